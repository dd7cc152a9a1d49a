//! Relay engines.
//!
//! [`RelayState`] owns everything a receiver thread needs to process a packet:
//! global toggles, server registries, counters, interface information and the
//! transport used to send. It is built once by the daemon and shared by
//! reference; there is no implicit global state.
//!
//! Every packet ends in an [`Outcome`]. Parse failures and policy rejections are
//! [`Outcome::Dropped`] with a [`DropReason`], never an error.

pub mod forwarder;
pub mod option79;
pub mod option82;
pub mod v4;
pub mod v6;

use crate::config::GlobalConfig;
use crate::links::LinkInfo;
use crate::registry::{
    GroupMembership, MAX_V4_SERVERS_PER_INTERFACE, MAX_V6_SERVERS_PER_INTERFACE, ServerRegistry,
    V4Server, V6Server,
};
use crate::stats::RelayStats;
use crate::wire::WireError;
use option79::Option79Error;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, SocketAddrV6};
use std::sync::Arc;
use thiserror::Error;

/// Sends relayed packets.
pub trait Transport: Send + Sync {
    /// Send a DHCPv4 payload over UDP.
    ///
    /// `src` selects the source address and `ifindex` the egress interface.
    fn send_v4(
        &self,
        payload: &[u8],
        dst: SocketAddrV4,
        src: Option<Ipv4Addr>,
        ifindex: Option<u32>,
    ) -> io::Result<()>;

    /// Send a complete IPv4 datagram as is.
    fn send_raw_v4(&self, datagram: &[u8], dst: Ipv4Addr) -> io::Result<()>;

    /// Send a DHCPv6 payload. `multicast_if` selects the outgoing interface
    /// for multicast destinations.
    fn send_v6(&self, payload: &[u8], dst: SocketAddrV6, multicast_if: Option<u32>)
    -> io::Result<()>;

    /// Install a neighbor entry so a unicast reply reaches a client that has
    /// no address yet.
    fn add_arp_entry(&self, ifname: &str, ip: Ipv4Addr, hwaddr: &[u8], htype: u8)
    -> io::Result<()>;
}

/// Why a packet was not relayed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DropReason {
    #[error("relay disabled")]
    Disabled,

    #[error("malformed packet: {0}")]
    Malformed(#[from] WireError),

    #[error("broadcast reply already on the wire")]
    BroadcastReply,

    #[error("unknown interface index {0}")]
    UnknownInterface(u32),

    #[error("interface {0} has no IPv4 address")]
    NoInterfaceAddress(String),

    #[error("no local interface owns relay address {0}")]
    UnknownRelayAddress(Ipv4Addr),

    #[error("hop limit exceeded")]
    HopLimitExceeded,

    #[error("no server configured on {0}")]
    NoHelperConfigured(String),

    #[error("option 82 present and policy is drop")]
    Option82Policy,

    #[error("invalid option 82")]
    InvalidOption82,

    #[error("no valid option 82 in reply")]
    Option82Unvalidated,

    #[error("no client address to deliver to")]
    NoClientAddress,

    #[error("IPv4-mapped source address")]
    V4MappedSource,

    #[error("invalid message type")]
    InvalidMessageType,

    #[error("server message is not a relay-reply")]
    NotRelayReply,

    #[error("client MAC address unknown")]
    MissingClientMac,

    #[error("{0}")]
    Option79(#[from] Option79Error),

    #[error("not a broadcast destination")]
    NotBroadcast,

    #[error("TTL expired")]
    TtlExpired,

    #[error("no server for UDP port {0}")]
    NoServerForPort(u16),

    #[error("every send failed")]
    SendFailed,
}

/// Result of processing one packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Sent to `sent` destinations; `failed` sends were skipped.
    Relayed { sent: usize, failed: usize },
    Dropped(DropReason),
}

impl Outcome {
    pub fn is_relayed(&self) -> bool {
        matches!(self, Outcome::Relayed { .. })
    }

    pub(crate) fn from_fan_out(sent: usize, failed: usize) -> Self {
        if sent == 0 && failed > 0 {
            Outcome::Dropped(DropReason::SendFailed)
        } else {
            Outcome::Relayed { sent, failed }
        }
    }
}

impl From<DropReason> for Outcome {
    fn from(reason: DropReason) -> Self {
        Outcome::Dropped(reason)
    }
}

/// Shared relay state.
pub struct RelayState {
    pub config: Arc<GlobalConfig>,
    pub v4_servers: Arc<ServerRegistry<V4Server>>,
    pub v6_servers: Arc<ServerRegistry<V6Server>>,
    pub stats: Arc<RelayStats>,
    pub links: Arc<dyn LinkInfo>,
    pub transport: Arc<dyn Transport>,
}

impl RelayState {
    /// Build the relay state. `membership` is run when a DHCPv6 relay
    /// interface is created or deleted.
    pub fn new(
        config: Arc<GlobalConfig>,
        links: Arc<dyn LinkInfo>,
        transport: Arc<dyn Transport>,
        membership: Arc<dyn GroupMembership>,
    ) -> Self {
        Self {
            config,
            v4_servers: Arc::new(ServerRegistry::new(MAX_V4_SERVERS_PER_INTERFACE)),
            v6_servers: Arc::new(ServerRegistry::with_membership(
                MAX_V6_SERVERS_PER_INTERFACE,
                membership,
            )),
            stats: Arc::new(RelayStats::new()),
            links,
            transport,
        }
    }
}
