//! DHCPv6 relay agent (RFC 8415 section 19).

use super::option79::{self, build_options, parse_reply_options};
use super::{DropReason, Outcome, RelayState};
use crate::registry::V6Server;
use crate::stats::{UNKNOWN_INTERFACE, inc};
use crate::wire::dhcpv6::{
    Dhcpv6MessageType, MIN_MESSAGE_SIZE, RelayHeader, SERVER_PORT, encode_relay, message_type,
};
use crate::wire::decode_dhcpv6_relay;
use std::net::{Ipv6Addr, SocketAddrV6};
use tracing::{debug, warn};

/// Relay-forward messages that crossed this many relays are dropped
pub const MAX_HOP_COUNT: u8 = 32;

/// Hop limit for relayed multicast
pub const MULTICAST_HOP_LIMIT: u32 = 32;

/// All_DHCP_Relay_Agents_and_Servers (link scope)
pub const ALL_RELAY_AGENTS_AND_SERVERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 2);

/// All_DHCP_Servers (site scope)
pub const ALL_DHCP_SERVERS: Ipv6Addr = Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 1, 3);

impl RelayState {
    /// Process one DHCPv6 payload received from `src` on `ifindex`.
    pub fn handle_v6_datagram(&self, payload: &[u8], src: SocketAddrV6, ifindex: u32) -> Outcome {
        if !self.config.v6_relay_enabled() {
            return DropReason::Disabled.into();
        }

        let ifname = self.links.name_of(ifindex);
        let counters = self
            .stats
            .counters(ifname.as_deref().unwrap_or(UNKNOWN_INTERFACE));

        if src.ip().to_ipv4_mapped().is_some() {
            inc(&counters.bad_packets);
            return DropReason::V4MappedSource.into();
        }

        let msg_type = match message_type(payload) {
            Ok(t) => t,
            Err(e) => {
                inc(&counters.bad_packets);
                debug!(ifindex, src = %src, error = %e, "Dropping DHCPv6 message");
                return if payload.len() < MIN_MESSAGE_SIZE {
                    Outcome::Dropped(e.into())
                } else {
                    DropReason::InvalidMessageType.into()
                };
            }
        };

        if msg_type.is_from_client() {
            let outcome = self.v6_client_path(payload, msg_type, src, ifindex, ifname.as_deref());
            match &outcome {
                Outcome::Relayed { .. } => inc(&counters.v6_client_relayed),
                Outcome::Dropped(reason) => {
                    inc(&counters.v6_client_dropped);
                    debug!(ifindex, src = %src, reason = %reason, "DHCPv6 client message dropped");
                }
            }
            outcome
        } else {
            let (outcome, egress) = self.v6_server_path(payload, msg_type);
            let counters = match egress {
                Some(name) => self.stats.counters(&name),
                None => counters,
            };
            match &outcome {
                Outcome::Relayed { .. } => inc(&counters.v6_server_relayed),
                Outcome::Dropped(reason) => {
                    inc(&counters.v6_server_dropped);
                    debug!(ifindex, src = %src, reason = %reason, "DHCPv6 server message dropped");
                }
            }
            outcome
        }
    }

    fn v6_client_path(
        &self,
        payload: &[u8],
        msg_type: Dhcpv6MessageType,
        src: SocketAddrV6,
        ifindex: u32,
        ifname: Option<&str>,
    ) -> Outcome {
        let Some(ifname) = ifname else {
            return DropReason::UnknownInterface(ifindex).into();
        };
        let servers = match self.v6_servers.lookup(ifname) {
            Some(servers) if !servers.is_empty() => servers,
            _ => return DropReason::NoHelperConfigured(ifname.to_string()).into(),
        };

        let from_relay = msg_type == Dhcpv6MessageType::RelayForw;
        let hop_count = if from_relay {
            let relay = match decode_dhcpv6_relay(payload) {
                Ok(r) => r,
                Err(e) => return Outcome::Dropped(e.into()),
            };
            if relay.hop_count() >= MAX_HOP_COUNT {
                return DropReason::HopLimitExceeded.into();
            }
            relay.hop_count() + 1
        } else {
            0
        };

        // A relay behind a global address identifies its own link
        let link_address = if !from_relay || src.ip().is_unicast_link_local() {
            self.links.ipv6_of(ifname).unwrap_or(Ipv6Addr::UNSPECIFIED)
        } else {
            Ipv6Addr::UNSPECIFIED
        };

        let client_mac = if self.config.option79_enabled() && !from_relay {
            match option79::client_mac(*src.ip(), payload) {
                Some(mac) => Some(mac),
                None => return DropReason::MissingClientMac.into(),
            }
        } else {
            None
        };

        let options = build_options(payload, ifindex, client_mac);
        let mut out = Vec::new();
        encode_relay(
            &mut out,
            &RelayHeader {
                msg_type: Dhcpv6MessageType::RelayForw,
                hop_count,
                link_address,
                peer_address: *src.ip(),
            },
            &options,
        );

        let counters = self.stats.counters(ifname);
        let (mut sent, mut failed) = (0, 0);
        for server in &servers {
            match self.send_to_v6_server(&out, server, ifindex) {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!(iface = %ifname, server = %server, error = %e, "Failed to relay DHCPv6 message");
                    inc(&counters.send_failures);
                    failed += 1;
                }
            }
        }
        Outcome::from_fan_out(sent, failed)
    }

    fn send_to_v6_server(&self, out: &[u8], server: &V6Server, ifindex: u32) -> std::io::Result<()> {
        let egress = server.egress.as_deref().and_then(|e| self.links.index_of(e));

        if server.address.is_multicast() {
            let Some(egress) = egress else {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "egress interface not found",
                ));
            };
            let dst = SocketAddrV6::new(server.address, SERVER_PORT, 0, 0);
            self.transport.send_v6(out, dst, Some(egress))
        } else {
            let scope = if server.address.is_unicast_link_local() {
                egress.unwrap_or(ifindex)
            } else {
                0
            };
            let dst = SocketAddrV6::new(server.address, SERVER_PORT, 0, scope);
            self.transport.send_v6(out, dst, None)
        }
    }

    /// Returns the outcome and the client-facing interface, once known.
    fn v6_server_path(
        &self,
        payload: &[u8],
        msg_type: Dhcpv6MessageType,
    ) -> (Outcome, Option<String>) {
        if msg_type != Dhcpv6MessageType::RelayReply {
            return (DropReason::NotRelayReply.into(), None);
        }

        let reply = match parse_reply_options(payload) {
            Ok(reply) => reply,
            Err(e) => return (Outcome::Dropped(e.into()), None),
        };
        let egress = (reply.interface_id != 0)
            .then(|| self.links.name_of(reply.interface_id))
            .flatten();

        let scope = if reply.peer.is_unicast_link_local() {
            reply.interface_id
        } else {
            0
        };
        let dst = SocketAddrV6::new(reply.peer, reply.dst_port(), 0, scope);

        let outcome = match self.transport.send_v6(reply.payload, dst, None) {
            Ok(()) => Outcome::Relayed { sent: 1, failed: 0 },
            Err(e) => {
                warn!(peer = %dst, error = %e, "Failed to relay DHCPv6 reply");
                let counters = self
                    .stats
                    .counters(egress.as_deref().unwrap_or(UNKNOWN_INTERFACE));
                inc(&counters.send_failures);
                DropReason::SendFailed.into()
            }
        };
        (outcome, egress)
    }
}
