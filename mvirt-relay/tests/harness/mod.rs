//! Test harness for relay integration tests
//!
//! Builds a [`RelayState`] over the standard test topology with a recording
//! transport, so packets can be pushed through the engines and the resulting
//! transmissions inspected.

#![allow(dead_code)]

use mvirt_relay::config::{GlobalConfig, GlobalSettings};
use mvirt_relay::registry::{V4Server, V6Server};
use mvirt_relay::relay::RelayState;
use mvirt_relay::stats::CountersSnapshot;
use mvirt_relay::test_util::{MockTransport, RecordingMembership, Sent, StaticLinks};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

pub use mvirt_relay::test_util::mock::SYSTEM_MAC;

/// eth0: upstream, towards the servers
pub const ETH0: u32 = 2;
/// eth1: client segment 192.168.1.0/24
pub const ETH1: u32 = 3;
/// eth2: client segment 192.168.2.0/24
pub const ETH2: u32 = 4;
/// eth3: no addresses
pub const ETH3: u32 = 5;

pub const ETH1_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
pub const HELPER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

pub struct TestRelay {
    pub state: Arc<RelayState>,
    pub config: Arc<GlobalConfig>,
    pub transport: Arc<MockTransport>,
    pub membership: Arc<RecordingMembership>,
}

impl TestRelay {
    pub fn new() -> Self {
        Self::with_settings(GlobalSettings::default())
    }

    pub fn with_settings(settings: GlobalSettings) -> Self {
        let config = Arc::new(GlobalConfig::from_settings(&settings));
        let transport = Arc::new(MockTransport::new());
        let membership = Arc::new(RecordingMembership::new());
        let state = Arc::new(RelayState::new(
            config.clone(),
            Arc::new(StaticLinks::standard()),
            transport.clone(),
            membership.clone(),
        ));
        Self {
            state,
            config,
            transport,
            membership,
        }
    }

    /// Configure a DHCP helper address on `iface`.
    pub fn helper(&self, iface: &str, addr: Ipv4Addr) -> &Self {
        self.state
            .v4_servers
            .store_address(iface, V4Server::dhcp(addr))
            .unwrap();
        self
    }

    /// Configure a UDP forwarding target on `iface`.
    pub fn udp_server(&self, iface: &str, addr: Ipv4Addr, port: u16) -> &Self {
        self.state
            .v4_servers
            .store_address(iface, V4Server::new(addr, port))
            .unwrap();
        self
    }

    /// Configure a DHCPv6 server on `iface`.
    pub fn v6_server(&self, iface: &str, server: V6Server) -> &Self {
        self.state.v6_servers.store_address(iface, server).unwrap();
        self
    }

    pub fn v6_unicast(&self, iface: &str, addr: Ipv6Addr) -> &Self {
        self.v6_server(iface, V6Server::unicast(addr))
    }

    pub fn counters(&self, iface: &str) -> CountersSnapshot {
        self.state.stats.counters(iface).snapshot()
    }

    /// Take the single recorded transmission, failing if there is not exactly one.
    pub fn take_one(&self) -> Sent {
        let mut sent = self.transport.take();
        assert_eq!(sent.len(), 1, "expected one transmission, got {sent:?}");
        sent.remove(0)
    }
}
