//! In-memory collaborators for the relay engines.

use crate::links::{LinkEntry, LinkTable, MacAddr};
use crate::registry::GroupMembership;
use crate::relay::Transport;
use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4, SocketAddrV6};
use std::sync::Mutex;

/// MAC address of the switch in [`StaticLinks::standard`]
pub const SYSTEM_MAC: MacAddr = [0x02, 0, 0, 0, 0, 0x01];

/// One transmission recorded by [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    V4 {
        payload: Vec<u8>,
        dst: SocketAddrV4,
        src: Option<Ipv4Addr>,
        ifindex: Option<u32>,
    },
    RawV4 {
        datagram: Vec<u8>,
        dst: Ipv4Addr,
    },
    V6 {
        payload: Vec<u8>,
        dst: SocketAddrV6,
        multicast_if: Option<u32>,
    },
}

/// A neighbor entry installed through [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpEntry {
    pub ifname: String,
    pub ip: Ipv4Addr,
    pub hwaddr: Vec<u8>,
    pub htype: u8,
}

/// Transport that records every send instead of touching the network.
#[derive(Debug, Default)]
pub struct MockTransport {
    sent: Mutex<Vec<Sent>>,
    arp: Mutex<Vec<ArpEntry>>,
    unreachable: Mutex<HashSet<IpAddr>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every send to `addr` fail.
    pub fn fail_sends_to(&self, addr: impl Into<IpAddr>) {
        self.unreachable.lock().unwrap().insert(addr.into());
    }

    fn check(&self, addr: IpAddr) -> io::Result<()> {
        if self.unreachable.lock().unwrap().contains(&addr) {
            return Err(io::Error::new(
                io::ErrorKind::HostUnreachable,
                "destination unreachable",
            ));
        }
        Ok(())
    }

    /// All transmissions so far.
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    /// Take and clear the recorded transmissions.
    pub fn take(&self) -> Vec<Sent> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn arp_entries(&self) -> Vec<ArpEntry> {
        self.arp.lock().unwrap().clone()
    }
}

impl Transport for MockTransport {
    fn send_v4(
        &self,
        payload: &[u8],
        dst: SocketAddrV4,
        src: Option<Ipv4Addr>,
        ifindex: Option<u32>,
    ) -> io::Result<()> {
        self.check(IpAddr::V4(*dst.ip()))?;
        self.sent.lock().unwrap().push(Sent::V4 {
            payload: payload.to_vec(),
            dst,
            src,
            ifindex,
        });
        Ok(())
    }

    fn send_raw_v4(&self, datagram: &[u8], dst: Ipv4Addr) -> io::Result<()> {
        self.check(IpAddr::V4(dst))?;
        self.sent.lock().unwrap().push(Sent::RawV4 {
            datagram: datagram.to_vec(),
            dst,
        });
        Ok(())
    }

    fn send_v6(
        &self,
        payload: &[u8],
        dst: SocketAddrV6,
        multicast_if: Option<u32>,
    ) -> io::Result<()> {
        self.check(IpAddr::V6(*dst.ip()))?;
        self.sent.lock().unwrap().push(Sent::V6 {
            payload: payload.to_vec(),
            dst,
            multicast_if,
        });
        Ok(())
    }

    fn add_arp_entry(&self, ifname: &str, ip: Ipv4Addr, hwaddr: &[u8], htype: u8) -> io::Result<()> {
        self.arp.lock().unwrap().push(ArpEntry {
            ifname: ifname.to_string(),
            ip,
            hwaddr: hwaddr.to_vec(),
            htype,
        });
        Ok(())
    }
}

/// Records multicast group joins and leaves.
#[derive(Debug, Default)]
pub struct RecordingMembership {
    events: Mutex<Vec<String>>,
    fail_join: Mutex<bool>,
}

impl RecordingMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent joins fail.
    pub fn fail_joins(&self, fail: bool) {
        *self.fail_join.lock().unwrap() = fail;
    }

    /// `"join eth1"` / `"leave eth1"` in call order.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl GroupMembership for RecordingMembership {
    fn join(&self, interface: &str) -> io::Result<()> {
        if *self.fail_join.lock().unwrap() {
            return Err(io::Error::new(io::ErrorKind::AddrNotAvailable, "join failed"));
        }
        self.events.lock().unwrap().push(format!("join {interface}"));
        Ok(())
    }

    fn leave(&self, interface: &str) -> io::Result<()> {
        self.events.lock().unwrap().push(format!("leave {interface}"));
        Ok(())
    }
}

/// Builder for a table-driven interface list.
#[derive(Debug, Default)]
pub struct StaticLinks {
    entries: Vec<LinkEntry>,
    system_mac: Option<MacAddr>,
}

impl StaticLinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The topology used across the relay tests:
    ///
    /// | ifindex | name | IPv4            | IPv6                      |
    /// |---------|------|-----------------|---------------------------|
    /// | 2       | eth0 | 10.0.0.1/24     | 2001:db8::1               |
    /// | 3       | eth1 | 192.168.1.1/24  | fe80::1, 2001:db8:1::1    |
    /// | 4       | eth2 | 192.168.2.1/24  | fe80::2                   |
    /// | 5       | eth3 | -               | -                         |
    pub fn standard() -> LinkTable {
        Self::new()
            .interface(2, "eth0", Some("10.0.0.1/24"), &["2001:db8::1"])
            .interface(
                3,
                "eth1",
                Some("192.168.1.1/24"),
                &["fe80::1", "2001:db8:1::1"],
            )
            .interface(4, "eth2", Some("192.168.2.1/24"), &["fe80::2"])
            .interface(5, "eth3", None, &[])
            .system_mac(SYSTEM_MAC)
            .build()
    }

    /// Add an interface. Addresses are parsed and must be valid.
    pub fn interface(mut self, index: u32, name: &str, ipv4: Option<&str>, ipv6: &[&str]) -> Self {
        let mut entry = LinkEntry::new(index, name);
        if let Some(net) = ipv4 {
            entry.ipv4.push(net.parse().expect("invalid IPv4 network"));
        }
        for addr in ipv6 {
            entry.ipv6.push(addr.parse().expect("invalid IPv6 address"));
        }
        self.entries.push(entry);
        self
    }

    pub fn system_mac(mut self, mac: MacAddr) -> Self {
        self.system_mac = Some(mac);
        self
    }

    pub fn build(self) -> LinkTable {
        let table = LinkTable::new(self.entries);
        match self.system_mac {
            Some(mac) => table.with_system_mac(mac),
            None => table,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::links::LinkInfo;

    #[test]
    fn test_standard_topology() {
        let links = StaticLinks::standard();
        assert_eq!(links.index_of("eth1"), Some(3));
        assert_eq!(links.ipv4_of("eth3"), None);
        assert_eq!(links.system_mac(), SYSTEM_MAC);
    }

    #[test]
    fn test_mock_transport_failure() {
        let transport = MockTransport::new();
        transport.fail_sends_to(Ipv4Addr::new(10, 0, 0, 5));
        assert!(
            transport
                .send_raw_v4(&[0u8; 4], Ipv4Addr::new(10, 0, 0, 5))
                .is_err()
        );
        transport
            .send_raw_v4(&[0u8; 4], Ipv4Addr::new(10, 0, 0, 6))
            .unwrap();
        assert_eq!(transport.take().len(), 1);
        assert!(transport.sent().is_empty());
    }
}
