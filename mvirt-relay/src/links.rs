//! Interface information used by the relay engines.
//!
//! [`LinkInfo`] answers the name/index/address questions the packet path asks.
//! [`SystemLinks`] implements it from the kernel's interface list, kept in an
//! [`ArcSwap`] so receiver threads read it without locking while a tokio task
//! refreshes it in the background.

use arc_swap::ArcSwap;
use ipnet::Ipv4Net;
use nix::ifaddrs::getifaddrs;
use nix::net::if_::{InterfaceFlags, if_nametoindex};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Ethernet MAC address
pub type MacAddr = [u8; 6];

/// Period of the background interface table refresh
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Interface lookups needed on the packet path.
pub trait LinkInfo: Send + Sync {
    /// Interface name for an ifindex.
    fn name_of(&self, ifindex: u32) -> Option<String>;

    /// Ifindex for an interface name.
    fn index_of(&self, name: &str) -> Option<u32>;

    /// Primary IPv4 address of an interface.
    fn ipv4_of(&self, name: &str) -> Option<Ipv4Addr>;

    /// Ifindex of the interface that owns `addr`.
    fn ifindex_by_ipv4(&self, addr: Ipv4Addr) -> Option<u32>;

    /// Preferred IPv6 address of an interface: global if any, else link-local.
    fn ipv6_of(&self, name: &str) -> Option<Ipv6Addr>;

    /// MAC address identifying this switch.
    fn system_mac(&self) -> MacAddr;

    /// `addr` is the directed broadcast address of a local subnet.
    fn is_subnet_broadcast(&self, addr: Ipv4Addr) -> bool;
}

/// One interface with its addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkEntry {
    pub index: u32,
    pub name: String,
    pub mac: Option<MacAddr>,
    pub loopback: bool,
    pub ipv4: Vec<Ipv4Net>,
    pub ipv6: Vec<Ipv6Addr>,
}

impl LinkEntry {
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            ..Default::default()
        }
    }

    fn preferred_ipv6(&self) -> Option<Ipv6Addr> {
        self.ipv6
            .iter()
            .find(|a| !a.is_unicast_link_local() && !a.is_loopback())
            .or_else(|| self.ipv6.iter().find(|a| a.is_unicast_link_local()))
            .copied()
    }
}

/// Immutable snapshot of the interface list.
#[derive(Debug, Clone, Default)]
pub struct LinkTable {
    entries: Vec<LinkEntry>,
    system_mac: MacAddr,
}

impl LinkTable {
    /// Build a table from entries. The system MAC is taken from the first
    /// non-loopback interface that has one.
    pub fn new(mut entries: Vec<LinkEntry>) -> Self {
        entries.sort_by_key(|e| e.index);
        let system_mac = entries
            .iter()
            .filter(|e| !e.loopback)
            .filter_map(|e| e.mac)
            .find(|mac| mac.iter().any(|&b| b != 0))
            .unwrap_or_default();
        Self {
            entries,
            system_mac,
        }
    }

    /// Override the system MAC.
    pub fn with_system_mac(mut self, mac: MacAddr) -> Self {
        self.system_mac = mac;
        self
    }

    /// Read the kernel's interface list.
    pub fn load() -> io::Result<Self> {
        let mut entries: Vec<LinkEntry> = Vec::new();

        for ifaddr in getifaddrs().map_err(io::Error::from)? {
            let pos = match entries.iter().position(|e| e.name == ifaddr.interface_name) {
                Some(pos) => pos,
                None => {
                    let index = if_nametoindex(ifaddr.interface_name.as_str()).unwrap_or(0);
                    let mut entry = LinkEntry::new(index, ifaddr.interface_name.clone());
                    entry.loopback = ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK);
                    entries.push(entry);
                    entries.len() - 1
                }
            };
            let entry = &mut entries[pos];

            let Some(address) = ifaddr.address else {
                continue;
            };
            if let Some(sin) = address.as_sockaddr_in() {
                let prefix = ifaddr
                    .netmask
                    .as_ref()
                    .and_then(|m| m.as_sockaddr_in())
                    .map(|m| u32::from(m.ip()).count_ones() as u8)
                    .unwrap_or(32);
                if let Ok(net) = Ipv4Net::new(sin.ip(), prefix) {
                    entry.ipv4.push(net);
                }
            } else if let Some(sin6) = address.as_sockaddr_in6() {
                entry.ipv6.push(sin6.ip());
            } else if let Some(link) = address.as_link_addr() {
                entry.mac = link.addr();
            }
        }

        Ok(Self::new(entries))
    }

    pub fn entries(&self) -> &[LinkEntry] {
        &self.entries
    }

    pub fn by_name(&self, name: &str) -> Option<&LinkEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn by_index(&self, index: u32) -> Option<&LinkEntry> {
        self.entries.iter().find(|e| e.index == index)
    }
}

impl LinkInfo for LinkTable {
    fn name_of(&self, ifindex: u32) -> Option<String> {
        self.by_index(ifindex).map(|e| e.name.clone())
    }

    fn index_of(&self, name: &str) -> Option<u32> {
        self.by_name(name).map(|e| e.index)
    }

    fn ipv4_of(&self, name: &str) -> Option<Ipv4Addr> {
        self.by_name(name)
            .and_then(|e| e.ipv4.first())
            .map(|net| net.addr())
    }

    fn ifindex_by_ipv4(&self, addr: Ipv4Addr) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.ipv4.iter().any(|net| net.addr() == addr))
            .map(|e| e.index)
    }

    fn ipv6_of(&self, name: &str) -> Option<Ipv6Addr> {
        self.by_name(name).and_then(LinkEntry::preferred_ipv6)
    }

    fn system_mac(&self) -> MacAddr {
        self.system_mac
    }

    fn is_subnet_broadcast(&self, addr: Ipv4Addr) -> bool {
        self.entries
            .iter()
            .flat_map(|e| e.ipv4.iter())
            .any(|net| net.prefix_len() < 31 && net.broadcast() == addr)
    }
}

/// Kernel-backed [`LinkInfo`] with lock-free reads.
pub struct SystemLinks {
    table: ArcSwap<LinkTable>,
}

impl SystemLinks {
    pub fn load() -> io::Result<Self> {
        Ok(Self::from_table(LinkTable::load()?))
    }

    pub fn from_table(table: LinkTable) -> Self {
        Self {
            table: ArcSwap::from_pointee(table),
        }
    }

    /// Current snapshot.
    pub fn table(&self) -> Arc<LinkTable> {
        self.table.load_full()
    }

    /// Re-read the kernel's interface list and publish it.
    pub fn refresh(&self) -> io::Result<()> {
        let table = LinkTable::load()?;
        debug!(interfaces = table.entries().len(), "Interface table refreshed");
        self.table.store(Arc::new(table));
        Ok(())
    }

    /// Refresh the table every `period` on the tokio runtime.
    pub fn spawn_refresh(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.refresh() {
                    warn!(error = %e, "Failed to refresh interface table");
                }
            }
        })
    }
}

impl LinkInfo for SystemLinks {
    fn name_of(&self, ifindex: u32) -> Option<String> {
        self.table.load().name_of(ifindex)
    }

    fn index_of(&self, name: &str) -> Option<u32> {
        self.table.load().index_of(name)
    }

    fn ipv4_of(&self, name: &str) -> Option<Ipv4Addr> {
        self.table.load().ipv4_of(name)
    }

    fn ifindex_by_ipv4(&self, addr: Ipv4Addr) -> Option<u32> {
        self.table.load().ifindex_by_ipv4(addr)
    }

    fn ipv6_of(&self, name: &str) -> Option<Ipv6Addr> {
        self.table.load().ipv6_of(name)
    }

    fn system_mac(&self) -> MacAddr {
        self.table.load().system_mac()
    }

    fn is_subnet_broadcast(&self, addr: Ipv4Addr) -> bool {
        self.table.load().is_subnet_broadcast(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> LinkTable {
        let mut lo = LinkEntry::new(1, "lo");
        lo.loopback = true;
        lo.mac = Some([0; 6]);
        lo.ipv4.push("127.0.0.1/8".parse().unwrap());

        let mut eth0 = LinkEntry::new(3, "eth0");
        eth0.mac = Some([0x02, 0, 0, 0, 0, 0x01]);
        eth0.ipv4.push("192.168.1.1/24".parse().unwrap());
        eth0.ipv6.push("fe80::1".parse().unwrap());
        eth0.ipv6.push("2001:db8::1".parse().unwrap());

        let mut eth1 = LinkEntry::new(4, "eth1");
        eth1.ipv6.push("fe80::2".parse().unwrap());
        eth1.ipv4.push("10.0.0.1/31".parse().unwrap());

        LinkTable::new(vec![eth1, eth0, lo])
    }

    #[test]
    fn test_name_index_lookup() {
        let t = table();
        assert_eq!(t.name_of(3).as_deref(), Some("eth0"));
        assert_eq!(t.index_of("eth1"), Some(4));
        assert_eq!(t.name_of(99), None);
        assert_eq!(t.entries()[0].name, "lo");
    }

    #[test]
    fn test_ipv4_lookup() {
        let t = table();
        assert_eq!(t.ipv4_of("eth0"), Some(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(t.ifindex_by_ipv4(Ipv4Addr::new(192, 168, 1, 1)), Some(3));
        assert_eq!(t.ifindex_by_ipv4(Ipv4Addr::new(192, 168, 1, 2)), None);
    }

    #[test]
    fn test_preferred_ipv6() {
        let t = table();
        assert_eq!(t.ipv6_of("eth0"), Some("2001:db8::1".parse().unwrap()));
        assert_eq!(t.ipv6_of("eth1"), Some("fe80::2".parse().unwrap()));
        assert_eq!(t.ipv6_of("lo"), None);
    }

    #[test]
    fn test_system_mac_skips_loopback() {
        assert_eq!(table().system_mac(), [0x02, 0, 0, 0, 0, 0x01]);
        let t = table().with_system_mac([0xaa; 6]);
        assert_eq!(t.system_mac(), [0xaa; 6]);
    }

    #[test]
    fn test_subnet_broadcast() {
        let t = table();
        assert!(t.is_subnet_broadcast(Ipv4Addr::new(192, 168, 1, 255)));
        assert!(!t.is_subnet_broadcast(Ipv4Addr::new(192, 168, 1, 1)));
        // /31 point-to-point links have no broadcast address
        assert!(!t.is_subnet_broadcast(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn test_system_links_serves_snapshot() {
        let links = SystemLinks::from_table(table());
        assert_eq!(links.index_of("eth0"), Some(3));
        assert_eq!(links.table().entries().len(), 3);
    }
}
