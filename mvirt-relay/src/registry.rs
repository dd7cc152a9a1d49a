//! Interface to server registry.
//!
//! Every interface holds an ordered list of server handles. Each distinct server
//! is stored once, with a reference count equal to the number of interfaces that
//! list it. A single mutex guards the whole registry: configuration changes and
//! packet-path lookups serialize on it, and lookups hand back an owned snapshot
//! so nothing borrowed from the registry outlives the lock.

use crate::wire::dhcpv4::SERVER_PORT;
use serde::Serialize;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::hash::Hash;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Servers per interface for the DHCPv6 relay
pub const MAX_V6_SERVERS_PER_INTERFACE: usize = 8;

/// Servers per interface for the DHCPv4 relay and UDP broadcast forwarder
pub const MAX_V4_SERVERS_PER_INTERFACE: usize = 16;

/// Registry errors, reported back to the configuration path.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("interface {interface} already has the maximum of {max} servers")]
    CapacityExceeded { interface: String, max: usize },

    #[error("server {server} is not configured on interface {interface}")]
    NotFound { interface: String, server: String },

    #[error("multicast membership change on {interface} failed: {source}")]
    Membership {
        interface: String,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Identity of a server record.
pub trait ServerKey: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + 'static {}

impl<T> ServerKey for T where T: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + 'static {}

/// A DHCPv4 helper address or UDP broadcast forwarding target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct V4Server {
    pub address: Ipv4Addr,
    pub port: u16,
}

impl V4Server {
    pub fn new(address: Ipv4Addr, port: u16) -> Self {
        Self { address, port }
    }

    /// A DHCP helper address.
    pub fn dhcp(address: Ipv4Addr) -> Self {
        Self::new(address, SERVER_PORT)
    }
}

impl fmt::Display for V4Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// A DHCPv6 server, unicast or multicast with an egress interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct V6Server {
    pub address: Ipv6Addr,
    pub egress: Option<String>,
}

impl V6Server {
    pub fn unicast(address: Ipv6Addr) -> Self {
        Self {
            address,
            egress: None,
        }
    }

    pub fn multicast(address: Ipv6Addr, egress: impl Into<String>) -> Self {
        Self {
            address,
            egress: Some(egress.into()),
        }
    }
}

impl fmt::Display for V6Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.egress {
            Some(egress) => write!(f, "{} via {}", self.address, egress),
            None => write!(f, "{}", self.address),
        }
    }
}

/// Side effect run when an interface node is created or destroyed.
///
/// The DHCPv6 relay uses it to join and leave the relay-agents multicast group.
pub trait GroupMembership: Send + Sync {
    fn join(&self, interface: &str) -> io::Result<()>;
    fn leave(&self, interface: &str) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Added,
    /// The interface already listed this server; nothing changed.
    AlreadyPresent,
}

#[derive(Debug)]
struct ServerRecord {
    ref_count: u32,
}

#[derive(Debug)]
struct InterfaceNode<K> {
    servers: Vec<K>,
}

#[derive(Debug)]
struct State<K> {
    interfaces: HashMap<String, InterfaceNode<K>>,
    records: HashMap<K, ServerRecord>,
}

/// One server as seen in a registry snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerEntry<K> {
    pub server: K,
    pub ref_count: u32,
}

/// One interface as seen in a registry snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceSnapshot<K> {
    pub name: String,
    pub servers: Vec<ServerEntry<K>>,
}

/// Changes applied by [`ServerRegistry::reconcile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport<K> {
    pub added: Vec<K>,
    pub removed: Vec<K>,
}

impl<K> ReconcileReport<K> {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Concurrent registry of per-interface server lists.
pub struct ServerRegistry<K: ServerKey> {
    state: Mutex<State<K>>,
    capacity: usize,
    membership: Option<Arc<dyn GroupMembership>>,
}

impl<K: ServerKey> ServerRegistry<K> {
    /// Create an empty registry allowing `capacity` servers per interface.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                interfaces: HashMap::new(),
                records: HashMap::new(),
            }),
            capacity,
            membership: None,
        }
    }

    /// Create a registry that runs `membership` when interfaces appear and vanish.
    pub fn with_membership(capacity: usize, membership: Arc<dyn GroupMembership>) -> Self {
        let mut registry = Self::new(capacity);
        registry.membership = Some(membership);
        registry
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add `server` to `interface`, creating the interface node on first use.
    ///
    /// Storing a server the interface already lists is a no-op.
    pub fn store_address(&self, interface: &str, server: K) -> Result<StoreOutcome> {
        let mut state = self.lock();
        self.store_locked(&mut state, interface, server)
    }

    fn store_locked(&self, state: &mut State<K>, interface: &str, server: K) -> Result<StoreOutcome> {
        match state.interfaces.get(interface) {
            Some(node) => {
                if node.servers.contains(&server) {
                    return Ok(StoreOutcome::AlreadyPresent);
                }
                if node.servers.len() >= self.capacity {
                    return Err(RegistryError::CapacityExceeded {
                        interface: interface.to_string(),
                        max: self.capacity,
                    });
                }
            }
            None => self.create_node_locked(state, interface)?,
        }

        state
            .records
            .entry(server.clone())
            .and_modify(|record| record.ref_count += 1)
            .or_insert(ServerRecord { ref_count: 1 });

        if let Some(node) = state.interfaces.get_mut(interface) {
            node.servers.push(server.clone());
        }

        debug!(iface = %interface, server = %server, "Server stored");
        Ok(StoreOutcome::Added)
    }

    fn create_node_locked(&self, state: &mut State<K>, interface: &str) -> Result<()> {
        if self.capacity == 0 {
            return Err(RegistryError::CapacityExceeded {
                interface: interface.to_string(),
                max: 0,
            });
        }
        if let Some(membership) = &self.membership {
            membership
                .join(interface)
                .map_err(|source| RegistryError::Membership {
                    interface: interface.to_string(),
                    source,
                })?;
        }
        state.interfaces.insert(
            interface.to_string(),
            InterfaceNode {
                servers: Vec::with_capacity(self.capacity),
            },
        );
        info!(iface = %interface, "Relay interface created");
        Ok(())
    }

    /// Remove `server` from `interface`.
    ///
    /// The last live entry moves into the freed slot. An interface left without
    /// servers is deleted.
    pub fn remove_address(&self, interface: &str, server: &K) -> Result<()> {
        let mut state = self.lock();
        self.remove_locked(&mut state, interface, server)
    }

    fn remove_locked(&self, state: &mut State<K>, interface: &str, server: &K) -> Result<()> {
        let now_empty = self.unlink_locked(state, interface, server)?;

        if now_empty {
            state.interfaces.remove(interface);
            info!(iface = %interface, "Relay interface deleted");
            if let Some(membership) = &self.membership
                && let Err(e) = membership.leave(interface)
            {
                warn!(iface = %interface, error = %e, "Failed to leave multicast group");
            }
        }

        Ok(())
    }

    /// Drop `server` from the node's list and release its record, leaving the
    /// node in place even when it ends up empty. Returns whether it is empty.
    fn unlink_locked(&self, state: &mut State<K>, interface: &str, server: &K) -> Result<bool> {
        let not_found = || RegistryError::NotFound {
            interface: interface.to_string(),
            server: server.to_string(),
        };

        let node = state.interfaces.get_mut(interface).ok_or_else(not_found)?;
        let index = node
            .servers
            .iter()
            .position(|s| s == server)
            .ok_or_else(not_found)?;
        node.servers.swap_remove(index);
        let now_empty = node.servers.is_empty();

        if let Entry::Occupied(mut record) = state.records.entry(server.clone()) {
            record.get_mut().ref_count -= 1;
            if record.get().ref_count == 0 {
                record.remove();
            }
        }

        debug!(iface = %interface, server = %server, "Server removed");
        Ok(now_empty)
    }

    /// Remove every server `interface` still references.
    ///
    /// Returns the servers that were removed.
    pub fn remove_interface(&self, interface: &str) -> Vec<K> {
        let mut state = self.lock();
        let servers = match state.interfaces.get(interface) {
            Some(node) => node.servers.clone(),
            None => return Vec::new(),
        };

        let mut removed = Vec::with_capacity(servers.len());
        for server in servers {
            if self.remove_locked(&mut state, interface, &server).is_ok() {
                removed.push(server);
            }
        }
        removed
    }

    /// Bring `interface` in line with `desired`.
    ///
    /// A failed call leaves the interface as it was: the capacity check and the
    /// multicast join for a new interface both run before any server is touched.
    /// Swapping a non-empty list keeps the interface node, so group membership
    /// is not cycled.
    pub fn reconcile(&self, interface: &str, desired: &[K]) -> Result<ReconcileReport<K>> {
        let mut state = self.lock();

        let current = state
            .interfaces
            .get(interface)
            .map(|node| node.servers.clone())
            .unwrap_or_default();

        let mut wanted: Vec<K> = Vec::with_capacity(desired.len());
        for server in desired {
            if !wanted.contains(server) {
                wanted.push(server.clone());
            }
        }

        if wanted.len() > self.capacity {
            return Err(RegistryError::CapacityExceeded {
                interface: interface.to_string(),
                max: self.capacity,
            });
        }

        let removed: Vec<K> = current
            .iter()
            .filter(|s| !wanted.contains(s))
            .cloned()
            .collect();
        let added: Vec<K> = wanted
            .iter()
            .filter(|s| !current.contains(s))
            .cloned()
            .collect();

        if wanted.is_empty() {
            for server in &removed {
                self.remove_locked(&mut state, interface, server)?;
            }
            return Ok(ReconcileReport { added, removed });
        }

        if !state.interfaces.contains_key(interface) {
            self.create_node_locked(&mut state, interface)?;
        }
        for server in &removed {
            self.unlink_locked(&mut state, interface, server)?;
        }
        for server in &added {
            self.store_locked(&mut state, interface, server.clone())?;
        }

        Ok(ReconcileReport { added, removed })
    }

    /// Snapshot of the servers configured on `interface`, in send order.
    pub fn lookup(&self, interface: &str) -> Option<Vec<K>> {
        self.lock()
            .interfaces
            .get(interface)
            .map(|node| node.servers.clone())
    }

    /// Reference count of a server record, `None` if no interface lists it.
    pub fn ref_count(&self, server: &K) -> Option<u32> {
        self.lock().records.get(server).map(|r| r.ref_count)
    }

    /// Number of distinct server records.
    pub fn record_count(&self) -> usize {
        self.lock().records.len()
    }

    /// Names of all interfaces with at least one server, sorted.
    pub fn interface_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().interfaces.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.lock().interfaces.is_empty()
    }

    /// Consistent view of one or all interfaces, taken under a single lock.
    pub fn snapshot(&self, interface: Option<&str>) -> Vec<InterfaceSnapshot<K>> {
        let state = self.lock();
        let mut out: Vec<InterfaceSnapshot<K>> = state
            .interfaces
            .iter()
            .filter(|(name, _)| interface.is_none_or(|wanted| wanted == name.as_str()))
            .map(|(name, node)| InterfaceSnapshot {
                name: name.clone(),
                servers: node
                    .servers
                    .iter()
                    .map(|server| ServerEntry {
                        server: server.clone(),
                        ref_count: state.records.get(server).map_or(0, |r| r.ref_count),
                    })
                    .collect(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
