//! Configuration sync.
//!
//! Turns a freshly loaded [`ConfigDocument`] into registry mutations and global
//! toggle updates. Row change flags are derived by comparing each row with the
//! row applied last time, so unchanged interfaces are never touched.

use crate::config::{ConfigDocument, ConfigError, GlobalConfig, InterfaceRow, Result};
use crate::registry::{RegistryError, ServerKey, ServerRegistry, V4Server, V6Server};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a configuration row differs from the one applied before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowChange {
    Inserted,
    Modified,
    Deleted,
}

/// What one [`ConfigSync::apply`] call changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub changes: Vec<(String, RowChange)>,
    /// Rows ignored because they belong to another VRF.
    pub skipped: Vec<String>,
    /// Number of global toggles whose value changed.
    pub toggles_changed: usize,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.toggles_changed == 0
    }

    pub fn change_of(&self, interface: &str) -> Option<RowChange> {
        self.changes
            .iter()
            .find(|(name, _)| name == interface)
            .map(|(_, change)| *change)
    }
}

/// Applies configuration documents to the relay state.
pub struct ConfigSync {
    config: Arc<GlobalConfig>,
    v4_servers: Arc<ServerRegistry<V4Server>>,
    v6_servers: Arc<ServerRegistry<V6Server>>,
    applied: BTreeMap<String, InterfaceRow>,
}

impl ConfigSync {
    pub fn new(
        config: Arc<GlobalConfig>,
        v4_servers: Arc<ServerRegistry<V4Server>>,
        v6_servers: Arc<ServerRegistry<V6Server>>,
    ) -> Self {
        Self {
            config,
            v4_servers,
            v6_servers,
            applied: BTreeMap::new(),
        }
    }

    /// Rows applied so far, keyed by interface name.
    pub fn applied(&self) -> &BTreeMap<String, InterfaceRow> {
        &self.applied
    }

    /// Apply `doc`.
    ///
    /// The whole document is parsed and every server list is checked against
    /// the per-interface limits before anything changes, so a malformed value
    /// or an oversized list rejects the change as a unit. A multicast join
    /// failure stops the sync; rows applied before it stay applied, the failed
    /// row is left as it was and is retried on the next call.
    pub fn apply(&mut self, doc: &ConfigDocument) -> Result<SyncReport> {
        let settings = doc.settings()?;
        let mut report = SyncReport::default();

        let mut rows: BTreeMap<&str, &InterfaceRow> = BTreeMap::new();
        for row in &doc.interfaces {
            if !row.in_vrf(&doc.default_vrf) {
                warn!(
                    iface = %row.name,
                    vrf = row.vrf.as_deref().unwrap_or_default(),
                    "Skipping interface outside the default VRF"
                );
                report.skipped.push(row.name.clone());
                continue;
            }
            if row.name.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "name".to_string(),
                    value: String::new(),
                });
            }
            if rows.insert(row.name.as_str(), row).is_some() {
                return Err(ConfigError::InvalidValue {
                    key: "name".to_string(),
                    value: row.name.clone(),
                });
            }
        }

        let mut parsed = Vec::with_capacity(rows.len());
        for (name, row) in &rows {
            let change = match self.applied.get(*name) {
                None => RowChange::Inserted,
                Some(previous) if previous != *row => RowChange::Modified,
                Some(_) => continue,
            };
            let v4 = row.v4_servers()?;
            let v6 = row.v6_servers()?;
            check_capacity(&self.v4_servers, name, &v4)?;
            check_capacity(&self.v6_servers, name, &v6)?;
            parsed.push((*row, change, v4, v6));
        }

        let names: HashSet<&str> = rows.keys().copied().collect();
        let deleted: Vec<String> = self
            .applied
            .keys()
            .filter(|name| !names.contains(name.as_str()))
            .cloned()
            .collect();

        for name in deleted {
            let v4 = self.v4_servers.remove_interface(&name);
            let v6 = self.v6_servers.remove_interface(&name);
            info!(iface = %name, v4 = v4.len(), v6 = v6.len(), "Relay configuration removed");
            self.applied.remove(&name);
            report.changes.push((name, RowChange::Deleted));
        }

        for (row, change, v4, v6) in parsed {
            let v4_report = self.v4_servers.reconcile(&row.name, &v4)?;
            let v6_report = self.v6_servers.reconcile(&row.name, &v6)?;
            info!(
                iface = %row.name,
                change = ?change,
                v4_added = v4_report.added.len(),
                v4_removed = v4_report.removed.len(),
                v6_added = v6_report.added.len(),
                v6_removed = v6_report.removed.len(),
                "Relay configuration applied"
            );
            self.applied.insert(row.name.clone(), row.clone());
            report.changes.push((row.name.clone(), change));
        }

        report.toggles_changed = self.config.apply(&settings);
        if report.is_empty() {
            debug!("Configuration unchanged");
        }
        Ok(report)
    }
}

fn check_capacity<K: ServerKey>(
    registry: &ServerRegistry<K>,
    interface: &str,
    servers: &[K],
) -> Result<()> {
    let distinct: HashSet<&K> = servers.iter().collect();
    if distinct.len() > registry.capacity() {
        return Err(RegistryError::CapacityExceeded {
            interface: interface.to_string(),
            max: registry.capacity(),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KEY_OPTION82_POLICY, KEY_V6_RELAY_ENABLED, MulticastServerRow, Option82Policy};
    use crate::registry::{MAX_V4_SERVERS_PER_INTERFACE, MAX_V6_SERVERS_PER_INTERFACE};
    use crate::test_util::RecordingMembership;
    use std::net::Ipv4Addr;

    struct Fixture {
        sync: ConfigSync,
        config: Arc<GlobalConfig>,
        v4: Arc<ServerRegistry<V4Server>>,
        v6: Arc<ServerRegistry<V6Server>>,
        membership: Arc<RecordingMembership>,
    }

    fn fixture() -> Fixture {
        let config = Arc::new(GlobalConfig::new());
        let membership = Arc::new(RecordingMembership::new());
        let v4 = Arc::new(ServerRegistry::new(MAX_V4_SERVERS_PER_INTERFACE));
        let v6 = Arc::new(ServerRegistry::with_membership(
            MAX_V6_SERVERS_PER_INTERFACE,
            membership.clone(),
        ));
        Fixture {
            sync: ConfigSync::new(config.clone(), v4.clone(), v6.clone()),
            config,
            v4,
            v6,
            membership,
        }
    }

    fn row(name: &str, helpers: &[&str]) -> InterfaceRow {
        InterfaceRow {
            name: name.to_string(),
            ipv4_helper_addresses: helpers.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn doc(rows: Vec<InterfaceRow>) -> ConfigDocument {
        ConfigDocument {
            interfaces: rows,
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_modify_delete() {
        let mut f = fixture();

        let report = f.sync.apply(&doc(vec![row("eth1", &["10.0.0.5"])])).unwrap();
        assert_eq!(report.change_of("eth1"), Some(RowChange::Inserted));
        assert_eq!(
            f.v4.lookup("eth1"),
            Some(vec![V4Server::dhcp(Ipv4Addr::new(10, 0, 0, 5))])
        );

        let report = f
            .sync
            .apply(&doc(vec![row("eth1", &["10.0.0.6"])]))
            .unwrap();
        assert_eq!(report.change_of("eth1"), Some(RowChange::Modified));
        assert_eq!(
            f.v4.lookup("eth1"),
            Some(vec![V4Server::dhcp(Ipv4Addr::new(10, 0, 0, 6))])
        );
        assert_eq!(f.v4.record_count(), 1);

        let report = f.sync.apply(&doc(vec![])).unwrap();
        assert_eq!(report.change_of("eth1"), Some(RowChange::Deleted));
        assert!(f.v4.is_empty());
        assert!(f.sync.applied().is_empty());
    }

    #[test]
    fn test_unchanged_rows_are_not_touched() {
        let mut f = fixture();
        let d = doc(vec![row("eth1", &["10.0.0.5"]), row("eth2", &["10.0.0.5"])]);
        f.sync.apply(&d).unwrap();
        let report = f.sync.apply(&d).unwrap();
        assert!(report.is_empty());
        assert_eq!(
            f.v4.ref_count(&V4Server::dhcp(Ipv4Addr::new(10, 0, 0, 5))),
            Some(2)
        );
    }

    #[test]
    fn test_other_vrf_skipped() {
        let mut f = fixture();
        let mut other = row("eth3", &["10.0.0.7"]);
        other.vrf = Some("vrf_red".to_string());
        let report = f
            .sync
            .apply(&doc(vec![row("eth1", &["10.0.0.5"]), other]))
            .unwrap();
        assert_eq!(report.skipped, vec!["eth3".to_string()]);
        assert!(f.v4.lookup("eth3").is_none());
        assert!(f.v4.lookup("eth1").is_some());
    }

    #[test]
    fn test_malformed_document_changes_nothing() {
        let mut f = fixture();
        f.sync.apply(&doc(vec![row("eth1", &["10.0.0.5"])])).unwrap();

        let err = f
            .sync
            .apply(&doc(vec![row("eth1", &["10.0.0.6"]), row("eth2", &["bogus"])]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddress(_)));
        assert_eq!(
            f.v4.lookup("eth1"),
            Some(vec![V4Server::dhcp(Ipv4Addr::new(10, 0, 0, 5))])
        );
    }

    #[test]
    fn test_duplicate_row_rejected() {
        let mut f = fixture();
        let err = f
            .sync
            .apply(&doc(vec![row("eth1", &["10.0.0.5"]), row("eth1", &["10.0.0.6"])]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert!(f.v4.is_empty());
    }

    #[test]
    fn test_capacity_rejection_surfaces() {
        let mut f = fixture();
        let addrs: Vec<String> = (1..=17).map(|i| format!("10.0.0.{i}")).collect();
        let helpers: Vec<&str> = addrs.iter().map(String::as_str).collect();
        let err = f.sync.apply(&doc(vec![row("eth1", &helpers)])).unwrap_err();
        assert!(matches!(err, ConfigError::Registry(_)));
        assert!(f.v4.is_empty());
        assert!(f.sync.applied().is_empty());
    }

    #[test]
    fn test_v6_rows_join_and_leave() {
        let mut f = fixture();
        let mut r = InterfaceRow {
            name: "eth1".to_string(),
            ipv6_unicast_servers: vec!["2001:db8::5".to_string()],
            ..Default::default()
        };
        r.ipv6_multicast_servers.push(MulticastServerRow {
            address: "ff05::1:3".to_string(),
            egress_ports: vec!["eth0".to_string()],
        });
        f.sync.apply(&doc(vec![r])).unwrap();
        assert_eq!(f.v6.lookup("eth1").map(|s| s.len()), Some(2));

        f.sync.apply(&doc(vec![])).unwrap();
        assert_eq!(f.membership.events(), vec!["join eth1", "leave eth1"]);
    }

    #[test]
    fn test_global_toggles_applied() {
        let mut f = fixture();
        let mut d = doc(vec![]);
        d.other_config
            .insert(KEY_OPTION82_POLICY.to_string(), "keep".to_string());
        d.other_config
            .insert(KEY_V6_RELAY_ENABLED.to_string(), "true".to_string());
        let report = f.sync.apply(&d).unwrap();
        assert_eq!(report.toggles_changed, 2);
        assert_eq!(f.config.option82_policy(), Option82Policy::Keep);
        assert!(f.config.v6_relay_enabled());
    }

    #[test]
    fn test_v6_overflow_leaves_v4_and_toggles() {
        let mut f = fixture();
        f.sync.apply(&doc(vec![row("eth1", &["10.0.0.5"])])).unwrap();

        let mut r = row("eth1", &["10.0.0.6", "10.0.0.7"]);
        r.ipv6_unicast_servers = (1..=9).map(|i| format!("2001:db8::{i}")).collect();
        let mut d = doc(vec![row("eth0", &["10.0.0.8"]), r]);
        d.other_config
            .insert(KEY_V6_RELAY_ENABLED.to_string(), "true".to_string());

        let err = f.sync.apply(&d).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Registry(RegistryError::CapacityExceeded { max: 8, .. })
        ));
        assert_eq!(
            f.v4.lookup("eth1"),
            Some(vec![V4Server::dhcp(Ipv4Addr::new(10, 0, 0, 5))])
        );
        assert!(f.v4.lookup("eth0").is_none());
        assert!(f.v6.is_empty());
        assert!(!f.config.v6_relay_enabled());
        assert_eq!(f.sync.applied().len(), 1);
        assert!(f.membership.events().is_empty());
    }
}
