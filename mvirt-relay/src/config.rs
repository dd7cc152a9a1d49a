//! Relay configuration.
//!
//! [`GlobalConfig`] holds the process-wide toggles read by the packet path. Each
//! toggle sits in its own atomic cell, so a receiver thread never sees a torn
//! value while the configuration path updates it.
//!
//! [`ConfigDocument`] models the configuration rows the daemon loads from disk
//! and hands to [`crate::sync::ConfigSync`].

use crate::registry::{RegistryError, V4Server, V6Server};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Default statistics refresh interval in seconds
pub const DEFAULT_STATS_INTERVAL: u64 = 5;

/// Name of the only VRF the relay serves unless configured otherwise
pub const DEFAULT_VRF: &str = "vrf_default";

pub const KEY_RELAY_DISABLED: &str = "dhcp_relay_disabled";
pub const KEY_HOP_COUNT_INCREMENT_DISABLED: &str = "v4relay_hop_count_increment_disabled";
pub const KEY_OPTION82_ENABLED: &str = "v4relay_option82_enabled";
pub const KEY_OPTION82_VALIDATION: &str = "v4relay_option82_validation_enabled";
pub const KEY_OPTION82_POLICY: &str = "v4relay_option82_policy";
pub const KEY_OPTION82_REMOTE_ID: &str = "v4relay_option82_remote_id";
pub const KEY_V6_RELAY_ENABLED: &str = "v6relay_enabled";
pub const KEY_OPTION79_ENABLED: &str = "v6relay_option79_enabled";
pub const KEY_UDP_FORWARDER_ENABLED: &str = "udp_bcast_forwarder_enabled";
pub const KEY_STATS_INTERVAL: &str = "stats_update_interval";

/// Well-known UDP services accepted by name for the broadcast forwarder.
pub const UDP_PROTOCOLS: &[(&str, u16)] = &[
    ("dns", 53),
    ("ntp", 123),
    ("netbios-ns", 137),
    ("netbios-dgm", 138),
    ("radius", 1812),
    ("radius-old", 1645),
    ("rip", 520),
    ("snmp", 161),
    ("snmp-trap", 162),
    ("tftp", 69),
    ("timep", 37),
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid address '{0}'")]
    InvalidAddress(String),

    #[error("Unknown UDP protocol '{0}'")]
    UnknownProtocol(String),

    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// What to do with an Option 82 already present in a client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Option82Policy {
    /// Leave the existing option alone and forward.
    Keep,
    /// Drop the request.
    Drop,
    /// Strip the existing option and insert our own.
    #[default]
    Replace,
}

impl Option82Policy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Option82Policy::Keep => "keep",
            Option82Policy::Drop => "drop",
            Option82Policy::Replace => "replace",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Option82Policy::Keep,
            1 => Option82Policy::Drop,
            _ => Option82Policy::Replace,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Option82Policy::Keep => 0,
            Option82Policy::Drop => 1,
            Option82Policy::Replace => 2,
        }
    }
}

impl std::str::FromStr for Option82Policy {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "keep" => Ok(Option82Policy::Keep),
            "drop" => Ok(Option82Policy::Drop),
            "replace" => Ok(Option82Policy::Replace),
            _ => Err(()),
        }
    }
}

/// Identity carried in the Option 82 Remote-ID sub-option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteIdKind {
    #[default]
    Mac,
    Ip,
}

impl RemoteIdKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteIdKind::Mac => "mac",
            RemoteIdKind::Ip => "ip",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => RemoteIdKind::Ip,
            _ => RemoteIdKind::Mac,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            RemoteIdKind::Mac => 0,
            RemoteIdKind::Ip => 1,
        }
    }
}

impl std::str::FromStr for RemoteIdKind {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "mac" => Ok(RemoteIdKind::Mac),
            "ip" => Ok(RemoteIdKind::Ip),
            _ => Err(()),
        }
    }
}

/// Plain copy of every global toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GlobalSettings {
    pub relay_enabled: bool,
    pub hop_count_increment: bool,
    pub option82_enabled: bool,
    pub option82_validate: bool,
    pub option82_policy: Option82Policy,
    pub remote_id: RemoteIdKind,
    pub v6_relay_enabled: bool,
    pub option79_enabled: bool,
    pub udp_forwarder_enabled: bool,
    pub stats_interval_secs: u64,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            relay_enabled: true,
            hop_count_increment: true,
            option82_enabled: false,
            option82_validate: false,
            option82_policy: Option82Policy::Replace,
            remote_id: RemoteIdKind::Mac,
            v6_relay_enabled: false,
            option79_enabled: false,
            udp_forwarder_enabled: false,
            stats_interval_secs: DEFAULT_STATS_INTERVAL,
        }
    }
}

fn flag(map: &BTreeMap<String, String>, key: &str) -> bool {
    map.get(key).is_some_and(|v| v == "true")
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

impl GlobalSettings {
    /// Read the toggles from an `other_config` map.
    ///
    /// Boolean keys count as set only for the literal `"true"`. Absent keys
    /// take their defaults.
    pub fn from_other_config(map: &BTreeMap<String, String>) -> Result<Self> {
        let defaults = Self::default();

        let option82_policy = match map.get(KEY_OPTION82_POLICY) {
            Some(v) => v
                .parse()
                .map_err(|_| invalid(KEY_OPTION82_POLICY, v))?,
            None => defaults.option82_policy,
        };
        let remote_id = match map.get(KEY_OPTION82_REMOTE_ID) {
            Some(v) => v
                .parse()
                .map_err(|_| invalid(KEY_OPTION82_REMOTE_ID, v))?,
            None => defaults.remote_id,
        };
        let stats_interval_secs = match map.get(KEY_STATS_INTERVAL) {
            Some(v) => match v.parse::<u64>() {
                Ok(secs) if secs > 0 => secs,
                _ => return Err(invalid(KEY_STATS_INTERVAL, v)),
            },
            None => defaults.stats_interval_secs,
        };

        Ok(Self {
            relay_enabled: !flag(map, KEY_RELAY_DISABLED),
            hop_count_increment: !flag(map, KEY_HOP_COUNT_INCREMENT_DISABLED),
            option82_enabled: flag(map, KEY_OPTION82_ENABLED),
            option82_validate: flag(map, KEY_OPTION82_VALIDATION),
            option82_policy,
            remote_id,
            v6_relay_enabled: flag(map, KEY_V6_RELAY_ENABLED),
            option79_enabled: flag(map, KEY_OPTION79_ENABLED),
            udp_forwarder_enabled: flag(map, KEY_UDP_FORWARDER_ENABLED),
            stats_interval_secs,
        })
    }
}

/// Live global toggles shared between the configuration path and receivers.
#[derive(Debug)]
pub struct GlobalConfig {
    relay_enabled: AtomicBool,
    hop_count_increment: AtomicBool,
    option82_enabled: AtomicBool,
    option82_validate: AtomicBool,
    option82_policy: AtomicU8,
    remote_id: AtomicU8,
    v6_relay_enabled: AtomicBool,
    option79_enabled: AtomicBool,
    udp_forwarder_enabled: AtomicBool,
    stats_interval_secs: AtomicU64,
}

impl GlobalConfig {
    pub fn new() -> Self {
        Self::from_settings(&GlobalSettings::default())
    }

    pub fn from_settings(s: &GlobalSettings) -> Self {
        Self {
            relay_enabled: AtomicBool::new(s.relay_enabled),
            hop_count_increment: AtomicBool::new(s.hop_count_increment),
            option82_enabled: AtomicBool::new(s.option82_enabled),
            option82_validate: AtomicBool::new(s.option82_validate),
            option82_policy: AtomicU8::new(s.option82_policy.to_u8()),
            remote_id: AtomicU8::new(s.remote_id.to_u8()),
            v6_relay_enabled: AtomicBool::new(s.v6_relay_enabled),
            option79_enabled: AtomicBool::new(s.option79_enabled),
            udp_forwarder_enabled: AtomicBool::new(s.udp_forwarder_enabled),
            stats_interval_secs: AtomicU64::new(s.stats_interval_secs),
        }
    }

    pub fn relay_enabled(&self) -> bool {
        self.relay_enabled.load(Ordering::Relaxed)
    }

    pub fn hop_count_increment(&self) -> bool {
        self.hop_count_increment.load(Ordering::Relaxed)
    }

    pub fn option82_enabled(&self) -> bool {
        self.option82_enabled.load(Ordering::Relaxed)
    }

    pub fn option82_validate(&self) -> bool {
        self.option82_validate.load(Ordering::Relaxed)
    }

    pub fn option82_policy(&self) -> Option82Policy {
        Option82Policy::from_u8(self.option82_policy.load(Ordering::Relaxed))
    }

    pub fn remote_id(&self) -> RemoteIdKind {
        RemoteIdKind::from_u8(self.remote_id.load(Ordering::Relaxed))
    }

    pub fn v6_relay_enabled(&self) -> bool {
        self.v6_relay_enabled.load(Ordering::Relaxed)
    }

    pub fn option79_enabled(&self) -> bool {
        self.option79_enabled.load(Ordering::Relaxed)
    }

    pub fn udp_forwarder_enabled(&self) -> bool {
        self.udp_forwarder_enabled.load(Ordering::Relaxed)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> GlobalSettings {
        GlobalSettings {
            relay_enabled: self.relay_enabled(),
            hop_count_increment: self.hop_count_increment(),
            option82_enabled: self.option82_enabled(),
            option82_validate: self.option82_validate(),
            option82_policy: self.option82_policy(),
            remote_id: self.remote_id(),
            v6_relay_enabled: self.v6_relay_enabled(),
            option79_enabled: self.option79_enabled(),
            udp_forwarder_enabled: self.udp_forwarder_enabled(),
            stats_interval_secs: self.stats_interval_secs.load(Ordering::Relaxed),
        }
    }

    /// Store every toggle that differs from `new`, logging old and new values.
    ///
    /// Returns the number of toggles that changed.
    pub fn apply(&self, new: &GlobalSettings) -> usize {
        let mut changed = 0;

        macro_rules! swap_bool {
            ($field:ident, $key:expr) => {
                let old = self.$field.swap(new.$field, Ordering::Relaxed);
                if old != new.$field {
                    info!(key = $key, old, new = new.$field, "Relay setting changed");
                    changed += 1;
                }
            };
        }

        swap_bool!(relay_enabled, KEY_RELAY_DISABLED);
        swap_bool!(hop_count_increment, KEY_HOP_COUNT_INCREMENT_DISABLED);
        swap_bool!(option82_enabled, KEY_OPTION82_ENABLED);
        swap_bool!(option82_validate, KEY_OPTION82_VALIDATION);
        swap_bool!(v6_relay_enabled, KEY_V6_RELAY_ENABLED);
        swap_bool!(option79_enabled, KEY_OPTION79_ENABLED);
        swap_bool!(udp_forwarder_enabled, KEY_UDP_FORWARDER_ENABLED);

        let old = Option82Policy::from_u8(
            self.option82_policy
                .swap(new.option82_policy.to_u8(), Ordering::Relaxed),
        );
        if old != new.option82_policy {
            info!(
                key = KEY_OPTION82_POLICY,
                old = old.as_str(),
                new = new.option82_policy.as_str(),
                "Relay setting changed"
            );
            changed += 1;
        }

        let old = RemoteIdKind::from_u8(self.remote_id.swap(new.remote_id.to_u8(), Ordering::Relaxed));
        if old != new.remote_id {
            info!(
                key = KEY_OPTION82_REMOTE_ID,
                old = old.as_str(),
                new = new.remote_id.as_str(),
                "Relay setting changed"
            );
            changed += 1;
        }

        let old = self
            .stats_interval_secs
            .swap(new.stats_interval_secs, Ordering::Relaxed);
        if old != new.stats_interval_secs {
            info!(
                key = KEY_STATS_INTERVAL,
                old,
                new = new.stats_interval_secs,
                "Relay setting changed"
            );
            changed += 1;
        }

        changed
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A DHCPv6 multicast server with the ports it is reached through.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MulticastServerRow {
    pub address: String,
    pub egress_ports: Vec<String>,
}

/// Relay configuration of one interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceRow {
    pub name: String,
    pub vrf: Option<String>,
    pub ipv4_helper_addresses: Vec<String>,
    pub udp_forward_servers: Vec<String>,
    pub ipv6_unicast_servers: Vec<String>,
    pub ipv6_multicast_servers: Vec<MulticastServerRow>,
}

impl InterfaceRow {
    /// The row belongs to `default_vrf` (rows without a VRF do too).
    pub fn in_vrf(&self, default_vrf: &str) -> bool {
        self.vrf.as_deref().is_none_or(|vrf| vrf == default_vrf)
    }

    /// DHCP helpers followed by UDP forwarding targets.
    pub fn v4_servers(&self) -> Result<Vec<V4Server>> {
        let mut servers = Vec::new();
        for addr in &self.ipv4_helper_addresses {
            servers.push(V4Server::dhcp(parse_ipv4(addr)?));
        }
        for entry in &self.udp_forward_servers {
            servers.push(parse_udp_server(entry)?);
        }
        Ok(servers)
    }

    /// Unicast servers followed by one entry per multicast (group, egress) pair.
    pub fn v6_servers(&self) -> Result<Vec<V6Server>> {
        let mut servers = Vec::new();
        for addr in &self.ipv6_unicast_servers {
            let address = parse_ipv6(addr)?;
            if address.is_multicast() {
                return Err(ConfigError::InvalidAddress(addr.clone()));
            }
            servers.push(V6Server::unicast(address));
        }
        for row in &self.ipv6_multicast_servers {
            let address = parse_ipv6(&row.address)?;
            if !address.is_multicast() {
                return Err(ConfigError::InvalidAddress(row.address.clone()));
            }
            if row.egress_ports.is_empty() {
                return Err(invalid("egress_ports", &row.address));
            }
            for egress in &row.egress_ports {
                servers.push(V6Server::multicast(address, egress.clone()));
            }
        }
        Ok(servers)
    }
}

/// The full configuration as loaded from disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigDocument {
    pub default_vrf: String,
    pub other_config: BTreeMap<String, String>,
    pub interfaces: Vec<InterfaceRow>,
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self {
            default_vrf: DEFAULT_VRF.to_string(),
            other_config: BTreeMap::new(),
            interfaces: Vec::new(),
        }
    }
}

impl ConfigDocument {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn settings(&self) -> Result<GlobalSettings> {
        GlobalSettings::from_other_config(&self.other_config)
    }

    /// Parse every row without applying anything.
    pub fn validate(&self) -> Result<()> {
        self.settings()?;
        for row in &self.interfaces {
            if row.name.is_empty() {
                return Err(invalid("name", ""));
            }
            row.v4_servers()?;
            row.v6_servers()?;
        }
        Ok(())
    }
}

fn parse_ipv4(s: &str) -> Result<Ipv4Addr> {
    s.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidAddress(s.to_string()))
}

fn parse_ipv6(s: &str) -> Result<Ipv6Addr> {
    s.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidAddress(s.to_string()))
}

/// Resolve a numeric port or a name from [`UDP_PROTOCOLS`].
pub fn udp_port_from_str(s: &str) -> Result<u16> {
    if let Ok(port) = s.parse::<u16>() {
        if port == 0 {
            return Err(invalid("port", s));
        }
        return Ok(port);
    }
    UDP_PROTOCOLS
        .iter()
        .find(|(name, _)| *name == s)
        .map(|(_, port)| *port)
        .ok_or_else(|| ConfigError::UnknownProtocol(s.to_string()))
}

/// Name of a well-known UDP port, if it has one.
pub fn udp_protocol_name(port: u16) -> Option<&'static str> {
    UDP_PROTOCOLS
        .iter()
        .find(|(_, p)| *p == port)
        .map(|(name, _)| *name)
}

/// Parse an `address:port` forwarding target.
pub fn parse_udp_server(s: &str) -> Result<V4Server> {
    let (addr, port) = s
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::InvalidAddress(s.to_string()))?;
    let address = match addr.parse::<IpAddr>() {
        Ok(IpAddr::V4(a)) => a,
        _ => return Err(ConfigError::InvalidAddress(s.to_string())),
    };
    Ok(V4Server::new(address, udp_port_from_str(port)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_from_empty_map() {
        let s = GlobalSettings::from_other_config(&BTreeMap::new()).unwrap();
        assert_eq!(s, GlobalSettings::default());
        assert!(s.relay_enabled);
        assert_eq!(s.option82_policy, Option82Policy::Replace);
    }

    #[test]
    fn test_booleans_require_literal_true() {
        let s = GlobalSettings::from_other_config(&map(&[
            (KEY_RELAY_DISABLED, "yes"),
            (KEY_OPTION82_ENABLED, "true"),
            (KEY_V6_RELAY_ENABLED, "TRUE"),
        ]))
        .unwrap();
        assert!(s.relay_enabled);
        assert!(s.option82_enabled);
        assert!(!s.v6_relay_enabled);
    }

    #[test]
    fn test_invalid_enum_values_rejected() {
        assert!(matches!(
            GlobalSettings::from_other_config(&map(&[(KEY_OPTION82_POLICY, "append")])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(GlobalSettings::from_other_config(&map(&[(KEY_OPTION82_REMOTE_ID, "vlan")])).is_err());
        assert!(GlobalSettings::from_other_config(&map(&[(KEY_STATS_INTERVAL, "0")])).is_err());
    }

    #[test]
    fn test_apply_counts_changes() {
        let config = GlobalConfig::new();
        let mut s = config.snapshot();
        assert_eq!(config.apply(&s), 0);

        s.option82_policy = Option82Policy::Keep;
        s.remote_id = RemoteIdKind::Ip;
        s.relay_enabled = false;
        assert_eq!(config.apply(&s), 3);
        assert_eq!(config.option82_policy(), Option82Policy::Keep);
        assert_eq!(config.remote_id(), RemoteIdKind::Ip);
        assert!(!config.relay_enabled());
        assert_eq!(config.snapshot(), s);
    }

    #[test]
    fn test_udp_ports() {
        assert_eq!(udp_port_from_str("dns").unwrap(), 53);
        assert_eq!(udp_port_from_str("timep").unwrap(), 37);
        assert_eq!(udp_port_from_str("5353").unwrap(), 5353);
        assert!(matches!(
            udp_port_from_str("gopher"),
            Err(ConfigError::UnknownProtocol(_))
        ));
        assert_eq!(udp_protocol_name(520), Some("rip"));

        let server = parse_udp_server("10.0.0.9:ntp").unwrap();
        assert_eq!(server, V4Server::new(Ipv4Addr::new(10, 0, 0, 9), 123));
        assert!(parse_udp_server("10.0.0.9").is_err());
        assert!(parse_udp_server("::1:53").is_err());
    }

    #[test]
    fn test_interface_row_servers() {
        let row = InterfaceRow {
            name: "eth1".into(),
            ipv4_helper_addresses: vec!["10.0.0.5".into()],
            udp_forward_servers: vec!["10.0.0.9:dns".into()],
            ipv6_unicast_servers: vec!["2001:db8::1".into()],
            ipv6_multicast_servers: vec![MulticastServerRow {
                address: "ff05::1:3".into(),
                egress_ports: vec!["eth2".into(), "eth3".into()],
            }],
            ..Default::default()
        };

        let v4 = row.v4_servers().unwrap();
        assert_eq!(v4[0], V4Server::dhcp(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(v4[1].port, 53);

        let v6 = row.v6_servers().unwrap();
        assert_eq!(v6.len(), 3);
        assert_eq!(v6[2].egress.as_deref(), Some("eth3"));
    }

    #[test]
    fn test_multicast_in_unicast_list_rejected() {
        let row = InterfaceRow {
            name: "eth1".into(),
            ipv6_unicast_servers: vec!["ff05::1:3".into()],
            ..Default::default()
        };
        assert!(matches!(row.v6_servers(), Err(ConfigError::InvalidAddress(_))));
    }

    #[test]
    fn test_document_parse() {
        let doc = ConfigDocument::from_json(
            r#"{
                "other_config": { "v6relay_enabled": "true" },
                "interfaces": [
                    { "name": "eth1", "ipv4_helper_addresses": ["10.0.0.5"] },
                    { "name": "eth2", "vrf": "red" }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(doc.default_vrf, DEFAULT_VRF);
        assert!(doc.settings().unwrap().v6_relay_enabled);
        assert!(doc.interfaces[0].in_vrf(&doc.default_vrf));
        assert!(!doc.interfaces[1].in_vrf(&doc.default_vrf));
        doc.validate().unwrap();
    }
}
