//! Text dumps of the live relay registries.
//!
//! Each dump takes one registry snapshot and renders from it, so the output is
//! consistent even while configuration changes are being applied.

use crate::config::GlobalSettings;
use crate::registry::{InterfaceSnapshot, ServerRegistry, V4Server, V6Server};
use std::fmt;

fn enabled(flag: bool) -> &'static str {
    if flag { "enabled" } else { "disabled" }
}

/// DHCPv4 relay and UDP forwarder dump, optionally filtered by interface and port.
#[derive(Debug, Clone)]
pub struct V4Dump {
    settings: GlobalSettings,
    interface: Option<String>,
    port: Option<u16>,
    interfaces: Vec<InterfaceSnapshot<V4Server>>,
}

impl V4Dump {
    pub fn new(
        settings: GlobalSettings,
        registry: &ServerRegistry<V4Server>,
        interface: Option<&str>,
        port: Option<u16>,
    ) -> Self {
        Self {
            settings,
            interface: interface.map(str::to_string),
            port: port.filter(|&p| p != 0),
            interfaces: registry.snapshot(interface),
        }
    }
}

impl fmt::Display for V4Dump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "DHCP Relay : {}", enabled(self.settings.relay_enabled))?;
        writeln!(
            f,
            "UDP Broadcast Forwarder : {}",
            enabled(self.settings.udp_forwarder_enabled)
        )?;

        if let Some(name) = &self.interface
            && self.interfaces.is_empty()
        {
            return writeln!(f, "No helper address configured on this interface :{name}");
        }

        for iface in &self.interfaces {
            writeln!(f, "Interface : {}", iface.name)?;
            let mut found = false;
            for entry in &iface.servers {
                if self.port.is_some_and(|p| p != entry.server.port) {
                    continue;
                }
                found = true;
                writeln!(
                    f,
                    "Server IP Address : {}, Port no : {}, Server Ip ref count : {}",
                    entry.server.address, entry.server.port, entry.ref_count
                )?;
            }
            if let Some(port) = self.port
                && !found
            {
                writeln!(f, "No IP address associated with this port: {port}")?;
            }
        }
        Ok(())
    }
}

/// DHCPv6 relay dump, optionally filtered by interface.
#[derive(Debug, Clone)]
pub struct V6Dump {
    settings: GlobalSettings,
    interface: Option<String>,
    interfaces: Vec<InterfaceSnapshot<V6Server>>,
}

impl V6Dump {
    pub fn new(
        settings: GlobalSettings,
        registry: &ServerRegistry<V6Server>,
        interface: Option<&str>,
    ) -> Self {
        Self {
            settings,
            interface: interface.map(str::to_string),
            interfaces: registry.snapshot(interface),
        }
    }
}

impl fmt::Display for V6Dump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "DHCPv6 Relay : {}", enabled(self.settings.v6_relay_enabled))?;
        writeln!(
            f,
            "DHCPv6 Relay Option79 : {}",
            enabled(self.settings.option79_enabled)
        )?;

        if let Some(name) = &self.interface
            && self.interfaces.is_empty()
        {
            return writeln!(f, "No servers are configured on this interface :{name}");
        }

        for iface in &self.interfaces {
            writeln!(f, "Interface {}: {}", iface.name, iface.servers.len())?;
            for entry in &iface.servers {
                writeln!(
                    f,
                    "{},ref {},egress {}",
                    entry.server.address,
                    entry.ref_count,
                    entry.server.egress.as_deref().unwrap_or("-")
                )?;
            }
        }
        Ok(())
    }
}
