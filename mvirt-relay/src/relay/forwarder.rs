//! UDP broadcast forwarder.
//!
//! Broadcast datagrams for a configured UDP port are re-emitted as unicast to
//! every server configured for that port on the ingress interface. The client's
//! source address and ports are kept and the TTL is decremented.

use super::{DropReason, Outcome, RelayState};
use crate::stats::{InterfaceCounters, inc};
use crate::wire::ipv4::{IPV4_HEADER_SIZE, UDP_HEADER_SIZE};
use crate::wire::{Ipv4UdpHeader, Ipv4UdpView, encode_ipv4_udp};
use std::net::Ipv4Addr;
use tracing::{debug, warn};

impl RelayState {
    pub(crate) fn forward_broadcast(
        &self,
        datagram: &[u8],
        view: &Ipv4UdpView,
        ifindex: u32,
        ifname: Option<&str>,
        counters: &InterfaceCounters,
    ) -> Outcome {
        let outcome = self.forward_to_servers(datagram, view, ifindex, ifname);
        match &outcome {
            Outcome::Relayed { .. } => inc(&counters.udp_forwarded),
            Outcome::Dropped(reason) => {
                inc(&counters.udp_dropped);
                debug!(ifindex, port = view.dst_port, reason = %reason, "Broadcast not forwarded");
            }
        }
        outcome
    }

    fn forward_to_servers(
        &self,
        datagram: &[u8],
        view: &Ipv4UdpView,
        ifindex: u32,
        ifname: Option<&str>,
    ) -> Outcome {
        if !self.config.udp_forwarder_enabled() {
            return DropReason::Disabled.into();
        }
        if view.dst != Ipv4Addr::BROADCAST && !self.links.is_subnet_broadcast(view.dst) {
            return DropReason::NotBroadcast.into();
        }
        if view.ttl <= 1 {
            return DropReason::TtlExpired.into();
        }
        let Some(ifname) = ifname else {
            return DropReason::UnknownInterface(ifindex).into();
        };

        let servers: Vec<Ipv4Addr> = self
            .v4_servers
            .lookup(ifname)
            .unwrap_or_default()
            .into_iter()
            .filter(|s| s.port == view.dst_port)
            .map(|s| s.address)
            .collect();
        if servers.is_empty() {
            return DropReason::NoServerForPort(view.dst_port).into();
        }

        let src = if view.src.is_unspecified() {
            match self.links.ipv4_of(ifname) {
                Some(addr) => addr,
                None => return DropReason::NoInterfaceAddress(ifname.to_string()).into(),
            }
        } else {
            view.src
        };

        let payload = view.payload(datagram);
        let mut out = vec![0u8; IPV4_HEADER_SIZE + UDP_HEADER_SIZE + payload.len()];
        let counters = self.stats.counters(ifname);
        let (mut sent, mut failed) = (0, 0);

        for server in servers {
            let header = Ipv4UdpHeader {
                src,
                dst: server,
                src_port: view.src_port,
                dst_port: view.dst_port,
                ttl: view.ttl - 1,
            };
            let len = match encode_ipv4_udp(&mut out, &header, payload) {
                Ok(len) => len,
                Err(e) => return Outcome::Dropped(e.into()),
            };
            match self.transport.send_raw_v4(&out[..len], server) {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!(iface = %ifname, server = %server, error = %e, "Failed to forward broadcast");
                    inc(&counters.send_failures);
                    failed += 1;
                }
            }
        }

        Outcome::from_fan_out(sent, failed)
    }
}
