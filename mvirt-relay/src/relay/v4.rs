//! DHCPv4 relay (RFC 1542, RFC 3046).

use super::option82::{self, RemoteId, RequestAction, ResponseAction};
use super::{DropReason, Outcome, RelayState};
use crate::config::RemoteIdKind;
use crate::stats::{InterfaceCounters, UNKNOWN_INTERFACE, inc};
use crate::wire::dhcpv4::{
    BOOTREPLY, BOOTREQUEST, CLIENT_PORT, DHCPACK, DHCPNAK, DhcpPacket, SERVER_PORT,
};
use crate::wire::{Ipv4UdpView, WireError, decode_ipv4_udp};
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::{debug, warn};

/// Requests that already crossed more relays than this are dropped
pub const MAX_HOPS: u8 = 16;

fn is_dhcp_port(port: u16) -> bool {
    port == SERVER_PORT || port == CLIENT_PORT
}

impl RelayState {
    /// Process one IPv4 datagram (IP header included) received on `ifindex`.
    ///
    /// DHCP traffic goes to the DHCPv4 relay, any other UDP to the broadcast
    /// forwarder.
    pub fn handle_v4_datagram(&self, datagram: &[u8], ifindex: u32) -> Outcome {
        let ifname = self.links.name_of(ifindex);
        let counters = self
            .stats
            .counters(ifname.as_deref().unwrap_or(UNKNOWN_INTERFACE));

        let view = match decode_ipv4_udp(datagram) {
            Ok(view) => view,
            Err(e) => {
                inc(&counters.bad_packets);
                debug!(ifindex, error = %e, "Dropping undecodable datagram");
                return Outcome::Dropped(e.into());
            }
        };

        if is_dhcp_port(view.dst_port) {
            self.relay_dhcpv4(&view, view.payload(datagram), ifindex, ifname.as_deref(), &counters)
        } else {
            self.forward_broadcast(datagram, &view, ifindex, ifname.as_deref(), &counters)
        }
    }

    fn relay_dhcpv4(
        &self,
        view: &Ipv4UdpView,
        payload: &[u8],
        ifindex: u32,
        ifname: Option<&str>,
        counters: &InterfaceCounters,
    ) -> Outcome {
        if !self.config.relay_enabled() {
            return DropReason::Disabled.into();
        }

        let packet = match DhcpPacket::new_checked(payload) {
            Ok(p) => p,
            Err(e) => {
                inc(&counters.bad_packets);
                debug!(ifindex, error = %e, "Dropping malformed BOOTP packet");
                return Outcome::Dropped(e.into());
            }
        };
        counters.record_v4_message(packet.op(), packet.message_type());

        match packet.op() {
            BOOTREQUEST => {
                let outcome = self.v4_client_path(view, payload, ifindex, ifname);
                match &outcome {
                    Outcome::Relayed { .. } => inc(&counters.v4_client_relayed),
                    Outcome::Dropped(reason) => {
                        inc(&counters.v4_client_dropped);
                        debug!(ifindex, reason = %reason, "Client request dropped");
                    }
                }
                outcome
            }
            BOOTREPLY => {
                if view.dst == Ipv4Addr::BROADCAST {
                    return DropReason::BroadcastReply.into();
                }
                let (outcome, egress) = self.v4_server_path(payload);
                let counters = match egress {
                    Some(name) => self.stats.counters(&name),
                    None => self.stats.counters(ifname.unwrap_or(UNKNOWN_INTERFACE)),
                };
                match &outcome {
                    Outcome::Relayed { .. } => inc(&counters.v4_server_relayed),
                    Outcome::Dropped(reason) => {
                        inc(&counters.v4_server_dropped);
                        debug!(ifindex, reason = %reason, "Server reply dropped");
                    }
                }
                outcome
            }
            _ => {
                inc(&counters.bad_packets);
                Outcome::Dropped(WireError::MalformedHeader("bootp op").into())
            }
        }
    }

    fn v4_client_path(
        &self,
        view: &Ipv4UdpView,
        payload: &[u8],
        ifindex: u32,
        ifname: Option<&str>,
    ) -> Outcome {
        let Some(ifname) = ifname else {
            return DropReason::UnknownInterface(ifindex).into();
        };
        let Some(if_ip) = self.links.ipv4_of(ifname).filter(|a| !a.is_unspecified()) else {
            return DropReason::NoInterfaceAddress(ifname.to_string()).into();
        };

        let mut buf = payload.to_vec();

        if self.config.option82_enabled() {
            let remote = match self.config.remote_id() {
                RemoteIdKind::Mac => {
                    let mac = self.links.system_mac();
                    mac.iter().any(|&b| b != 0).then_some(RemoteId::Mac(mac))
                }
                RemoteIdKind::Ip => Some(RemoteId::Ip(if_ip)),
            };
            match option82::process_request(&mut buf, self.config.option82_policy(), ifindex, remote)
            {
                Ok(RequestAction::Forward) | Ok(RequestAction::Skip) => {}
                Ok(RequestAction::Drop) => return DropReason::Option82Policy.into(),
                Err(e) => return Outcome::Dropped(e.into()),
            }
        }

        let mut packet = DhcpPacket::new_unchecked(&mut buf[..]);
        let hops = packet.hops();
        if hops > MAX_HOPS {
            return DropReason::HopLimitExceeded.into();
        }
        if self.config.hop_count_increment() {
            packet.set_hops(hops + 1);
        }
        if packet.giaddr().is_unspecified() {
            packet.set_giaddr(if_ip);
        }

        let servers: Vec<Ipv4Addr> = self
            .v4_servers
            .lookup(ifname)
            .unwrap_or_default()
            .into_iter()
            .filter(|s| s.port == SERVER_PORT)
            .map(|s| s.address)
            .collect();
        if servers.is_empty() {
            return DropReason::NoHelperConfigured(ifname.to_string()).into();
        }

        let src = view.src.is_unspecified().then_some(if_ip);
        let counters = self.stats.counters(ifname);
        let (mut sent, mut failed) = (0, 0);
        for server in servers {
            let dst = SocketAddrV4::new(server, SERVER_PORT);
            match self.transport.send_v4(&buf, dst, src, None) {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!(iface = %ifname, server = %dst, error = %e, "Failed to relay DHCP request");
                    inc(&counters.send_failures);
                    failed += 1;
                }
            }
        }
        Outcome::from_fan_out(sent, failed)
    }

    /// Returns the outcome and the client-facing interface, once known.
    fn v4_server_path(&self, payload: &[u8]) -> (Outcome, Option<String>) {
        let giaddr = DhcpPacket::new_unchecked(payload).giaddr();
        let Some(out_ifindex) = self.links.ifindex_by_ipv4(giaddr) else {
            return (DropReason::UnknownRelayAddress(giaddr).into(), None);
        };
        let Some(out_ifname) = self.links.name_of(out_ifindex) else {
            return (DropReason::UnknownInterface(out_ifindex).into(), None);
        };

        let outcome = self.deliver_reply(payload, giaddr, out_ifindex, &out_ifname);
        (outcome, Some(out_ifname))
    }

    fn deliver_reply(
        &self,
        payload: &[u8],
        giaddr: Ipv4Addr,
        out_ifindex: u32,
        out_ifname: &str,
    ) -> Outcome {
        let mut buf = payload.to_vec();

        if self.config.option82_enabled() {
            match option82::process_response(
                &mut buf,
                self.config.option82_validate(),
                self.config.remote_id(),
                self.links.as_ref(),
            ) {
                ResponseAction::Forward => {}
                ResponseAction::DropInvalid => return DropReason::InvalidOption82.into(),
                ResponseAction::DropUnvalidated => return DropReason::Option82Unvalidated.into(),
            }
        }

        let packet = DhcpPacket::new_unchecked(&buf[..]);
        let msg_type = packet.message_type();

        let dst = if packet.broadcast() || msg_type == Some(DHCPNAK) {
            Ipv4Addr::BROADCAST
        } else if !packet.yiaddr().is_unspecified() {
            packet.yiaddr()
        } else if msg_type == Some(DHCPACK) && !packet.ciaddr().is_unspecified() {
            packet.ciaddr()
        } else {
            return DropReason::NoClientAddress.into();
        };

        if dst != Ipv4Addr::BROADCAST
            && let Err(e) =
                self.transport
                    .add_arp_entry(out_ifname, dst, packet.chaddr(), packet.htype())
        {
            debug!(iface = %out_ifname, client = %dst, error = %e, "Failed to add ARP entry");
        }

        let dst = SocketAddrV4::new(dst, CLIENT_PORT);
        match self
            .transport
            .send_v4(&buf, dst, Some(giaddr), Some(out_ifindex))
        {
            Ok(()) => Outcome::Relayed { sent: 1, failed: 0 },
            Err(e) => {
                warn!(iface = %out_ifname, client = %dst, error = %e, "Failed to relay DHCP reply");
                inc(&self.stats.counters(out_ifname).send_failures);
                DropReason::SendFailed.into()
            }
        }
    }
}
