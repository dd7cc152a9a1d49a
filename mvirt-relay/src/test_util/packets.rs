//! Protocol packet builders for relay tests
//!
//! DHCPv4 messages are encoded with dhcproto, IPv4/UDP framing goes through the
//! relay's smoltcp-based encoder and DHCPv6 messages are assembled from raw
//! options.

use crate::links::MacAddr;
use crate::relay::option79::{OPTION_CLIENT_ID, OPTION_INTERFACE_ID, OPTION_RELAY_MSG};
use crate::wire::dhcpv4::{MIN_BOOTP_LEN, OPTIONS_OFFSET};
use crate::wire::dhcpv6::{Dhcpv6MessageType, RelayHeader, encode_relay, push_option};
use crate::wire::ipv4::{IPV4_HEADER_SIZE, UDP_HEADER_SIZE};
use crate::wire::options::TlvCursor;
use crate::wire::{Ipv4UdpHeader, encode_ipv4_udp};
use dhcproto::v4::{DhcpOption, Flags, Message, MessageType, Opcode};
use dhcproto::{Encodable, Encoder};
use std::net::{Ipv4Addr, Ipv6Addr};

/// MAC address used for test clients
pub const CLIENT_MAC: MacAddr = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

/// Link-local address derived from [`CLIENT_MAC`] (EUI-64)
pub const CLIENT_LINK_LOCAL: Ipv6Addr = Ipv6Addr::new(0xfe80, 0, 0, 0, 0x5054, 0x00ff, 0xfe12, 0x3456);

// ============================================================================
// DHCPv4
// ============================================================================

/// A client request as sent by a DHCP client.
pub fn dhcp_request(msg_type: MessageType, chaddr: MacAddr, xid: u32) -> Message {
    let mut msg = Message::default();
    msg.set_opcode(Opcode::BootRequest);
    msg.set_xid(xid);
    msg.set_chaddr(&chaddr);
    msg.set_flags(Flags::default().set_broadcast());
    msg.opts_mut().insert(DhcpOption::MessageType(msg_type));
    msg
}

/// A server reply addressed to the relay at `giaddr`.
pub fn dhcp_reply(
    msg_type: MessageType,
    chaddr: MacAddr,
    xid: u32,
    yiaddr: Ipv4Addr,
    giaddr: Ipv4Addr,
) -> Message {
    let mut msg = Message::default();
    msg.set_opcode(Opcode::BootReply);
    msg.set_xid(xid);
    msg.set_chaddr(&chaddr);
    msg.set_yiaddr(yiaddr);
    msg.set_giaddr(giaddr);
    msg.opts_mut().insert(DhcpOption::MessageType(msg_type));
    msg.opts_mut()
        .insert(DhcpOption::ServerIdentifier(Ipv4Addr::new(10, 0, 0, 5)));
    msg
}

/// Encode a message, padded to the BOOTP minimum.
pub fn encode_dhcp(msg: &Message) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut encoder = Encoder::new(&mut buf);
    msg.encode(&mut encoder).expect("DHCP encoding failed");
    if buf.len() < MIN_BOOTP_LEN {
        buf.resize(MIN_BOOTP_LEN, 0);
    }
    buf
}

/// Insert raw option bytes right before the END option.
pub fn with_raw_option(mut payload: Vec<u8>, option: &[u8]) -> Vec<u8> {
    let mut cursor = TlvCursor::dhcpv4(&payload[OPTIONS_OFFSET..]);
    while cursor.next_tlv().is_some() {}
    let end = OPTIONS_OFFSET
        + cursor
            .end_offset()
            .unwrap_or(payload.len() - OPTIONS_OFFSET);
    payload.splice(end..end, option.iter().copied());
    payload
}

// ============================================================================
// IPv4 / UDP
// ============================================================================

/// Wrap `payload` in IPv4 and UDP headers with valid checksums.
pub fn ipv4_udp(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    ttl: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = vec![0u8; IPV4_HEADER_SIZE + UDP_HEADER_SIZE + payload.len()];
    let header = Ipv4UdpHeader {
        src,
        dst,
        src_port,
        dst_port,
        ttl,
    };
    encode_ipv4_udp(&mut buf, &header, payload).expect("IPv4/UDP encoding failed");
    buf
}

// ============================================================================
// DHCPv6
// ============================================================================

/// DUID-LL for an Ethernet address.
pub fn duid_ll(mac: MacAddr) -> Vec<u8> {
    let mut duid = vec![0, 3, 0, 1];
    duid.extend_from_slice(&mac);
    duid
}

/// A client message with the given options.
pub fn dhcpv6_message(msg_type: Dhcpv6MessageType, xid: u32, options: &[(u16, &[u8])]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(msg_type as u8);
    buf.extend_from_slice(&xid.to_be_bytes()[1..]);
    for (code, value) in options {
        push_option(&mut buf, *code, value);
    }
    buf
}

/// A SOLICIT carrying a DUID-LL client identifier for `mac`.
pub fn dhcpv6_solicit(mac: MacAddr, xid: u32) -> Vec<u8> {
    dhcpv6_message(
        Dhcpv6MessageType::Solicit,
        xid,
        &[(OPTION_CLIENT_ID, &duid_ll(mac))],
    )
}

/// A RELAY-FORW wrapping `inner`, as sent by a downstream relay.
pub fn relay_forw(hop_count: u8, link: Ipv6Addr, peer: Ipv6Addr, inner: &[u8]) -> Vec<u8> {
    let mut options = Vec::new();
    push_option(&mut options, OPTION_RELAY_MSG, inner);
    let mut buf = Vec::new();
    encode_relay(
        &mut buf,
        &RelayHeader {
            msg_type: Dhcpv6MessageType::RelayForw,
            hop_count,
            link_address: link,
            peer_address: peer,
        },
        &options,
    );
    buf
}

/// A RELAY-REPL from a server, for the client at `peer`.
pub fn relay_reply(peer: Ipv6Addr, interface_id: Option<u32>, inner: &[u8]) -> Vec<u8> {
    let mut options = Vec::new();
    if let Some(id) = interface_id {
        push_option(&mut options, OPTION_INTERFACE_ID, &id.to_be_bytes());
    }
    push_option(&mut options, OPTION_RELAY_MSG, inner);
    let mut buf = Vec::new();
    encode_relay(
        &mut buf,
        &RelayHeader {
            msg_type: Dhcpv6MessageType::RelayReply,
            hop_count: 0,
            link_address: Ipv6Addr::UNSPECIFIED,
            peer_address: peer,
        },
        &options,
    );
    buf
}
