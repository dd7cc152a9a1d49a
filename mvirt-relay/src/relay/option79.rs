//! DHCPv6 relay options: Relay Message (9), Interface-ID (18) and Client
//! Link-Layer Address (79, RFC 6939).

use crate::links::MacAddr;
use crate::wire::WireError;
use crate::wire::dhcpv6::{
    CLIENT_PORT, Dhcpv6MessageType, MIN_MESSAGE_SIZE, RELAY_HEADER_SIZE, SERVER_PORT,
    decode_dhcpv6_relay, push_option,
};
use crate::wire::options::TlvCursor;
use std::net::Ipv6Addr;
use thiserror::Error;

/// Client Identifier option
pub const OPTION_CLIENT_ID: u16 = 1;

/// Relay Message option
pub const OPTION_RELAY_MSG: u16 = 9;

/// Interface-ID option
pub const OPTION_INTERFACE_ID: u16 = 18;

/// Client Link-Layer Address option
pub const OPTION_CLIENT_LINKLAYER_ADDR: u16 = 79;

/// ARP hardware type for Ethernet
pub const HWTYPE_ETHERNET: u16 = 1;

/// Relay messages longer than this are ignored
pub const MAX_RELAY_MESSAGE_LEN: usize = 1024;

const DUID_LLT: u16 = 1;
const DUID_LL: u16 = 3;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Option79Error {
    #[error("relay-reply carries no usable relay message")]
    MissingRelayMessage,

    #[error("client address is link-local and no interface-id was given")]
    AmbiguousClientInterface,

    #[error("malformed relay options: {0}")]
    Malformed(#[from] WireError),
}

/// Options of a relay-forward message wrapping `inner`.
pub fn build_options(inner: &[u8], ifindex: u32, client_mac: Option<MacAddr>) -> Vec<u8> {
    let mut out = Vec::with_capacity(inner.len() + 4 + 8 + 12);
    push_option(&mut out, OPTION_RELAY_MSG, inner);
    push_option(&mut out, OPTION_INTERFACE_ID, &ifindex.to_be_bytes());
    if let Some(mac) = client_mac {
        let mut value = [0u8; 8];
        value[..2].copy_from_slice(&HWTYPE_ETHERNET.to_be_bytes());
        value[2..].copy_from_slice(&mac);
        push_option(&mut out, OPTION_CLIENT_LINKLAYER_ADDR, &value);
    }
    out
}

/// What a relay-reply asks us to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyOptions<'a> {
    /// The inner message, sent unmodified.
    pub payload: &'a [u8],
    /// Ifindex from the Interface-ID option, 0 when absent.
    pub interface_id: u32,
    /// The inner message is itself a relay-reply for a downstream relay.
    pub to_relay: bool,
    /// Where the inner message goes.
    pub peer: Ipv6Addr,
}

impl ReplyOptions<'_> {
    pub fn dst_port(&self) -> u16 {
        if self.to_relay { SERVER_PORT } else { CLIENT_PORT }
    }
}

/// Extract the relay message and interface of a relay-reply.
pub fn parse_reply_options(msg: &[u8]) -> Result<ReplyOptions<'_>, Option79Error> {
    let peer = decode_dhcpv6_relay(msg)?.peer_address();

    let mut payload: Option<&[u8]> = None;
    let mut interface_id = 0u32;

    for item in TlvCursor::dhcpv6(&msg[RELAY_HEADER_SIZE..]) {
        let tlv = item.map_err(WireError::from)?;
        match tlv.code {
            OPTION_RELAY_MSG => {
                if !tlv.value.is_empty() && tlv.value.len() <= MAX_RELAY_MESSAGE_LEN {
                    payload = Some(tlv.value);
                }
            }
            OPTION_INTERFACE_ID if tlv.value.len() <= 4 => {
                let mut bytes = [0u8; 4];
                bytes[4 - tlv.value.len()..].copy_from_slice(tlv.value);
                interface_id = u32::from_be_bytes(bytes);
            }
            _ => {}
        }
    }

    let payload = payload.ok_or(Option79Error::MissingRelayMessage)?;
    if peer.is_unicast_link_local() && interface_id == 0 {
        return Err(Option79Error::AmbiguousClientInterface);
    }

    Ok(ReplyOptions {
        payload,
        interface_id,
        to_relay: payload[0] == Dhcpv6MessageType::RelayReply as u8,
        peer,
    })
}

/// MAC address of the client that sent `msg` from `src`.
///
/// Taken from a DUID-LL or DUID-LLT client identifier with an Ethernet
/// hardware type, else from the EUI-64 interface identifier of a link-local
/// source address.
pub fn client_mac(src: Ipv6Addr, msg: &[u8]) -> Option<MacAddr> {
    if msg.len() >= MIN_MESSAGE_SIZE
        && let Some(mac) = mac_from_client_id(&msg[MIN_MESSAGE_SIZE..])
    {
        return Some(mac);
    }
    if src.is_unicast_link_local() {
        return mac_from_eui64(src);
    }
    None
}

fn mac_from_client_id(options: &[u8]) -> Option<MacAddr> {
    let duid = TlvCursor::dhcpv6(options)
        .map_while(|r| r.ok())
        .find(|t| t.code == OPTION_CLIENT_ID)?
        .value;
    if duid.len() < 4 {
        return None;
    }

    let duid_type = u16::from_be_bytes([duid[0], duid[1]]);
    let hwtype = u16::from_be_bytes([duid[2], duid[3]]);
    if hwtype != HWTYPE_ETHERNET {
        return None;
    }
    let lladdr = match duid_type {
        DUID_LLT => duid.get(8..)?,
        DUID_LL => &duid[4..],
        _ => return None,
    };
    lladdr.try_into().ok()
}

fn mac_from_eui64(addr: Ipv6Addr) -> Option<MacAddr> {
    let o = addr.octets();
    if o[11] != 0xff || o[12] != 0xfe {
        return None;
    }
    Some([o[8] ^ 0x02, o[9], o[10], o[13], o[14], o[15]])
}
