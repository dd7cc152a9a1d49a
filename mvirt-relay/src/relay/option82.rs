//! DHCPv4 Relay Agent Information option (RFC 3046).
//!
//! Inserted option layout:
//!
//! ```text
//! +----+-----+---+---+--------------+---+-----+----------------+-----+
//! | 82 | len | 1 | 4 | circuit (BE) | 2 | 6|4 | MAC or IPv4    | END |
//! +----+-----+---+---+--------------+---+-----+----------------+-----+
//! ```
//!
//! The circuit ID is the ingress ifindex. The remote ID identifies this switch
//! by its MAC or by the IPv4 address of the ingress interface.

use crate::config::{Option82Policy, RemoteIdKind};
use crate::links::{LinkInfo, MacAddr};
use crate::wire::WireError;
use crate::wire::dhcpv4::{
    MIN_BOOTP_LEN, OPTION_MAX_MESSAGE_SIZE, OPTION_MESSAGE_TYPE, OPTION_RELAY_AGENT_INFO,
    OPTIONS_OFFSET, DhcpPacket,
};
use crate::wire::options::{END, PAD, TlvCursor, TlvError};
use std::net::Ipv4Addr;
use tracing::debug;

/// Circuit-ID sub-option
pub const SUBOPT_CIRCUIT_ID: u8 = 1;

/// Remote-ID sub-option
pub const SUBOPT_REMOTE_ID: u8 = 2;

/// Size of the circuit ID value (ifindex, network byte order)
pub const CIRCUIT_ID_LEN: usize = 4;

/// Packets are never grown past the Ethernet MTU
pub const ETHERNET_MTU: usize = 1500;

/// Maximum Message Size values below this are ignored (RFC 2132 section 9.10)
pub const MIN_MAX_MESSAGE_SIZE: u16 = 576;

/// Identity written into the Remote-ID sub-option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteId {
    Mac(MacAddr),
    Ip(Ipv4Addr),
}

impl RemoteId {
    pub fn kind(&self) -> RemoteIdKind {
        match self {
            RemoteId::Mac(_) => RemoteIdKind::Mac,
            RemoteId::Ip(_) => RemoteIdKind::Ip,
        }
    }
}

fn remote_id_len(kind: RemoteIdKind) -> usize {
    match kind {
        RemoteIdKind::Mac => 6,
        RemoteIdKind::Ip => 4,
    }
}

/// Total size of the inserted option, code and length bytes included.
pub const fn option_length_for(remote_len: usize) -> usize {
    2 + 2 + CIRCUIT_ID_LEN + 2 + remote_len
}

/// Total size of the inserted option for a remote-ID kind.
pub fn option_length(kind: RemoteIdKind) -> usize {
    let len = option_length_for(remote_id_len(kind));
    debug_assert!(len - 2 <= u8::MAX as usize);
    len
}

/// Outcome of checking an Option 82 found in a server reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// The option was inserted by this relay.
    Ok {
        circuit_id: u32,
        /// Matched remote IP when the remote ID is an address.
        ip: Option<Ipv4Addr>,
    },
    /// Sub-options are malformed.
    Invalid,
    /// Well formed, but not ours.
    Mismatch,
}

/// Check the sub-options of an Option 82 value against this relay's identity.
pub fn validate(value: &[u8], kind: RemoteIdKind, links: &dyn LinkInfo) -> Validation {
    let mut circuit: Option<&[u8]> = None;
    let mut remote: Option<&[u8]> = None;

    let mut pos = 0;
    while pos < value.len() {
        if pos + 2 > value.len() {
            return Validation::Invalid;
        }
        let tag = value[pos];
        let len = value[pos + 1] as usize;
        let start = pos + 2;
        let end = start + len;
        if end > value.len() {
            return Validation::Invalid;
        }
        match tag {
            SUBOPT_CIRCUIT_ID => circuit = Some(&value[start..end]),
            SUBOPT_REMOTE_ID => remote = Some(&value[start..end]),
            _ => return Validation::Invalid,
        }
        pos = end;
    }

    let Some(circuit) = circuit else {
        return Validation::Mismatch;
    };
    let Ok(circuit) = <[u8; CIRCUIT_ID_LEN]>::try_from(circuit) else {
        return Validation::Mismatch;
    };
    let circuit_id = u32::from_be_bytes(circuit);

    let Some(remote) = remote else {
        return Validation::Mismatch;
    };

    match kind {
        RemoteIdKind::Mac => {
            if remote == links.system_mac() {
                Validation::Ok {
                    circuit_id,
                    ip: None,
                }
            } else {
                Validation::Mismatch
            }
        }
        RemoteIdKind::Ip => {
            let Ok(octets) = <[u8; 4]>::try_from(remote) else {
                return Validation::Mismatch;
            };
            let ip = Ipv4Addr::from(octets);
            if links.ifindex_by_ipv4(ip).is_some() {
                Validation::Ok {
                    circuit_id,
                    ip: Some(ip),
                }
            } else {
                Validation::Mismatch
            }
        }
    }
}

/// Append our Option 82 followed by END. Returns the number of bytes written.
pub fn insert(out: &mut Vec<u8>, circuit_id: u32, remote: RemoteId) -> usize {
    let opt_len = option_length(remote.kind());
    out.reserve(opt_len + 1);
    out.push(OPTION_RELAY_AGENT_INFO);
    out.push((opt_len - 2) as u8);
    out.push(SUBOPT_CIRCUIT_ID);
    out.push(CIRCUIT_ID_LEN as u8);
    out.extend_from_slice(&circuit_id.to_be_bytes());
    out.push(SUBOPT_REMOTE_ID);
    match remote {
        RemoteId::Mac(mac) => {
            out.push(mac.len() as u8);
            out.extend_from_slice(&mac);
        }
        RemoteId::Ip(ip) => {
            out.push(4);
            out.extend_from_slice(&ip.octets());
        }
    }
    out.push(END);
    opt_len + 1
}

/// Action for a client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestAction {
    /// Relay the (possibly rewritten) packet.
    Forward,
    /// An Option 82 was already present and the policy keeps it; the packet is
    /// relayed byte for byte.
    Skip,
    /// The policy rejects requests that already carry an Option 82.
    Drop,
}

/// Action for a server reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseAction {
    Forward,
    /// An Option 82 with malformed sub-options was found.
    DropInvalid,
    /// Validation is on and no Option 82 of ours was found.
    DropUnvalidated,
}

fn finish(out: &mut Vec<u8>) {
    out.push(END);
    pad(out);
}

fn pad(out: &mut Vec<u8>) {
    if out.len() < MIN_BOOTP_LEN {
        out.resize(MIN_BOOTP_LEN, PAD);
    }
}

/// Apply the Option 82 policy to a client request and insert our agent info.
///
/// `remote` is `None` when this relay's identity is not known; existing
/// options are still handled per policy but nothing is inserted. BOOTP
/// packets and packets without a message-type option are left unchanged.
/// A truncated option area or a malformed Maximum Message Size fails.
pub fn process_request(
    payload: &mut Vec<u8>,
    policy: Option82Policy,
    circuit_id: u32,
    remote: Option<RemoteId>,
) -> Result<RequestAction, WireError> {
    if payload.len() < OPTIONS_OFFSET || !DhcpPacket::new_unchecked(&payload[..]).has_magic_cookie()
    {
        return Ok(RequestAction::Forward);
    }

    let options = &payload[OPTIONS_OFFSET..];
    let mut out = Vec::with_capacity(payload.len() + option_length(RemoteIdKind::Mac) + 1);
    out.extend_from_slice(&payload[..OPTIONS_OFFSET]);

    let mut is_dhcp = false;
    let mut max_size: u16 = 0;
    let mut stripped = false;
    let mut copied = 0;

    let mut cursor = TlvCursor::dhcpv4(options);
    while let Some(item) = cursor.next_tlv() {
        let tlv = match item {
            Ok(tlv) => tlv,
            Err(TlvError::Truncated { offset }) => {
                return Err(WireError::TruncatedOption(OPTIONS_OFFSET + offset));
            }
        };
        match tlv.code as u8 {
            OPTION_MESSAGE_TYPE => is_dhcp = true,
            OPTION_MAX_MESSAGE_SIZE => {
                let Ok(bytes) = <[u8; 2]>::try_from(tlv.value) else {
                    return Err(WireError::MalformedHeader("maximum message size"));
                };
                max_size = u16::from_be_bytes(bytes);
                if max_size < MIN_MAX_MESSAGE_SIZE {
                    max_size = 0;
                }
            }
            OPTION_RELAY_AGENT_INFO if is_dhcp => match policy {
                Option82Policy::Keep => return Ok(RequestAction::Skip),
                Option82Policy::Drop => return Ok(RequestAction::Drop),
                Option82Policy::Replace => {
                    out.extend_from_slice(&options[copied..tlv.offset]);
                    copied = tlv.end;
                    stripped = true;
                }
            },
            _ => {}
        }
    }

    if !is_dhcp {
        return Ok(RequestAction::Forward);
    }

    let end = cursor.end_offset().unwrap_or(options.len());
    out.extend_from_slice(&options[copied..end]);
    while out.len() > OPTIONS_OFFSET && out.last() == Some(&PAD) {
        out.pop();
    }

    let mut inserted = false;
    if let Some(remote) = remote {
        let packlen = out.len() + option_length(remote.kind()) + 1;
        if packlen < ETHERNET_MTU && (max_size == 0 || max_size as usize >= packlen) {
            insert(&mut out, circuit_id, remote);
            pad(&mut out);
            inserted = true;
        } else {
            debug!(packlen, max_size, "Option 82 not inserted, packet would exceed size limit");
        }
    }

    if !inserted {
        if !stripped {
            return Ok(RequestAction::Forward);
        }
        finish(&mut out);
    }

    *payload = out;
    Ok(RequestAction::Forward)
}

/// Strip Option 82 from a server reply, validating it on the way.
///
/// BOOTP replies and replies without a message-type option are forwarded
/// unchanged. A DHCP reply without any Option 82 is left unchanged and
/// forwarded unless `validate_enabled` is set.
pub fn process_response(
    payload: &mut Vec<u8>,
    validate_enabled: bool,
    kind: RemoteIdKind,
    links: &dyn LinkInfo,
) -> ResponseAction {
    if payload.len() < OPTIONS_OFFSET || !DhcpPacket::new_unchecked(&payload[..]).has_magic_cookie()
    {
        return ResponseAction::Forward;
    }

    let options = &payload[OPTIONS_OFFSET..];
    let mut out = Vec::with_capacity(payload.len());
    out.extend_from_slice(&payload[..OPTIONS_OFFSET]);

    let mut is_dhcp = false;
    let mut good = false;
    let mut stripped = false;
    let mut copied = 0;

    let mut cursor = TlvCursor::dhcpv4(options);
    while let Some(item) = cursor.next_tlv() {
        let Ok(tlv) = item else {
            return ResponseAction::DropInvalid;
        };
        match tlv.code as u8 {
            OPTION_MESSAGE_TYPE => {
                is_dhcp = true;
                continue;
            }
            // An agent option ahead of the message type is left alone
            OPTION_RELAY_AGENT_INFO if is_dhcp => {}
            _ => continue,
        }
        match validate(tlv.value, kind, links) {
            Validation::Invalid => return ResponseAction::DropInvalid,
            Validation::Ok { .. } => good = true,
            Validation::Mismatch => {}
        }
        out.extend_from_slice(&options[copied..tlv.offset]);
        copied = tlv.end;
        stripped = true;
    }

    if !is_dhcp {
        return ResponseAction::Forward;
    }
    if !good && validate_enabled {
        return ResponseAction::DropUnvalidated;
    }
    if !stripped {
        return ResponseAction::Forward;
    }

    let end = cursor.end_offset().unwrap_or(options.len());
    out.extend_from_slice(&options[copied..end]);
    finish(&mut out);
    *payload = out;
    ResponseAction::Forward
}
