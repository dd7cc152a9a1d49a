//! DHCPv6 message types and the relay-forward/relay-reply envelope (RFC 8415 section 9).
//!
//! ```text
//!  0                   1                   2                   3
//! |    msg-type   |   hop-count   |                               |
//! |                         link-address (16)                     |
//! |                         peer-address (16)                     |
//! |                     options (variable)                        |
//! ```

use super::options::TlvCursor;
use super::{Result, WireError};
use std::net::Ipv6Addr;

/// Fixed relay message header: type, hop count, link and peer address
pub const RELAY_HEADER_SIZE: usize = 34;

/// Smallest DHCPv6 message (type + transaction id)
pub const MIN_MESSAGE_SIZE: usize = 4;

/// DHCPv6 client port
pub const CLIENT_PORT: u16 = 546;

/// DHCPv6 server and relay agent port
pub const SERVER_PORT: u16 = 547;

/// DHCPv6 message types relevant to a relay agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Dhcpv6MessageType {
    Solicit = 1,
    Advertise = 2,
    Request = 3,
    Confirm = 4,
    Renew = 5,
    Rebind = 6,
    Reply = 7,
    Release = 8,
    Decline = 9,
    Reconfigure = 10,
    InformationRequest = 11,
    RelayForw = 12,
    RelayReply = 13,
}

impl TryFrom<u8> for Dhcpv6MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        use Dhcpv6MessageType::*;
        Ok(match value {
            1 => Solicit,
            2 => Advertise,
            3 => Request,
            4 => Confirm,
            5 => Renew,
            6 => Rebind,
            7 => Reply,
            8 => Release,
            9 => Decline,
            10 => Reconfigure,
            11 => InformationRequest,
            12 => RelayForw,
            13 => RelayReply,
            other => return Err(other),
        })
    }
}

impl Dhcpv6MessageType {
    /// Sent by clients, or by relays towards servers.
    pub fn is_from_client(self) -> bool {
        use Dhcpv6MessageType::*;
        matches!(
            self,
            Solicit
                | Request
                | Confirm
                | Renew
                | Rebind
                | Release
                | Decline
                | InformationRequest
                | RelayForw
        )
    }

    /// Sent by servers, or by relays towards clients.
    pub fn is_from_server(self) -> bool {
        !self.is_from_client()
    }
}

/// Message type of a DHCPv6 datagram.
///
/// The type is the high byte of the leading 32-bit word (type + transaction id).
pub fn message_type(buf: &[u8]) -> Result<Dhcpv6MessageType> {
    if buf.len() < MIN_MESSAGE_SIZE {
        return Err(WireError::MalformedHeader("dhcpv6"));
    }
    let word = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    Dhcpv6MessageType::try_from((word >> 24) as u8)
        .map_err(|_| WireError::MalformedHeader("dhcpv6 message type"))
}

/// A RELAY-FORW or RELAY-REPL message.
#[derive(Debug, Clone)]
pub struct RelayMessage<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> RelayMessage<T> {
    pub fn new_checked(buffer: T) -> Result<Self> {
        if buffer.as_ref().len() < RELAY_HEADER_SIZE {
            return Err(WireError::MalformedHeader("dhcpv6 relay"));
        }
        Ok(Self { buffer })
    }

    pub fn msg_type(&self) -> u8 {
        self.buffer.as_ref()[0]
    }

    pub fn hop_count(&self) -> u8 {
        self.buffer.as_ref()[1]
    }

    pub fn link_address(&self) -> Ipv6Addr {
        addr_at(self.buffer.as_ref(), 2)
    }

    pub fn peer_address(&self) -> Ipv6Addr {
        addr_at(self.buffer.as_ref(), 18)
    }

    /// Raw option bytes following the header.
    pub fn options_bytes(&self) -> &[u8] {
        &self.buffer.as_ref()[RELAY_HEADER_SIZE..]
    }

    pub fn options(&self) -> TlvCursor<'_> {
        TlvCursor::dhcpv6(self.options_bytes())
    }
}

fn addr_at(buf: &[u8], offset: usize) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&buf[offset..offset + 16]);
    Ipv6Addr::from(octets)
}

/// Decode the relay envelope of a RELAY-FORW/RELAY-REPL message.
pub fn decode_dhcpv6_relay(buf: &[u8]) -> Result<RelayMessage<&[u8]>> {
    RelayMessage::new_checked(buf)
}

/// Relay header fields to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayHeader {
    pub msg_type: Dhcpv6MessageType,
    pub hop_count: u8,
    pub link_address: Ipv6Addr,
    pub peer_address: Ipv6Addr,
}

/// Write a relay message (header followed by pre-encoded options) into `out`.
pub fn encode_relay(out: &mut Vec<u8>, header: &RelayHeader, options: &[u8]) {
    out.reserve(RELAY_HEADER_SIZE + options.len());
    out.push(header.msg_type as u8);
    out.push(header.hop_count);
    out.extend_from_slice(&header.link_address.octets());
    out.extend_from_slice(&header.peer_address.octets());
    out.extend_from_slice(options);
}

/// Append one DHCPv6 option.
pub fn push_option(out: &mut Vec<u8>, code: u16, value: &[u8]) {
    out.extend_from_slice(&code.to_be_bytes());
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
}
