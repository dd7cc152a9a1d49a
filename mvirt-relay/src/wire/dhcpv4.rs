//! BOOTP/DHCPv4 header access over a borrowed buffer.
//!
//! Layout (RFC 2131 section 2): fixed 236-byte BOOTP header, 4-byte magic cookie,
//! then options.

use super::options::{self, TlvCursor};
use super::{Result, WireError};
use std::net::Ipv4Addr;

/// BOOTP op: client request
pub const BOOTREQUEST: u8 = 1;

/// BOOTP op: server reply
pub const BOOTREPLY: u8 = 2;

/// DHCP server port
pub const SERVER_PORT: u16 = 67;

/// DHCP client port
pub const CLIENT_PORT: u16 = 68;

/// DHCP magic cookie
pub const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

/// Fixed BOOTP header size (without cookie)
pub const BOOTP_HEADER_SIZE: usize = 236;

/// Offset of the first option (after the magic cookie)
pub const OPTIONS_OFFSET: usize = 240;

/// Minimum BOOTP message length (RFC 951)
pub const MIN_BOOTP_LEN: usize = 300;

/// Broadcast bit of the flags field
pub const BROADCAST_FLAG: u16 = 0x8000;

/// DHCP Message Type option
pub const OPTION_MESSAGE_TYPE: u8 = 53;

/// Maximum DHCP Message Size option
pub const OPTION_MAX_MESSAGE_SIZE: u8 = 57;

/// Relay Agent Information option (RFC 3046)
pub const OPTION_RELAY_AGENT_INFO: u8 = 82;

/// DHCPACK message type
pub const DHCPACK: u8 = 5;

/// DHCPNAK message type
pub const DHCPNAK: u8 = 6;

mod field {
    use std::ops::Range;

    pub const OP: usize = 0;
    pub const HTYPE: usize = 1;
    pub const HLEN: usize = 2;
    pub const HOPS: usize = 3;
    pub const XID: Range<usize> = 4..8;
    pub const FLAGS: Range<usize> = 10..12;
    pub const CIADDR: Range<usize> = 12..16;
    pub const YIADDR: Range<usize> = 16..20;
    pub const GIADDR: Range<usize> = 24..28;
    pub const CHADDR: Range<usize> = 28..44;
    pub const SNAME: Range<usize> = 44..108;
    pub const FILE: Range<usize> = 108..236;
    pub const COOKIE: Range<usize> = 236..240;
}

/// A BOOTP/DHCP message.
#[derive(Debug, Clone)]
pub struct DhcpPacket<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> DhcpPacket<T> {
    /// Wrap a buffer without checking its length.
    pub fn new_unchecked(buffer: T) -> Self {
        Self { buffer }
    }

    /// Wrap a buffer, checking that it holds a full BOOTP header.
    pub fn new_checked(buffer: T) -> Result<Self> {
        if buffer.as_ref().len() < BOOTP_HEADER_SIZE {
            return Err(WireError::MalformedHeader("bootp"));
        }
        Ok(Self { buffer })
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.as_ref()
    }

    fn addr(&self, range: std::ops::Range<usize>) -> Ipv4Addr {
        let b = &self.buffer.as_ref()[range];
        Ipv4Addr::new(b[0], b[1], b[2], b[3])
    }

    pub fn op(&self) -> u8 {
        self.buffer.as_ref()[field::OP]
    }

    pub fn htype(&self) -> u8 {
        self.buffer.as_ref()[field::HTYPE]
    }

    pub fn hlen(&self) -> u8 {
        self.buffer.as_ref()[field::HLEN]
    }

    pub fn hops(&self) -> u8 {
        self.buffer.as_ref()[field::HOPS]
    }

    pub fn xid(&self) -> u32 {
        let b = &self.buffer.as_ref()[field::XID];
        u32::from_be_bytes([b[0], b[1], b[2], b[3]])
    }

    pub fn flags(&self) -> u16 {
        let b = &self.buffer.as_ref()[field::FLAGS];
        u16::from_be_bytes([b[0], b[1]])
    }

    /// The client asked for a broadcast reply.
    pub fn broadcast(&self) -> bool {
        self.flags() & BROADCAST_FLAG != 0
    }

    pub fn ciaddr(&self) -> Ipv4Addr {
        self.addr(field::CIADDR)
    }

    pub fn yiaddr(&self) -> Ipv4Addr {
        self.addr(field::YIADDR)
    }

    pub fn giaddr(&self) -> Ipv4Addr {
        self.addr(field::GIADDR)
    }

    /// Client hardware address, `hlen` bytes (capped at the 16-byte field).
    pub fn chaddr(&self) -> &[u8] {
        let len = (self.hlen() as usize).min(field::CHADDR.len());
        &self.buffer.as_ref()[field::CHADDR.start..field::CHADDR.start + len]
    }

    pub fn has_magic_cookie(&self) -> bool {
        self.buffer
            .as_ref()
            .get(field::COOKIE)
            .is_some_and(|c| c == MAGIC_COOKIE)
    }

    /// The option area, empty for plain BOOTP.
    pub fn options(&self) -> &[u8] {
        if self.has_magic_cookie() {
            &self.buffer.as_ref()[OPTIONS_OFFSET..]
        } else {
            &[]
        }
    }

    /// Find an option, following Option Overload into `file` and `sname`.
    ///
    /// A malformed option area yields `None`.
    pub fn pick_option(&self, tag: u8) -> Option<&[u8]> {
        let scan = options::scan(self.options(), tag).ok()?;
        if let Some(tlv) = scan.found {
            return Some(tlv.value);
        }

        let buf = self.buffer.as_ref();
        if scan.overload.file()
            && let Some(value) = find_in(&buf[field::FILE], tag)
        {
            return Some(value);
        }
        if scan.overload.sname() {
            return find_in(&buf[field::SNAME], tag);
        }
        None
    }

    /// Value of the DHCP Message Type option.
    pub fn message_type(&self) -> Option<u8> {
        self.pick_option(OPTION_MESSAGE_TYPE)
            .and_then(|v| v.first().copied())
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> DhcpPacket<T> {
    pub fn set_hops(&mut self, hops: u8) {
        self.buffer.as_mut()[field::HOPS] = hops;
    }

    pub fn set_giaddr(&mut self, addr: Ipv4Addr) {
        self.buffer.as_mut()[field::GIADDR].copy_from_slice(&addr.octets());
    }
}

fn find_in(area: &[u8], tag: u8) -> Option<&[u8]> {
    TlvCursor::dhcpv4(area)
        .map_while(|r| r.ok())
        .find(|tlv| tlv.code == tag as u16)
        .map(|tlv| tlv.value)
}

/// Decode a DHCP message, failing with [`WireError::NotDhcp`] for plain BOOTP.
pub fn decode_dhcpv4(payload: &[u8]) -> Result<DhcpPacket<&[u8]>> {
    let packet = DhcpPacket::new_checked(payload)?;
    if !packet.has_magic_cookie() {
        return Err(WireError::NotDhcp);
    }
    Ok(packet)
}
