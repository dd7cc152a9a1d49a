//! IPv4/UDP framing for the raw listener and the broadcast forwarder.

use super::{Result, WireError};
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{IpProtocol, Ipv4Packet, Ipv4Repr, UdpPacket, UdpRepr};
use std::net::Ipv4Addr;

/// Minimum IPv4 header size
pub const IPV4_HEADER_SIZE: usize = 20;

/// UDP header size
pub const UDP_HEADER_SIZE: usize = 8;

/// Decoded IPv4 and UDP headers of a received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4UdpView {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub ttl: u8,
    pub src_port: u16,
    pub dst_port: u16,
    /// Offset of the UDP payload within the datagram.
    pub payload_offset: usize,
    pub payload_len: usize,
}

impl Ipv4UdpView {
    /// Slice the UDP payload out of the buffer this view was decoded from.
    pub fn payload<'a>(&self, datagram: &'a [u8]) -> &'a [u8] {
        &datagram[self.payload_offset..self.payload_offset + self.payload_len]
    }
}

/// Decode the IPv4 and UDP headers at the start of `buf`.
pub fn decode_ipv4_udp(buf: &[u8]) -> Result<Ipv4UdpView> {
    let ip = Ipv4Packet::new_checked(buf).map_err(|_| WireError::MalformedHeader("ipv4"))?;

    if ip.next_header() != IpProtocol::Udp {
        return Err(WireError::MalformedHeader("not udp"));
    }
    if ip.more_frags() || ip.frag_offset() != 0 {
        return Err(WireError::MalformedHeader("fragmented"));
    }

    let udp = UdpPacket::new_checked(ip.payload()).map_err(|_| WireError::MalformedHeader("udp"))?;
    let header_len = ip.header_len() as usize;

    Ok(Ipv4UdpView {
        src: ip.src_addr(),
        dst: ip.dst_addr(),
        ttl: ip.hop_limit(),
        src_port: udp.src_port(),
        dst_port: udp.dst_port(),
        payload_offset: header_len + UDP_HEADER_SIZE,
        payload_len: udp.len() as usize - UDP_HEADER_SIZE,
    })
}

/// Fields of an IPv4/UDP datagram to emit.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4UdpHeader {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub ttl: u8,
}

/// Write an IPv4/UDP datagram carrying `payload` into `out`.
///
/// Both checksums are computed. Returns the number of bytes written.
pub fn encode_ipv4_udp(out: &mut [u8], header: &Ipv4UdpHeader, payload: &[u8]) -> Result<usize> {
    let udp_len = UDP_HEADER_SIZE + payload.len();
    let total_len = IPV4_HEADER_SIZE + udp_len;
    if out.len() < total_len {
        return Err(WireError::BufferTooSmall {
            needed: total_len,
            available: out.len(),
        });
    }
    if total_len > u16::MAX as usize {
        return Err(WireError::MalformedHeader("datagram too long"));
    }

    let caps = ChecksumCapabilities::default();

    let ip_repr = Ipv4Repr {
        src_addr: header.src,
        dst_addr: header.dst,
        next_header: IpProtocol::Udp,
        payload_len: udp_len,
        hop_limit: header.ttl,
    };
    let mut ip_packet = Ipv4Packet::new_unchecked(&mut out[..total_len]);
    ip_repr.emit(&mut ip_packet, &caps);

    let udp_repr = UdpRepr {
        src_port: header.src_port,
        dst_port: header.dst_port,
    };
    let mut udp_packet = UdpPacket::new_unchecked(ip_packet.payload_mut());
    udp_repr.emit(
        &mut udp_packet,
        &ip_repr.src_addr.into(),
        &ip_repr.dst_addr.into(),
        payload.len(),
        |buf| buf.copy_from_slice(payload),
        &caps,
    );

    Ok(total_len)
}

/// Check the IPv4 header checksum and the UDP checksum of a datagram.
pub fn checksums_valid(buf: &[u8]) -> bool {
    let Ok(ip) = Ipv4Packet::new_checked(buf) else {
        return false;
    };
    if !ip.verify_checksum() {
        return false;
    }
    let Ok(udp) = UdpPacket::new_checked(ip.payload()) else {
        return false;
    };
    udp.verify_checksum(&ip.src_addr().into(), &ip.dst_addr().into())
}
