//! Sockets and receiver threads.
//!
//! - DHCPv4/UDP listener: raw IPv4 UDP socket with IP_PKTINFO, so whole
//!   datagrams arrive together with the ingress ifindex
//! - DHCPv4 sender: UDP socket bound to port 67, source address and egress
//!   interface picked per send through an IP_PKTINFO control message
//! - Forwarder sender: IPPROTO_RAW socket for prebuilt IPv4 datagrams
//! - DHCPv6: one UDP socket on `[::]:547`, shared by the receiver and senders
//!
//! Receivers run their blocking loop on a dedicated thread with a read timeout
//! so a shutdown flag can stop them.

use crate::links::LinkInfo;
use crate::registry::GroupMembership;
use crate::relay::v6::{ALL_RELAY_AGENTS_AND_SERVERS, MULTICAST_HOP_LIMIT};
use crate::relay::{RelayState, Transport};
use crate::wire::{dhcpv4, dhcpv6};
use nix::errno::Errno;
use nix::sys::socket::sockopt::{Ipv4PacketInfo, Ipv6RecvPacketInfo};
use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, SockaddrIn, SockaddrIn6, recvmsg, sendmsg,
    setsockopt,
};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, IoSlice, IoSliceMut};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Receive buffer size (jumbo frame)
pub const RECV_BUFFER_SIZE: usize = 9228;

/// Receive timeout, bounds how long shutdown waits for a receiver
pub const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// ARP hardware type for Ethernet
const ARPHRD_ETHER: u16 = 1;

/// Open the raw IPv4 UDP listener.
pub fn open_v4_listener() -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::UDP))?;
    setsockopt(&socket, Ipv4PacketInfo, &true)?;
    socket.set_read_timeout(Some(RECV_TIMEOUT))?;
    Ok(socket)
}

/// Open the DHCPv6 socket on `[::]:547`.
pub fn open_v6_socket() -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(true)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(SocketAddrV6::new(
        Ipv6Addr::UNSPECIFIED,
        dhcpv6::SERVER_PORT,
        0,
        0,
    )))?;
    socket.set_multicast_hops_v6(MULTICAST_HOP_LIMIT)?;
    socket.set_multicast_loop_v6(false)?;
    setsockopt(&socket, Ipv6RecvPacketInfo, &true)?;
    socket.set_read_timeout(Some(RECV_TIMEOUT))?;
    Ok(socket)
}

/// [`Transport`] over real sockets.
pub struct SocketTransport {
    udp4: Socket,
    raw4: Socket,
    udp6: Arc<Socket>,
}

impl SocketTransport {
    /// Open the IPv4 senders. `udp6` is the shared DHCPv6 socket.
    pub fn open(udp6: Arc<Socket>) -> io::Result<Self> {
        let udp4 = open_v4_sender(dhcpv4::SERVER_PORT)?;
        let raw4 = Socket::new(
            Domain::IPV4,
            Type::RAW,
            Some(Protocol::from(libc::IPPROTO_RAW)),
        )?;

        Ok(Self { udp4, raw4, udp6 })
    }
}

impl Transport for SocketTransport {
    fn send_v4(
        &self,
        payload: &[u8],
        dst: SocketAddrV4,
        src: Option<Ipv4Addr>,
        ifindex: Option<u32>,
    ) -> io::Result<()> {
        if src.is_none() && ifindex.is_none() {
            self.udp4.send_to(payload, &SockAddr::from(dst))?;
            return Ok(());
        }

        send_with_pktinfo_v4(&self.udp4, payload, dst, src, ifindex)
    }

    fn send_raw_v4(&self, datagram: &[u8], dst: Ipv4Addr) -> io::Result<()> {
        self.raw4
            .send_to(datagram, &SockAddr::from(SocketAddrV4::new(dst, 0)))?;
        Ok(())
    }

    fn send_v6(
        &self,
        payload: &[u8],
        dst: SocketAddrV6,
        multicast_if: Option<u32>,
    ) -> io::Result<()> {
        let Some(ifindex) = multicast_if else {
            self.udp6.send_to(payload, &SockAddr::from(dst))?;
            return Ok(());
        };

        let iov = [IoSlice::new(payload)];
        let addr = SockaddrIn6::from(dst);
        sendmsg(
            self.udp6.as_raw_fd(),
            &iov,
            &[ControlMessage::Ipv6PacketInfo(&pktinfo_v6(ifindex))],
            MsgFlags::empty(),
            Some(&addr),
        )?;
        Ok(())
    }

    fn add_arp_entry(
        &self,
        ifname: &str,
        ip: Ipv4Addr,
        hwaddr: &[u8],
        htype: u8,
    ) -> io::Result<()> {
        let req = arp_request(ifname, ip, hwaddr, htype)?;
        // SAFETY: req is a fully initialized arpreq that outlives the call
        let ret = unsafe { libc::ioctl(self.udp4.as_raw_fd(), libc::SIOCSARP as _, &req) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// UDP socket holding `port` for DHCPv4 sends.
fn open_v4_sender(port: u16) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.bind(&SockAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)))?;
    // Send only: the raw listener sees every datagram, so this socket is
    // never read. Keep its queue at the kernel minimum.
    socket.set_recv_buffer_size(0)?;
    Ok(socket)
}

fn pktinfo_v4(src: Option<Ipv4Addr>, ifindex: Option<u32>) -> libc::in_pktinfo {
    libc::in_pktinfo {
        ipi_ifindex: ifindex.unwrap_or(0) as libc::c_int,
        ipi_spec_dst: libc::in_addr {
            s_addr: u32::from(src.unwrap_or(Ipv4Addr::UNSPECIFIED)).to_be(),
        },
        ipi_addr: libc::in_addr { s_addr: 0 },
    }
}

fn pktinfo_v6(ifindex: u32) -> libc::in6_pktinfo {
    libc::in6_pktinfo {
        ipi6_addr: libc::in6_addr { s6_addr: [0; 16] },
        ipi6_ifindex: ifindex as libc::c_uint,
    }
}

/// Send `payload` with the source address and egress interface pinned by an
/// IP_PKTINFO control message.
fn send_with_pktinfo_v4(
    socket: &Socket,
    payload: &[u8],
    dst: SocketAddrV4,
    src: Option<Ipv4Addr>,
    ifindex: Option<u32>,
) -> io::Result<()> {
    let info = pktinfo_v4(src, ifindex);
    let iov = [IoSlice::new(payload)];
    let addr = SockaddrIn::from(dst);
    sendmsg(
        socket.as_raw_fd(),
        &iov,
        &[ControlMessage::Ipv4PacketInfo(&info)],
        MsgFlags::empty(),
        Some(&addr),
    )?;
    Ok(())
}

fn empty_sockaddr() -> libc::sockaddr {
    libc::sockaddr {
        sa_family: 0,
        sa_data: [0; 14],
    }
}

/// Build the SIOCSARP request for a completed neighbor entry.
fn arp_request(ifname: &str, ip: Ipv4Addr, hwaddr: &[u8], htype: u8) -> io::Result<libc::arpreq> {
    if ifname.len() >= libc::IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "interface name too long",
        ));
    }

    // sockaddr_in layout inside sa_data: port (2 bytes), then the address
    let mut pa = empty_sockaddr();
    pa.sa_family = libc::AF_INET as libc::sa_family_t;
    for (dst, b) in pa.sa_data[2..6].iter_mut().zip(ip.octets()) {
        *dst = b as libc::c_char;
    }

    let mut ha = empty_sockaddr();
    ha.sa_family = if htype == 0 { ARPHRD_ETHER } else { htype as u16 };
    for (dst, &b) in ha.sa_data.iter_mut().zip(hwaddr) {
        *dst = b as libc::c_char;
    }

    let mut req = libc::arpreq {
        arp_pa: pa,
        arp_ha: ha,
        arp_flags: libc::ATF_COM,
        arp_netmask: empty_sockaddr(),
        arp_dev: [0; 16],
    };
    for (dst, &b) in req.arp_dev.iter_mut().zip(ifname.as_bytes()) {
        *dst = b as libc::c_char;
    }
    Ok(req)
}

/// Joins and leaves All_DHCP_Relay_Agents_and_Servers on the DHCPv6 socket.
pub struct MulticastMembership {
    socket: Arc<Socket>,
    links: Arc<dyn LinkInfo>,
}

impl MulticastMembership {
    pub fn new(socket: Arc<Socket>, links: Arc<dyn LinkInfo>) -> Self {
        Self { socket, links }
    }

    fn index(&self, interface: &str) -> io::Result<u32> {
        self.links.index_of(interface).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("interface {interface} not found"),
            )
        })
    }
}

impl GroupMembership for MulticastMembership {
    fn join(&self, interface: &str) -> io::Result<()> {
        let index = self.index(interface)?;
        self.socket
            .join_multicast_v6(&ALL_RELAY_AGENTS_AND_SERVERS, index)?;
        info!(iface = %interface, ifindex = index, "Joined DHCPv6 relay multicast group");
        Ok(())
    }

    fn leave(&self, interface: &str) -> io::Result<()> {
        let index = self.index(interface)?;
        self.socket
            .leave_multicast_v6(&ALL_RELAY_AGENTS_AND_SERVERS, index)?;
        info!(iface = %interface, ifindex = index, "Left DHCPv6 relay multicast group");
        Ok(())
    }
}

fn is_timeout(e: Errno) -> bool {
    matches!(e, Errno::EAGAIN | Errno::EINTR)
}

fn recv_v4(fd: i32, buf: &mut [u8], cmsg: &mut Vec<u8>) -> nix::Result<(usize, Option<u32>)> {
    let mut iov = [IoSliceMut::new(buf)];
    let msg = recvmsg::<SockaddrIn>(fd, &mut iov, Some(cmsg), MsgFlags::empty())?;
    let ifindex = msg.cmsgs()?.find_map(|c| match c {
        ControlMessageOwned::Ipv4PacketInfo(info) => Some(info.ipi_ifindex as u32),
        _ => None,
    });
    Ok((msg.bytes, ifindex))
}

type V6Received = (usize, Option<SocketAddrV6>, Option<u32>);

fn recv_v6(fd: i32, buf: &mut [u8], cmsg: &mut Vec<u8>) -> nix::Result<V6Received> {
    let mut iov = [IoSliceMut::new(buf)];
    let msg = recvmsg::<SockaddrIn6>(fd, &mut iov, Some(cmsg), MsgFlags::empty())?;
    let ifindex = msg.cmsgs()?.find_map(|c| match c {
        ControlMessageOwned::Ipv6PacketInfo(info) => Some(info.ipi6_ifindex),
        _ => None,
    });
    Ok((msg.bytes, msg.address.map(SocketAddrV6::from), ifindex))
}

/// Run the DHCPv4/UDP receive loop on its own thread until `shutdown` is set.
pub fn spawn_v4_receiver(
    socket: Socket,
    state: Arc<RelayState>,
    shutdown: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("relay-v4".to_string())
        .spawn(move || {
            let fd = socket.as_raw_fd();
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            let mut cmsg = nix::cmsg_space!(libc::in_pktinfo);
            info!("DHCPv4 receiver started");

            while !shutdown.load(Ordering::Relaxed) {
                match recv_v4(fd, &mut buf, &mut cmsg) {
                    Ok((len, Some(ifindex))) => {
                        state.handle_v4_datagram(&buf[..len], ifindex);
                    }
                    Ok((_, None)) => debug!("Datagram without packet info"),
                    Err(e) if is_timeout(e) => {}
                    Err(e) => {
                        warn!(error = %e, "DHCPv4 receive failed");
                        std::thread::sleep(RECV_TIMEOUT);
                    }
                }
            }
            info!("DHCPv4 receiver stopped");
        })
}

/// Run the DHCPv6 receive loop on its own thread until `shutdown` is set.
pub fn spawn_v6_receiver(
    socket: Arc<Socket>,
    state: Arc<RelayState>,
    shutdown: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("relay-v6".to_string())
        .spawn(move || {
            let fd = socket.as_raw_fd();
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            let mut cmsg = nix::cmsg_space!(libc::in6_pktinfo);
            info!("DHCPv6 receiver started");

            while !shutdown.load(Ordering::Relaxed) {
                match recv_v6(fd, &mut buf, &mut cmsg) {
                    Ok((len, Some(src), Some(ifindex))) => {
                        state.handle_v6_datagram(&buf[..len], src, ifindex);
                    }
                    Ok(_) => debug!("DHCPv6 datagram without source or packet info"),
                    Err(e) if is_timeout(e) => {}
                    Err(e) => {
                        warn!(error = %e, "DHCPv6 receive failed");
                        std::thread::sleep(RECV_TIMEOUT);
                    }
                }
            }
            info!("DHCPv6 receiver stopped");
        })
}
