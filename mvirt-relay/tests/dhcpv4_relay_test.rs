//! DHCPv4 relay integration tests
//!
//! Client requests are injected as full IPv4/UDP datagrams on a client-facing
//! interface and must come out as unicast to the helper with giaddr, hops and
//! Option 82 rewritten. Server replies must be delivered back to the client
//! through the interface that owns giaddr.

mod harness;

use dhcproto::v4::{Flags, MessageType};
use harness::{ETH0, ETH1, ETH1_IP, ETH3, HELPER, SYSTEM_MAC, TestRelay};
use mvirt_relay::config::{GlobalSettings, Option82Policy, RemoteIdKind};
use mvirt_relay::relay::{DropReason, Outcome};
use mvirt_relay::test_util::Sent;
use mvirt_relay::test_util::packets::{
    CLIENT_MAC, dhcp_reply, dhcp_request, encode_dhcp, ipv4_udp, with_raw_option,
};
use mvirt_relay::wire::decode_dhcpv4;
use mvirt_relay::wire::dhcpv4::{CLIENT_PORT, SERVER_PORT};
use std::net::{Ipv4Addr, SocketAddrV4};

const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 50);

fn client_datagram(payload: &[u8]) -> Vec<u8> {
    ipv4_udp(
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::BROADCAST,
        CLIENT_PORT,
        SERVER_PORT,
        64,
        payload,
    )
}

fn server_datagram(payload: &[u8]) -> Vec<u8> {
    ipv4_udp(HELPER, ETH1_IP, SERVER_PORT, SERVER_PORT, 64, payload)
}

fn discover() -> Vec<u8> {
    encode_dhcp(&dhcp_request(MessageType::Discover, CLIENT_MAC, 0x1234))
}

fn option82_settings(validate: bool) -> GlobalSettings {
    GlobalSettings {
        option82_enabled: true,
        option82_validate: validate,
        ..Default::default()
    }
}

/// Option 82 as this relay inserts it for a client on eth1.
fn our_option82() -> Vec<u8> {
    let mut opt = vec![82, 14, 1, 4, 0, 0, 0, ETH1 as u8, 2, 6];
    opt.extend_from_slice(&SYSTEM_MAC);
    opt
}

#[test]
fn test_client_request_relayed_to_helper() {
    let relay = TestRelay::new();
    relay.helper("eth1", HELPER);

    let outcome = relay
        .state
        .handle_v4_datagram(&client_datagram(&discover()), ETH1);
    assert_eq!(outcome, Outcome::Relayed { sent: 1, failed: 0 });

    let Sent::V4 {
        payload,
        dst,
        src,
        ifindex,
    } = relay.take_one()
    else {
        panic!("expected a DHCPv4 send");
    };
    assert_eq!(dst, SocketAddrV4::new(HELPER, SERVER_PORT));
    assert_eq!(src, Some(ETH1_IP));
    assert_eq!(ifindex, None);

    let packet = decode_dhcpv4(&payload).unwrap();
    assert_eq!(packet.giaddr(), ETH1_IP);
    assert_eq!(packet.hops(), 1);
    assert_eq!(packet.xid(), 0x1234);
    assert_eq!(packet.chaddr(), &CLIENT_MAC);

    let counters = relay.counters("eth1");
    assert_eq!(counters.v4_client_relayed, 1);
    assert_eq!(counters.discover, 1);
}

#[test]
fn test_existing_giaddr_kept() {
    let relay = TestRelay::new();
    relay.helper("eth1", HELPER);

    let mut msg = dhcp_request(MessageType::Request, CLIENT_MAC, 7);
    msg.set_giaddr(Ipv4Addr::new(172, 16, 0, 1));
    msg.set_hops(3);
    let datagram = ipv4_udp(
        Ipv4Addr::new(172, 16, 0, 1),
        ETH1_IP,
        SERVER_PORT,
        SERVER_PORT,
        64,
        &encode_dhcp(&msg),
    );

    assert!(relay.state.handle_v4_datagram(&datagram, ETH1).is_relayed());
    let Sent::V4 { payload, src, .. } = relay.take_one() else {
        panic!("expected a DHCPv4 send");
    };
    let packet = decode_dhcpv4(&payload).unwrap();
    assert_eq!(packet.giaddr(), Ipv4Addr::new(172, 16, 0, 1));
    assert_eq!(packet.hops(), 4);
    assert_eq!(src, None);
}

#[test]
fn test_hop_count_increment_disabled() {
    let relay = TestRelay::with_settings(GlobalSettings {
        hop_count_increment: false,
        ..Default::default()
    });
    relay.helper("eth1", HELPER);

    relay
        .state
        .handle_v4_datagram(&client_datagram(&discover()), ETH1);
    let Sent::V4 { payload, .. } = relay.take_one() else {
        panic!("expected a DHCPv4 send");
    };
    assert_eq!(decode_dhcpv4(&payload).unwrap().hops(), 0);
}

#[test]
fn test_hop_limit() {
    let relay = TestRelay::new();
    relay.helper("eth1", HELPER);

    let mut msg = dhcp_request(MessageType::Discover, CLIENT_MAC, 1);
    msg.set_hops(16);
    let outcome = relay
        .state
        .handle_v4_datagram(&client_datagram(&encode_dhcp(&msg)), ETH1);
    assert!(outcome.is_relayed());
    relay.transport.take();

    msg.set_hops(17);
    let outcome = relay
        .state
        .handle_v4_datagram(&client_datagram(&encode_dhcp(&msg)), ETH1);
    assert_eq!(outcome, Outcome::Dropped(DropReason::HopLimitExceeded));
    assert!(relay.transport.sent().is_empty());
    assert_eq!(relay.counters("eth1").v4_client_dropped, 1);
}

#[test]
fn test_no_helper_configured() {
    let relay = TestRelay::new();
    relay.helper("eth2", HELPER);

    let outcome = relay
        .state
        .handle_v4_datagram(&client_datagram(&discover()), ETH1);
    assert_eq!(
        outcome,
        Outcome::Dropped(DropReason::NoHelperConfigured("eth1".to_string()))
    );
    assert_eq!(relay.counters("eth1").v4_client_dropped, 1);
}

#[test]
fn test_interface_without_address() {
    let relay = TestRelay::new();
    relay.helper("eth3", HELPER);

    let outcome = relay
        .state
        .handle_v4_datagram(&client_datagram(&discover()), ETH3);
    assert_eq!(
        outcome,
        Outcome::Dropped(DropReason::NoInterfaceAddress("eth3".to_string()))
    );
}

#[test]
fn test_relay_disabled() {
    let relay = TestRelay::with_settings(GlobalSettings {
        relay_enabled: false,
        ..Default::default()
    });
    relay.helper("eth1", HELPER);

    let outcome = relay
        .state
        .handle_v4_datagram(&client_datagram(&discover()), ETH1);
    assert_eq!(outcome, Outcome::Dropped(DropReason::Disabled));
    assert!(relay.transport.sent().is_empty());
}

#[test]
fn test_fan_out_continues_after_send_failure() {
    let relay = TestRelay::new();
    let unreachable = Ipv4Addr::new(10, 0, 0, 6);
    relay.helper("eth1", unreachable).helper("eth1", HELPER);
    relay.transport.fail_sends_to(unreachable);

    let outcome = relay
        .state
        .handle_v4_datagram(&client_datagram(&discover()), ETH1);
    assert_eq!(outcome, Outcome::Relayed { sent: 1, failed: 1 });

    let Sent::V4 { dst, .. } = relay.take_one() else {
        panic!("expected a DHCPv4 send");
    };
    assert_eq!(dst, SocketAddrV4::new(HELPER, SERVER_PORT));
    assert_eq!(relay.counters("eth1").send_failures, 1);
}

#[test]
fn test_option82_inserted() {
    let relay = TestRelay::with_settings(option82_settings(false));
    relay.helper("eth1", HELPER);

    relay
        .state
        .handle_v4_datagram(&client_datagram(&discover()), ETH1);
    let Sent::V4 { payload, .. } = relay.take_one() else {
        panic!("expected a DHCPv4 send");
    };

    let mut expected = our_option82();
    expected.push(255);
    let at = payload
        .windows(expected.len())
        .position(|w| w == expected.as_slice());
    assert!(at.is_some(), "option 82 not found in {payload:?}");

    let packet = decode_dhcpv4(&payload).unwrap();
    assert_eq!(packet.message_type(), Some(1));
    assert!(payload.len() >= 300);
}

#[test]
fn test_option82_remote_id_ip() {
    let relay = TestRelay::with_settings(GlobalSettings {
        remote_id: RemoteIdKind::Ip,
        ..option82_settings(false)
    });
    relay.helper("eth1", HELPER);

    relay
        .state
        .handle_v4_datagram(&client_datagram(&discover()), ETH1);
    let Sent::V4 { payload, .. } = relay.take_one() else {
        panic!("expected a DHCPv4 send");
    };
    let packet = decode_dhcpv4(&payload).unwrap();
    assert_eq!(
        packet.pick_option(82),
        Some(&[1, 4, 0, 0, 0, ETH1 as u8, 2, 4, 192, 168, 1, 1][..])
    );
}

#[test]
fn test_option82_policies() {
    let foreign = [82, 6, 1, 4, 0, 0, 0, 9];
    let request = with_raw_option(discover(), &foreign);

    let relay = TestRelay::with_settings(GlobalSettings {
        option82_policy: Option82Policy::Keep,
        ..option82_settings(false)
    });
    relay.helper("eth1", HELPER);
    relay
        .state
        .handle_v4_datagram(&client_datagram(&request), ETH1);
    let Sent::V4 { payload, .. } = relay.take_one() else {
        panic!("expected a DHCPv4 send");
    };
    let packet = decode_dhcpv4(&payload).unwrap();
    assert_eq!(packet.pick_option(82), Some(&foreign[2..]));

    let relay = TestRelay::with_settings(GlobalSettings {
        option82_policy: Option82Policy::Drop,
        ..option82_settings(false)
    });
    relay.helper("eth1", HELPER);
    let outcome = relay
        .state
        .handle_v4_datagram(&client_datagram(&request), ETH1);
    assert_eq!(outcome, Outcome::Dropped(DropReason::Option82Policy));

    let relay = TestRelay::with_settings(option82_settings(false));
    relay.helper("eth1", HELPER);
    relay
        .state
        .handle_v4_datagram(&client_datagram(&request), ETH1);
    let Sent::V4 { payload, .. } = relay.take_one() else {
        panic!("expected a DHCPv4 send");
    };
    let packet = decode_dhcpv4(&payload).unwrap();
    assert_eq!(packet.pick_option(82), Some(&our_option82()[2..]));
}

#[test]
fn test_reply_unicast_to_yiaddr() {
    let relay = TestRelay::new();
    let mut reply = dhcp_reply(MessageType::Offer, CLIENT_MAC, 0x1234, CLIENT_IP, ETH1_IP);
    reply.set_flags(Flags::default());

    let outcome = relay
        .state
        .handle_v4_datagram(&server_datagram(&encode_dhcp(&reply)), ETH0);
    assert_eq!(outcome, Outcome::Relayed { sent: 1, failed: 0 });

    let Sent::V4 {
        dst, src, ifindex, ..
    } = relay.take_one()
    else {
        panic!("expected a DHCPv4 send");
    };
    assert_eq!(dst, SocketAddrV4::new(CLIENT_IP, CLIENT_PORT));
    assert_eq!(src, Some(ETH1_IP));
    assert_eq!(ifindex, Some(ETH1));

    let arp = relay.transport.arp_entries();
    assert_eq!(arp.len(), 1);
    assert_eq!(arp[0].ifname, "eth1");
    assert_eq!(arp[0].ip, CLIENT_IP);
    assert_eq!(arp[0].hwaddr, CLIENT_MAC.to_vec());

    let counters = relay.counters("eth1");
    assert_eq!(counters.v4_server_relayed, 1);
    assert_eq!(counters.offer, 0);
    assert_eq!(relay.counters("eth0").offer, 1);
}

#[test]
fn test_reply_broadcast_flag_and_nak() {
    let relay = TestRelay::new();

    let mut reply = dhcp_reply(MessageType::Offer, CLIENT_MAC, 1, CLIENT_IP, ETH1_IP);
    reply.set_flags(Flags::default().set_broadcast());
    relay
        .state
        .handle_v4_datagram(&server_datagram(&encode_dhcp(&reply)), ETH0);
    let Sent::V4 { dst, .. } = relay.take_one() else {
        panic!("expected a DHCPv4 send");
    };
    assert_eq!(dst, SocketAddrV4::new(Ipv4Addr::BROADCAST, CLIENT_PORT));

    let mut nak = dhcp_reply(MessageType::Nak, CLIENT_MAC, 2, Ipv4Addr::UNSPECIFIED, ETH1_IP);
    nak.set_flags(Flags::default());
    relay
        .state
        .handle_v4_datagram(&server_datagram(&encode_dhcp(&nak)), ETH0);
    let Sent::V4 { dst, .. } = relay.take_one() else {
        panic!("expected a DHCPv4 send");
    };
    assert_eq!(dst, SocketAddrV4::new(Ipv4Addr::BROADCAST, CLIENT_PORT));
    assert!(relay.transport.arp_entries().is_empty());
}

#[test]
fn test_ack_falls_back_to_ciaddr() {
    let relay = TestRelay::new();

    let mut ack = dhcp_reply(MessageType::Ack, CLIENT_MAC, 3, Ipv4Addr::UNSPECIFIED, ETH1_IP);
    ack.set_flags(Flags::default());
    ack.set_ciaddr(CLIENT_IP);
    relay
        .state
        .handle_v4_datagram(&server_datagram(&encode_dhcp(&ack)), ETH0);
    let Sent::V4 { dst, .. } = relay.take_one() else {
        panic!("expected a DHCPv4 send");
    };
    assert_eq!(dst, SocketAddrV4::new(CLIENT_IP, CLIENT_PORT));

    ack.set_ciaddr(Ipv4Addr::UNSPECIFIED);
    let outcome = relay
        .state
        .handle_v4_datagram(&server_datagram(&encode_dhcp(&ack)), ETH0);
    assert_eq!(outcome, Outcome::Dropped(DropReason::NoClientAddress));
    assert_eq!(relay.counters("eth1").v4_server_dropped, 1);
}

#[test]
fn test_reply_for_unknown_giaddr() {
    let relay = TestRelay::new();
    let reply = dhcp_reply(
        MessageType::Offer,
        CLIENT_MAC,
        1,
        CLIENT_IP,
        Ipv4Addr::new(172, 16, 0, 1),
    );
    let outcome = relay
        .state
        .handle_v4_datagram(&server_datagram(&encode_dhcp(&reply)), ETH0);
    assert_eq!(
        outcome,
        Outcome::Dropped(DropReason::UnknownRelayAddress(Ipv4Addr::new(172, 16, 0, 1)))
    );
}

#[test]
fn test_broadcast_reply_not_relayed() {
    let relay = TestRelay::new();
    let reply = dhcp_reply(MessageType::Offer, CLIENT_MAC, 1, CLIENT_IP, ETH1_IP);
    let datagram = ipv4_udp(
        HELPER,
        Ipv4Addr::BROADCAST,
        SERVER_PORT,
        CLIENT_PORT,
        64,
        &encode_dhcp(&reply),
    );
    let outcome = relay.state.handle_v4_datagram(&datagram, ETH0);
    assert_eq!(outcome, Outcome::Dropped(DropReason::BroadcastReply));
}

#[test]
fn test_reply_option82_stripped_after_validation() {
    let relay = TestRelay::with_settings(option82_settings(true));
    let mut reply = dhcp_reply(MessageType::Ack, CLIENT_MAC, 9, CLIENT_IP, ETH1_IP);
    reply.set_flags(Flags::default());
    let payload = with_raw_option(encode_dhcp(&reply), &our_option82());

    let outcome = relay
        .state
        .handle_v4_datagram(&server_datagram(&payload), ETH0);
    assert!(outcome.is_relayed());
    let Sent::V4 { payload, .. } = relay.take_one() else {
        panic!("expected a DHCPv4 send");
    };
    let packet = decode_dhcpv4(&payload).unwrap();
    assert_eq!(packet.pick_option(82), None);
    assert_eq!(packet.message_type(), Some(5));
}

#[test]
fn test_reply_without_option82_dropped_when_validating() {
    let relay = TestRelay::with_settings(option82_settings(true));
    let reply = dhcp_reply(MessageType::Ack, CLIENT_MAC, 9, CLIENT_IP, ETH1_IP);

    let outcome = relay
        .state
        .handle_v4_datagram(&server_datagram(&encode_dhcp(&reply)), ETH0);
    assert_eq!(outcome, Outcome::Dropped(DropReason::Option82Unvalidated));

    let relay = TestRelay::with_settings(option82_settings(false));
    let mut reply = dhcp_reply(MessageType::Ack, CLIENT_MAC, 9, CLIENT_IP, ETH1_IP);
    reply.set_flags(Flags::default());
    let sent = encode_dhcp(&reply);
    relay
        .state
        .handle_v4_datagram(&server_datagram(&sent), ETH0);
    let Sent::V4 { payload, .. } = relay.take_one() else {
        panic!("expected a DHCPv4 send");
    };
    assert_eq!(payload, sent);
}

#[test]
fn test_malformed_packets_counted() {
    let relay = TestRelay::new();
    relay.helper("eth1", HELPER);

    let outcome = relay
        .state
        .handle_v4_datagram(&client_datagram(&[1u8; 100]), ETH1);
    assert!(matches!(outcome, Outcome::Dropped(DropReason::Malformed(_))));

    let outcome = relay.state.handle_v4_datagram(&[0x45, 0, 0], ETH1);
    assert!(matches!(outcome, Outcome::Dropped(DropReason::Malformed(_))));

    assert_eq!(relay.counters("eth1").bad_packets, 2);
    assert!(relay.transport.sent().is_empty());
}

#[test]
fn test_bootp_reply_relayed_while_validating() {
    let relay = TestRelay::with_settings(option82_settings(true));
    let mut reply = dhcp_reply(MessageType::Ack, CLIENT_MAC, 9, CLIENT_IP, ETH1_IP);
    reply.set_flags(Flags::default());
    let mut bootp = encode_dhcp(&reply);
    // Without the magic cookie this is a plain BOOTP reply
    bootp[236..240].fill(0);

    let outcome = relay
        .state
        .handle_v4_datagram(&server_datagram(&bootp), ETH0);
    assert!(outcome.is_relayed());
    let Sent::V4 { payload, dst, .. } = relay.take_one() else {
        panic!("expected a DHCPv4 send");
    };
    assert_eq!(payload, bootp);
    assert_eq!(dst, SocketAddrV4::new(CLIENT_IP, CLIENT_PORT));
}
