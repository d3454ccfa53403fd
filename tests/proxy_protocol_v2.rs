//! Concrete scenario 2 (PROXY v2 inbound success) and the v2 round-trip law.

mod common;

use std::net::IpAddr;

use relayio::proxy_protocol::{self, NetType, ProxyProtocolVersion};
use relayio::{EventType, Io};

use common::FakeBase;

const IDENTIFIER_V2: &[u8] = &[0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A];

fn build_v2(src: [u8; 4], dst: [u8; 4], src_port: u16, dst_port: u16) -> Vec<u8> {
    let mut msg = IDENTIFIER_V2.to_vec();
    msg.push(0x21); // version 2, PROXY command
    msg.push(0x11); // TCP over IPv4
    msg.extend_from_slice(&12u16.to_be_bytes());
    msg.extend_from_slice(&src);
    msg.extend_from_slice(&dst);
    msg.extend_from_slice(&src_port.to_be_bytes());
    msg.extend_from_slice(&dst_port.to_be_bytes());
    msg
}

#[test]
fn scenario_v2_inbound_success() {
    let mut message = build_v2([192, 168, 0, 1], [10, 0, 0, 1], 0x01BB, 0xFFFF);
    message.push(b'X');

    let base = FakeBase::new(&message);
    let mut io = Io::new("fake", Box::new(base)).unwrap();
    proxy_protocol::add_inbound(&mut io, ProxyProtocolVersion::Any).unwrap();

    io.dispatch_hard_event(EventType::Read);
    let delivered = io.dispatch_soft_events();
    assert_eq!(delivered, vec![EventType::Connected, EventType::Read]);

    let mut buf = [0u8; 1];
    let n = io.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"X");

    assert_eq!(proxy_protocol::source_ipaddr(&mut io), Some(IpAddr::from([192, 168, 0, 1])));
    assert_eq!(proxy_protocol::dest_ipaddr(&mut io), Some(IpAddr::from([10, 0, 0, 1])));
    assert_eq!(proxy_protocol::source_port(&mut io), 0x01BB);
    assert_eq!(proxy_protocol::dest_port(&mut io), 0xFFFF);
    assert_eq!(proxy_protocol::proxied_type(&mut io), NetType::V4);
    assert!(proxy_protocol::relayed(&mut io));
}

#[test]
fn law_v2_round_trip() {
    let cases = [
        ([192, 168, 0, 1], [10, 0, 0, 1], 443u16, 65535u16),
        ([1, 2, 3, 4], [5, 6, 7, 8], 1, 2),
        ([255, 255, 255, 255], [0, 0, 0, 1], 60000, 1024),
    ];

    for (src, dst, src_port, dst_port) in cases {
        let message = build_v2(src, dst, src_port, dst_port);
        let base = FakeBase::new(&message);
        let mut io = Io::new("fake", Box::new(base)).unwrap();
        proxy_protocol::add_inbound(&mut io, ProxyProtocolVersion::Any).unwrap();

        io.dispatch_hard_event(EventType::Read);
        io.dispatch_soft_events();

        assert_eq!(proxy_protocol::source_ipaddr(&mut io), Some(IpAddr::from(src)));
        assert_eq!(proxy_protocol::dest_ipaddr(&mut io), Some(IpAddr::from(dst)));
        assert_eq!(proxy_protocol::source_port(&mut io), src_port);
        assert_eq!(proxy_protocol::dest_port(&mut io), dst_port);
    }
}
