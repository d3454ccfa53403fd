//! Concrete scenario 1 (PROXY v1 inbound success) and the v1 round-trip law:
//! a message built from a tuple of endpoints, parsed back, yields the same
//! tuple.

mod common;

use std::net::IpAddr;

use relayio::proxy_protocol::{self, NetType, ProxyProtocolVersion};
use relayio::{EventType, Io};

use common::FakeBase;

fn build_v1(src_ip: &str, dst_ip: &str, src_port: u16, dst_port: u16) -> Vec<u8> {
    format!("PROXY TCP4 {} {} {} {}\r\n", src_ip, dst_ip, src_port, dst_port).into_bytes()
}

#[test]
fn scenario_v1_inbound_success() {
    let mut header = build_v1("192.168.0.1", "10.0.0.1", 443, 65535);
    header.extend_from_slice(b"GET /\r\n");

    let base = FakeBase::new(&header);
    let mut io = Io::new("fake", Box::new(base)).unwrap();
    proxy_protocol::add_inbound(&mut io, ProxyProtocolVersion::Any).unwrap();

    assert_eq!(io.dispatch_hard_event(EventType::Read), None);
    let delivered = io.dispatch_soft_events();
    assert_eq!(delivered, vec![EventType::Connected, EventType::Read]);

    let mut buf = [0u8; 7];
    let n = io.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"GET /\r\n");

    assert_eq!(proxy_protocol::source_ipaddr(&mut io), Some("192.168.0.1".parse::<IpAddr>().unwrap()));
    assert_eq!(proxy_protocol::dest_ipaddr(&mut io), Some("10.0.0.1".parse::<IpAddr>().unwrap()));
    assert_eq!(proxy_protocol::source_port(&mut io), 443);
    assert_eq!(proxy_protocol::dest_port(&mut io), 65535);
    assert_eq!(proxy_protocol::proxied_type(&mut io), NetType::V4);
    assert!(proxy_protocol::relayed(&mut io));
}

#[test]
fn law_v1_round_trip() {
    let cases = [
        ("192.168.0.1", "10.0.0.1", 443u16, 65535u16),
        ("127.0.0.1", "127.0.0.2", 1, 2),
        ("255.255.255.255", "0.0.0.1", 60000, 1024),
    ];

    for (src_ip, dst_ip, src_port, dst_port) in cases {
        let message = build_v1(src_ip, dst_ip, src_port, dst_port);
        let base = FakeBase::new(&message);
        let mut io = Io::new("fake", Box::new(base)).unwrap();
        proxy_protocol::add_inbound(&mut io, ProxyProtocolVersion::Any).unwrap();

        io.dispatch_hard_event(EventType::Read);
        io.dispatch_soft_events();

        assert_eq!(proxy_protocol::source_ipaddr(&mut io), Some(src_ip.parse().unwrap()));
        assert_eq!(proxy_protocol::dest_ipaddr(&mut io), Some(dst_ip.parse().unwrap()));
        assert_eq!(proxy_protocol::source_port(&mut io), src_port);
        assert_eq!(proxy_protocol::dest_port(&mut io), dst_port);
    }
}
