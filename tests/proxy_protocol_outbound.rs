//! Concrete scenario 4: an outbound PROXY v1 header is written ahead of
//! anything the caller sends, and `Connected` is only delivered once it has
//! fully flushed.

mod common;

use relayio::proxy_protocol::{self, ProxyEndpoints, ProxyProtocolVersion};
use relayio::{EventType, Io};

use common::FakeBase;

#[test]
fn scenario_v1_outbound_header_precedes_connected() {
    let base = FakeBase::new(&[]);
    let mut io = Io::new("fake", Box::new(base)).unwrap();
    proxy_protocol::add_outbound(&mut io, ProxyProtocolVersion::V1Only).unwrap();

    let ok = proxy_protocol::set_source_endpoints(
        &mut io,
        Some(ProxyEndpoints {
            source_ipaddr: "10.0.0.9".parse().unwrap(),
            dest_ipaddr: "10.0.0.1".parse().unwrap(),
            source_port: 55000,
            dest_port: 443,
        }),
    );
    assert!(ok);

    // Drive the base transport straight to "connected" and let the layer
    // react, as `TcpBase` would on the first writable notification.
    let delivered = io.dispatch_hard_event(EventType::Connected);
    assert_eq!(delivered, None);

    let events = io.dispatch_soft_events();
    assert_eq!(events, vec![EventType::Connected]);

    let base = io.base_as::<FakeBase>().unwrap();
    assert_eq!(base.outbound, b"PROXY TCP4 10.0.0.9 10.0.0.1 55000 443\r\n");

    // Only after the header flush does user data pass straight through.
    io.write(b"hello").unwrap();
    let base = io.base_as::<FakeBase>().unwrap();
    assert_eq!(&base.outbound[base.outbound.len() - 5..], b"hello");
}
