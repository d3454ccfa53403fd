//! Concrete scenario 3: a v2-only handle fed a v1 header reports an error
//! and never delivers `Connected`.

mod common;

use relayio::proxy_protocol::{self, ProxyProtocolVersion};
use relayio::{EventType, Io};

use common::FakeBase;

#[test]
fn scenario_version_mismatch_errors_without_connecting() {
    let base = FakeBase::new(b"PROXY TCP4 192.168.0.1 10.0.0.1 443 65535\r\n");
    let mut io = Io::new("fake", Box::new(base)).unwrap();
    proxy_protocol::add_inbound(&mut io, ProxyProtocolVersion::V2Only).unwrap();

    io.dispatch_hard_event(EventType::Read);
    let delivered = io.dispatch_soft_events();

    assert_eq!(delivered, vec![EventType::Error]);
    assert!(!delivered.contains(&EventType::Connected));
    assert_eq!(io.error_message().as_deref(), Some("Incompatible proxy protocol version detected"));
}
