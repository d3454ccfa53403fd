//! The outbound direction: build and write a PROXY v1 or v2 header ahead of
//! an outgoing connection, grounded on
//! `M_io_proxy_protocol_build_proxy_message_{v1,v2}` and
//! `M_io_proxy_protocol_process_outbound` / `write_event_header_data`.
//!
//! Two bugs present in the source this is grounded on are fixed here
//! rather than carried over (see `DESIGN.md`): `set_source_endpoints`
//! duplicated `source_ipaddr` into the `dest_ipaddr` slot instead of
//! `dest_ipaddr`, and `M_io_proxy_protocol_outbound_add` had a dead
//! `return M_IO_ERROR_NOTIMPL;` statement after its real success return.

use std::any::Any;
use std::collections::VecDeque;
use std::net::IpAddr;

use crate::error::{IoError, IoResult};
use crate::event_type::EventType;
use crate::io_state::IoState;
use crate::layer::{Layer, LayerContext};

use super::{NetType, ProxyEndpoints, ProxyProtocolVersion, ProxyState};

const IDENTIFIER_V1: &str = "PROXY";
const IDENTIFIER_V2: &[u8] = &[0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A];

fn ip_to_bytes(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(a) => a.octets().to_vec(),
        IpAddr::V6(a) => a.octets().to_vec(),
    }
}

fn build_v1(local: bool, net_type: NetType, endpoints: Option<ProxyEndpoints>) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(IDENTIFIER_V1.as_bytes());
    out.push(b' ');

    if local {
        out.extend_from_slice(b"UNKNOWN\r\n");
        return out;
    }

    out.extend_from_slice(if net_type == NetType::V4 { b"TCP4 " } else { b"TCP6 " });

    let e = endpoints.expect("non-local outbound header requires endpoints");
    out.extend_from_slice(e.source_ipaddr.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(e.dest_ipaddr.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(e.source_port.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(e.dest_port.to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    out
}

fn build_v2(local: bool, net_type: NetType, endpoints: Option<ProxyEndpoints>) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(IDENTIFIER_V2);

    out.push((0x02 << 4) | if local { 0x00 } else { 0x01 });

    let family_byte = if local {
        0x00
    } else if net_type == NetType::V4 {
        0x11
    } else {
        0x21
    };
    out.push(family_byte);

    let addr_len: u16 = if local {
        0
    } else if net_type == NetType::V4 {
        12
    } else {
        36
    };
    out.extend_from_slice(&addr_len.to_be_bytes());

    if !local {
        let e = endpoints.expect("non-local outbound header requires endpoints");
        out.extend_from_slice(&ip_to_bytes(e.source_ipaddr));
        out.extend_from_slice(&ip_to_bytes(e.dest_ipaddr));
        out.extend_from_slice(&e.source_port.to_be_bytes());
        out.extend_from_slice(&e.dest_port.to_be_bytes());
    }

    out
}

fn build_message(version: ProxyProtocolVersion, local: bool, net_type: NetType, endpoints: Option<ProxyEndpoints>) -> Vec<u8> {
    if version == ProxyProtocolVersion::V1Only {
        build_v1(local, net_type, endpoints)
    } else {
        build_v2(local, net_type, endpoints)
    }
}

/// Prepends a PROXY v1/v2 header ahead of an outgoing connection's traffic.
pub struct OutboundProxyLayer {
    version: ProxyProtocolVersion,
    local: bool,
    net_type: NetType,
    endpoints: Option<ProxyEndpoints>,
    header: VecDeque<u8>,
    built: bool,
    complete: bool,
    io_state: IoState,
    error: Option<String>,
}

impl OutboundProxyLayer {
    pub fn new(version: ProxyProtocolVersion) -> Self {
        OutboundProxyLayer {
            version,
            local: true,
            net_type: NetType::Any,
            endpoints: None,
            header: VecDeque::new(),
            built: false,
            complete: false,
            io_state: IoState::Connecting,
            error: None,
        }
    }

    pub(crate) fn state(&self) -> ProxyState {
        ProxyState {
            local: self.local,
            net_type: self.net_type,
            endpoints: self.endpoints,
            error: self.error.clone(),
        }
    }

    /// Set the endpoints this layer should relay. `None` clears to a
    /// local/health-check connection. Returns `false` if the pair is
    /// malformed (mismatched address families) -- matching
    /// `M_io_proxy_protocol_set_source_endpoints`'s validation, with its
    /// `dest_ipaddr` duplication bug fixed.
    pub(crate) fn set_source_endpoints(&mut self, endpoints: Option<ProxyEndpoints>) -> bool {
        let Some(e) = endpoints else {
            self.local = true;
            self.net_type = NetType::Any;
            self.endpoints = None;
            return true;
        };

        if e.source_port == 0 || e.dest_port == 0 {
            return false;
        }
        let source_is_v4 = e.source_ipaddr.is_ipv4();
        if source_is_v4 != e.dest_ipaddr.is_ipv4() {
            return false;
        }

        self.local = false;
        self.net_type = NetType::of(e.source_ipaddr);
        self.endpoints = Some(e);
        true
    }

    fn flush(&mut self, ctx: &mut LayerContext<'_>, event_type: &mut EventType) -> bool {
        while !self.header.is_empty() {
            let chunk: Vec<u8> = self.header.iter().copied().collect();
            match ctx.write_below(&chunk) {
                Ok(0) => break,
                Ok(n) => {
                    self.header.drain(..n);
                }
                Err(e) if !e.is_critical() => break,
                Err(e) => {
                    self.io_state = IoState::Error;
                    self.error = Some(e.message.clone());
                    ctx.softevent_add(true, EventType::Error, Some(e));
                    return false;
                }
            }
        }

        if self.header.is_empty() {
            self.complete = true;
            self.io_state = IoState::Connected;
            ctx.softevent_add(true, EventType::Connected, None);
            if *event_type == EventType::Write {
                ctx.softevent_add(true, EventType::Write, None);
            }
        }
        false
    }
}

impl Layer for OutboundProxyLayer {
    fn write(&mut self, ctx: &mut LayerContext<'_>, buf: &[u8]) -> IoResult<usize> {
        if !self.complete {
            return Err(IoError::would_block());
        }
        ctx.write_below(buf)
    }

    fn process_event(&mut self, ctx: &mut LayerContext<'_>, event_type: &mut EventType) -> bool {
        if self.complete {
            return true;
        }

        match event_type {
            EventType::Connected if !self.built => {
                self.built = true;
                let bytes = build_message(self.version, self.local, self.net_type, self.endpoints);
                self.header = bytes.into();
                self.flush(ctx, event_type)
            }
            EventType::Write if self.built && !self.header.is_empty() => self.flush(ctx, event_type),
            _ => true,
        }
    }

    fn reset(&mut self, _ctx: &mut LayerContext<'_>) -> IoResult<()> {
        self.header.clear();
        self.built = false;
        self.complete = false;
        self.io_state = IoState::Connecting;
        self.error = None;
        Ok(())
    }

    fn state(&self) -> Option<IoState> {
        Some(self.io_state)
    }

    fn error_message(&self) -> Option<String> {
        self.error.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> ProxyEndpoints {
        ProxyEndpoints {
            source_ipaddr: "192.168.0.1".parse().unwrap(),
            dest_ipaddr: "192.168.0.11".parse().unwrap(),
            source_port: 56324,
            dest_port: 443,
        }
    }

    #[test]
    fn v1_message_matches_expected_wire_form() {
        let bytes = build_v1(false, NetType::V4, Some(endpoints()));
        assert_eq!(bytes, b"PROXY TCP4 192.168.0.1 192.168.0.11 56324 443\r\n");
    }

    #[test]
    fn v1_local_message_is_unknown() {
        let bytes = build_v1(true, NetType::Any, None);
        assert_eq!(bytes, b"PROXY UNKNOWN\r\n");
    }

    #[test]
    fn v2_message_header_fields() {
        let bytes = build_v2(false, NetType::V4, Some(endpoints()));
        assert_eq!(&bytes[..12], IDENTIFIER_V2);
        assert_eq!(bytes[12], 0x21);
        assert_eq!(bytes[13], 0x11);
        assert_eq!(&bytes[14..16], &12u16.to_be_bytes());
        assert_eq!(&bytes[16..20], &[192, 168, 0, 1]);
        assert_eq!(&bytes[20..24], &[192, 168, 0, 11]);
    }

    #[test]
    fn set_source_endpoints_uses_dest_ip_for_dest_field() {
        let mut layer = OutboundProxyLayer::new(ProxyProtocolVersion::Any);
        assert!(layer.set_source_endpoints(Some(endpoints())));
        assert_eq!(layer.endpoints.unwrap().dest_ipaddr, "192.168.0.11".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn set_source_endpoints_rejects_mismatched_families() {
        let mut layer = OutboundProxyLayer::new(ProxyProtocolVersion::Any);
        let bad = ProxyEndpoints {
            source_ipaddr: "192.168.0.1".parse().unwrap(),
            dest_ipaddr: "::1".parse().unwrap(),
            source_port: 1,
            dest_port: 2,
        };
        assert!(!layer.set_source_endpoints(Some(bad)));
    }

    #[test]
    fn set_source_endpoints_none_clears_to_local() {
        let mut layer = OutboundProxyLayer::new(ProxyProtocolVersion::Any);
        layer.set_source_endpoints(Some(endpoints()));
        assert!(layer.set_source_endpoints(None));
        assert!(layer.local);
        assert!(layer.endpoints.is_none());
    }
}
