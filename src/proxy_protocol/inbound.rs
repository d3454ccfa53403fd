//! The inbound direction: recognize and strip a PROXY v1 or v2 header off
//! the front of a connection, grounded state-for-state on
//! `create_inbound_sm()` and its state functions in `m_io_proxy_protocol.c`.

use std::any::Any;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::{IoError, IoResult};
use crate::event_type::EventType;
use crate::io_handle::Io;
use crate::io_state::IoState;
use crate::layer::{Layer, LayerContext};
use crate::state_machine::{Sm, StateId, Status};

use super::wire::Parser;
use super::{NetType, ProxyEndpoints, ProxyProtocolVersion, ProxyState};

const STATE_DETERMINE_VERSION: StateId = 1;
const STATE_V1: StateId = 2;
const STATE_V2: StateId = 3;

const STATE_V1_HEADER: StateId = 1;
const STATE_V1_PROTOCOL: StateId = 2;
const STATE_V1_SOURCE_ADDR: StateId = 3;
const STATE_V1_DEST_ADDR: StateId = 4;
const STATE_V1_SOURCE_PORT: StateId = 5;
const STATE_V1_DEST_PORT: StateId = 6;

const STATE_V2_HEADER: StateId = 1;
const STATE_V2_ADDR: StateId = 2;
const STATE_V2_TLV: StateId = 3;

const IDENTIFIER_V1: &[u8] = b"PROXY";
const IDENTIFIER_V2: &[u8] = &[0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A];

/// The data a running inbound parse accumulates, threaded through every
/// state function as `&mut InboundCtx`.
struct InboundCtx {
    parser: Parser,
    required_version: ProxyProtocolVersion,
    local: bool,
    net_type: NetType,
    source_ipaddr: Option<IpAddr>,
    dest_ipaddr: Option<IpAddr>,
    source_port: u16,
    dest_port: u16,
    v2_dlen: usize,
    error: Option<String>,
}

impl InboundCtx {
    fn new(required_version: ProxyProtocolVersion) -> Self {
        InboundCtx {
            parser: Parser::new(),
            required_version,
            local: false,
            net_type: NetType::Any,
            source_ipaddr: None,
            dest_ipaddr: None,
            source_port: 0,
            dest_port: 0,
            v2_dlen: 0,
            error: None,
        }
    }

    fn fail(&mut self, message: &str) -> (Status, Option<StateId>) {
        self.error = Some(message.to_string());
        (Status::ErrorState, None)
    }
}

fn parse_ip(bytes: &[u8]) -> Option<IpAddr> {
    std::str::from_utf8(bytes).ok().and_then(|s| IpAddr::from_str(s).ok())
}

fn state_determine_version(ctx: &mut InboundCtx) -> (Status, Option<StateId>) {
    if ctx.parser.len() < 12 {
        return (Status::Wait, None);
    }
    let next = if ctx.parser.compare(IDENTIFIER_V1) {
        STATE_V1
    } else if ctx.parser.compare(IDENTIFIER_V2) {
        STATE_V2
    } else {
        return ctx.fail("not proxy protocol");
    };

    let incompatible = (ctx.required_version == ProxyProtocolVersion::V1Only && next == STATE_V2)
        || (ctx.required_version == ProxyProtocolVersion::V2Only && next == STATE_V1);
    if incompatible {
        return ctx.fail("Incompatible proxy protocol version detected");
    }
    (Status::Next, Some(next))
}

fn state_v1_header(ctx: &mut InboundCtx) -> (Status, Option<StateId>) {
    if ctx.parser.len() < 6 {
        return (Status::Wait, None);
    }
    match ctx.parser.consume_through(b" ") {
        Some(6) => (Status::Next, None),
        _ => ctx.fail("proxy protocol v1: invalid identity"),
    }
}

fn state_v1_protocol(ctx: &mut InboundCtx) -> (Status, Option<StateId>) {
    if ctx.parser.len() < 9 {
        return (Status::Wait, None);
    }
    if ctx.parser.compare_ci(b"UNKNOWN\r\n") {
        ctx.local = true;
        ctx.parser.consume(9);
        return (Status::Done, None);
    }

    let field = match ctx.parser.read_until(b" ") {
        Some(f) => f,
        None => return ctx.fail("proxy protocol v1: failed to determine protocol"),
    };
    match field.as_slice() {
        b"TCP4" | b"tcp4" => ctx.net_type = NetType::V4,
        b"TCP6" | b"tcp6" => ctx.net_type = NetType::V6,
        _ => return ctx.fail("proxy protocol v1: invalid protocol"),
    }
    ctx.parser.consume(1);
    (Status::Next, None)
}

fn state_v1_source_ipaddr(ctx: &mut InboundCtx) -> (Status, Option<StateId>) {
    match ctx.parser.read_until(b" ") {
        None => {
            if ctx.parser.len() >= 40 {
                ctx.fail("proxy protocol v1: missing or invalid source address")
            } else {
                (Status::Wait, None)
            }
        }
        Some(field) => match parse_ip(&field) {
            Some(ip) => {
                ctx.source_ipaddr = Some(ip);
                ctx.parser.consume(1);
                (Status::Next, None)
            }
            None => ctx.fail("proxy protocol v1: invalid source address"),
        },
    }
}

fn state_v1_dest_ipaddr(ctx: &mut InboundCtx) -> (Status, Option<StateId>) {
    match ctx.parser.read_until(b" ") {
        None => {
            if ctx.parser.len() >= 40 {
                ctx.fail("proxy protocol v1: missing or invalid destination address")
            } else {
                (Status::Wait, None)
            }
        }
        Some(field) => match parse_ip(&field) {
            Some(ip) => {
                ctx.dest_ipaddr = Some(ip);
                ctx.parser.consume(1);
                (Status::Next, None)
            }
            None => ctx.fail("proxy protocol v1: invalid destination address"),
        },
    }
}

fn state_v1_source_port(ctx: &mut InboundCtx) -> (Status, Option<StateId>) {
    match ctx.parser.read_until(b" ") {
        None => {
            if ctx.parser.len() >= 5 {
                ctx.fail("proxy protocol v1: missing or invalid source port")
            } else {
                (Status::Wait, None)
            }
        }
        Some(field) => match parse_port(&field) {
            Some(port) => {
                ctx.source_port = port;
                ctx.parser.consume(1);
                (Status::Next, None)
            }
            None => ctx.fail("proxy protocol v1: invalid source port"),
        },
    }
}

fn state_v1_dest_port(ctx: &mut InboundCtx) -> (Status, Option<StateId>) {
    match ctx.parser.read_until(b"\r\n") {
        None => {
            if ctx.parser.len() >= 5 {
                ctx.fail("proxy protocol v1: missing or invalid destination port")
            } else {
                (Status::Wait, None)
            }
        }
        Some(field) => match parse_port(&field) {
            Some(port) => {
                ctx.dest_port = port;
                ctx.parser.consume(2);
                (Status::Done, None)
            }
            None => ctx.fail("proxy protocol v1: invalid destination port"),
        },
    }
}

fn parse_port(field: &[u8]) -> Option<u16> {
    let s = std::str::from_utf8(field).ok()?;
    let v: u32 = s.parse().ok()?;
    if v == 0 || v > u16::MAX as u32 {
        None
    } else {
        Some(v as u16)
    }
}

fn state_v2_header(ctx: &mut InboundCtx) -> (Status, Option<StateId>) {
    if ctx.parser.len() < 16 {
        return (Status::Wait, None);
    }
    ctx.parser.consume(12);

    let byte = ctx.parser.read_byte().unwrap();
    if byte >> 4 != 0x02 {
        return ctx.fail("proxy protocol v2: invalid v2 version");
    }
    match byte & 0x0F {
        0x00 => ctx.local = true,
        0x01 => ctx.local = false,
        _ => return ctx.fail("proxy protocol v2: invalid command"),
    }

    let fam = ctx.parser.read_byte().unwrap();
    match fam {
        0x00 => ctx.net_type = NetType::Any,
        0x11 => ctx.net_type = NetType::V4,
        0x21 => ctx.net_type = NetType::V6,
        _ => return ctx.fail("proxy protocol v2: unknown or unsupported address family or protocol"),
    }

    let dlen_bytes = ctx.parser.read_bytes(2).unwrap();
    ctx.v2_dlen = u16::from_be_bytes([dlen_bytes[0], dlen_bytes[1]]) as usize;

    match ctx.net_type {
        NetType::V4 if ctx.v2_dlen < 12 => return ctx.fail("proxy protocol v2: address info too short"),
        NetType::V6 if ctx.v2_dlen < 36 => return ctx.fail("proxy protocol v2: address info too short"),
        NetType::Any => {
            ctx.parser.consume(ctx.v2_dlen);
            return (Status::Done, None);
        }
        _ => {}
    }
    (Status::Next, None)
}

fn state_v2_ipaddr(ctx: &mut InboundCtx) -> (Status, Option<StateId>) {
    let addr_len = if ctx.net_type == NetType::V4 { 4 } else { 16 };
    let block_len = if ctx.net_type == NetType::V4 { 12 } else { 36 };
    if ctx.parser.len() < block_len {
        return (Status::Wait, None);
    }

    let source = ctx.parser.read_bytes(addr_len).unwrap();
    let source_ip = match bytes_to_ip(&source) {
        Some(ip) => ip,
        None => return ctx.fail("proxy protocol v2: invalid source address"),
    };

    let dest = ctx.parser.read_bytes(addr_len).unwrap();
    let dest_ip = match bytes_to_ip(&dest) {
        Some(ip) => ip,
        None => return ctx.fail("proxy protocol v2: invalid destination address"),
    };

    ctx.source_ipaddr = Some(source_ip);
    ctx.dest_ipaddr = Some(dest_ip);
    ctx.v2_dlen -= block_len;

    let source_port_bytes = ctx.parser.read_bytes(2).unwrap();
    let source_port = u16::from_be_bytes([source_port_bytes[0], source_port_bytes[1]]);
    if source_port == 0 {
        return ctx.fail("proxy protocol v2: invalid source port");
    }
    ctx.source_port = source_port;

    let dest_port_bytes = ctx.parser.read_bytes(2).unwrap();
    let dest_port = u16::from_be_bytes([dest_port_bytes[0], dest_port_bytes[1]]);
    if dest_port == 0 {
        return ctx.fail("proxy protocol v2: invalid destination port");
    }
    ctx.dest_port = dest_port;

    (Status::Next, None)
}

fn bytes_to_ip(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => Some(IpAddr::from([bytes[0], bytes[1], bytes[2], bytes[3]])),
        16 => {
            let mut a = [0u8; 16];
            a.copy_from_slice(bytes);
            Some(IpAddr::from(a))
        }
        _ => None,
    }
}

fn state_v2_tlv(ctx: &mut InboundCtx) -> (Status, Option<StateId>) {
    if ctx.v2_dlen == 0 {
        return (Status::Done, None);
    }
    if ctx.parser.len() < ctx.v2_dlen {
        return (Status::Wait, None);
    }
    // TLV data is not currently interpreted.
    ctx.parser.consume(ctx.v2_dlen);
    ctx.v2_dlen = 0;
    (Status::Next, None)
}

fn build_inbound_sm() -> Sm<InboundCtx> {
    let mut sm: Sm<InboundCtx> = Sm::new_linear_end("proxy-protocol-inbound");
    sm.insert_state(STATE_DETERMINE_VERSION, "determine-version", state_determine_version, None);

    let mut v1: Sm<InboundCtx> = Sm::new_linear_end("proxy-protocol-v1");
    v1.insert_state(STATE_V1_HEADER, "v1-header", state_v1_header, None);
    v1.insert_state(STATE_V1_PROTOCOL, "v1-protocol", state_v1_protocol, None);
    v1.insert_state(STATE_V1_SOURCE_ADDR, "v1-source-addr", state_v1_source_ipaddr, None);
    v1.insert_state(STATE_V1_DEST_ADDR, "v1-dest-addr", state_v1_dest_ipaddr, None);
    v1.insert_state(STATE_V1_SOURCE_PORT, "v1-source-port", state_v1_source_port, None);
    v1.insert_state(STATE_V1_DEST_PORT, "v1-dest-port", state_v1_dest_port, None);
    sm.insert_sub_state_machine(STATE_V1, "v1", v1, None);

    let mut v2: Sm<InboundCtx> = Sm::new_linear_end("proxy-protocol-v2");
    v2.insert_state(STATE_V2_HEADER, "v2-header", state_v2_header, None);
    v2.insert_state(STATE_V2_ADDR, "v2-addr", state_v2_ipaddr, None);
    v2.insert_state(STATE_V2_TLV, "v2-tlv", state_v2_tlv, None);
    sm.insert_sub_state_machine(STATE_V2, "v2", v2, None);

    sm
}

/// Strips a PROXY v1/v2 header off the front of an inbound connection.
pub struct InboundProxyLayer {
    sm: Sm<InboundCtx>,
    data: InboundCtx,
    complete: bool,
    pending: Vec<u8>,
    io_state: IoState,
    error: Option<String>,
    required_version: ProxyProtocolVersion,
}

impl InboundProxyLayer {
    pub fn new(version: ProxyProtocolVersion) -> Self {
        InboundProxyLayer {
            sm: build_inbound_sm(),
            data: InboundCtx::new(version),
            complete: false,
            pending: Vec::new(),
            io_state: IoState::Connecting,
            error: None,
            required_version: version,
        }
    }

    pub(crate) fn state(&self) -> ProxyState {
        ProxyState {
            local: self.data.local,
            net_type: self.data.net_type,
            endpoints: match (self.data.source_ipaddr, self.data.dest_ipaddr) {
                (Some(s), Some(d)) => Some(ProxyEndpoints {
                    source_ipaddr: s,
                    dest_ipaddr: d,
                    source_port: self.data.source_port,
                    dest_port: self.data.dest_port,
                }),
                _ => None,
            },
            error: self.error.clone(),
        }
    }

    fn drain_below(&mut self, ctx: &mut LayerContext<'_>) -> IoResult<()> {
        let mut buf = [0u8; 4096];
        loop {
            match ctx.read_below(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => self.data.parser.append(&buf[..n]),
                Err(e) if !e.is_critical() => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

impl Layer for InboundProxyLayer {
    fn read(&mut self, ctx: &mut LayerContext<'_>, buf: &mut [u8]) -> IoResult<usize> {
        if !self.complete {
            return Err(IoError::would_block());
        }
        if self.pending.is_empty() {
            return ctx.read_below(buf);
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        if n == buf.len() {
            return Ok(n);
        }
        match ctx.read_below(&mut buf[n..]) {
            Ok(more) => Ok(n + more),
            Err(e) if !e.is_critical() => Ok(n),
            Err(e) => Err(e),
        }
    }

    fn process_event(&mut self, ctx: &mut LayerContext<'_>, event_type: &mut EventType) -> bool {
        if self.complete {
            return true;
        }

        match event_type {
            EventType::Connected => false,
            EventType::Read => {
                if let Err(e) = self.drain_below(ctx) {
                    self.io_state = IoState::Error;
                    self.error = Some(e.message.clone());
                    ctx.softevent_add(true, EventType::Error, Some(e));
                    return false;
                }

                match self.sm.run(&mut self.data) {
                    Status::Done => {
                        self.complete = true;
                        self.io_state = IoState::Connected;
                        self.pending = self.data.parser.take_remaining();
                        ctx.softevent_add(true, EventType::Connected, None);
                        if !self.pending.is_empty() {
                            ctx.softevent_add(true, EventType::Read, None);
                        }
                        false
                    }
                    Status::Wait => false,
                    _ => {
                        self.io_state = IoState::Error;
                        let msg = self.data.error.clone().unwrap_or_else(|| "proxy protocol parse error".into());
                        self.error = Some(msg.clone());
                        ctx.softevent_add(true, EventType::Error, Some(IoError::invalid(msg)));
                        false
                    }
                }
            }
            _ => true,
        }
    }

    fn accept(&mut self, _ctx: &mut LayerContext<'_>, child: &mut Io) -> IoResult<()> {
        super::add_inbound(child, self.required_version)
    }

    fn reset(&mut self, _ctx: &mut LayerContext<'_>) -> IoResult<()> {
        self.sm = build_inbound_sm();
        self.data = InboundCtx::new(self.required_version);
        self.complete = false;
        self.pending.clear();
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
    use crate::io_handle::Io;

    #[test]
    fn v1_header_requires_space_after_identifier() {
        let mut ctx = InboundCtx::new(ProxyProtocolVersion::Any);
        ctx.parser.append(b"PROXY ");
        let (status, _) = state_v1_header(&mut ctx);
        assert_eq!(status, Status::Next);
    }

    #[test]
    fn v1_full_header_parses_to_done() {
        let mut sm = build_inbound_sm();
        let mut ctx = InboundCtx::new(ProxyProtocolVersion::Any);
        ctx.parser.append(b"PROXY TCP4 192.168.0.1 192.168.0.11 56324 443\r\nextra");
        let status = sm.run(&mut ctx);
        assert_eq!(status, Status::Done);
        assert_eq!(ctx.source_ipaddr, Some("192.168.0.1".parse().unwrap()));
        assert_eq!(ctx.dest_ipaddr, Some("192.168.0.11".parse().unwrap()));
        assert_eq!(ctx.source_port, 56324);
        assert_eq!(ctx.dest_port, 443);
        assert_eq!(ctx.parser.take_remaining(), b"extra");
    }

    #[test]
    fn v1_unknown_is_local() {
        let mut sm = build_inbound_sm();
        let mut ctx = InboundCtx::new(ProxyProtocolVersion::Any);
        ctx.parser.append(b"PROXY UNKNOWN\r\n");
        let status = sm.run(&mut ctx);
        assert_eq!(status, Status::Done);
        assert!(ctx.local);
    }

    #[test]
    fn v1_waits_on_partial_header() {
        let mut sm = build_inbound_sm();
        let mut ctx = InboundCtx::new(ProxyProtocolVersion::Any);
        ctx.parser.append(b"PROXY TCP4 192.168.0.1 ");
        let status = sm.run(&mut ctx);
        assert_eq!(status, Status::Wait);
    }

    #[test]
    fn not_proxy_protocol_errors() {
        let mut sm = build_inbound_sm();
        let mut ctx = InboundCtx::new(ProxyProtocolVersion::Any);
        ctx.parser.append(b"GET / HTTP/1.1\r\n");
        let status = sm.run(&mut ctx);
        assert_eq!(status, Status::ErrorState);
    }

    #[test]
    fn v2_only_rejects_v1() {
        let mut sm = build_inbound_sm();
        let mut ctx = InboundCtx::new(ProxyProtocolVersion::V2Only);
        ctx.parser.append(b"PROXY TCP4 1.2.3.4 5.6.7.8 1 2\r\n");
        let status = sm.run(&mut ctx);
        assert_eq!(status, Status::ErrorState);
    }

    #[test]
    fn v2_ipv4_header_parses_to_done() {
        let mut sm = build_inbound_sm();
        let mut ctx = InboundCtx::new(ProxyProtocolVersion::Any);
        let mut msg = IDENTIFIER_V2.to_vec();
        msg.push(0x21); // version 2, PROXY command
        msg.push(0x11); // TCP over IPv4
        msg.extend_from_slice(&12u16.to_be_bytes());
        msg.extend_from_slice(&[192, 168, 0, 1]);
        msg.extend_from_slice(&[192, 168, 0, 11]);
        msg.extend_from_slice(&56324u16.to_be_bytes());
        msg.extend_from_slice(&443u16.to_be_bytes());
        ctx.parser.append(&msg);

        let status = sm.run(&mut ctx);
        assert_eq!(status, Status::Done);
        assert_eq!(ctx.source_ipaddr, Some(IpAddr::from([192, 168, 0, 1])));
        assert_eq!(ctx.dest_port, 443);
    }

    #[test]
    fn v2_local_command_consumes_and_finishes() {
        let mut sm = build_inbound_sm();
        let mut ctx = InboundCtx::new(ProxyProtocolVersion::Any);
        let mut msg = IDENTIFIER_V2.to_vec();
        msg.push(0x20); // version 2, LOCAL command
        msg.push(0x00); // unspecified
        msg.extend_from_slice(&0u16.to_be_bytes());
        ctx.parser.append(&msg);

        let status = sm.run(&mut ctx);
        assert_eq!(status, Status::Done);
        assert!(ctx.local);
    }

    #[test]
    fn layer_strips_header_and_reports_connected() {
        use crate::io_state::IoState as S;
        use std::collections::VecDeque;

        struct FakeBase {
            data: VecDeque<u8>,
        }
        impl Layer for FakeBase {
            fn read(&mut self, _ctx: &mut LayerContext<'_>, buf: &mut [u8]) -> IoResult<usize> {
                let n = buf.len().min(self.data.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = self.data.pop_front().unwrap();
                }
                if n == 0 {
                    Err(IoError::would_block())
                } else {
                    Ok(n)
                }
            }
            fn process_event(&mut self, _ctx: &mut LayerContext<'_>, _e: &mut EventType) -> bool {
                true
            }
            fn state(&self) -> Option<S> {
                Some(S::Connected)
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
            fn as_any_mut(&mut self) -> &mut dyn Any {
                self
            }
        }

        let base = FakeBase {
            data: b"PROXY TCP4 1.2.3.4 5.6.7.8 111 222\r\nhello".iter().copied().collect(),
        };
        let mut io = Io::new("fake", Box::new(base)).unwrap();
        io.push_layer(super::super::LAYER_NAME, Box::new(InboundProxyLayer::new(ProxyProtocolVersion::Any)))
            .unwrap();

        let delivered = io.dispatch_hard_event(EventType::Read);
        assert_eq!(delivered, None); // raw Read absorbed; soft-events carry the result

        let events = io.dispatch_soft_events();
        assert!(events.contains(&EventType::Connected));
        assert!(events.contains(&EventType::Read));

        let mut out = [0u8; 5];
        let n = io.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"hello");
    }
}
