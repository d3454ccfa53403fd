//! Shared mock base layer for the integration suite: an in-memory
//! connection with separate inbound/outbound byte queues, standing in for
//! a real socket the way the teacher's own test harnesses use an in-memory
//! duplex instead of a live connection.

use std::any::Any;
use std::collections::VecDeque;

use relayio::{EventType, IoError, IoResult, IoState, Layer, LayerContext};

pub struct FakeBase {
    pub inbound: VecDeque<u8>,
    pub outbound: Vec<u8>,
    pub state: IoState,
}

impl FakeBase {
    pub fn new(inbound: &[u8]) -> Self {
        FakeBase {
            inbound: inbound.iter().copied().collect(),
            outbound: Vec::new(),
            state: IoState::Connected,
        }
    }
}

impl Layer for FakeBase {
    fn read(&mut self, _ctx: &mut LayerContext<'_>, buf: &mut [u8]) -> IoResult<usize> {
        let n = buf.len().min(self.inbound.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.inbound.pop_front().unwrap();
        }
        if n == 0 {
            Err(IoError::would_block())
        } else {
            Ok(n)
        }
    }

    fn write(&mut self, _ctx: &mut LayerContext<'_>, buf: &[u8]) -> IoResult<usize> {
        self.outbound.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn process_event(&mut self, _ctx: &mut LayerContext<'_>, _event_type: &mut EventType) -> bool {
        true
    }

    fn state(&self) -> Option<IoState> {
        Some(self.state)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
