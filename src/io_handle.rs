//! `Io`: a stack of [`Layer`]s presented to callers as one handle
//! (component C2, §4.2-4.3).
//!
//! `Io` itself never touches a layer's private state; every operation goes
//! through free functions (`read_at`, `write_at`, ...) that take a `&mut
//! [LayerSlot]` and an index, splitting it with `split_at_mut` so a layer's
//! callback gets a `LayerContext` borrowing only the slots below it. This is
//! what lets a layer call back down into the stack without `Io` holding two
//! overlapping mutable borrows of the same `Vec`.

use crate::error::{IoError, IoResult};
use crate::event_type::EventType;
use crate::io_state::IoState;
use crate::layer::{drain_and_dispatch, Layer, LayerContext, LayerSlot};

/// A stack of layers addressed as a single I/O handle.
///
/// Layer 0 is always the base transport (the only layer expected to
/// implement [`crate::sys::Pollable`]); each subsequent layer wraps the one
/// below it. Reads and writes always enter at the top layer and are passed
/// down through `read`/`write` defaults unless a layer intercepts them.
pub struct Io {
    layers: Vec<LayerSlot>,
    destroyed: bool,
    /// Set once a terminal event (`Disconnected`/`Error`) has been
    /// delivered to the top of the stack; from then on every dispatch is a
    /// no-op, per the "no event after the first terminal event" invariant.
    terminated: bool,
}

impl Io {
    /// Build a handle from a base transport layer. Additional layers are
    /// added with [`Io::push_layer`].
    pub fn new(base_name: &'static str, base: Box<dyn Layer>) -> IoResult<Self> {
        let mut io = Io {
            layers: vec![LayerSlot::new(base_name, base)],
            destroyed: false,
            terminated: false,
        };
        io.init_layer(0)?;
        Ok(io)
    }

    /// Push a new layer on top of the stack, calling its `init`.
    pub fn push_layer(&mut self, name: &'static str, layer: Box<dyn Layer>) -> IoResult<()> {
        self.layers.push(LayerSlot::new(name, layer));
        self.init_layer(self.layers.len() - 1)
    }

    fn init_layer(&mut self, index: usize) -> IoResult<()> {
        let (below, at_and_above) = self.layers.split_at_mut(index);
        let slot = &mut at_and_above[0];
        let mut ctx = LayerContext {
            below,
            soft_events: &mut slot.soft_events,
            index,
        };
        slot.layer.init(&mut ctx)
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn layer_name(&self, index: usize) -> Option<&'static str> {
        self.layers.get(index).map(|s| s.name())
    }

    /// Read from the top of the stack.
    pub fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        let top = self.layers.len() - 1;
        Self::read_at(&mut self.layers, top, buf)
    }

    /// Write to the top of the stack.
    pub fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
        let top = self.layers.len() - 1;
        Self::write_at(&mut self.layers, top, buf)
    }

    /// Dispatch a hard event from the OS selector, which always targets the
    /// base transport (index 0), then bubbles upward through
    /// `process_event` the same way a soft-event targeted `Up` would.
    pub fn dispatch_hard_event(&mut self, mut event_type: EventType) -> Option<EventType> {
        if self.terminated || self.layers.is_empty() {
            return None;
        }
        let (below, at_and_above) = self.layers.split_at_mut(0);
        let slot = &mut at_and_above[0];
        let mut ctx = LayerContext {
            below,
            soft_events: &mut slot.soft_events,
            index: 0,
        };
        let keep = slot.layer.process_event(&mut ctx, &mut event_type);
        if !keep {
            return None;
        }
        let mut current = 0usize;
        while current + 1 < self.layers.len() {
            current += 1;
            let (below, at_and_above) = self.layers.split_at_mut(current);
            let slot = &mut at_and_above[0];
            let mut ctx = LayerContext {
                below,
                soft_events: &mut slot.soft_events,
                index: current,
            };
            let keep = slot.layer.process_event(&mut ctx, &mut event_type);
            if !keep {
                return None;
            }
        }
        if event_type.is_terminal() {
            self.terminated = true;
        }
        Some(event_type)
    }

    /// Drain and dispatch every layer's pending soft-events for one turn,
    /// returning the events that survived to the top of the stack (i.e.
    /// should be delivered to the handle's owner) in priority order (§4.1:
    /// `CONNECTED, ACCEPT, READ, DISCONNECTED, ERROR, WRITE, OTHER`). Once a
    /// terminal event (`Disconnected`/`Error`) has been delivered, either
    /// here or from [`Io::dispatch_hard_event`], every later call is a
    /// no-op -- no event is ever delivered after the first terminal one.
    pub fn dispatch_soft_events(&mut self) -> Vec<EventType> {
        if self.terminated {
            return Vec::new();
        }
        let mut delivered = Vec::new();
        for originator in 0..self.layers.len() {
            let pending = self.layers[originator].soft_events.drain_turn();
            for event in pending {
                if let Some((event_type, final_index)) =
                    drain_and_dispatch(&mut self.layers, originator, event)
                {
                    if final_index == self.layers.len() - 1 {
                        delivered.push(event_type);
                    }
                }
            }
        }
        delivered.sort_by_key(|e| e.priority());
        if let Some(cut) = delivered.iter().position(|e| e.is_terminal()) {
            delivered.truncate(cut + 1);
            self.terminated = true;
        }
        delivered
    }

    /// A new child handle was accepted on this (listening) handle; give
    /// every layer a chance to attach an equivalent layer to it.
    pub fn accept_into(&mut self, child: &mut Io) -> IoResult<()> {
        for index in 0..self.layers.len() {
            let (below, at_and_above) = self.layers.split_at_mut(index);
            let slot = &mut at_and_above[0];
            let mut ctx = LayerContext {
                below,
                soft_events: &mut slot.soft_events,
                index,
            };
            slot.layer.accept(&mut ctx, child)?;
        }
        Ok(())
    }

    /// Reset every layer for reuse (e.g. pooled handles).
    pub fn reset(&mut self) -> IoResult<()> {
        for index in 0..self.layers.len() {
            let (below, at_and_above) = self.layers.split_at_mut(index);
            let slot = &mut at_and_above[0];
            let mut ctx = LayerContext {
                below,
                soft_events: &mut slot.soft_events,
                index,
            };
            slot.layer.reset(&mut ctx)?;
        }
        self.terminated = false;
        Ok(())
    }

    /// The handle's aggregate state: the most severe state reported by any
    /// layer (§4.3).
    pub fn state(&self) -> IoState {
        IoState::aggregate(self.layers.iter().filter_map(|s| s.layer.state()))
    }

    /// The deepest non-`None` error message, searched top-down since the
    /// top layer usually has the most specific diagnosis.
    pub fn error_message(&self) -> Option<String> {
        self.layers.iter().rev().find_map(|s| s.layer.error_message())
    }

    /// Tear the stack down, bottom-up, calling `destroy` on every layer
    /// exactly once even if an earlier layer's context borrow would
    /// otherwise prevent it.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        for index in 0..self.layers.len() {
            let (below, at_and_above) = self.layers.split_at_mut(index);
            let slot = &mut at_and_above[0];
            let mut ctx = LayerContext {
                below,
                soft_events: &mut slot.soft_events,
                index,
            };
            slot.layer.destroy(&mut ctx);
        }
    }

    /// Downcast the base transport (layer 0) to a concrete type, mostly
    /// useful in tests that need to inspect a mock layer's private state.
    pub fn base_as<T: 'static>(&mut self) -> Option<&mut T> {
        self.layers.get_mut(0)?.layer.as_any_mut().downcast_mut::<T>()
    }

    /// Find the top-most layer of a concrete type `T`, searching from the
    /// top of the stack down. Mirrors the source's pattern of locating
    /// "the" proxy-protocol (or similar) layer by name from whichever
    /// index it was pushed at.
    pub fn top_layer_as<T: 'static>(&mut self) -> Option<&mut T> {
        self.layers
            .iter_mut()
            .rev()
            .find_map(|slot| slot.layer.as_any_mut().downcast_mut::<T>())
    }

    /// The base transport's [`crate::sys::Pollable`] facet, if it has one
    /// -- used by the event loop to register/deregister it with a
    /// selector. Every layer above the base defers to it.
    pub fn base_pollable(&mut self) -> Option<&mut dyn crate::sys::Pollable> {
        self.layers.get_mut(0)?.layer.as_pollable()
    }

    // -- free dispatch functions, usable from inside a LayerContext too --

    pub(crate) fn read_at(layers: &mut [LayerSlot], index: usize, buf: &mut [u8]) -> IoResult<usize> {
        if index >= layers.len() {
            return Err(IoError::invalid("layer index out of range"));
        }
        let (below, at_and_above) = layers.split_at_mut(index);
        let slot = &mut at_and_above[0];
        let mut ctx = LayerContext {
            below,
            soft_events: &mut slot.soft_events,
            index,
        };
        slot.layer.read(&mut ctx, buf)
    }

    pub(crate) fn write_at(layers: &mut [LayerSlot], index: usize, buf: &[u8]) -> IoResult<usize> {
        if index >= layers.len() {
            return Err(IoError::invalid("layer index out of range"));
        }
        let (below, at_and_above) = layers.split_at_mut(index);
        let slot = &mut at_and_above[0];
        let mut ctx = LayerContext {
            below,
            soft_events: &mut slot.soft_events,
            index,
        };
        slot.layer.write(&mut ctx, buf)
    }
}

impl Drop for Io {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;

    struct EchoBase {
        data: std::collections::VecDeque<u8>,
    }

    impl Layer for EchoBase {
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

        fn write(&mut self, _ctx: &mut LayerContext<'_>, buf: &[u8]) -> IoResult<usize> {
            self.data.extend(buf.iter().copied());
            Ok(buf.len())
        }

        fn process_event(&mut self, _ctx: &mut LayerContext<'_>, _event_type: &mut EventType) -> bool {
            true
        }

        fn state(&self) -> Option<IoState> {
            Some(IoState::Connected)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct UppercaseLayer;

    impl Layer for UppercaseLayer {
        fn write(&mut self, ctx: &mut LayerContext<'_>, buf: &[u8]) -> IoResult<usize> {
            let upper: Vec<u8> = buf.iter().map(|b| b.to_ascii_uppercase()).collect();
            ctx.write_below(&upper)
        }

        fn process_event(&mut self, _ctx: &mut LayerContext<'_>, _event_type: &mut EventType) -> bool {
            true
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn write_passes_through_layer_transform_to_base() {
        let base = EchoBase {
            data: std::collections::VecDeque::new(),
        };
        let mut io = Io::new("echo", Box::new(base)).unwrap();
        io.push_layer("upper", Box::new(UppercaseLayer)).unwrap();

        io.write(b"hi").unwrap();
        let mut out = [0u8; 2];
        io.read(&mut out).unwrap();
        assert_eq!(&out, b"HI");
    }

    #[test]
    fn state_is_reported_by_base_layer() {
        let base = EchoBase {
            data: std::collections::VecDeque::new(),
        };
        let io = Io::new("echo", Box::new(base)).unwrap();
        assert_eq!(io.state(), IoState::Connected);
    }

    #[test]
    fn read_at_empty_base_would_block() {
        let base = EchoBase {
            data: std::collections::VecDeque::new(),
        };
        let mut io = Io::new("echo", Box::new(base)).unwrap();
        let mut buf = [0u8; 4];
        let err = io.read(&mut buf).unwrap_err();
        assert_eq!(err.kind, crate::error::IoErrorKind::WouldBlock);
    }
}
