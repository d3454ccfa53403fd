//! The layer callback contract (component C2, §4.2).
//!
//! Each entry in mstdlib's `M_io_callbacks_t` vtable becomes a trait method
//! here, with a no-op default for everything the source lists as optional.
//! `process_event` and `destroy` are the only two callbacks the source marks
//! required, so they are the only ones without a default body.

use std::any::Any;

use crate::error::IoResult;
use crate::event_type::EventType;
use crate::io_state::IoState;
use crate::soft_event::{SoftEvent, SoftEventQueue, SoftEventTarget};

/// One layer in an [`Io`](crate::io_handle::Io) handle's stack.
///
/// A layer owns whatever private state it needs (a parser buffer, a TLS
/// session, ...) as fields on the concrete type implementing this trait;
/// `Io` only ever talks to it through these methods.
pub trait Layer: Any {
    /// Called once, right after the layer is attached to a handle.
    fn init(&mut self, _ctx: &mut LayerContext<'_>) -> IoResult<()> {
        Ok(())
    }

    /// A layer above requested bytes. The default passes the request
    /// straight through to the layer below.
    fn read(&mut self, ctx: &mut LayerContext<'_>, buf: &mut [u8]) -> IoResult<usize> {
        ctx.read_below(buf)
    }

    /// A layer above has bytes to write. The default passes them straight
    /// through to the layer below.
    fn write(&mut self, ctx: &mut LayerContext<'_>, buf: &[u8]) -> IoResult<usize> {
        ctx.write_below(buf)
    }

    /// An event reached this layer moving upward (or, for a `SelfLayer`
    /// soft-event, was redelivered to its own originator). Returning `false`
    /// drops the event -- it is not delivered to the layer above, nor
    /// ultimately to the user.
    fn process_event(
        &mut self,
        ctx: &mut LayerContext<'_>,
        event_type: &mut EventType,
    ) -> bool;

    /// A new connection was accepted on a listening handle that carries this
    /// layer; an opportunity to add an equivalent layer onto `child`.
    fn accept(&mut self, _ctx: &mut LayerContext<'_>, _child: &mut crate::io_handle::Io) -> IoResult<()> {
        Ok(())
    }

    /// The handle is being reset for reuse; clear any accumulated state.
    fn reset(&mut self, _ctx: &mut LayerContext<'_>) -> IoResult<()> {
        Ok(())
    }

    /// The handle is being destroyed. Always called, bottom-up across the
    /// stack.
    fn destroy(&mut self, _ctx: &mut LayerContext<'_>) {}

    /// This layer's contribution to the handle's aggregate state, or `None`
    /// if it defers entirely to other layers.
    fn state(&self) -> Option<IoState> {
        None
    }

    /// A human-readable description of this layer's last error, if any.
    fn error_message(&self) -> Option<String> {
        None
    }

    /// Called just before the layer is removed from a running loop.
    fn unregister(&mut self, _ctx: &mut LayerContext<'_>) {}

    /// Only the concrete base-transport layer overrides this, exposing
    /// itself for OS-selector registration. Every other layer defers.
    fn as_pollable(&mut self) -> Option<&mut dyn crate::sys::Pollable> {
        None
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// One slot in an `Io`'s layer stack: the layer itself plus its private
/// soft-event queue.
pub struct LayerSlot {
    pub(crate) layer: Box<dyn Layer>,
    pub(crate) soft_events: SoftEventQueue,
    pub(crate) name: &'static str,
}

impl LayerSlot {
    pub fn new(name: &'static str, layer: Box<dyn Layer>) -> Self {
        LayerSlot {
            layer,
            soft_events: SoftEventQueue::new(),
            name,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// The view a [`Layer`] method gets of the rest of its stack: everything
/// strictly below it, plus its own soft-event queue.
///
/// Layers below are reachable only through `read_below`/`write_below`/
/// `dispatch_event_below`, which recurse back into the same index-based
/// dispatcher `Io` uses -- there is no direct reference to the owning `Io`,
/// which is what lets `Io::read`/`write`/`dispatch` hold `&mut self.layers`
/// for the whole call without a cyclic borrow.
pub struct LayerContext<'a> {
    pub(crate) below: &'a mut [LayerSlot],
    pub(crate) soft_events: &'a mut SoftEventQueue,
    pub(crate) index: usize,
}

impl<'a> LayerContext<'a> {
    /// The 0-based index of the layer this context belongs to. 0 is the
    /// base transport.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_base(&self) -> bool {
        self.index == 0
    }

    pub fn read_below(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        if self.index == 0 {
            return Err(crate::error::IoError::invalid("no layer below the base transport"));
        }
        crate::io_handle::Io::read_at(self.below, self.index - 1, buf)
    }

    pub fn write_below(&mut self, buf: &[u8]) -> IoResult<usize> {
        if self.index == 0 {
            return Err(crate::error::IoError::invalid("no layer below the base transport"));
        }
        crate::io_handle::Io::write_at(self.below, self.index - 1, buf)
    }

    /// Enqueue a soft-event on this layer's own queue.
    pub fn softevent_add(
        &mut self,
        propagate_upward: bool,
        event_type: EventType,
        io_error: Option<crate::error::IoError>,
    ) {
        let target = if propagate_upward {
            SoftEventTarget::Up
        } else {
            SoftEventTarget::SelfLayer
        };
        self.soft_events.push(target, event_type, io_error);
    }

    /// Reach into a layer strictly below this one by its absolute index
    /// (e.g. the base transport, to downcast to a concrete type for
    /// selector registration). Returns `None` if `index` is not below.
    pub fn layer_below_as<T: 'static>(&mut self, index: usize) -> Option<&mut T> {
        if index >= self.index {
            return None;
        }
        self.below.get_mut(index)?.layer.as_any_mut().downcast_mut::<T>()
    }
}

pub(crate) fn drain_and_dispatch(
    layers: &mut [LayerSlot],
    originator: usize,
    event: SoftEvent,
) -> Option<(EventType, usize)> {
    match event.target {
        SoftEventTarget::SelfLayer => {
            let mut event_type = event.event_type;
            let (below, at_and_above) = layers.split_at_mut(originator);
            let slot = &mut at_and_above[0];
            let mut ctx = LayerContext {
                below,
                soft_events: &mut slot.soft_events,
                index: originator,
            };
            let keep = slot.layer.process_event(&mut ctx, &mut event_type);
            if keep {
                Some((event_type, originator))
            } else {
                None
            }
        }
        SoftEventTarget::Up => {
            let mut event_type = event.event_type;
            let mut current = originator;
            while current + 1 < layers.len() {
                current += 1;
                let (below, at_and_above) = layers.split_at_mut(current);
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
            Some((event_type, current))
        }
    }
}
