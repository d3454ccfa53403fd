//! Per-layer soft-event queue (component C1).
//!
//! A soft-event is a synthesized event a layer injects into the dispatcher,
//! as opposed to a "hard" event reported directly by the OS selector. Layers
//! use soft-events to delay, suppress, or fabricate events -- e.g. the PROXY
//! protocol layer suppresses the inbound `Connected` event until its header
//! has been parsed, then re-emits it as a soft-event.

use std::collections::VecDeque;

use crate::error::IoError;
use crate::event_type::EventType;

/// Where a soft-event should be redelivered once drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftEventTarget {
    /// Redeliver to the originating layer's own `process_event`, without
    /// notifying layers above it.
    SelfLayer,
    /// Propagate upward: every layer above the originating one gets a
    /// chance to observe, mutate, or suppress the event via
    /// `process_event`, in bottom-up order.
    Up,
}

#[derive(Debug, Clone)]
pub struct SoftEvent {
    pub event_type: EventType,
    pub io_error: Option<IoError>,
    pub target: SoftEventTarget,
    pub sequence: u64,
}

/// FIFO of pending soft-events for a single layer, with the coalescing rule
/// from §3: duplicate pending `Read`/`Write` events collapse to one;
/// terminal events (`Disconnected`, `Error`) override pending non-terminals
/// and are never coalesced away.
#[derive(Debug, Default)]
pub struct SoftEventQueue {
    pending: VecDeque<SoftEvent>,
    next_sequence: u64,
}

impl SoftEventQueue {
    pub fn new() -> Self {
        SoftEventQueue {
            pending: VecDeque::new(),
            next_sequence: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Enqueue a soft-event, applying the coalescing rule.
    pub fn push(&mut self, target: SoftEventTarget, event_type: EventType, io_error: Option<IoError>) {
        if event_type.is_coalescible() {
            if let Some(existing) = self
                .pending
                .iter()
                .find(|e| e.event_type == event_type && e.target == target)
            {
                let _ = existing;
                return;
            }
        }

        // A terminal event supersedes any pending non-terminal event for the
        // same target; it is never itself dropped by coalescing.
        if event_type.is_terminal() {
            self.pending
                .retain(|e| e.target != target || e.event_type.is_terminal());
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.pending.push_back(SoftEvent {
            event_type,
            io_error,
            target,
            sequence,
        });
    }

    /// Drain every soft-event queued *before* this call. Events pushed while
    /// draining are left for the next turn (§4.2: "soft-events added during a
    /// turn are processed in the next turn").
    pub fn drain_turn(&mut self) -> Vec<SoftEvent> {
        self.pending.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_reads_coalesce_to_one() {
        let mut q = SoftEventQueue::new();
        for _ in 0..5 {
            q.push(SoftEventTarget::Up, EventType::Read, None);
        }
        assert_eq!(q.len(), 1);
        let drained = q.drain_turn();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].event_type, EventType::Read);
    }

    #[test]
    fn terminal_overrides_pending_non_terminal() {
        let mut q = SoftEventQueue::new();
        q.push(SoftEventTarget::Up, EventType::Read, None);
        q.push(SoftEventTarget::Up, EventType::Error, Some(IoError::disconnect()));
        let drained = q.drain_turn();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].event_type, EventType::Error);
    }

    #[test]
    fn terminal_never_coalesced_away() {
        let mut q = SoftEventQueue::new();
        q.push(SoftEventTarget::Up, EventType::Disconnected, None);
        q.push(SoftEventTarget::Up, EventType::Error, None);
        let drained = q.drain_turn();
        // Both terminal events survive; only non-terminal dupes collapse.
        assert_eq!(drained.len(), 2);
    }

    #[test]
    fn events_pushed_during_drain_wait_for_next_turn() {
        let mut q = SoftEventQueue::new();
        q.push(SoftEventTarget::Up, EventType::Read, None);
        let _ = q.drain_turn();
        q.push(SoftEventTarget::Up, EventType::Write, None);
        assert_eq!(q.len(), 1);
    }
}
