//! Triggers (`M_event_trigger_*`): a manually-signaled, edge-triggered
//! "other" event, typically used to wake the loop from another thread.
//! At most one signal is ever pending per trigger -- signalling twice
//! before it's processed collapses to a single delivery, same as the
//! source's documented behavior.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TriggerId(pub(crate) u64);

pub(crate) struct TriggerState {
    pub(crate) pending: bool,
}

impl TriggerState {
    pub(crate) fn new() -> Self {
        TriggerState { pending: false }
    }

    pub(crate) fn signal(&mut self) {
        self.pending = true;
    }

    pub(crate) fn take(&mut self) -> bool {
        std::mem::replace(&mut self.pending, false)
    }
}
