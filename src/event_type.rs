//! The event kinds delivered to layers and, ultimately, to the user callback
//! registered with the event loop.

/// One event delivered up the layer stack, or to the event loop's user
/// callback.
///
/// Ordering matters: [`EventType::priority`] defines the delivery order
/// within a single dispatch turn (`§4.1` of the design: `CONNECTED, ACCEPT,
/// READ, DISCONNECTED, ERROR, WRITE, OTHER`). This is not the derived
/// discriminant order because `Other` (triggers, timers, queued tasks) must
/// sort last even though it is the catch-all case and thus declared last for
/// readability too -- that's a coincidence worth calling out rather than
/// relying on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Connected,
    Accept,
    Read,
    Disconnected,
    Error,
    Write,
    Other,
}

impl EventType {
    /// Lower sorts first. See the dispatch ordering contract in the module
    /// docs.
    pub fn priority(self) -> u8 {
        match self {
            EventType::Connected => 0,
            EventType::Accept => 1,
            EventType::Read => 2,
            EventType::Disconnected => 3,
            EventType::Error => 4,
            EventType::Write => 5,
            EventType::Other => 6,
        }
    }

    /// Terminal events end a handle's event stream; no further events are
    /// delivered to the handle's top layer afterward.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventType::Disconnected | EventType::Error)
    }

    /// Coalescible event kinds collapse into a single delivery when enqueued
    /// multiple times without an intervening dispatch. Terminal events are
    /// never coalesced away (§3, Soft-event invariant).
    pub fn is_coalescible(self) -> bool {
        matches!(self, EventType::Read | EventType::Write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_matches_dispatch_contract() {
        let mut kinds = [
            EventType::Other,
            EventType::Write,
            EventType::Error,
            EventType::Disconnected,
            EventType::Read,
            EventType::Accept,
            EventType::Connected,
        ];
        kinds.sort_by_key(|k| k.priority());
        assert_eq!(
            kinds,
            [
                EventType::Connected,
                EventType::Accept,
                EventType::Read,
                EventType::Disconnected,
                EventType::Error,
                EventType::Write,
                EventType::Other,
            ]
        );
    }

    #[test]
    fn only_disconnected_and_error_are_terminal() {
        for kind in [
            EventType::Connected,
            EventType::Accept,
            EventType::Read,
            EventType::Write,
            EventType::Other,
        ] {
            assert!(!kind.is_terminal());
        }
        assert!(EventType::Disconnected.is_terminal());
        assert!(EventType::Error.is_terminal());
    }
}
