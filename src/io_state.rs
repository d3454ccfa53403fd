//! Aggregate connection state (§4.3).
//!
//! Each layer reports its own view of the handle's state through
//! [`crate::layer::Layer::state`]; `Io::state` reduces those contributions
//! to a single value with a max-severity rule: the layer reporting the
//! most "final" state wins, so a TLS layer that has already moved to
//! `Disconnected` is not masked by a base transport still reporting
//! `Connected`.

/// A handle's connection state, as reported by one layer or aggregated
/// across a whole stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoState {
    Init,
    Listening,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Error,
}

impl IoState {
    /// Higher sorts later in the handle's lifecycle. Used by the
    /// max-severity reduction across a layer stack's reported states.
    fn severity(self) -> u8 {
        match self {
            IoState::Init => 0,
            IoState::Listening => 1,
            IoState::Connecting => 2,
            IoState::Connected => 3,
            IoState::Disconnecting => 4,
            IoState::Disconnected => 5,
            IoState::Error => 6,
        }
    }

    /// Reduce every layer's reported state (bottom-to-top or any order) to
    /// one aggregate value: the most severe state wins. Layers that
    /// abstain (`None`) do not participate. Absent any opinion at all, a
    /// freshly built stack is `Init`.
    pub fn aggregate(states: impl IntoIterator<Item = IoState>) -> IoState {
        states
            .into_iter()
            .max_by_key(|s| s.severity())
            .unwrap_or(IoState::Init)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, IoState::Disconnected | IoState::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn most_severe_state_wins() {
        let agg = IoState::aggregate([IoState::Connected, IoState::Error, IoState::Connecting]);
        assert_eq!(agg, IoState::Error);
    }

    #[test]
    fn empty_defaults_to_init() {
        assert_eq!(IoState::aggregate([]), IoState::Init);
    }

    #[test]
    fn disconnected_outranks_connected() {
        let agg = IoState::aggregate([IoState::Connected, IoState::Disconnected]);
        assert_eq!(agg, IoState::Disconnected);
    }
}
