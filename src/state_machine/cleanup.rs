//! Cleanup machines: a linear sequence of states run to unwind a handle or
//! a parent state machine, regardless of why it stopped.
//!
//! Grounded on `M_state_machine_cleanup_*` in the source: cleanup machines
//! always run to completion (`M_STATE_MACHINE_LINEAR_END` semantics --
//! running off the end of the sequence is success, not an error), may
//! nest an ordinary [`Sm`](super::Sm) as one of their states, and receive
//! a [`CleanupReason`] explaining why they were invoked.

use std::collections::HashMap;

use super::{Sm, StateId, Status};

/// Why a cleanup machine was run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupReason {
    /// The owning machine (or handle) finished normally.
    Done,
    /// The owning handle was reset for reuse.
    Reset,
    /// The owning operation was cancelled by its caller.
    Cancel,
    /// The owning machine (or handle) hit an unrecoverable error.
    Error,
}

/// A single cleanup state's logic.
pub trait CleanupStateFn<T>: 'static {
    fn run(&mut self, data: &mut T, reason: CleanupReason) -> (Status, Option<StateId>);
}

impl<T, F> CleanupStateFn<T> for F
where
    F: FnMut(&mut T, CleanupReason) -> (Status, Option<StateId>) + 'static,
{
    fn run(&mut self, data: &mut T, reason: CleanupReason) -> (Status, Option<StateId>) {
        (self)(data, reason)
    }
}

enum CleanupKind<T> {
    Leaf(Box<dyn CleanupStateFn<T>>),
    Sub(Sm<T>),
}

struct CleanupEntry<T> {
    descr: &'static str,
    kind: CleanupKind<T>,
}

/// A linear cleanup sequence: states run in insertion order (unless a
/// state names an explicit next/prev) and the machine completes
/// successfully when it runs off the end.
pub struct CleanupSm<T> {
    descr: &'static str,
    order: Vec<StateId>,
    states: HashMap<StateId, CleanupEntry<T>>,
}

impl<T: 'static> CleanupSm<T> {
    pub fn new(descr: &'static str) -> Self {
        CleanupSm {
            descr,
            order: Vec::new(),
            states: HashMap::new(),
        }
    }

    pub fn insert_state(&mut self, id: StateId, descr: &'static str, func: impl CleanupStateFn<T>) {
        self.order.push(id);
        self.states.insert(
            id,
            CleanupEntry {
                descr,
                kind: CleanupKind::Leaf(Box::new(func)),
            },
        );
    }

    pub fn insert_sub_state_machine(&mut self, id: StateId, descr: &'static str, sub: Sm<T>) {
        self.order.push(id);
        self.states.insert(
            id,
            CleanupEntry {
                descr,
                kind: CleanupKind::Sub(sub),
            },
        );
    }

    fn next_in_order(&self, id: StateId) -> Option<StateId> {
        let pos = self.order.iter().position(|&x| x == id)?;
        self.order.get(pos + 1).copied()
    }

    fn prev_in_order(&self, id: StateId) -> Option<StateId> {
        let pos = self.order.iter().position(|&x| x == id)?;
        if pos == 0 {
            None
        } else {
            self.order.get(pos - 1).copied()
        }
    }

    /// Run every state in sequence. Unlike [`Sm::run`], reaching the end of
    /// the sequence is `Status::Done`, not an error -- there is no implicit
    /// "ran off the end" failure for a cleanup chain.
    pub fn run(&mut self, data: &mut T, reason: CleanupReason) -> Status {
        self.run_with_observer(data, reason, &mut |_, _| {})
    }

    /// As [`run`](Self::run), additionally calling `observer(state_id,
    /// state_descr)` immediately before running each state, so a parent
    /// `Sm` can expose which cleanup state is presently executing through
    /// its own introspection methods while this call is still on the
    /// stack.
    pub(crate) fn run_with_observer(
        &mut self,
        data: &mut T,
        reason: CleanupReason,
        observer: &mut dyn FnMut(StateId, &'static str),
    ) -> Status {
        let mut current = match self.order.first().copied() {
            Some(id) => id,
            None => return Status::Done,
        };

        loop {
            let (status, mut next_hint) = {
                let entry = match self.states.get_mut(&current) {
                    Some(e) => e,
                    None => return Status::ErrorBadNext,
                };
                observer(current, entry.descr);
                match &mut entry.kind {
                    CleanupKind::Leaf(func) => func.run(data, reason),
                    CleanupKind::Sub(sub) => match sub.run(data) {
                        Status::Done => (Status::Next, None),
                        other => return other,
                    },
                }
            };

            match status {
                Status::Next => {
                    let resolved = next_hint.take().or_else(|| self.next_in_order(current));
                    match resolved {
                        None => return Status::Done,
                        Some(n) if n == current => return Status::ErrorSelfNext,
                        Some(n) if !self.states.contains_key(&n) => return Status::ErrorBadNext,
                        Some(n) => current = n,
                    }
                }
                Status::Prev => {
                    let resolved = next_hint.take().or_else(|| self.prev_in_order(current));
                    match resolved {
                        None => return Status::ErrorNoNext,
                        Some(n) if n == current => return Status::ErrorSelfNext,
                        Some(n) if !self.states.contains_key(&n) => return Status::ErrorBadNext,
                        Some(n) => current = n,
                    }
                }
                Status::Done => return Status::Done,
                Status::Wait => return Status::Wait,
                other => return other,
            }
        }
    }

    pub fn descr(&self) -> &'static str {
        self.descr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_off_the_end_is_success() {
        let mut cm: CleanupSm<i32> = CleanupSm::new("cm");
        cm.insert_state(1, "a", |d: &mut i32, _reason| {
            *d += 1;
            (Status::Next, None)
        });
        cm.insert_state(2, "b", |d: &mut i32, _reason| {
            *d += 1;
            (Status::Next, None)
        });

        let mut data = 0;
        let status = cm.run(&mut data, CleanupReason::Done);
        assert_eq!(status, Status::Done);
        assert_eq!(data, 2);
    }

    #[test]
    fn reason_is_threaded_through() {
        let mut cm: CleanupSm<Option<CleanupReason>> = CleanupSm::new("cm");
        cm.insert_state(1, "a", |d: &mut Option<CleanupReason>, reason| {
            *d = Some(reason);
            (Status::Next, None)
        });

        let mut data = None;
        cm.run(&mut data, CleanupReason::Cancel);
        assert_eq!(data, Some(CleanupReason::Cancel));
    }
}
