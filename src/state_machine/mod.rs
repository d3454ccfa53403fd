//! Hierarchical state-machine runtime (component C4).
//!
//! Grounded on the behavior exercised by mstdlib's state-machine test
//! suite: states are plain functions keyed by an arbitrary `u64` id, run in
//! insertion order unless a state names an explicit successor, and may
//! nest an entire sub-machine in place of a single state. `Status::Wait`
//! suspends the machine in place -- `run` returns, and a later call
//! resumes from the same state -- which is what lets a machine yield back
//! to an event loop waiting on I/O mid-transition.

pub mod cleanup;

use std::collections::HashMap;
use std::fmt;

pub use cleanup::{CleanupReason, CleanupSm};

pub type StateId = u64;

/// The outcome of running a single state function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Move to the state-supplied next id, or the next one in insertion
    /// order if none was given.
    Next,
    /// Move to the state-supplied previous id, or the one before this in
    /// insertion order if none was given.
    Prev,
    /// The machine has finished successfully.
    Done,
    /// Suspend; `run` returns without advancing `current`, and the next
    /// call to `run` re-enters the same state.
    Wait,
    /// The state reported failure; the machine's cleanup runs (if any),
    /// then `run` returns this status.
    ErrorState,
    /// `Next`/`Prev` requested implicit traversal but there was no
    /// adjacent state to fall to.
    ErrorNoNext,
    /// A state named an explicit next/prev id that does not exist in this
    /// machine, or that its `allowed_next` set does not permit.
    ErrorBadNext,
    /// A state named itself as the next id.
    ErrorSelfNext,
}

impl Status {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            Status::ErrorState | Status::ErrorNoNext | Status::ErrorBadNext | Status::ErrorSelfNext
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A single state's logic: inspect/mutate `data`, optionally name an
/// explicit next/prev id, and report what happened.
pub trait StateFn<T>: 'static {
    fn run(&mut self, data: &mut T) -> (Status, Option<StateId>);
}

impl<T, F> StateFn<T> for F
where
    F: FnMut(&mut T) -> (Status, Option<StateId>) + 'static,
{
    fn run(&mut self, data: &mut T) -> (Status, Option<StateId>) {
        (self)(data)
    }
}

/// A hook run immediately after a leaf state's function, with the chance
/// to override the outcome before the machine acts on it. Grounded on the
/// source's post-transition callbacks (e.g. a state whose "real" next id
/// depends on accumulated data rather than a fixed successor).
pub trait PostCheck<T>: 'static {
    fn check(&mut self, data: &mut T, status: &mut Status, next: &mut Option<StateId>);
}

impl<T, F> PostCheck<T> for F
where
    F: FnMut(&mut T, &mut Status, &mut Option<StateId>) + 'static,
{
    fn check(&mut self, data: &mut T, status: &mut Status, next: &mut Option<StateId>) {
        (self)(data, status, next)
    }
}

/// A hook run before a sub-state-machine state; `false` skips the
/// sub-machine entirely and forces the parent to transition with the
/// written `status`/`next`.
pub trait SubPreCheck<T>: 'static {
    fn check(&mut self, data: &mut T, status: &mut Status, next: &mut Option<StateId>) -> bool;
}

impl<T, F> SubPreCheck<T> for F
where
    F: FnMut(&mut T, &mut Status, &mut Option<StateId>) -> bool + 'static,
{
    fn check(&mut self, data: &mut T, status: &mut Status, next: &mut Option<StateId>) -> bool {
        (self)(data, status, next)
    }
}

/// A hook run after a sub-state-machine finishes; its return becomes the
/// parent's status, and it may force a transition via `next`.
pub trait SubPostCheck<T>: 'static {
    fn check(&mut self, data: &mut T, sub_status: Status, next: &mut Option<StateId>) -> Status;
}

impl<T, F> SubPostCheck<T> for F
where
    F: FnMut(&mut T, Status, &mut Option<StateId>) -> Status + 'static,
{
    fn check(&mut self, data: &mut T, sub_status: Status, next: &mut Option<StateId>) -> Status {
        (self)(data, sub_status, next)
    }
}

enum StateKind<T> {
    Leaf(Box<dyn StateFn<T>>, Option<Box<dyn PostCheck<T>>>),
    Sub(Box<Sm<T>>, Option<Box<dyn SubPreCheck<T>>>, Option<Box<dyn SubPostCheck<T>>>),
}

struct StateEntry<T> {
    descr: &'static str,
    kind: StateKind<T>,
    cleanup: Option<CleanupHandle<T>>,
    /// Restricts which explicit `next_id`s a `Next` from this state may
    /// name; unset means any id present in the machine is allowed.
    allowed_next: Option<std::collections::HashSet<StateId>>,
}

/// A shared handle to a cleanup machine: several states (and several
/// parent machines) can point at the same cleanup sequence.
pub type CleanupHandle<T> = std::rc::Rc<std::cell::RefCell<CleanupSm<T>>>;

/// Where in a dispatch turn / machine run a trace observer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    MachineEnter,
    MachineExit,
    StateStart,
    PostCheck,
    /// Entering the cleanup machine registered for the active stack's
    /// `state_id` (fired once, before that cleanup machine's own states
    /// start running).
    Cleanup,
    /// One state of a cleanup machine starting; `state_id`/`state_descr`
    /// name the cleanup machine's own state, and `path` carries the full
    /// `[M] ... -> [S] ... -> [CM] ... -> [S] ...` chain down to it.
    CleanupStateStart,
}

/// What a trace observer is told about one step.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub kind: TraceKind,
    pub machine_descr: &'static str,
    pub state_descr: &'static str,
    pub state_id: StateId,
    pub status: Option<Status>,
    /// The full hierarchical descriptor path active when this event
    /// fired, e.g. `"[M] SM -> [S] B -> [CM] CM2 -> [S] cm2-first"`.
    /// Mirrors `Sm::descr_full(true)` at the moment of firing.
    pub path: String,
}

impl TraceEvent {
    pub fn full_descr(&self) -> String {
        self.path.clone()
    }
}

pub type Tracer = std::rc::Rc<dyn Fn(&TraceEvent)>;

/// The descriptor path of a cleanup machine that is currently unwinding
/// this machine, captured at whichever of its own states is presently
/// running. Lets `descr_full`/`active_state` see into a cleanup frame
/// while `run_cleanup_stack` is still on the stack.
struct ActiveCleanup {
    parent_state_descr: &'static str,
    cleanup_descr: &'static str,
    cleanup_state_id: StateId,
    cleanup_state_descr: &'static str,
}

/// A state machine: an ordered collection of states (leaves or nested
/// sub-machines) run against a caller-owned `data: &mut T`.
pub struct Sm<T> {
    pub(crate) descr: &'static str,
    order: Vec<StateId>,
    states: HashMap<StateId, StateEntry<T>>,
    current: Option<StateId>,
    started: bool,
    tracer: Option<Tracer>,
    linear_end: bool,
    /// Every state entered so far this run, in entry order. Walked
    /// deepest-first (i.e. in reverse) to run each entered state's
    /// cleanup machine on `ERROR_STATE`/reset/cancel.
    entered: Vec<StateId>,
    active_cleanup: Option<ActiveCleanup>,
}

impl<T: 'static> Sm<T> {
    pub fn new(descr: &'static str) -> Self {
        Sm {
            descr,
            order: Vec::new(),
            states: HashMap::new(),
            current: None,
            started: false,
            tracer: None,
            linear_end: false,
            entered: Vec::new(),
            active_cleanup: None,
        }
    }

    /// Build a machine where running `Next` off the end of the insertion
    /// order (instead of hitting an explicit `Done`) is treated as a
    /// successful finish rather than `ErrorNoNext`.
    pub fn new_linear_end(descr: &'static str) -> Self {
        let mut sm = Self::new(descr);
        sm.linear_end = true;
        sm
    }

    pub fn set_tracer(&mut self, tracer: Tracer) {
        self.tracer = Some(tracer);
    }

    pub fn insert_state(
        &mut self,
        id: StateId,
        descr: &'static str,
        func: impl StateFn<T>,
        cleanup: Option<CleanupHandle<T>>,
    ) {
        self.insert_state_with_post(id, descr, func, cleanup, None);
    }

    pub fn insert_state_with_post(
        &mut self,
        id: StateId,
        descr: &'static str,
        func: impl StateFn<T>,
        cleanup: Option<CleanupHandle<T>>,
        post: Option<Box<dyn PostCheck<T>>>,
    ) {
        self.order.push(id);
        self.states.insert(
            id,
            StateEntry {
                descr,
                kind: StateKind::Leaf(Box::new(func), post),
                cleanup,
                allowed_next: None,
            },
        );
    }

    /// Restrict which explicit `next_id`s state `id` may transition to.
    /// A `Next` naming an id outside this set is `ERROR_BAD_NEXT`; the
    /// default (never called) allows any id present in the machine.
    pub fn set_allowed_next(&mut self, id: StateId, allowed_next: impl IntoIterator<Item = StateId>) {
        if let Some(entry) = self.states.get_mut(&id) {
            entry.allowed_next = Some(allowed_next.into_iter().collect());
        }
    }

    pub fn insert_sub_state_machine(
        &mut self,
        id: StateId,
        descr: &'static str,
        sub: Sm<T>,
        cleanup: Option<CleanupHandle<T>>,
    ) {
        self.insert_sub_state_machine_with_hooks(id, descr, sub, cleanup, None, None);
    }

    /// As [`insert_sub_state_machine`](Self::insert_sub_state_machine), with
    /// optional `pre`/`post` hooks around the sub-machine's run.
    pub fn insert_sub_state_machine_with_hooks(
        &mut self,
        id: StateId,
        descr: &'static str,
        sub: Sm<T>,
        cleanup: Option<CleanupHandle<T>>,
        pre: Option<Box<dyn SubPreCheck<T>>>,
        post: Option<Box<dyn SubPostCheck<T>>>,
    ) {
        self.order.push(id);
        self.states.insert(
            id,
            StateEntry {
                descr,
                kind: StateKind::Sub(Box::new(sub), pre, post),
                cleanup,
                allowed_next: None,
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

    fn trace(&self, kind: TraceKind, state_descr: &'static str, state_id: StateId, status: Option<Status>) {
        if let Some(t) = &self.tracer {
            t(&TraceEvent {
                kind,
                machine_descr: self.descr,
                state_descr,
                state_id,
                status,
                path: self.descr_full(true),
            });
        }
    }

    /// Run (or resume) the machine until it reaches `Done`, a `Wait`
    /// suspension, or an error.
    pub fn run(&mut self, data: &mut T) -> Status {
        if !self.started {
            self.started = true;
            self.current = self.order.first().copied();
            self.entered.clear();
            if let Some(id) = self.current {
                self.entered.push(id);
            }
            self.trace(TraceKind::MachineEnter, "", 0, None);
        }

        loop {
            let id = match self.current {
                Some(id) => id,
                None => {
                    self.trace(TraceKind::MachineExit, "", 0, Some(Status::Done));
                    return Status::Done;
                }
            };

            let descr = self
                .states
                .get(&id)
                .map(|e| e.descr)
                .unwrap_or("");
            self.trace(TraceKind::StateStart, descr, id, None);

            let (mut status, mut next_hint) = {
                let entry = match self.states.get_mut(&id) {
                    Some(e) => e,
                    None => return Status::ErrorBadNext,
                };
                match &mut entry.kind {
                    StateKind::Leaf(func, post) => {
                        let (mut status, mut next_hint) = func.run(data);
                        if let Some(post) = post {
                            post.check(data, &mut status, &mut next_hint);
                        }
                        (status, next_hint)
                    }
                    StateKind::Sub(sub, pre, post) => {
                        let mut forced_status = Status::Next;
                        let mut forced_next: Option<StateId> = None;
                        let run_sub = match pre {
                            Some(pre) => pre.check(data, &mut forced_status, &mut forced_next),
                            None => true,
                        };
                        if !run_sub {
                            (forced_status, forced_next)
                        } else {
                            let sub_status = sub.run(data);
                            if sub_status == Status::Wait {
                                return Status::Wait;
                            }
                            match post {
                                Some(post) => {
                                    let mut next = None;
                                    let status = post.check(data, sub_status, &mut next);
                                    (status, next)
                                }
                                None => match sub_status {
                                    Status::Done => (Status::Next, None),
                                    other => return other,
                                },
                            }
                        }
                    }
                }
            };

            self.trace(TraceKind::PostCheck, descr, id, Some(status));

            match status {
                Status::Next => {
                    let explicit = next_hint.take();
                    let allowed_next = self.states.get(&id).and_then(|e| e.allowed_next.clone());

                    if explicit.is_none() && allowed_next.is_some() && !self.linear_end {
                        self.run_cleanup_stack(data, CleanupReason::Error);
                        return Status::ErrorNoNext;
                    }

                    let resolved = explicit.or_else(|| self.next_in_order(id));
                    match resolved {
                        None if self.linear_end => {
                            self.current = None;
                            self.trace(TraceKind::MachineExit, descr, id, Some(Status::Done));
                            return Status::Done;
                        }
                        None => {
                            self.run_cleanup_stack(data, CleanupReason::Error);
                            return Status::ErrorNoNext;
                        }
                        Some(n) if n == id => {
                            self.run_cleanup_stack(data, CleanupReason::Error);
                            return Status::ErrorSelfNext;
                        }
                        Some(n) if allowed_next.as_ref().is_some_and(|set| !set.contains(&n)) => {
                            self.run_cleanup_stack(data, CleanupReason::Error);
                            return Status::ErrorBadNext;
                        }
                        Some(n) if !self.states.contains_key(&n) => {
                            self.run_cleanup_stack(data, CleanupReason::Error);
                            return Status::ErrorBadNext;
                        }
                        Some(n) => {
                            self.current = Some(n);
                            self.entered.push(n);
                            continue;
                        }
                    }
                }
                Status::Prev => {
                    let resolved = next_hint.take().or_else(|| self.prev_in_order(id));
                    match resolved {
                        None => {
                            self.run_cleanup_stack(data, CleanupReason::Error);
                            return Status::ErrorNoNext;
                        }
                        Some(n) if n == id => {
                            self.run_cleanup_stack(data, CleanupReason::Error);
                            return Status::ErrorSelfNext;
                        }
                        Some(n) if !self.states.contains_key(&n) => {
                            self.run_cleanup_stack(data, CleanupReason::Error);
                            return Status::ErrorBadNext;
                        }
                        Some(n) => {
                            self.current = Some(n);
                            self.entered.push(n);
                            continue;
                        }
                    }
                }
                Status::Done => {
                    self.current = None;
                    self.trace(TraceKind::MachineExit, descr, id, Some(Status::Done));
                    return Status::Done;
                }
                Status::Wait => {
                    // current stays put; next run() call re-enters this state.
                    return Status::Wait;
                }
                Status::ErrorState => {
                    self.run_cleanup_stack(data, CleanupReason::Error);
                    self.trace(TraceKind::MachineExit, descr, id, Some(Status::ErrorState));
                    return Status::ErrorState;
                }
                Status::ErrorNoNext | Status::ErrorBadNext | Status::ErrorSelfNext => {
                    self.run_cleanup_stack(data, CleanupReason::Error);
                    return status;
                }
            }
        }
    }

    /// Walk every state entered so far this run, deepest (most recently
    /// entered) first, running each one's registered cleanup machine
    /// exactly once. Matches `M_state_machine_cleanup` running cleanup for
    /// every active state rather than only the one that failed.
    fn run_cleanup_stack(&mut self, data: &mut T, reason: CleanupReason) {
        let mut seen = std::collections::HashSet::new();
        for id in self.entered.clone().into_iter().rev() {
            if !seen.insert(id) {
                continue;
            }
            let Some((parent_state_descr, cleanup)) = self
                .states
                .get(&id)
                .and_then(|entry| entry.cleanup.clone().map(|cleanup| (entry.descr, cleanup)))
            else {
                continue;
            };
            self.trace(TraceKind::Cleanup, parent_state_descr, id, None);
            let cleanup_descr = cleanup.borrow().descr();
            let machine_descr = self.descr;
            let tracer = self.tracer.clone();
            {
                let active_cleanup = &mut self.active_cleanup;
                let mut observer = |cleanup_state_id: StateId, cleanup_state_descr: &'static str| {
                    *active_cleanup = Some(ActiveCleanup {
                        parent_state_descr,
                        cleanup_descr,
                        cleanup_state_id,
                        cleanup_state_descr,
                    });
                    if let Some(t) = &tracer {
                        t(&TraceEvent {
                            kind: TraceKind::CleanupStateStart,
                            machine_descr,
                            state_descr: cleanup_state_descr,
                            state_id: cleanup_state_id,
                            status: None,
                            path: format!(
                                "[M] {} -> [S] {} -> [CM] {} -> [S] {}",
                                machine_descr, parent_state_descr, cleanup_descr, cleanup_state_descr
                            ),
                        });
                    }
                };
                cleanup.borrow_mut().run_with_observer(data, reason, &mut observer);
            }
            self.active_cleanup = None;
        }
    }

    /// The currently active leaf state and its nesting depth: `0` for a
    /// leaf of this machine, `+1` for each level of sub-machine or active
    /// cleanup-machine descent.
    pub fn active_state(&self) -> Option<(StateId, usize)> {
        if let Some(ac) = &self.active_cleanup {
            return Some((ac.cleanup_state_id, 1));
        }
        let id = self.current?;
        let entry = self.states.get(&id)?;
        match &entry.kind {
            StateKind::Leaf(..) => Some((id, 0)),
            StateKind::Sub(sub, ..) => match sub.active_state() {
                Some((sub_id, depth)) => Some((sub_id, depth + 1)),
                None => Some((id, 0)),
            },
        }
    }

    /// The deepest currently-active nested sub-state-machine, if the
    /// active leaf state is itself a sub-machine. `include_cleanup` is
    /// accepted for parity with `descr_full`, but a cleanup machine's own
    /// internal sub-machine nesting isn't exposed as a live reference here
    /// -- it lives behind the `Rc<RefCell<_>>` several states may share.
    /// `descr_full` still reports into an active cleanup frame by
    /// descriptor string; this method only descends ordinary nesting.
    pub fn active_sub(&self, include_cleanup: bool) -> Option<&Sm<T>> {
        let id = self.current?;
        let entry = self.states.get(&id)?;
        match &entry.kind {
            StateKind::Sub(sub, ..) => Some(sub.active_sub(include_cleanup).unwrap_or(sub)),
            StateKind::Leaf(..) => None,
        }
    }

    fn state_chain(&self) -> Option<String> {
        let id = self.current?;
        let entry = self.states.get(&id)?;
        let mut chain = format!("[S] {}", entry.descr);
        if let StateKind::Sub(sub, ..) = &entry.kind {
            if let Some(nested) = sub.state_chain() {
                chain.push_str(" -> ");
                chain.push_str(&nested);
            }
        }
        Some(chain)
    }

    /// The full `"[M] machine -> [S] state -> ..."` descriptor path for
    /// wherever the machine is right now, descending through nested
    /// sub-machines. When `include_cleanup` is set and a cleanup machine
    /// is currently unwinding this machine, descends into that cleanup
    /// frame instead (`"[M] machine -> [S] state -> [CM] cleanup -> [S]
    /// cleanup-state"`).
    pub fn descr_full(&self, include_cleanup: bool) -> String {
        if include_cleanup {
            if let Some(ac) = &self.active_cleanup {
                return format!(
                    "[M] {} -> [S] {} -> [CM] {} -> [S] {}",
                    self.descr, ac.parent_state_descr, ac.cleanup_descr, ac.cleanup_state_descr
                );
            }
        }
        match self.state_chain() {
            Some(chain) => format!("[M] {} -> {}", self.descr, chain),
            None => format!("[M] {}", self.descr),
        }
    }

    /// Reset the machine back to its first state, running the active
    /// stack's cleanup machines first (deepest-first), as if the run had
    /// failed for `reason` instead of finishing normally.
    pub fn reset(&mut self, data: &mut T, reason: CleanupReason) {
        if self.started && self.current.is_some() {
            self.run_cleanup_stack(data, reason);
        }
        self.started = false;
        self.current = None;
        self.entered.clear();
    }

    pub fn descr(&self) -> &'static str {
        self.descr
    }
}
