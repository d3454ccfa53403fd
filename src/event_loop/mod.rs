//! The event loop (component C3, §4.1): a single-threaded dispatch turn
//! that polls the OS selector, feeds hard events into registered [`Io`]
//! handles, drains their soft-event queues, and fires due timers,
//! triggers, and queued tasks -- all in the priority order fixed by
//! [`EventType::priority`].
//!
//! Grounded on `M_event_*` in the source (`M_event_create`, `M_event_add`,
//! `M_event_timer_add`, `M_event_trigger_add`, `M_event_queue_task`,
//! `M_event_loop`). The source's `void *cb_data` pattern becomes an
//! ordinary `FnMut` closure capturing its own state -- Rust has no need
//! for the C idiom of smuggling state through a void pointer.

pub mod pool;
pub mod timer;
pub mod trigger;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::error::{IoError, IoResult};
use crate::event_type::EventType;
use crate::io_handle::Io;
use crate::sys::{self, Events, Interest, Selector, Token};

pub use pool::EventPool;
pub use timer::{TimerId, TimerMode};
pub use trigger::TriggerId;

use timer::Timer;
use trigger::TriggerState;

/// Construction-time behavior flags for an [`EventLoop`], mirroring
/// `M_EVENT_FLAG_*`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventLoopFlags {
    /// This loop will never be woken from another thread; skip setting up
    /// a waker.
    pub no_wake: bool,
    /// Exit the loop once there is nothing left registered (no handles,
    /// and -- unless `exit_on_empty_no_timers` -- no running timers).
    pub exit_on_empty: bool,
    /// When combined with `exit_on_empty`, running timers don't count as
    /// "something left registered".
    pub exit_on_empty_no_timers: bool,
}

/// A loop's current run state (`M_event_status_t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    Running,
    Paused,
    Return,
    Done,
}

/// Why [`EventLoop::run`] returned (`M_event_err_t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Done,
    Timeout,
    Return,
}

struct IoRegistration {
    io: Io,
    callback: Box<dyn FnMut(&mut EventLoop, EventType, &mut Io)>,
}

/// The event loop itself.
pub struct EventLoop {
    selector: Selector,
    waker: sys::Waker,
    waker_token: Token,
    events_buf: Events,
    next_token: usize,
    ios: HashMap<Token, IoRegistration>,
    timers: HashMap<u64, (Timer, Box<dyn FnMut(&mut EventLoop)>)>,
    next_timer_id: u64,
    triggers: HashMap<u64, (TriggerState, Box<dyn FnMut(&mut EventLoop)>)>,
    next_trigger_id: u64,
    queued_tasks: std::collections::VecDeque<Box<dyn FnOnce(&mut EventLoop)>>,
    flags: EventLoopFlags,
    status: LoopStatus,
    pending_exit: Option<LoopExit>,
    /// Ids a callback asked to remove while it was itself detached from
    /// `timers`/`triggers` for the call -- checked after the call returns
    /// so we don't resurrect something the callback deleted.
    removed_timers: std::collections::HashSet<u64>,
    removed_triggers: std::collections::HashSet<u64>,
}

impl EventLoop {
    pub fn new(flags: EventLoopFlags) -> IoResult<Self> {
        let selector = Selector::new()?;
        let waker_token = Token(usize::MAX);
        let waker = sys::Waker::new(&selector, waker_token)?;
        Ok(EventLoop {
            selector,
            waker,
            waker_token,
            events_buf: Events::with_capacity(128),
            next_token: 0,
            ios: HashMap::new(),
            timers: HashMap::new(),
            next_timer_id: 0,
            triggers: HashMap::new(),
            next_trigger_id: 0,
            queued_tasks: std::collections::VecDeque::new(),
            flags,
            status: LoopStatus::Paused,
            pending_exit: None,
            removed_timers: std::collections::HashSet::new(),
            removed_triggers: std::collections::HashSet::new(),
        })
    }

    fn alloc_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }

    /// Register a handle with the loop. Its base transport layer is
    /// polled for readiness; every hard and soft event it produces is
    /// delivered to `callback` in priority order.
    pub fn add_io(
        &mut self,
        mut io: Io,
        interest: Interest,
        callback: impl FnMut(&mut EventLoop, EventType, &mut Io) + 'static,
    ) -> IoResult<Token> {
        let token = self.alloc_token();
        match io.base_pollable() {
            Some(base) => base.register(&self.selector, token, interest)?,
            None => return Err(IoError::invalid("base layer does not implement Pollable")),
        }
        self.ios.insert(
            token,
            IoRegistration {
                io,
                callback: Box::new(callback),
            },
        );
        Ok(token)
    }

    pub fn remove_io(&mut self, token: Token) -> Option<Io> {
        let mut reg = self.ios.remove(&token)?;
        if let Some(base) = reg.io.base_pollable() {
            let _ = base.deregister(&self.selector);
        }
        reg.io.destroy();
        Some(reg.io)
    }

    pub fn timer_add(&mut self, callback: impl FnMut(&mut EventLoop) + 'static) -> TimerId {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        self.timers.insert(id, (Timer::new(), Box::new(callback)));
        TimerId(id)
    }

    pub fn timer_set_mode(&mut self, id: TimerId, mode: TimerMode) {
        if let Some((timer, _)) = self.timers.get_mut(&id.0) {
            timer.mode = mode;
        }
    }

    pub fn timer_set_firecount(&mut self, id: TimerId, limit: usize) {
        if let Some((timer, _)) = self.timers.get_mut(&id.0) {
            timer.fire_count_limit = Some(limit);
        }
    }

    pub fn timer_set_autoremove(&mut self, id: TimerId, enabled: bool) {
        if let Some((timer, _)) = self.timers.get_mut(&id.0) {
            timer.autoremove = enabled;
        }
    }

    pub fn timer_start(&mut self, id: TimerId, interval: Duration) -> bool {
        match self.timers.get_mut(&id.0) {
            Some((timer, _)) => {
                timer.start(interval, Instant::now());
                true
            }
            None => false,
        }
    }

    pub fn timer_stop(&mut self, id: TimerId) -> bool {
        match self.timers.get_mut(&id.0) {
            Some((timer, _)) => {
                timer.stop();
                true
            }
            None => false,
        }
    }

    pub fn timer_remove(&mut self, id: TimerId) -> bool {
        self.removed_timers.insert(id.0);
        self.timers.remove(&id.0).is_some()
    }

    pub fn timer_oneshot(
        &mut self,
        interval: Duration,
        autoremove: bool,
        callback: impl FnMut(&mut EventLoop) + 'static,
    ) -> TimerId {
        let id = self.timer_add(callback);
        self.timer_set_firecount(id, 1);
        self.timer_set_autoremove(id, autoremove);
        self.timer_start(id, interval);
        id
    }

    pub fn trigger_add(&mut self, callback: impl FnMut(&mut EventLoop) + 'static) -> TriggerId {
        let id = self.next_trigger_id;
        self.next_trigger_id += 1;
        self.triggers.insert(id, (TriggerState::new(), Box::new(callback)));
        TriggerId(id)
    }

    pub fn trigger_remove(&mut self, id: TriggerId) {
        self.removed_triggers.insert(id.0);
        self.triggers.remove(&id.0);
    }

    /// Signal a trigger, waking a loop blocked in `select` on another
    /// thread.
    pub fn trigger_signal(&mut self, id: TriggerId) {
        if let Some((state, _)) = self.triggers.get_mut(&id.0) {
            state.signal();
            let _ = self.waker.wake();
        }
    }

    pub fn queue_task(&mut self, task: impl FnOnce(&mut EventLoop) + 'static) {
        self.queued_tasks.push_back(Box::new(task));
        let _ = self.waker.wake();
    }

    /// Tell the loop to stop after the current turn, as `M_event_done`.
    pub fn done(&mut self) {
        self.pending_exit = Some(LoopExit::Done);
    }

    /// Tell the loop to stop after the current turn, distinguished from
    /// [`EventLoop::done`] only in the `LoopExit` reported back to the
    /// caller of `run`.
    pub fn exit_return(&mut self) {
        self.pending_exit = Some(LoopExit::Return);
    }

    pub fn status(&self) -> LoopStatus {
        self.status
    }

    pub fn num_objects(&self) -> usize {
        self.ios.len() + self.timers.values().filter(|(t, _)| t.running).count()
    }

    fn nothing_left(&self) -> bool {
        if !self.ios.is_empty() {
            return false;
        }
        if self.flags.exit_on_empty_no_timers {
            return true;
        }
        !self.timers.values().any(|(t, _)| t.running)
    }

    fn next_timeout(&self) -> Option<Duration> {
        let now = Instant::now();
        self.timers
            .values()
            .filter(|(t, _)| t.running)
            .filter_map(|(t, _)| t.remaining_ms(now))
            .min()
            .map(Duration::from_millis)
    }

    /// Run until the loop is told to stop, or `timeout` elapses with
    /// nothing to report. `None` blocks indefinitely (modulo
    /// `exit_on_empty`).
    pub fn run(&mut self, timeout: Option<Duration>) -> IoResult<LoopExit> {
        self.status = LoopStatus::Running;
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if let Some(exit) = self.pending_exit.take() {
                self.status = LoopStatus::Done;
                return Ok(exit);
            }
            if self.flags.exit_on_empty && self.nothing_left() {
                self.status = LoopStatus::Done;
                return Ok(LoopExit::Done);
            }
            if let Some(dl) = deadline {
                if Instant::now() >= dl {
                    self.status = LoopStatus::Paused;
                    return Ok(LoopExit::Timeout);
                }
            }

            let turn_timeout = self.turn_timeout(deadline);
            self.turn(turn_timeout)?;
        }
    }

    fn turn_timeout(&self, deadline: Option<Instant>) -> Option<Duration> {
        let timer_to = self.next_timeout();
        let deadline_to = deadline.map(|dl| dl.saturating_duration_since(Instant::now()));
        match (timer_to, deadline_to) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => {
                if self.flags.no_wake && self.timers.is_empty() && self.triggers.is_empty() {
                    None
                } else {
                    Some(Duration::from_millis(250))
                }
            }
        }
    }

    /// One full dispatch turn (§4.1, steps 1-8): poll, dispatch hard
    /// events, drain soft events, fire due timers, run queued tasks,
    /// deliver trigger signals.
    fn turn(&mut self, timeout: Option<Duration>) -> IoResult<()> {
        sys::select(&self.selector, &mut self.events_buf, timeout)?;

        let mut ready_tokens = Vec::new();
        for ev in self.events_buf.iter() {
            if ev.token == self.waker_token {
                self.waker.reset();
                continue;
            }
            ready_tokens.push((ev.token, event_type_for(ev)));
        }

        for (token, event_type) in ready_tokens {
            self.dispatch_io_event(token, event_type);
        }

        // Soft-events may have been queued by the hard-event dispatch
        // above; drain them in the same turn, in registration order.
        let tokens: Vec<Token> = self.ios.keys().copied().collect();
        for token in tokens {
            self.dispatch_soft_events(token);
        }

        self.run_timers();
        self.run_queued_tasks();
        self.run_triggers();

        Ok(())
    }

    fn dispatch_io_event(&mut self, token: Token, event_type: EventType) {
        let mut reg = match self.ios.remove(&token) {
            Some(r) => r,
            None => return,
        };
        trace!("dispatch hard event {:?} on token {:?}", event_type, token);
        if let Some(delivered) = reg.io.dispatch_hard_event(event_type) {
            (reg.callback)(self, delivered, &mut reg.io);
        }
        if !self.ios.contains_key(&token) {
            self.ios.insert(token, reg);
        }
    }

    fn dispatch_soft_events(&mut self, token: Token) {
        let mut reg = match self.ios.remove(&token) {
            Some(r) => r,
            None => return,
        };
        let mut events = reg.io.dispatch_soft_events();
        events.sort_by_key(|e| e.priority());
        for event_type in events {
            (reg.callback)(self, event_type, &mut reg.io);
        }
        if !self.ios.contains_key(&token) {
            self.ios.insert(token, reg);
        }
    }

    /// Fire every timer due as of `now`, looping per timer so one that
    /// fell behind schedule (a slow turn, a long callback) catches up on
    /// all its accumulated occurrences within this single turn instead of
    /// one per `run()` iteration. `Timer::poll` itself enforces
    /// `fire_count_limit`/`end_at`, so this loop always terminates.
    fn run_timers(&mut self) {
        let now = Instant::now();
        let ids: Vec<u64> = self.timers.keys().copied().collect();
        for id in ids {
            loop {
                let due = match self.timers.get_mut(&id) {
                    Some((timer, _)) => timer.poll(now),
                    None => false,
                };
                if !due {
                    break;
                }
                let (timer, mut callback) = match self.timers.remove(&id) {
                    Some(entry) => entry,
                    None => break,
                };
                let drop_after_call = timer.autoremove && !timer.running;
                debug!("firing timer {}", id);
                callback(self);
                if self.removed_timers.remove(&id) {
                    break;
                }
                if drop_after_call {
                    break;
                }
                self.timers.insert(id, (timer, callback));
            }
        }
    }

    fn run_queued_tasks(&mut self) {
        let tasks: Vec<_> = self.queued_tasks.drain(..).collect();
        for task in tasks {
            task(self);
        }
    }

    fn run_triggers(&mut self) {
        let fired: Vec<u64> = self
            .triggers
            .iter_mut()
            .filter_map(|(id, (state, _))| state.take().then_some(*id))
            .collect();
        for id in fired {
            let (_, mut callback) = match self.triggers.remove(&id) {
                Some(entry) => entry,
                None => continue,
            };
            callback(self);
            if self.removed_triggers.remove(&id) {
                continue;
            }
            self.triggers.insert(id, (TriggerState::new(), callback));
        }
    }
}

fn event_type_for(ev: &sys::Event) -> EventType {
    if ev.error || ev.hup {
        EventType::Error
    } else if ev.readable {
        EventType::Read
    } else if ev.writable {
        EventType::Write
    } else {
        EventType::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_relative_schedules_from_actual_fire() {
        let mut timer = Timer::new();
        let start = Instant::now();
        timer.start(Duration::from_millis(10), start);
        assert!(!timer.poll(start));
        let fired_at = start + Duration::from_millis(15);
        assert!(timer.poll(fired_at));
        assert_eq!(timer.next_fire, Some(fired_at + Duration::from_millis(10)));
    }

    #[test]
    fn timer_monotonic_schedules_from_original_slot() {
        let mut timer = Timer::new();
        timer.mode = TimerMode::Monotonic;
        let start = Instant::now();
        timer.start(Duration::from_millis(10), start);
        let due = start + Duration::from_millis(10);
        let fired_late = due + Duration::from_millis(25);
        assert!(timer.poll(fired_late));
        // Next slot is computed from the *scheduled* time, not `fired_late`,
        // so a delayed loop catches back up instead of drifting forever.
        assert_eq!(timer.next_fire, Some(due + Duration::from_millis(10)));
    }

    #[test]
    fn firecount_limit_stops_timer() {
        let mut timer = Timer::new();
        timer.fire_count_limit = Some(1);
        let start = Instant::now();
        timer.start(Duration::from_millis(5), start);
        assert!(timer.poll(start + Duration::from_millis(5)));
        assert!(!timer.running);
    }
}
