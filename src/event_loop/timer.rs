//! Timers (`M_event_timer_*`): periodic or one-shot callbacks scheduled
//! against the event loop's own clock rather than OS readiness.

use std::time::{Duration, Instant};

/// How a timer's next fire time is computed after it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    /// The next interval is measured from when the timer actually last
    /// fired -- a slow loop turn pushes every subsequent fire back.
    Relative,
    /// The next interval is measured from when the timer was *scheduled*
    /// to fire, even if the loop was too busy to run it on time. A timer
    /// that falls behind catches up by firing on consecutive turns until
    /// its schedule is current again.
    Monotonic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub(crate) u64);

pub(crate) struct Timer {
    pub(crate) interval: Duration,
    pub(crate) mode: TimerMode,
    pub(crate) next_fire: Option<Instant>,
    pub(crate) end_at: Option<Instant>,
    pub(crate) fire_count: usize,
    pub(crate) fire_count_limit: Option<usize>,
    pub(crate) autoremove: bool,
    pub(crate) running: bool,
}

impl Timer {
    pub(crate) fn new() -> Self {
        Timer {
            interval: Duration::from_millis(0),
            mode: TimerMode::Relative,
            next_fire: None,
            end_at: None,
            fire_count: 0,
            fire_count_limit: None,
            autoremove: false,
            running: false,
        }
    }

    pub(crate) fn start(&mut self, interval: Duration, now: Instant) {
        self.interval = interval;
        self.next_fire = Some(now + interval);
        self.running = true;
    }

    pub(crate) fn stop(&mut self) {
        self.running = false;
        self.next_fire = None;
    }

    /// Returns `true` if it is time to fire, and advances the schedule.
    pub(crate) fn poll(&mut self, now: Instant) -> bool {
        if !self.running {
            return false;
        }
        if let Some(end) = self.end_at {
            if now >= end {
                self.stop();
                return false;
            }
        }
        let due = match self.next_fire {
            Some(t) => t,
            None => return false,
        };
        if now < due {
            return false;
        }

        self.fire_count += 1;
        match self.mode {
            TimerMode::Relative => self.next_fire = Some(now + self.interval),
            TimerMode::Monotonic => self.next_fire = Some(due + self.interval),
        }

        if let Some(limit) = self.fire_count_limit {
            if self.fire_count >= limit {
                self.stop();
            }
        }
        true
    }

    pub(crate) fn remaining_ms(&self, now: Instant) -> Option<u64> {
        self.next_fire
            .map(|t| t.saturating_duration_since(now).as_millis() as u64)
    }
}
