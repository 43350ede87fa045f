/*
 * Explicit debounce timers. A `Debouncer` holds at most one pending deadline and
 * is polled with the current time by the session's `tick`. Nothing fires on its
 * own, which keeps firing semantics deterministic and testable:
 *
 * - `schedule` is cancel-and-reschedule: every call pushes the deadline to
 *   `now + quiet_period`, so a burst of events yields a single firing one quiet
 *   period after the last event.
 * - `schedule_if_idle` only arms the timer when nothing is pending, so a steady
 *   stream of events still fires one quiet period after the first of them.
 */
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Debouncer {
    quiet_period: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(quiet_period: Duration) -> Self {
        Debouncer {
            quiet_period,
            deadline: None,
        }
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    pub fn schedule(&mut self, now: Instant) {
        self.deadline = Some(now + self.quiet_period);
    }

    pub fn schedule_if_idle(&mut self, now: Instant) {
        if self.deadline.is_none() {
            self.deadline = Some(now + self.quiet_period);
        }
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /*
     * Returns true exactly once per armed deadline, when `now` has reached it.
     * The timer is disarmed as it fires.
     */
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}
