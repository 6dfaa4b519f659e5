//! Deadline timers driven by explicit [`Instant`]s.
//!
//! Neither timer sleeps or spawns anything. The owner passes the current time
//! on every poll and asks whether a deadline passed.

use std::time::{Duration, Instant};

/// Repeating timer.
#[derive(Debug, Clone)]
pub struct Interval {
    period: Duration,
    next_fire: Option<Instant>,
}

impl Interval {
    /// Create a stopped timer firing every `period`.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next_fire: None,
        }
    }

    /// (Re)start the timer; the first tick is one period after `now`.
    pub fn start(&mut self, now: Instant) {
        self.next_fire = Some(now + self.period);
    }

    /// Stop the timer.
    pub fn stop(&mut self) {
        self.next_fire = None;
    }

    /// Whether the timer is running.
    pub fn is_active(&self) -> bool {
        self.next_fire.is_some()
    }

    /// Consume one tick if it is due at `now`.
    ///
    /// Ticks missed while the owner was not polling collapse into one.
    pub fn due(&mut self, now: Instant) -> bool {
        match self.next_fire {
            Some(at) if now >= at => {
                self.next_fire = Some(now + self.period);
                true
            },
            _ => false,
        }
    }
}

/// Single-shot timer restarted on every sign of progress.
#[derive(Debug, Clone)]
pub struct Watchdog {
    timeout: Duration,
    deadline: Option<Instant>,
}

impl Watchdog {
    /// Create a disarmed watchdog expiring `timeout` after each arm.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: None,
        }
    }

    /// Arm (or re-arm) the watchdog relative to `now`.
    pub fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + self.timeout);
    }

    /// Disarm.
    pub fn stop(&mut self) {
        self.deadline = None;
    }

    /// Whether a deadline is set.
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Check whether the deadline passed. An expired watchdog disarms itself.
    pub fn expired(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(at) if now >= at => {
                self.deadline = None;
                true
            },
            _ => false,
        }
    }
}
