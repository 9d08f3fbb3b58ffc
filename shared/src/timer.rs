//! Tick-driven timers
//!
//! Nothing here blocks. Every timer advances only when its owner calls
//! `advance`/`tick` with the elapsed time, so the authority and observers can
//! drive all of their waits from one periodic loop.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

/// A single-shot delay
#[derive(Debug, Clone)]
pub struct Timer {
    duration: Duration,
    elapsed: Duration,
    finished: bool,
}

impl Timer {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            elapsed: Duration::ZERO,
            finished: false,
        }
    }

    /// Advances the timer and returns true exactly once, on the tick that
    /// completes its duration
    pub fn advance(&mut self, dt: Duration) -> bool {
        self.advance_with_overflow(dt).is_some()
    }

    /// Like `advance`, but also returns the time left over past completion
    pub fn advance_with_overflow(&mut self, dt: Duration) -> Option<Duration> {
        if self.finished {
            return None;
        }
        self.elapsed += dt;
        if self.elapsed >= self.duration {
            self.finished = true;
            Some(self.elapsed - self.duration)
        } else {
            None
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn remaining(&self) -> Duration {
        self.duration.saturating_sub(self.elapsed)
    }

    pub fn reset(&mut self) {
        self.elapsed = Duration::ZERO;
        self.finished = false;
    }
}

/// N single-shot timers run back to back
///
/// Link `k + 1` starts only once link `k` has fully elapsed; time left over
/// from one link carries into the next.
#[derive(Debug, Clone)]
pub struct TimerChain {
    links: u32,
    completed: u32,
    current: Timer,
}

impl TimerChain {
    pub fn new(links: u32, interval: Duration) -> Self {
        Self {
            links,
            completed: 0,
            current: Timer::new(interval),
        }
    }

    /// Advances the chain, returning how many links completed during `dt`
    pub fn advance(&mut self, dt: Duration) -> u32 {
        let mut remaining = dt;
        let mut fired = 0;

        while self.completed < self.links {
            match self.current.advance_with_overflow(remaining) {
                Some(overflow) => {
                    self.completed += 1;
                    fired += 1;
                    self.current.reset();
                    remaining = overflow;
                }
                None => break,
            }
        }

        fired
    }

    pub fn completed(&self) -> u32 {
        self.completed
    }

    pub fn is_finished(&self) -> bool {
        self.completed >= self.links
    }
}

/// A timer that re-arms itself until cancelled
///
/// Cancellation is cooperative: `cancel` only sets a flag, which is checked
/// before the timer schedules its next period.
#[derive(Debug, Clone)]
pub struct RepeatingTimer {
    timer: Timer,
    cancelled: bool,
}

impl RepeatingTimer {
    pub fn new(period: Duration) -> Self {
        Self {
            timer: Timer::new(period),
            cancelled: false,
        }
    }

    /// Returns true each time a period completes
    pub fn advance(&mut self, dt: Duration) -> bool {
        if self.cancelled {
            return false;
        }
        if self.timer.advance(dt) {
            self.timer.reset();
            true
        } else {
            false
        }
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// Keyed single-shot timers with cancellation
///
/// Used for the authority's delayed actions (projectile lifespans, the
/// post-countdown spawn delay).
#[derive(Debug)]
pub struct Scheduler<K> {
    timers: HashMap<K, Timer>,
}

impl<K: Eq + Hash + Clone> Scheduler<K> {
    pub fn new() -> Self {
        Self {
            timers: HashMap::new(),
        }
    }

    /// Schedules `key` to fire after `delay`, replacing any pending timer
    /// with the same key
    pub fn schedule(&mut self, key: K, delay: Duration) {
        self.timers.insert(key, Timer::new(delay));
    }

    /// Returns true if a pending timer was removed
    pub fn cancel(&mut self, key: &K) -> bool {
        self.timers.remove(key).is_some()
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.timers.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Advances every pending timer and returns the keys that fired
    pub fn tick(&mut self, dt: Duration) -> Vec<K> {
        let mut fired = Vec::new();
        for (key, timer) in self.timers.iter_mut() {
            if timer.advance(dt) {
                fired.push(key.clone());
            }
        }
        for key in &fired {
            self.timers.remove(key);
        }
        fired
    }
}

impl<K: Eq + Hash + Clone> Default for Scheduler<K> {
    fn default() -> Self {
        Self::new()
    }
}
