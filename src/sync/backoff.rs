//! Exponential backoff for connect attempts.

use crate::config::BackoffConfig;
use std::time::Duration;

/// Doubling delay, capped at `max`, with an optional attempt budget.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    failures: u32,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        let initial = Duration::from_millis(config.initial_ms.max(1));
        Self {
            next: initial,
            max: Duration::from_millis(config.max_ms).max(initial),
            failures: 0,
            max_attempts: config.max_attempts,
        }
    }

    /// Record a failed attempt and return how long to wait before the next
    /// one, or `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.max_attempts != 0 && self.failures >= self.max_attempts {
            return None;
        }
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        Some(delay)
    }

    /// Failed attempts recorded so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}
