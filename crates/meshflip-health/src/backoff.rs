//! Poll delay with exponential backoff.
//!
//! The delay doubles (up to a cap) each time a poll observes the same
//! unready count as the previous one, and drops back to the base
//! interval as soon as the count changes.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PollBackoff {
    base: Duration,
    max: Duration,
    current: Duration,
    last_count: Option<usize>,
}

impl PollBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
            last_count: None,
        }
    }

    /// Record an observed count and return the delay before the next poll.
    pub fn next_delay(&mut self, count: usize) -> Duration {
        if self.last_count == Some(count) {
            self.current = self.current.saturating_mul(2).min(self.max);
        } else {
            self.current = self.base;
        }
        self.last_count = Some(count);
        self.current
    }
}
