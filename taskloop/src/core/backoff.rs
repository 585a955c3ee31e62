//! Backoff schedule for retried units of work.

use std::time::Duration;

/// Exponential backoff settings for the retry controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            multiplier: 2,
        }
    }
}

impl BackoffPolicy {
    /// Wait before the next attempt: a classifier hint wins over the running delay.
    pub fn wait(&self, current: Duration, hint: Option<Duration>) -> Duration {
        hint.unwrap_or(current)
    }

    /// Running delay for the round after `current`.
    pub fn grow(&self, current: Duration) -> Duration {
        current.saturating_mul(self.multiplier)
    }

    /// Waits between attempts when no failure carries a hint.
    pub fn schedule(&self) -> Vec<Duration> {
        let mut delays = Vec::new();
        let mut current = self.base_delay;
        for _ in 1..self.max_attempts {
            delays.push(current);
            current = self.grow(current);
        }
        delays
    }
}
