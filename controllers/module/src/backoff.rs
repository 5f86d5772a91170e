//! # Fibonacci Backoff
//!
//! Requeue delays for Modules whose reconciliation keeps failing. The delay
//! grows along the Fibonacci sequence, which is gentler than doubling, and is
//! capped so a broken Module is still retried regularly.
//!
//! With a 5s minimum and 300s maximum: 5s, 5s, 10s, 15s, 25s, 40s, ... 300s.

use std::time::Duration;

/// Fibonacci backoff calculator, in seconds.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min_seconds: u64,
    prev_seconds: u64,
    current_seconds: u64,
    max_seconds: u64,
}

impl FibonacciBackoff {
    /// Create a backoff starting at `min_seconds` and capped at `max_seconds`.
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            min_seconds,
            prev_seconds: 0,
            current_seconds: min_seconds,
            max_seconds,
        }
    }

    /// Returns the current delay and advances the sequence.
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current_seconds;

        let next = self.prev_seconds.saturating_add(self.current_seconds);
        self.prev_seconds = self.current_seconds;
        self.current_seconds = std::cmp::min(next, self.max_seconds);

        Duration::from_secs(result)
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev_seconds = 0;
        self.current_seconds = self.min_seconds;
    }
}
