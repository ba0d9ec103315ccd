//! # Fibonacci Backoff
//!
//! Requeue delays for objects whose reconciliation keeps failing. The delay
//! grows along the Fibonacci sequence, more slowly than an exponential
//! backoff, so a cloud API that is briefly unavailable is not hammered and
//! a recovered one is picked up again quickly.
//!
//! Sequence with the watcher defaults: 1s, 1s, 2s, 3s, 5s, 8s, ... 60s (max).

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Fibonacci backoff calculator
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Minimum backoff, used for the first two values and on reset
    min: Duration,
    prev: Duration,
    current: Duration,
    max: Duration,
}

impl FibonacciBackoff {
    /// Create a backoff starting at `min` and capped at `max`
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            prev: Duration::ZERO,
            current: min,
            max,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        let next = self.prev.saturating_add(self.current);
        self.prev = self.current;
        self.current = next.min(self.max);
        result
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev = Duration::ZERO;
        self.current = self.min;
    }
}

/// One backoff sequence per object name.
///
/// A failure advances the object's sequence, a success forgets it.
#[derive(Debug)]
pub struct BackoffTracker {
    min: Duration,
    max: Duration,
    sequences: Mutex<HashMap<String, FibonacciBackoff>>,
}

impl BackoffTracker {
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            sequences: Mutex::new(HashMap::new()),
        }
    }

    /// Delay before retrying `name` after another failure
    pub fn next_backoff(&self, name: &str) -> Duration {
        let mut sequences = self.sequences.lock().unwrap_or_else(PoisonError::into_inner);
        sequences
            .entry(name.to_string())
            .or_insert_with(|| FibonacciBackoff::new(self.min, self.max))
            .next_backoff()
    }

    /// `name` reconciled successfully
    pub fn reset(&self, name: &str) {
        self.sequences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }
}
