//! Throughput tracker
//!
//! Keeps completion timestamps in arrival order and reports a moving
//! transfers/second rate over a trailing window.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

/// Entries are retained for this many windows before being pruned on record
const RETENTION_WINDOWS: i64 = 10;
/// Shortest window used for rate calculation
const MIN_WINDOW_MS: i64 = 1_000;

pub struct ThroughputTracker {
    window_ms: i64,
    completions: Mutex<VecDeque<i64>>,
}

impl ThroughputTracker {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms: window_ms.max(MIN_WINDOW_MS),
            completions: Mutex::new(VecDeque::new()),
        }
    }

    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    /// Record one completed transfer
    pub fn record_completion(&self, timestamp_ms: i64) {
        let mut completions = self.completions.lock().unwrap_or_else(PoisonError::into_inner);
        // Keep the deque sorted even if a caller reports slightly out of order
        let pos = completions
            .iter()
            .rposition(|&t| t <= timestamp_ms)
            .map_or(0, |p| p + 1);
        completions.insert(pos, timestamp_ms);

        let cutoff = timestamp_ms - self.window_ms * RETENTION_WINDOWS;
        while completions.front().is_some_and(|&t| t < cutoff) {
            completions.pop_front();
        }
    }

    /// Completions per second over the trailing window ending at `now_ms`
    pub fn throughput(&self, now_ms: i64) -> f64 {
        let mut completions = self.completions.lock().unwrap_or_else(PoisonError::into_inner);
        let cutoff = now_ms - self.window_ms;
        while completions.front().is_some_and(|&t| t < cutoff) {
            completions.pop_front();
        }
        completions.len() as f64 / (self.window_ms as f64 / 1000.0)
    }

    pub fn len(&self) -> usize {
        self.completions.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
