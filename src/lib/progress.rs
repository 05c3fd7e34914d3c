//! Interval-based progress logging.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::logging::format_count;

/// Thread-safe counter that logs a line each time the count crosses a
/// multiple of the interval.
pub struct ProgressTracker {
    message: String,
    interval: u64,
    count: AtomicU64,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(message: impl Into<String>, interval: u64) -> Self {
        Self { message: message.into(), interval: interval.max(1), count: AtomicU64::new(0) }
    }

    /// Add `additional` to the count, logging every interval crossed.
    pub fn add(&self, additional: u64) {
        if additional == 0 {
            return;
        }
        let prev = self.count.fetch_add(additional, Ordering::Relaxed);
        let now = prev + additional;
        for milestone in (prev / self.interval + 1)..=(now / self.interval) {
            log::info!("{} {}", self.message, format_count(milestone * self.interval));
        }
    }

    /// Log the final count unless it already landed on an interval.
    pub fn log_final(&self) {
        let count = self.count.load(Ordering::Relaxed);
        if count > 0 && !count.is_multiple_of(self.interval) {
            log::info!("{} {} (complete)", self.message, format_count(count));
        }
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}
