//! Logging helpers for formatted summary output.

use std::time::{Duration, Instant};

use crate::stats::NamedStats;

/// Formats a count with thousands separators (e.g. `1,234,567`).
#[must_use]
pub fn format_count(count: u64) -> String {
    let digits = count.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i).is_multiple_of(3) {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Formats a duration in human-readable form (`45s`, `2m 15s`, `1h 30m`).
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        let mins = secs / 60;
        let rest = secs % 60;
        if rest == 0 { format!("{mins}m") } else { format!("{mins}m {rest}s") }
    } else {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        if mins == 0 { format!("{hours}h") } else { format!("{hours}h {mins}m") }
    }
}

/// Formats a processing rate (`1,234 reads/s`).
#[must_use]
pub fn format_rate(count: u64, duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs < 0.001 {
        return format!("{} reads/s", format_count(count));
    }
    let rate = count as f64 / secs;
    if rate >= 1.0 {
        format!("{} reads/s", format_count(rate as u64))
    } else {
        format!("{:.1} reads/min", count as f64 / (secs / 60.0))
    }
}

/// Log the final pipeline statistics at info level.
pub fn log_pipeline_summary(stats: &NamedStats) {
    log::info!("Pipeline summary:");
    for (key, value) in stats {
        // Queue depths are transient; only the counters matter at the end.
        if key.ends_with("_depth") {
            continue;
        }
        if (value.fract()).abs() < f64::EPSILON {
            log::info!("  {key}: {}", format_count(*value as u64));
        } else {
            log::info!("  {key}: {value:.2}");
        }
    }
}

/// Operation timing helper: logs the start on construction and a rate
/// summary on completion.
pub struct OperationTimer {
    operation: String,
    start_time: Instant,
}

impl OperationTimer {
    #[must_use]
    pub fn new(operation: &str) -> Self {
        log::info!("{operation} ...");
        Self { operation: operation.to_string(), start_time: Instant::now() }
    }

    /// Log the completion with item count and rate.
    pub fn log_completion(&self, count: u64) {
        let duration = self.start_time.elapsed();
        log::info!(
            "{} completed: {} in {} ({})",
            self.operation,
            format_count(count),
            format_duration(duration),
            format_rate(count, duration)
        );
    }
}
