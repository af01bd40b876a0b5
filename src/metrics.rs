// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the batch sync engine.
//!
//! Uses the `metrics` crate facade; the host picks the exporter
//! (Prometheus, OTEL, ...). Without an installed recorder every call is a no-op.
//!
//! # Metric Naming Convention
//! - `batch_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `operation`: cancel, set_attendance, adjust_counter, apply
//! - `outcome`: succeeded, failed, skipped, success, rejected, ...

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::coordinator::Summary;

/// Per-item outcomes of one `apply`
pub fn record_outcomes(operation: &str, summary: &Summary) {
    for (outcome, count) in [
        ("succeeded", summary.succeeded),
        ("failed", summary.failed),
        ("skipped", summary.skipped),
    ] {
        if count > 0 {
            counter!(
                "batch_sync_item_outcomes_total",
                "operation" => operation.to_string(),
                "outcome" => outcome
            )
            .increment(count as u64);
        }
    }
}

pub fn record_batch_size(count: usize) {
    histogram!("batch_sync_batch_size").record(count as f64);
}

pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "batch_sync_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// One settled SoR chunk
pub fn record_chunk(direction: &str, outcome: &str) {
    counter!(
        "batch_sync_sor_chunks_total",
        "direction" => direction.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// A chunk gave up while still throttled
pub fn record_rate_limit_exhausted() {
    counter!("batch_sync_sor_rate_limit_exhausted_total").increment(1);
}

pub fn record_counter_clamp(backend: &str) {
    counter!(
        "batch_sync_counter_clamps_total",
        "backend" => backend.to_string()
    )
    .increment(1);
}

pub fn record_mirror_write_failure() {
    counter!("batch_sync_mirror_write_failures_total").increment(1);
}

/// `mode`: sync or deferred
pub fn record_invalidation(mode: &str, patterns: usize) {
    counter!(
        "batch_sync_invalidation_patterns_total",
        "mode" => mode.to_string()
    )
    .increment(patterns as u64);
}

pub fn record_notification(outcome: &str, attempts: usize) {
    counter!(
        "batch_sync_notifications_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("batch_sync_notification_attempts").record(attempts as f64);
}

pub fn record_sweep(checked: usize, corrected: usize) {
    counter!("batch_sync_sweep_checked_total").increment(checked as u64);
    counter!("batch_sync_sweep_corrected_total").increment(corrected as u64);
}

pub fn record_background_task(task: &str, outcome: &str) {
    counter!(
        "batch_sync_background_tasks_total",
        "task" => task.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn set_background_tasks(in_flight: usize) {
    gauge!("batch_sync_background_tasks_in_flight").set(in_flight as f64);
}

/// Record circuit breaker call outcome
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "batch_sync_circuit_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}

/// Convenience macro for timing operations
#[macro_export]
macro_rules! time_operation {
    ($op:expr) => {
        $crate::metrics::LatencyTimer::new($op)
    };
}
