//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Per-series replication throughput
//! - Backfill activity and sizes
//! - Worker restarts
//! - Pool dials and topology polls
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `sync_` and follow Prometheus
//! conventions: counters end in `_total`, gauges represent current state,
//! histograms track distributions.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record live records forwarded to a replica.
pub fn record_live_records(series: &str, replica: &str, count: usize) {
    counter!("sync_live_records_total", "series" => series.to_string(), "replica" => replica.to_string())
        .increment(count as u64);
}

/// Record live records buffered while a backfill runs.
pub fn record_buffered_records(series: &str, replica: &str, count: usize) {
    counter!("sync_buffered_records_total", "series" => series.to_string(), "replica" => replica.to_string())
        .increment(count as u64);
}

/// Record records copied by a range migration.
pub fn record_migrated_records(series: &str, replica: &str, count: usize) {
    counter!("sync_migrated_records_total", "series" => series.to_string(), "replica" => replica.to_string())
        .increment(count as u64);
}

/// Record a completed backfill and its duration.
pub fn record_backfill(series: &str, replica: &str, duration: Duration) {
    counter!("sync_backfills_total", "series" => series.to_string(), "replica" => replica.to_string())
        .increment(1);
    histogram!("sync_backfill_duration_seconds", "series" => series.to_string())
        .record(duration.as_secs_f64());
}

/// Record a worker round ending in error (the loop restarts after 1s).
pub fn record_worker_restart(series: &str) {
    counter!("sync_worker_restarts_total", "series" => series.to_string()).increment(1);
}

/// Record a pool dial attempt.
pub fn record_dial(host: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("sync_dials_total", "host" => host.to_string(), "status" => status).increment(1);
}

/// Set the number of series currently under synchronization.
pub fn set_active_series(count: usize) {
    gauge!("sync_active_series").set(count as f64);
}

/// Record a topology poll outcome.
pub fn record_topology_poll(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("sync_topology_polls_total", "status" => status).increment(1);
}

/// Record a registry propagation outcome on the destination.
pub fn record_registry_create(series: &str, outcome: &str) {
    counter!("sync_registry_creates_total", "series" => series.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

/// Record the destination cursor for a series-replica pair, in seconds.
pub fn set_destination_cursor(series: &str, replica: &str, seconds: f64) {
    gauge!("sync_destination_cursor_seconds", "series" => series.to_string(), "replica" => replica.to_string())
        .set(seconds);
}
