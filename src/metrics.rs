//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Poll outcomes and latency per producer tablet
//! - Batch apply outcomes and applied record counts
//! - Write RPCs and transaction coordinator calls
//! - Safe time, schema gating and poller state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `xcluster_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use xcluster_consumer::metrics;
//! use std::time::Duration;
//!
//! // In the poll loop after get_changes returns
//! metrics::record_poll("tablet-1", true, Duration::from_millis(12));
//!
//! // In the output client once a batch is finalized
//! metrics::record_apply_result("tablet-1", "ok", 42);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Poller Metrics
// =============================================================================

/// Record one "get changes" call.
pub fn record_poll(producer_tablet: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "xcluster_polls_total",
        "producer_tablet" => producer_tablet.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!("xcluster_poll_duration_seconds", "producer_tablet" => producer_tablet.to_string())
        .record(duration.as_secs_f64());
}

/// Records returned by the producer.
pub fn record_records_received(producer_tablet: &str, count: usize) {
    counter!("xcluster_records_received_total", "producer_tablet" => producer_tablet.to_string())
        .increment(count as u64);
}

/// Consecutive poll failures (drives backoff).
pub fn set_poll_failures(producer_tablet: &str, failures: u32) {
    gauge!("xcluster_poll_failures", "producer_tablet" => producer_tablet.to_string())
        .set(f64::from(failures));
}

/// Consecutive apply failures.
pub fn set_apply_failures(producer_tablet: &str, failures: u32) {
    gauge!("xcluster_apply_failures", "producer_tablet" => producer_tablet.to_string())
        .set(f64::from(failures));
}

/// Record an idle poll (batch applied zero records).
pub fn record_idle_poll(producer_tablet: &str) {
    counter!("xcluster_idle_polls_total", "producer_tablet" => producer_tablet.to_string())
        .increment(1);
}

/// Safe time watermark as a raw hybrid time.
pub fn set_safe_time(producer_tablet: &str, safe_time: u64) {
    gauge!("xcluster_safe_time", "producer_tablet" => producer_tablet.to_string())
        .set(safe_time as f64);
}

/// Polling paused until the consumer schema reaches `version`.
pub fn record_schema_wait(producer_tablet: &str, version: u32) {
    counter!("xcluster_schema_waits_total", "producer_tablet" => producer_tablet.to_string())
        .increment(1);
    gauge!("xcluster_schema_wait_version", "producer_tablet" => producer_tablet.to_string())
        .set(f64::from(version));
}

/// Gauge for poller state.
pub fn set_poller_state(producer_tablet: &str, state: &str) {
    // Numeric encoding for alerting
    let value = match state {
        "Idle" => 0.0,
        "Polling" => 1.0,
        "Applying" => 2.0,
        "WaitingForSchema" => 3.0,
        "Shutdown" => 4.0,
        _ => -1.0,
    };
    gauge!("xcluster_poller_state", "producer_tablet" => producer_tablet.to_string()).set(value);
}

// =============================================================================
// Output Client Metrics
// =============================================================================

/// Record a finalized batch.
///
/// `outcome` is `"ok"` or an [`XClusterError::kind`](crate::error::XClusterError::kind) label.
pub fn record_apply_result(consumer_tablet: &str, outcome: &str, processed_records: usize) {
    counter!(
        "xcluster_apply_results_total",
        "consumer_tablet" => consumer_tablet.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    counter!("xcluster_records_applied_total", "consumer_tablet" => consumer_tablet.to_string())
        .increment(processed_records as u64);
}

/// Record a write RPC round trip.
pub fn record_write_rpc(consumer_tablet: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "xcluster_write_rpcs_total",
        "consumer_tablet" => consumer_tablet.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!("xcluster_write_rpc_duration_seconds", "consumer_tablet" => consumer_tablet.to_string())
        .record(duration.as_secs_f64());
}

/// Record one phase of external transaction updates.
pub fn record_transaction_updates(consumer_tablet: &str, phase: &str, count: usize) {
    counter!(
        "xcluster_transaction_updates_total",
        "consumer_tablet" => consumer_tablet.to_string(),
        "phase" => phase.to_string()
    )
    .increment(count as u64);
}

/// Record a forced partition cache refresh.
pub fn record_partition_refresh(table_id: &str) {
    counter!("xcluster_partition_refreshes_total", "table_id" => table_id.to_string()).increment(1);
}

/// Record a producer tablet split seen by the consumer.
pub fn record_producer_split(producer_tablet: &str) {
    counter!("xcluster_producer_splits_total", "producer_tablet" => producer_tablet.to_string())
        .increment(1);
}
