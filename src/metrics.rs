//! Metrics for observability.
//!
//! Thin wrappers over the `metrics` facade. Install any recorder (e.g. a
//! Prometheus exporter) in the binary to collect them; without one they
//! are no-ops.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `firehose_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration)

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a connect attempt to the feed.
pub fn record_connection(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("firehose_connections_total", "status" => status).increment(1);
}

/// Record a reconnect scheduled after a failure.
pub fn record_reconnect(attempt: usize, delay: Duration) {
    counter!("firehose_reconnects_total").increment(1);
    gauge!("firehose_reconnect_attempt").set(attempt as f64);
    histogram!("firehose_reconnect_delay_seconds").record(delay.as_secs_f64());
}

/// Record the stream client's state.
pub fn set_client_state(state: &str) {
    gauge!("firehose_client_state", "state" => state.to_string()).set(1.0);
}

/// Record the engine's lifecycle state.
pub fn set_engine_state(state: &str) {
    gauge!("firehose_engine_state", "state" => state.to_string()).set(1.0);
}

/// Record a raw frame read from the socket.
pub fn record_frame_received() {
    counter!("firehose_frames_received_total").increment(1);
}

/// Record a frame or envelope dropped before reaching the worker.
pub fn record_envelope_dropped(reason: &'static str) {
    counter!("firehose_envelopes_dropped_total", "reason" => reason).increment(1);
}

/// Record an envelope handed to the worker queue.
pub fn record_envelope_enqueued(collection: &str) {
    counter!("firehose_envelopes_enqueued_total", "collection" => collection.to_string()).increment(1);
}

/// Record a handled envelope and how long the handler took.
pub fn record_envelope_handled(kind: &str, outcome: &'static str, duration: Duration) {
    counter!(
        "firehose_envelopes_handled_total",
        "kind" => kind.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!("firehose_handler_duration_seconds", "kind" => kind.to_string())
        .record(duration.as_secs_f64());
}

/// Record a mirror write failure for one envelope.
pub fn record_handler_error(kind: &str, policy: &str) {
    counter!(
        "firehose_handler_errors_total",
        "kind" => kind.to_string(),
        "policy" => policy.to_string()
    )
    .increment(1);
}

/// Record the number of envelopes waiting for the worker.
pub fn set_queue_depth(depth: usize) {
    gauge!("firehose_queue_depth").set(depth as f64);
}

/// Record the cursor position and how far behind wall-clock it is.
pub fn set_cursor_position(time_us: i64) {
    gauge!("firehose_cursor_time_us").set(time_us as f64);
    let lag_us = chrono::Utc::now().timestamp_micros().saturating_sub(time_us).max(0);
    gauge!("firehose_cursor_lag_seconds").set(lag_us as f64 / 1_000_000.0);
}

/// Record cursor flush batch (debounced writes).
pub fn record_cursor_flush(flushed: usize, errors: usize) {
    counter!("firehose_cursor_flushes_total").increment(1);
    counter!("firehose_cursor_flushed_count").increment(flushed as u64);
    if errors > 0 {
        counter!("firehose_cursor_flush_errors_total").increment(errors as u64);
    }
}

/// Record SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_sqlite_retry(operation: &str) {
    counter!("firehose_sqlite_retries_total", "operation" => operation.to_string()).increment(1);
}
