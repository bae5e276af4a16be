//! Metrics for pipeline observability
//!
//! OpenTelemetry instruments for:
//! - REST operations against the remote controller
//! - Retry queue traffic, abandoned work and fatal shutdowns
//! - Status write-back
//! - Full sync passes and queue handler failures

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for lbsync metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("lbsync"));

/// Counter of REST operations issued to the remote controller
///
/// Labels:
/// - `method`: POST, PUT, DELETE
/// - `kind`: remote object kind
/// - `result`: success, error, aborted, skipped
pub static REST_OPERATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("lbsync_rest_operations_total")
        .with_description("Total number of REST operations by method, kind and result")
        .with_unit("{operations}")
        .build()
});

/// Counter of keys handed to a retry queue
///
/// Labels:
/// - `queue`: fast, slow
pub static RETRY_ENQUEUED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("lbsync_retry_enqueued_total")
        .with_description("Total number of models scheduled for retry")
        .with_unit("{models}")
        .build()
});

/// Counter of models abandoned after exhausting the retry cap
pub static RETRY_ABANDONED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("lbsync_retry_abandoned_total")
        .with_description("Total number of models abandoned after the retry cap")
        .with_unit("{models}")
        .build()
});

/// Counter of fatal shutdowns
///
/// Labels:
/// - `source`: rest, bootstrap
pub static FATAL_SHUTDOWNS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("lbsync_fatal_shutdowns_total")
        .with_description("Total number of fatal shutdowns by source")
        .with_unit("{shutdowns}")
        .build()
});

/// Counter of status writes
///
/// Labels:
/// - `result`: written, unchanged, error
pub static STATUS_WRITES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("lbsync_status_writes_total")
        .with_description("Total number of status updates by result")
        .with_unit("{writes}")
        .build()
});

/// Histogram of full sync duration
pub static FULL_SYNC_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("lbsync_full_sync_duration_seconds")
        .with_description("Duration of full sync passes in seconds")
        .with_unit("s")
        .build()
});

/// Counter of queue handler failures
///
/// Labels:
/// - `queue`: queue name
/// - `reason`: error, panic
pub static QUEUE_FAILURES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("lbsync_queue_failures_total")
        .with_description("Total number of queue items whose handler failed")
        .with_unit("{items}")
        .build()
});

/// Record one REST operation
pub fn record_rest_op(method: &str, kind: &str, result: &'static str) {
    REST_OPERATIONS.add(
        1,
        &[
            KeyValue::new("method", method.to_string()),
            KeyValue::new("kind", kind.to_string()),
            KeyValue::new("result", result),
        ],
    );
}

/// Record a retry enqueue on the named queue
pub fn record_retry(queue: &'static str) {
    RETRY_ENQUEUED.add(1, &[KeyValue::new("queue", queue)]);
}

/// Record an abandoned model
pub fn record_abandoned() {
    RETRY_ABANDONED.add(1, &[]);
}

/// Record a fatal shutdown
pub fn record_fatal_shutdown(source: &'static str) {
    FATAL_SHUTDOWNS.add(1, &[KeyValue::new("source", source)]);
}

/// Record a status write outcome
pub fn record_status_write(result: &'static str) {
    STATUS_WRITES.add(1, &[KeyValue::new("result", result)]);
}

/// Record a queue handler failure
pub fn record_queue_failure(queue: &str, reason: &'static str) {
    QUEUE_FAILURES.add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("reason", reason),
        ],
    );
}
