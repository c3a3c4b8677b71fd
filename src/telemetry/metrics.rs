//! Metric instrument factories for lanekeeper.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"lanekeeper"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for lanekeeper instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("lanekeeper")
}

/// Counter: work items reaching a terminal outcome.
/// Labels: `lane`, `disposition` ("succeeded" | "malformed" | "failed").
pub fn items_processed() -> Counter<u64> {
    meter()
        .u64_counter("lanekeeper.items.processed")
        .with_description("Work items reaching a terminal outcome")
        .build()
}

/// Counter: checkpoint insertions.
/// Labels: `lane`, `result` ("new" | "duplicate").
pub fn checkpoint_writes() -> Counter<u64> {
    meter()
        .u64_counter("lanekeeper.checkpoint.writes")
        .with_description("Checkpoint insertion attempts")
        .build()
}

/// Counter: queue-level operations (send, read, archive, delete).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("lanekeeper.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: rate-limiter acquisition attempts.
/// Labels: `identity`, `result` ("granted" | "denied").
pub fn rate_limit_attempts() -> Counter<u64> {
    meter()
        .u64_counter("lanekeeper.ratelimit.attempts")
        .with_description("Token bucket acquisition attempts")
        .build()
}

/// Histogram: wait time suggested to denied rate-limiter callers.
/// Labels: `identity`.
pub fn rate_limit_wait_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("lanekeeper.ratelimit.wait_ms")
        .with_description("Suggested wait for denied token requests")
        .with_unit("ms")
        .build()
}

/// Counter: lane status transitions.
/// Labels: `from`, `to`.
pub fn lane_transitions() -> Counter<u64> {
    meter()
        .u64_counter("lanekeeper.lane.transitions")
        .with_description("Lane status transitions")
        .build()
}

/// Counter: lane restarts.
/// Labels: `lane`, `trigger` ("manual" | "auto" | "throttled").
pub fn lane_restarts() -> Counter<u64> {
    meter()
        .u64_counter("lanekeeper.lane.restarts")
        .with_description("Lane restart attempts")
        .build()
}

/// Counter: individual health check failures.
/// Labels: `lane`, `check`.
pub fn health_check_failures() -> Counter<u64> {
    meter()
        .u64_counter("lanekeeper.health.failures")
        .with_description("Failed lane health checks")
        .build()
}

/// Counter: administrative operations.
/// Labels: `operation`, `result` ("ok" | "error" | "refused").
pub fn admin_operations() -> Counter<u64> {
    meter()
        .u64_counter("lanekeeper.admin.operations")
        .with_description("Administrative operations")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("lanekeeper.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
