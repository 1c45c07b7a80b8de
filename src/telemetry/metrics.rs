//! Metric instrument factories for storyq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an exporter configured the global provider is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("storyq")
}

/// Counter: tasks handed to the producer.
/// Labels: `task_type`, `result` ("ok" | "store_error" | "enqueue_error").
pub fn tasks_submitted() -> Counter<u64> {
    meter()
        .u64_counter("storyq.tasks.submitted")
        .with_description("Number of tasks submitted")
        .build()
}

/// Counter: task status transitions.
/// Labels: `from`, `to`.
pub fn task_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("storyq.tasks.state_transitions")
        .with_description("Number of task status transitions")
        .build()
}

/// Counter: queue-level operations (send, read, archive, set_vt).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("storyq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: worker RPC calls.
/// Labels: `task_type`, `outcome` ("success" | "failed" | "transport_error").
pub fn worker_calls() -> Counter<u64> {
    meter()
        .u64_counter("storyq.worker.calls")
        .with_description("Number of generation worker calls")
        .build()
}

/// Counter: shots created by storyboard reconciliation.
/// Labels: `task_type`.
pub fn shots_created() -> Counter<u64> {
    meter()
        .u64_counter("storyq.shots.created")
        .with_description("Number of shots created from worker results")
        .build()
}

/// Counter: how deliveries were settled.
/// Labels: `disposition` ("completed" | "retryable" | "terminal" | "dead").
pub fn deliveries() -> Counter<u64> {
    meter()
        .u64_counter("storyq.deliveries")
        .with_description("Number of settled queue deliveries")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("storyq.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
