//! Task handling span helpers.

use opentelemetry::KeyValue;
use tracing::Span;

use super::metrics;
use crate::model::{TaskId, TaskStatus};

/// Start a span covering one delivery of a task.
///
/// `task.type` and `task.attempt` are declared empty: the type is only known
/// once the task has been loaded.
pub fn start_task_span(task_id: &TaskId, msg_id: i64) -> Span {
    tracing::info_span!(
        "task.dispatch",
        "task.id" = %task_id,
        "queue.msg_id" = msg_id,
        "task.type" = tracing::field::Empty,
        "task.attempt" = tracing::field::Empty,
    )
}

/// Fill in the fields known once the task is claimed and record the move
/// into `processing`. Attempts past the first come from a redelivery.
pub fn record_claim(span: &Span, task_type: &str, attempt: u32) {
    span.record("task.type", task_type);
    span.record("task.attempt", attempt);
    let from = if attempt <= 1 { "pending" } else { "redelivered" };
    span.in_scope(|| {
        tracing::info!(from, to = "processing", attempt, "state_transition");
    });
    metrics::task_state_transitions().add(
        1,
        &[KeyValue::new("from", from), KeyValue::new("to", "processing")],
    );
}

/// Emit a transition event on `span` and count it.
pub fn record_state_transition(span: &Span, from: TaskStatus, to: TaskStatus) {
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "state_transition");
    });
    metrics::task_state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}
