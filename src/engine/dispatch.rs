//! Per-delivery state machine.
//!
//! decode envelope -> claim (`Processing`) -> call worker -> reconcile ->
//! final status. Every path ends in a [`Disposition`]; the control plane
//! decides ack vs. redelivery from that tag alone.

use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use serde_json::Value;
use tracing::{Instrument, Span, error, info, warn};

use crate::error::Error;
use crate::model::{Task, TaskId, TaskPayload, TaskStatus, WorkerRequest, WorkerResponse};
use crate::queue::{Delivery, TaskEnvelope};
use crate::reconcile::{ReconcileConfig, Reconciler, StoryboardCommit};
use crate::store::{StatusUpdate, Store};
use crate::telemetry::metrics;
use crate::telemetry::task::{record_claim, record_state_transition, start_task_span};
use crate::worker::WorkerClient;

/// How a delivery ended, from the queue's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Done. Includes duplicate deliveries of already-final tasks.
    Completed,
    /// Worth redelivering: the worker could not be reached or the store
    /// write failed.
    RetryableFailure { task_id: TaskId, error: String },
    /// Final answer. Redelivering would produce the same outcome.
    TerminalFailure { error: String },
}

impl Disposition {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Disposition::RetryableFailure { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Disposition::Completed => "completed",
            Disposition::RetryableFailure { .. } => "retryable",
            Disposition::TerminalFailure { .. } => "terminal",
        }
    }
}

pub struct Dispatcher {
    store: Arc<dyn Store>,
    worker: Arc<dyn WorkerClient>,
    reconciler: Reconciler,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        worker: Arc<dyn WorkerClient>,
        reconcile: ReconcileConfig,
    ) -> Self {
        let reconciler = Reconciler::new(Arc::clone(&store), reconcile);
        Self {
            store,
            worker,
            reconciler,
        }
    }

    /// Handle one delivery end to end.
    pub async fn handle(&self, delivery: &Delivery) -> Disposition {
        let envelope = match TaskEnvelope::decode(&delivery.payload) {
            Ok(env) => env,
            Err(e) => {
                error!(msg_id = delivery.msg_id, error = %e, "dropping undecodable delivery");
                return Disposition::TerminalFailure {
                    error: e.to_string(),
                };
            }
        };

        let span = start_task_span(&envelope.task_id, delivery.msg_id);
        self.handle_task(envelope.task_id, &span)
            .instrument(span.clone())
            .await
    }

    async fn handle_task(&self, task_id: TaskId, span: &Span) -> Disposition {
        let task = match self.store.claim_task(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                info!(task_id = %task_id, "task already final, skipping duplicate delivery");
                return Disposition::Completed;
            }
            Err(Error::NotFound(what)) => {
                error!(task_id = %task_id, "{what} not found, dropping delivery");
                return Disposition::TerminalFailure {
                    error: format!("{what} not found"),
                };
            }
            Err(Error::InvalidParams(msg)) => {
                return self.fail_undecodable(task_id, msg).await;
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "failed to load task");
                return Disposition::RetryableFailure {
                    task_id,
                    error: e.to_string(),
                };
            }
        };
        record_claim(span, task.task_type().as_str(), task.attempts);
        info!(task_id = %task.id, task_type = %task.task_type(), attempt = task.attempts, "processing task");

        let request = match WorkerRequest::for_task(&task) {
            Ok(req) => req,
            Err(e) => {
                return self
                    .fail(span, &task, None, format!("cannot build worker request: {e}"))
                    .await;
            }
        };

        let started = Instant::now();
        let response = self.worker.call(&request).await;
        metrics::operation_duration_ms().record(
            started.elapsed().as_millis() as f64,
            &[KeyValue::new("operation", "worker.call")],
        );

        let response = match response {
            Ok(resp) => resp,
            Err(e) => {
                self.count_call(&task, "transport_error");
                warn!(task_id = %task.id, error = %e, "worker call failed");
                return self.fail_retryable(span, &task, format!("worker connection error: {e}")).await;
            }
        };

        if !response.is_success() {
            self.count_call(&task, "failed");
            let message = response.failure_message();
            warn!(task_id = %task.id, error = %message, "worker rejected task");
            return self.fail(span, &task, None, message).await;
        }
        self.count_call(&task, "success");

        self.reconcile(span, &task, response).await
    }

    async fn reconcile(&self, span: &Span, task: &Task, response: WorkerResponse) -> Disposition {
        let result = response.result;
        match &task.payload {
            TaskPayload::ShotGeneration { shot_id, .. } => {
                if let Err(e) = self.reconciler.reconcile_shot(*shot_id, result.as_ref()).await {
                    error!(task_id = %task.id, error = %e, "shot reconciliation failed");
                    return self.fail(span, task, result, e.to_string()).await;
                }
                let update = StatusUpdate::new(TaskStatus::Success)
                    .result(result)
                    .when_in_flight();
                self.finish(span, task, update).await
            }
            TaskPayload::Storyboard(_) => {
                let outcome = self
                    .reconciler
                    .reconcile_storyboard(task.id, task.project_id, result.as_ref())
                    .await;
                match outcome {
                    Ok(StoryboardCommit::Committed { shots_created }) => {
                        record_state_transition(span, TaskStatus::Processing, TaskStatus::Success);
                        info!(task_id = %task.id, shots_created, "task completed successfully");
                        Disposition::Completed
                    }
                    Ok(StoryboardCommit::Stale) => Disposition::Completed,
                    Err(e) => {
                        error!(task_id = %task.id, error = %e, "storyboard reconciliation failed");
                        self.fail(span, task, result, format!("failed to create shots: {e}"))
                            .await
                    }
                }
            }
        }
    }

    /// Terminal failure. `result` is kept for diagnosis when the worker did
    /// answer.
    async fn fail(&self, span: &Span, task: &Task, result: Option<Value>, error: String) -> Disposition {
        let update = StatusUpdate::new(TaskStatus::Failed)
            .result(result)
            .error(error.clone())
            .when_in_flight();
        match self.write_final(span, task, update).await {
            Ok(true) => Disposition::TerminalFailure { error },
            Ok(false) => Disposition::Completed,
            Err(retry) => retry,
        }
    }

    /// Transport failure: recorded on the task, left open for redelivery.
    async fn fail_retryable(&self, span: &Span, task: &Task, error: String) -> Disposition {
        let update = StatusUpdate::new(TaskStatus::Failed)
            .error(error.clone())
            .retryable()
            .when_in_flight();
        match self.write_final(span, task, update).await {
            Ok(true) => Disposition::RetryableFailure {
                task_id: task.id,
                error,
            },
            Ok(false) => Disposition::Completed,
            Err(retry) => retry,
        }
    }

    async fn finish(&self, span: &Span, task: &Task, update: StatusUpdate) -> Disposition {
        match self.write_final(span, task, update).await {
            Ok(_) => Disposition::Completed,
            Err(retry) => retry,
        }
    }

    /// Apply a final status write guarded on the task still being in flight.
    /// A retryable failure recorded meanwhile by another delivery of the same
    /// message is overwritten, so a late worker answer is never lost.
    /// `Ok(false)` means another delivery already settled the task. A store
    /// error leaves the task as it was and asks for redelivery.
    async fn write_final(&self, span: &Span, task: &Task, update: StatusUpdate) -> Result<bool, Disposition> {
        let to = update.status;
        match self.store.update_status(task.id, update).await {
            Ok(true) => {
                record_state_transition(span, TaskStatus::Processing, to);
                if to == TaskStatus::Success {
                    info!(task_id = %task.id, "task completed successfully");
                }
                Ok(true)
            }
            Ok(false) => {
                warn!(task_id = %task.id, to = %to, "task already settled, status write skipped");
                Ok(false)
            }
            Err(e) => {
                error!(task_id = %task.id, to = %to, error = %e, "failed to write task status");
                Err(Disposition::RetryableFailure {
                    task_id: task.id,
                    error: e.to_string(),
                })
            }
        }
    }

    /// The claimed row cannot be decoded into a task. Redelivery would hit the
    /// same row, so fail it with a status-only write and drop the message.
    async fn fail_undecodable(&self, task_id: TaskId, msg: String) -> Disposition {
        error!(task_id = %task_id, error = %msg, "stored task is invalid, failing it");
        let error = format!("invalid stored task: {msg}");
        let update = StatusUpdate::new(TaskStatus::Failed)
            .error(error.clone())
            .when(TaskStatus::Processing);
        if let Err(e) = self.store.update_status(task_id, update).await {
            error!(task_id = %task_id, error = %e, "failed to write task status");
            return Disposition::RetryableFailure {
                task_id,
                error: e.to_string(),
            };
        }
        Disposition::TerminalFailure { error }
    }

    /// Close out a task whose deliveries have been exhausted. Status-only, so
    /// it works even when the stored parameters no longer decode.
    pub async fn abandon(&self, task_id: TaskId, reason: &str) {
        let in_flight = StatusUpdate::new(TaskStatus::Failed).error(reason).when_in_flight();
        let applied = match self.store.update_status(task_id, in_flight).await {
            // Never claimed: the store failed on every delivery.
            Ok(false) => {
                let pending = StatusUpdate::new(TaskStatus::Failed)
                    .error(reason)
                    .when(TaskStatus::Pending);
                self.store.update_status(task_id, pending).await
            }
            other => other,
        };
        match applied {
            Ok(true) => warn!(task_id = %task_id, reason, "task abandoned"),
            Ok(false) => {}
            Err(e) => error!(task_id = %task_id, error = %e, "failed to abandon task"),
        }
    }

    fn count_call(&self, task: &Task, outcome: &'static str) {
        metrics::worker_calls().add(
            1,
            &[
                KeyValue::new("task_type", task.task_type().as_str()),
                KeyValue::new("outcome", outcome),
            ],
        );
    }
}
