//! Wire contract with the external generation worker.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Task, TaskId, TaskType};
use crate::error::Result;

/// Body POSTed to the worker for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub task_id: TaskId,
    pub task_type: TaskType,
    /// Task parameters plus the normalized `prompt`.
    pub payload: Map<String, Value>,
}

impl WorkerRequest {
    pub fn for_task(task: &Task) -> Result<Self> {
        Ok(Self {
            task_id: task.id,
            task_type: task.task_type(),
            payload: task.payload.worker_payload()?,
        })
    }
}

/// The worker's answer. A `failed` status is a business answer, not a
/// transport error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub status: WorkerStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl WorkerResponse {
    pub fn is_success(&self) -> bool {
        self.status == WorkerStatus::Success
    }

    /// Failure message to record on the task.
    pub fn failure_message(&self) -> String {
        match self.error.as_deref() {
            Some(msg) if !msg.is_empty() => msg.to_string(),
            _ => format!("worker reported status '{}' without an error message", self.status),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Success,
    Failed,
    /// Anything else the worker sends. Treated as a logical failure.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStatus::Success => "success",
            WorkerStatus::Failed => "failed",
            WorkerStatus::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}
