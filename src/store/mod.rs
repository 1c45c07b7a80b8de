//! Store abstraction for tasks, shots, and projects.
//!
//! The dispatch pipeline never holds a process-wide database handle. Each
//! component receives an `Arc<dyn Store>` and only uses the operations it
//! needs. [`crate::db::Db`] is the Postgres implementation,
//! [`memory::MemoryStore`] the in-process one used by tests and local runs.

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{Project, ProjectId, Shot, ShotId, Task, TaskId, TaskStatus};

pub use memory::MemoryStore;

/// A status write, applied by [`TaskStore::update_status`].
///
/// Always sets `status`, `retryable` and refreshes `updated_at`. `result` and
/// `error` are only written when present and non-empty, so a status change
/// never erases diagnostics recorded earlier. A `Success` write clears
/// `error`. When `expected` is set, the
/// write only happens if the task is currently in that status (or, with
/// `accept_retryable`, in a retryable `Failed`).
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub retryable: bool,
    pub expected: Option<TaskStatus>,
    pub accept_retryable: bool,
}

impl StatusUpdate {
    pub fn new(status: TaskStatus) -> Self {
        Self {
            status,
            result: None,
            error: None,
            retryable: false,
            expected: None,
            accept_retryable: false,
        }
    }

    pub fn result(mut self, result: Option<Value>) -> Self {
        self.result = result.filter(|v| !is_empty_json(v));
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        let error = error.into();
        self.error = if error.is_empty() { None } else { Some(error) };
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    /// Only apply if the task is currently in `status`.
    pub fn when(mut self, status: TaskStatus) -> Self {
        self.expected = Some(status);
        self
    }

    /// Only apply while the task is still in flight: `Processing`, or a
    /// retryable `Failed` recorded by another delivery of the same message
    /// while this one was waiting on the worker.
    pub fn when_in_flight(mut self) -> Self {
        self.expected = Some(TaskStatus::Processing);
        self.accept_retryable = true;
        self
    }

    /// Does the guard admit a task currently in `status`?
    pub(crate) fn admits(&self, status: TaskStatus, retryable: bool) -> bool {
        match self.expected {
            None => true,
            Some(expected) if expected == status => true,
            Some(_) => self.accept_retryable && status == TaskStatus::Failed && retryable,
        }
    }
}

/// Reject a status write outside the task status graph.
pub(crate) fn validate_transition(from: TaskStatus, to: TaskStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Null, `{}` and `[]` count as "no result".
pub(crate) fn is_empty_json(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task.
    async fn insert_task(&self, task: &Task) -> Result<()>;

    /// Load a task. `Error::NotFound` if it does not exist.
    async fn get_task(&self, id: TaskId) -> Result<Task>;

    /// All tasks of a project, newest first.
    async fn list_tasks(&self, project_id: ProjectId) -> Result<Vec<Task>>;

    /// Atomically move a task into `Processing`, bumping `attempts` and
    /// clearing a retryable failure. Returns `None` if the task has already
    /// reached a final status.
    async fn claim_task(&self, id: TaskId) -> Result<Option<Task>>;

    /// Apply a status write. Returns false if the `expected` guard did not
    /// match, `Error::InvalidTransition` if the move is not in the status
    /// graph.
    async fn update_status(&self, id: TaskId, update: StatusUpdate) -> Result<bool>;

    /// In one transaction: insert the generated shots and mark the task
    /// `Success` with `result`, provided it is still in flight (see
    /// [`StatusUpdate::when_in_flight`]). Returns false (and writes nothing)
    /// if the task has settled.
    async fn commit_storyboard(
        &self,
        id: TaskId,
        shots: &[Shot],
        result: &Value,
        manifest_url: Option<&str>,
    ) -> Result<bool>;
}

#[async_trait]
pub trait ShotStore: Send + Sync {
    async fn insert_shot(&self, shot: &Shot) -> Result<()>;

    async fn get_shot(&self, id: ShotId) -> Result<Shot>;

    /// Shots of a project in `order`.
    async fn list_shots(&self, project_id: ProjectId) -> Result<Vec<Shot>>;

    /// Record a produced image and mark the shot completed.
    async fn set_shot_image(&self, id: ShotId, image_path: &str) -> Result<()>;
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn insert_project(&self, project: &Project) -> Result<()>;

    async fn get_project(&self, id: ProjectId) -> Result<Project>;
}

/// Everything the pipeline needs from persistence.
pub trait Store: TaskStore + ShotStore + ProjectStore {}

impl<T: TaskStore + ShotStore + ProjectStore> Store for T {}
