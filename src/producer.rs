//! Task creation and enqueue.
//!
//! A task row is written first, then its identifier is handed to the queue.
//! If the queue refuses the message, the row is forced to `Failed` so no task
//! sits in `Pending` without a message that would ever deliver it.

use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::{error, info, warn};

use crate::error::Error;
use crate::model::{
    NewTask, ProjectId, ShotGenParams, ShotId, StoryboardParams, Task, TaskId, TaskStatus,
};
use crate::queue::TaskQueue;
use crate::store::{StatusUpdate, Store};
use crate::telemetry::metrics;

#[derive(Debug, thiserror::Error)]
pub enum ProduceError {
    /// Nothing was enqueued.
    #[error("failed to create task: {0}")]
    Store(#[source] Error),

    /// The task exists but was marked failed.
    #[error("failed to enqueue task {task_id}: {source}")]
    Enqueue {
        task_id: TaskId,
        #[source]
        source: Error,
    },
}

pub struct Producer {
    store: Arc<dyn Store>,
    queue: Arc<dyn TaskQueue>,
}

impl Producer {
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn TaskQueue>) -> Self {
        Self { store, queue }
    }

    /// Create one `Pending` task and enqueue exactly one message for it.
    pub async fn submit(&self, new: NewTask) -> Result<Task, ProduceError> {
        let task = Task::pending(new);
        let task_type = task.task_type();

        if let Err(e) = self.store.insert_task(&task).await {
            metrics::tasks_submitted().add(
                1,
                &[
                    KeyValue::new("task_type", task_type.as_str()),
                    KeyValue::new("result", "store_error"),
                ],
            );
            return Err(ProduceError::Store(e));
        }

        if let Err(e) = self.queue.submit(task.id).await {
            warn!(task_id = %task.id, error = %e, "enqueue failed, marking task failed");
            let update = StatusUpdate::new(TaskStatus::Failed)
                .error(format!("failed to enqueue task: {e}"))
                .when(TaskStatus::Pending);
            if let Err(comp) = self.store.update_status(task.id, update).await {
                error!(task_id = %task.id, error = %comp, "could not mark unqueued task failed");
            }
            metrics::tasks_submitted().add(
                1,
                &[
                    KeyValue::new("task_type", task_type.as_str()),
                    KeyValue::new("result", "enqueue_error"),
                ],
            );
            return Err(ProduceError::Enqueue {
                task_id: task.id,
                source: e,
            });
        }

        metrics::tasks_submitted().add(
            1,
            &[
                KeyValue::new("task_type", task_type.as_str()),
                KeyValue::new("result", "ok"),
            ],
        );
        info!(task_id = %task.id, task_type = %task_type, project_id = %task.project_id, "task queued");
        Ok(task)
    }

    /// Queue a storyboard for a project, copying its story text and style.
    pub async fn submit_storyboard(&self, project_id: ProjectId) -> Result<Task, ProduceError> {
        let project = self
            .store
            .get_project(project_id)
            .await
            .map_err(ProduceError::Store)?;
        let params = StoryboardParams::new(project.story_text, project.style);
        self.submit(NewTask::storyboard(project.id, params)).await
    }

    /// Queue a (re)generation of one shot using its current prompt and the
    /// owning project's style.
    pub async fn submit_shot_generation(&self, shot_id: ShotId) -> Result<Task, ProduceError> {
        let shot = self
            .store
            .get_shot(shot_id)
            .await
            .map_err(ProduceError::Store)?;
        let project = self
            .store
            .get_project(shot.project_id)
            .await
            .map_err(ProduceError::Store)?;
        let params = ShotGenParams::new(shot.prompt, project.style);
        self.submit(NewTask::shot_generation(project.id, shot.id, params))
            .await
    }
}
