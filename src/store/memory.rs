//! In-process store backed by hash maps behind a mutex.
//!
//! Mirrors the Postgres semantics closely enough to drive the whole pipeline
//! in tests: guarded status writes, atomic storyboard commits, and the
//! `(source_task_id, order)` uniqueness of generated shots.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use super::{ProjectStore, ShotStore, StatusUpdate, TaskStore, validate_transition};
use crate::error::{Error, Result};
use crate::model::{Project, ProjectId, Shot, ShotId, ShotStatus, Task, TaskId, TaskStatus};

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, Task>,
    shots: HashMap<ShotId, Shot>,
    projects: HashMap<ProjectId, Project>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Other("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: &Task) -> Result<()> {
        let mut inner = self.lock()?;
        if !inner.projects.contains_key(&task.project_id) {
            return Err(Error::NotFound(format!("project {}", task.project_id)));
        }
        if let Some(shot_id) = task.shot_id() {
            if !inner.shots.contains_key(&shot_id) {
                return Err(Error::NotFound(format!("shot {shot_id}")));
            }
        }
        inner.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Task> {
        self.lock()?
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("task {id}")))
    }

    async fn list_tasks(&self, project_id: ProjectId) -> Result<Vec<Task>> {
        let inner = self.lock()?;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.project_id == project_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    async fn claim_task(&self, id: TaskId) -> Result<Option<Task>> {
        let mut inner = self.lock()?;
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        if !task.is_claimable() {
            return Ok(None);
        }
        task.status = TaskStatus::Processing;
        task.attempts += 1;
        task.retryable = false;
        task.error = None;
        task.updated_at = Utc::now();
        Ok(Some(task.clone()))
    }

    async fn update_status(&self, id: TaskId, update: StatusUpdate) -> Result<bool> {
        let mut inner = self.lock()?;
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        if !update.admits(task.status, task.retryable) {
            return Ok(false);
        }
        // A retryable failure re-entered by a guarded write counts as still
        // processing.
        let from = match update.expected {
            Some(TaskStatus::Processing) if task.status == TaskStatus::Failed => TaskStatus::Processing,
            _ => task.status,
        };
        validate_transition(from, update.status)?;
        task.status = update.status;
        task.retryable = update.retryable;
        task.updated_at = Utc::now();
        if let Some(result) = update.result {
            task.result = Some(result);
        }
        if update.status == TaskStatus::Success {
            task.error = None;
        } else if let Some(error) = update.error {
            task.error = Some(error);
        }
        Ok(true)
    }

    async fn commit_storyboard(
        &self,
        id: TaskId,
        shots: &[Shot],
        result: &Value,
        manifest_url: Option<&str>,
    ) -> Result<bool> {
        let mut inner = self.lock()?;
        let in_flight = inner
            .tasks
            .get(&id)
            .map(Task::is_in_flight)
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        if !in_flight {
            return Ok(false);
        }

        // Check every constraint before touching anything.
        for shot in shots {
            if inner.shots.contains_key(&shot.id) {
                return Err(Error::Other(format!("duplicate shot id {}", shot.id)));
            }
            let clash = shot.source_task_id.is_some()
                && inner.shots.values().any(|existing| {
                    existing.source_task_id == shot.source_task_id && existing.order == shot.order
                });
            if clash {
                return Err(Error::Other(format!(
                    "shot order {} already generated by task {id}",
                    shot.order
                )));
            }
        }

        for shot in shots {
            inner.shots.insert(shot.id, shot.clone());
        }
        if let Some(task) = inner.tasks.get_mut(&id) {
            task.status = TaskStatus::Success;
            task.retryable = false;
            task.error = None;
            task.result = Some(result.clone());
            if let Some(url) = manifest_url {
                task.manifest_url = Some(url.to_string());
            }
            task.updated_at = Utc::now();
        }
        Ok(true)
    }
}

#[async_trait]
impl ShotStore for MemoryStore {
    async fn insert_shot(&self, shot: &Shot) -> Result<()> {
        let mut inner = self.lock()?;
        if !inner.projects.contains_key(&shot.project_id) {
            return Err(Error::NotFound(format!("project {}", shot.project_id)));
        }
        inner.shots.insert(shot.id, shot.clone());
        Ok(())
    }

    async fn get_shot(&self, id: ShotId) -> Result<Shot> {
        self.lock()?
            .shots
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("shot {id}")))
    }

    async fn list_shots(&self, project_id: ProjectId) -> Result<Vec<Shot>> {
        let inner = self.lock()?;
        let mut shots: Vec<Shot> = inner
            .shots
            .values()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect();
        shots.sort_by_key(|s| (s.order, s.created_at));
        Ok(shots)
    }

    async fn set_shot_image(&self, id: ShotId, image_path: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let shot = inner
            .shots
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("shot {id}")))?;
        shot.image_path = Some(image_path.to_string());
        shot.status = ShotStatus::Completed;
        shot.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn insert_project(&self, project: &Project) -> Result<()> {
        self.lock()?.projects.insert(project.id, project.clone());
        Ok(())
    }

    async fn get_project(&self, id: ProjectId) -> Result<Project> {
        self.lock()?
            .projects
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("project {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewProject, NewTask, StoryboardParams};
    use serde_json::json;

    async fn seeded() -> (MemoryStore, Task) {
        let store = MemoryStore::new();
        let project = Project::from(NewProject {
            title: "t".to_string(),
            story_text: "s".to_string(),
            style: "x".to_string(),
        });
        store.insert_project(&project).await.unwrap();
        let task = Task::pending(NewTask::storyboard(
            project.id,
            StoryboardParams::new("s", "x"),
        ));
        store.insert_task(&task).await.unwrap();
        (store, task)
    }

    #[tokio::test]
    async fn guarded_update_skips_on_mismatch() {
        let (store, task) = seeded().await;
        let applied = store
            .update_status(
                task.id,
                StatusUpdate::new(TaskStatus::Success).when(TaskStatus::Processing),
            )
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(store.get_task(task.id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn update_never_erases_previous_result_or_error() {
        let (store, task) = seeded().await;
        store
            .update_status(
                task.id,
                StatusUpdate::new(TaskStatus::Failed)
                    .result(Some(json!({"a": 1})))
                    .error("boom"),
            )
            .await
            .unwrap();
        store
            .update_status(task.id, StatusUpdate::new(TaskStatus::Failed).result(None))
            .await
            .unwrap();
        let task = store.get_task(task.id).await.unwrap();
        assert_eq!(task.result, Some(json!({"a": 1})));
        assert_eq!(task.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn claim_bumps_attempts_and_refuses_final_tasks() {
        let (store, task) = seeded().await;
        let claimed = store.claim_task(task.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, TaskStatus::Processing);
        assert_eq!(claimed.attempts, 1);

        store
            .update_status(task.id, StatusUpdate::new(TaskStatus::Success))
            .await
            .unwrap();
        assert!(store.claim_task(task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn final_success_cannot_be_overwritten() {
        let (store, task) = seeded().await;
        store.claim_task(task.id).await.unwrap();
        store
            .update_status(task.id, StatusUpdate::new(TaskStatus::Success))
            .await
            .unwrap();

        let err = store
            .update_status(task.id, StatusUpdate::new(TaskStatus::Failed).error("late"))
            .await;
        assert!(matches!(err, Err(Error::InvalidTransition { .. })));
        assert_eq!(store.get_task(task.id).await.unwrap().status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn in_flight_write_overrides_retryable_failure() {
        let (store, task) = seeded().await;
        store.claim_task(task.id).await.unwrap();
        store
            .update_status(
                task.id,
                StatusUpdate::new(TaskStatus::Failed)
                    .error("worker connection error")
                    .retryable()
                    .when_in_flight(),
            )
            .await
            .unwrap();

        let applied = store
            .update_status(
                task.id,
                StatusUpdate::new(TaskStatus::Success)
                    .result(Some(json!({"images": ["a.png"]})))
                    .when_in_flight(),
            )
            .await
            .unwrap();
        assert!(applied);
        let done = store.get_task(task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Success);
        assert!(!done.retryable);

        // Settled: nothing in flight any more.
        let late = store
            .update_status(
                task.id,
                StatusUpdate::new(TaskStatus::Failed)
                    .error("late")
                    .retryable()
                    .when_in_flight(),
            )
            .await
            .unwrap();
        assert!(!late);
    }

    #[tokio::test]
    async fn storyboard_commit_accepts_retryable_failure() {
        let (store, task) = seeded().await;
        store.claim_task(task.id).await.unwrap();
        store
            .update_status(
                task.id,
                StatusUpdate::new(TaskStatus::Failed).retryable().when_in_flight(),
            )
            .await
            .unwrap();

        let mut shot = Shot::authored(task.project_id, 0, "a");
        shot.source_task_id = Some(task.id);
        assert!(
            store
                .commit_storyboard(task.id, &[shot], &json!({"shots": [{}]}), None)
                .await
                .unwrap()
        );
        assert_eq!(store.get_task(task.id).await.unwrap().status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn rejected_commit_leaves_no_shots() {
        let (store, task) = seeded().await;
        store.claim_task(task.id).await.unwrap();

        let mut first = Shot::authored(task.project_id, 0, "a");
        first.source_task_id = Some(task.id);
        let mut dup = Shot::authored(task.project_id, 0, "b");
        dup.source_task_id = Some(task.id);
        store.insert_shot(&first).await.unwrap();

        let mut fresh = Shot::authored(task.project_id, 1, "c");
        fresh.source_task_id = Some(task.id);
        let result = store
            .commit_storyboard(task.id, &[fresh, dup], &json!({}), None)
            .await;
        assert!(result.is_err());
        assert_eq!(store.list_shots(task.project_id).await.unwrap().len(), 1);
        assert_eq!(store.get_task(task.id).await.unwrap().status, TaskStatus::Processing);
    }
}
