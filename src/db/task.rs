//! Task persistence: creation, claiming, guarded status writes, and the
//! storyboard commit.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::Db;
use super::shot::{insert_shot_with, missing_reference};
use crate::error::{Error, Result};
use crate::model::{ProjectId, Shot, ShotId, Task, TaskId, TaskPayload, TaskStatus};
use crate::store::{StatusUpdate, TaskStore, validate_transition};

const TASK_COLUMNS: &str = "id, project_id, task_type, shot_id, parameters, status, result, error, retryable, attempts, manifest_url, created_at, updated_at";

impl Db {
    async fn task_exists(&self, id: TaskId) -> Result<bool> {
        let row: (bool,) = sqlx::query_as("SELECT EXISTS (SELECT 1 FROM tasks WHERE id = $1)")
            .bind(id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

#[async_trait]
impl TaskStore for Db {
    async fn insert_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            "INSERT INTO tasks (id, project_id, task_type, shot_id, parameters, status, result, error, retryable, attempts, manifest_url, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(task.id.0)
        .bind(task.project_id.0)
        .bind(task.task_type().as_str())
        .bind(task.shot_id().map(|s| s.0))
        .bind(task.payload.parameters()?)
        .bind(task.status.as_str())
        .bind(&task.result)
        .bind(&task.error)
        .bind(task.retryable)
        .bind(task.attempts as i32)
        .bind(&task.manifest_url)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            missing_reference(e, || match task.shot_id() {
                Some(shot_id) => format!("project {} or shot {shot_id}", task.project_id),
                None => format!("project {}", task.project_id),
            })
        })?;
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Task> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or_else(|| Error::NotFound(format!("task {id}")))?
            .try_into_task()
    }

    async fn list_tasks(&self, project_id: ProjectId) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE project_id = $1 ORDER BY created_at DESC"
        ))
        .bind(project_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskRow::try_into_task).collect()
    }

    async fn claim_task(&self, id: TaskId) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "UPDATE tasks
             SET status = 'processing', attempts = attempts + 1, retryable = false, error = NULL, updated_at = now()
             WHERE id = $1
               AND (status IN ('pending', 'processing') OR (status = 'failed' AND retryable))
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        // The claim is already committed; a row that does not decode is
        // reported as InvalidParams so the caller can fail it by status alone.
        match row {
            Some(row) => row
                .try_into_task()
                .map(Some)
                .map_err(|e| match e {
                    Error::InvalidParams(msg) => Error::InvalidParams(format!("task {id}: {msg}")),
                    other => Error::InvalidParams(format!("task {id}: {other}")),
                }),
            None if self.task_exists(id).await? => Ok(None),
            None => Err(Error::NotFound(format!("task {id}"))),
        }
    }

    async fn update_status(&self, id: TaskId, update: StatusUpdate) -> Result<bool> {
        if let Some(from) = update.expected {
            validate_transition(from, update.status)?;
        }
        let sources: Vec<&str> = TaskStatus::sources(update.status)
            .into_iter()
            .map(TaskStatus::as_str)
            .collect();

        let rows_affected = sqlx::query(
            "UPDATE tasks
             SET status = $2, retryable = $3, result = COALESCE($4, result),
                 error = CASE WHEN $2 = 'success' THEN NULL ELSE COALESCE($5, error) END,
                 updated_at = now()
             WHERE id = $1
               AND ((status = ANY($6) AND ($7::text IS NULL OR status = $7))
                    OR ($8 AND status = 'failed' AND retryable))",
        )
        .bind(id.0)
        .bind(update.status.as_str())
        .bind(update.retryable)
        .bind(&update.result)
        .bind(&update.error)
        .bind(&sources)
        .bind(update.expected.map(TaskStatus::as_str))
        .bind(update.expected.is_some() && update.accept_retryable)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected > 0 {
            return Ok(true);
        }

        let current: Option<(String,)> = sqlx::query_as("SELECT status FROM tasks WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        match current {
            None => Err(Error::NotFound(format!("task {id}"))),
            Some(_) if update.expected.is_some() => Ok(false),
            Some((from,)) => Err(Error::InvalidTransition {
                from,
                to: update.status.to_string(),
            }),
        }
    }

    async fn commit_storyboard(
        &self,
        id: TaskId,
        shots: &[Shot],
        result: &Value,
        manifest_url: Option<&str>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(String, bool)> =
            sqlx::query_as("SELECT status, retryable FROM tasks WHERE id = $1 FOR UPDATE")
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await?;
        let (status, retryable) = row.ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        let in_flight = StatusUpdate::new(TaskStatus::Success)
            .when_in_flight()
            .admits(status.parse()?, retryable);
        if !in_flight {
            // Dropping the transaction rolls it back.
            return Ok(false);
        }

        for shot in shots {
            insert_shot_with(&mut *tx, shot).await?;
        }

        sqlx::query(
            "UPDATE tasks
             SET status = 'success', retryable = false, error = NULL, result = $2, manifest_url = COALESCE($3, manifest_url), updated_at = now()
             WHERE id = $1",
        )
        .bind(id.0)
        .bind(result)
        .bind(manifest_url)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    project_id: Uuid,
    task_type: String,
    shot_id: Option<Uuid>,
    parameters: Value,
    status: String,
    result: Option<Value>,
    error: Option<String>,
    retryable: bool,
    attempts: i32,
    manifest_url: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl TaskRow {
    fn try_into_task(self) -> Result<Task> {
        let payload =
            TaskPayload::from_parts(self.task_type.parse()?, self.shot_id.map(ShotId), self.parameters)?;
        Ok(Task {
            id: TaskId(self.id),
            project_id: ProjectId(self.project_id),
            payload,
            status: self.status.parse()?,
            result: self.result,
            error: self.error,
            retryable: self.retryable,
            attempts: self.attempts.max(0) as u32,
            manifest_url: self.manifest_url,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
