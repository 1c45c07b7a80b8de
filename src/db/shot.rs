//! Shot and project persistence.

use async_trait::async_trait;
use uuid::Uuid;

use super::Db;
use crate::error::{Error, Result};
use crate::model::{Project, ProjectId, Shot, ShotId, ShotStatus, TaskId};
use crate::store::{ProjectStore, ShotStore};

const SHOT_COLUMNS: &str = "id, project_id, shot_order, title, description, prompt, status, image_path, source_task_id, created_at, updated_at";

/// Map a foreign key violation to `NotFound` for the referenced record.
pub(super) fn missing_reference(e: sqlx::Error, what: impl FnOnce() -> String) -> Error {
    if let sqlx::Error::Database(db) = &e {
        if db.is_foreign_key_violation() {
            return Error::NotFound(what());
        }
    }
    Error::Database(e)
}

/// Insert a shot on any executor, so storyboard commits can reuse it inside
/// their transaction.
pub(super) async fn insert_shot_with<'e, E>(executor: E, shot: &Shot) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO shots (id, project_id, shot_order, title, description, prompt, status, image_path, source_task_id, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
    )
    .bind(shot.id.0)
    .bind(shot.project_id.0)
    .bind(shot.order as i32)
    .bind(&shot.title)
    .bind(&shot.description)
    .bind(&shot.prompt)
    .bind(shot.status.as_str())
    .bind(&shot.image_path)
    .bind(shot.source_task_id.map(|t| t.0))
    .bind(shot.created_at)
    .bind(shot.updated_at)
    .execute(executor)
    .await
    .map_err(|e| missing_reference(e, || format!("project {}", shot.project_id)))?;
    Ok(())
}

#[async_trait]
impl ShotStore for Db {
    async fn insert_shot(&self, shot: &Shot) -> Result<()> {
        insert_shot_with(&self.pool, shot).await
    }

    async fn get_shot(&self, id: ShotId) -> Result<Shot> {
        let row: Option<ShotRow> =
            sqlx::query_as(&format!("SELECT {SHOT_COLUMNS} FROM shots WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or_else(|| Error::NotFound(format!("shot {id}")))?
            .try_into_shot()
    }

    async fn list_shots(&self, project_id: ProjectId) -> Result<Vec<Shot>> {
        let rows: Vec<ShotRow> = sqlx::query_as(&format!(
            "SELECT {SHOT_COLUMNS} FROM shots WHERE project_id = $1 ORDER BY shot_order, created_at"
        ))
        .bind(project_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ShotRow::try_into_shot).collect()
    }

    async fn set_shot_image(&self, id: ShotId, image_path: &str) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE shots SET image_path = $1, status = $2, updated_at = now() WHERE id = $3",
        )
        .bind(image_path)
        .bind(ShotStatus::Completed.as_str())
        .bind(id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::NotFound(format!("shot {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ProjectStore for Db {
    async fn insert_project(&self, project: &Project) -> Result<()> {
        sqlx::query(
            "INSERT INTO projects (id, title, story_text, style, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(project.id.0)
        .bind(&project.title)
        .bind(&project.story_text)
        .bind(&project.style)
        .bind(project.created_at)
        .bind(project.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_project(&self, id: ProjectId) -> Result<Project> {
        let row: Option<ProjectRow> = sqlx::query_as(
            "SELECT id, title, story_text, style, created_at, updated_at FROM projects WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        let row = row.ok_or_else(|| Error::NotFound(format!("project {id}")))?;
        Ok(Project {
            id: ProjectId(row.id),
            title: row.title,
            story_text: row.story_text,
            style: row.style,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct ShotRow {
    id: Uuid,
    project_id: Uuid,
    shot_order: i32,
    title: String,
    description: String,
    prompt: String,
    status: String,
    image_path: Option<String>,
    source_task_id: Option<Uuid>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl ShotRow {
    fn try_into_shot(self) -> Result<Shot> {
        Ok(Shot {
            id: ShotId(self.id),
            project_id: ProjectId(self.project_id),
            order: u32::try_from(self.shot_order)
                .map_err(|_| Error::Other(format!("negative shot order on shot {}", self.id)))?,
            title: self.title,
            description: self.description,
            prompt: self.prompt,
            status: self.status.parse()?,
            image_path: self.image_path,
            source_task_id: self.source_task_id.map(TaskId),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: Uuid,
    title: String,
    story_text: String,
    style: String,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}
