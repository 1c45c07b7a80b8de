//! Shot and project records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ProjectId, ShotId, TaskId};
use crate::error::{Error, Result};

/// One visual unit of a storyboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shot {
    pub id: ShotId,
    pub project_id: ProjectId,
    /// 0-based position within the project.
    pub order: u32,
    pub title: String,
    pub description: String,
    pub prompt: String,
    pub status: ShotStatus,
    /// Asset location, set once an image has been produced.
    pub image_path: Option<String>,
    /// Storyboard task that generated this shot. None for authored shots.
    pub source_task_id: Option<TaskId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Shot {
    /// A shot written directly by an author rather than generated.
    pub fn authored(project_id: ProjectId, order: u32, prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ShotId::new(),
            project_id,
            order,
            title: String::new(),
            description: String::new(),
            prompt: prompt.into(),
            status: ShotStatus::Pending,
            image_path: None,
            source_task_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShotStatus {
    Pending,
    Generating,
    Completed,
    Failed,
}

impl ShotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ShotStatus::Pending => "pending",
            ShotStatus::Generating => "generating",
            ShotStatus::Completed => "completed",
            ShotStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ShotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ShotStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ShotStatus::Pending),
            "generating" => Ok(ShotStatus::Generating),
            "completed" => Ok(ShotStatus::Completed),
            "failed" => Ok(ShotStatus::Failed),
            other => Err(Error::Other(format!("unknown shot status: {other}"))),
        }
    }
}

/// Owner of tasks and shots. Read-only to the dispatch pipeline; its story
/// text and style are copied into task parameters at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub title: String,
    pub story_text: String,
    pub style: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a project.
#[derive(Debug, Clone)]
pub struct NewProject {
    pub title: String,
    pub story_text: String,
    pub style: String,
}

impl From<NewProject> for Project {
    fn from(new: NewProject) -> Self {
        let now = Utc::now();
        Self {
            id: ProjectId::new(),
            title: new.title,
            story_text: new.story_text,
            style: new.style,
            created_at: now,
            updated_at: now,
        }
    }
}
