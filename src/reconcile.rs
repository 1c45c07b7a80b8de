//! Result reconciliation: turn a worker's result payload into store writes.
//!
//! Shot generation overwrites one shot's image in place, so replaying the
//! same result is harmless. Storyboard creation inserts a fresh batch of
//! shots; the batch and the task's `Success` write commit together, and only
//! while the task is still `Processing`, so a duplicate delivery cannot
//! insert the batch twice.

use std::sync::Arc;

use chrono::Utc;
use opentelemetry::KeyValue;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::model::{ProjectId, Shot, ShotId, ShotStatus, TaskId};
use crate::store::Store;
use crate::telemetry::metrics;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("worker result does not contain a 'shots' field")]
    MissingShots,

    #[error("'shots' field is not a list")]
    ShotsNotList,

    #[error("worker result contains no images")]
    NoImages,

    #[error("store write failed: {0}")]
    Store(#[from] Error),
}

/// Behaviour switches for reconciliation.
#[derive(Debug, Clone, Default)]
pub struct ReconcileConfig {
    /// Fail a shot generation task whose result carries no usable image.
    /// Off by default: the task succeeds and the shot is left untouched.
    pub require_images: bool,
}

/// What happened to a shot generation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShotUpdate {
    /// The shot now points at this image and is `completed`.
    Updated { image_path: String },
    /// The result had no usable image; the shot was not modified.
    Unchanged,
}

/// What happened to a storyboard result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoryboardCommit {
    /// Shots inserted and task marked `Success`.
    Committed { shots_created: usize },
    /// Another delivery already settled the task; nothing was written.
    Stale,
}

/// One storyboard entry as produced by the worker.
#[derive(Debug, Deserialize)]
struct WorkerShot {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    prompt: String,
}

pub struct Reconciler {
    store: Arc<dyn Store>,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, config: ReconcileConfig) -> Self {
        Self { store, config }
    }

    /// Apply a shot generation result: the first entry of `result.images`
    /// becomes the shot's `image_path`.
    pub async fn reconcile_shot(
        &self,
        shot_id: ShotId,
        result: Option<&Value>,
    ) -> Result<ShotUpdate, ReconcileError> {
        let Some(image_path) = result.and_then(first_image) else {
            if self.config.require_images {
                return Err(ReconcileError::NoImages);
            }
            debug!(shot_id = %shot_id, "no image in worker result, shot left unchanged");
            return Ok(ShotUpdate::Unchanged);
        };

        self.store.set_shot_image(shot_id, &image_path).await?;
        info!(shot_id = %shot_id, image_path = %image_path, "shot updated with new image");
        Ok(ShotUpdate::Updated { image_path })
    }

    /// Apply a storyboard result: create one shot per decodable entry of
    /// `result.shots`, ordered contiguously from 0, and mark the task
    /// `Success` in the same transaction.
    pub async fn reconcile_storyboard(
        &self,
        task_id: TaskId,
        project_id: ProjectId,
        result: Option<&Value>,
    ) -> Result<StoryboardCommit, ReconcileError> {
        let result = result.ok_or(ReconcileError::MissingShots)?;
        let entries = result
            .get("shots")
            .ok_or(ReconcileError::MissingShots)?
            .as_array()
            .ok_or(ReconcileError::ShotsNotList)?;

        let shots = build_shots(task_id, project_id, entries);

        let manifest_url = result
            .get("url")
            .and_then(Value::as_str)
            .filter(|url| !url.is_empty());
        if let Some(url) = manifest_url {
            info!(task_id = %task_id, url, "storyboard manifest available");
        }

        let committed = self
            .store
            .commit_storyboard(task_id, &shots, result, manifest_url)
            .await?;

        if !committed {
            warn!(task_id = %task_id, "task already settled, storyboard batch discarded");
            return Ok(StoryboardCommit::Stale);
        }

        metrics::shots_created().add(shots.len() as u64, &[KeyValue::new("task_type", "storyboard")]);
        info!(
            task_id = %task_id,
            project_id = %project_id,
            shots = shots.len(),
            "storyboard shots created"
        );
        Ok(StoryboardCommit::Committed {
            shots_created: shots.len(),
        })
    }
}

/// First entry of `result.images`, if it is a non-empty string.
fn first_image(result: &Value) -> Option<String> {
    result
        .get("images")?
        .as_array()?
        .first()?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Decode worker entries into new shots. Entries that are not objects of
/// string fields are skipped; order counts only the survivors.
fn build_shots(task_id: TaskId, project_id: ProjectId, entries: &[Value]) -> Vec<Shot> {
    let now = Utc::now();
    entries
        .iter()
        .enumerate()
        .filter_map(|(index, entry)| {
            if !entry.is_object() {
                warn!(task_id = %task_id, index, "skipping shot: entry is not an object");
                return None;
            }
            match WorkerShot::deserialize(entry) {
                Ok(shot) => Some(shot),
                Err(e) => {
                    warn!(task_id = %task_id, index, error = %e, "skipping shot: decode failed");
                    None
                }
            }
        })
        .enumerate()
        .map(|(order, ws)| Shot {
            id: ShotId::new(),
            project_id,
            order: order as u32,
            title: ws.title,
            description: ws.description,
            prompt: ws.prompt,
            status: ShotStatus::Pending,
            image_path: None,
            source_task_id: Some(task_id),
            created_at: now,
            updated_at: now,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_image_requires_non_empty_string_list() {
        assert_eq!(
            first_image(&json!({"images": ["http://x/img.png", "http://x/2.png"]})),
            Some("http://x/img.png".to_string())
        );
        assert_eq!(first_image(&json!({"images": []})), None);
        assert_eq!(first_image(&json!({"images": "http://x/img.png"})), None);
        assert_eq!(first_image(&json!({"images": [42]})), None);
        assert_eq!(first_image(&json!({})), None);
    }

    #[test]
    fn orders_count_surviving_entries_only() {
        let entries = vec![
            json!({"prompt": "A", "title": "first"}),
            json!("not a shot"),
            json!({"prompt": 7}),
            json!({"prompt": "B"}),
        ];
        let task_id = TaskId::new();
        let shots = build_shots(task_id, ProjectId::new(), &entries);
        assert_eq!(shots.len(), 2);
        assert_eq!((shots[0].order, shots[0].prompt.as_str()), (0, "A"));
        assert_eq!(shots[0].title, "first");
        assert_eq!((shots[1].order, shots[1].prompt.as_str()), (1, "B"));
        assert!(shots.iter().all(|s| s.status == ShotStatus::Pending));
        assert!(shots.iter().all(|s| s.source_task_id == Some(task_id)));
    }

    #[test]
    fn array_entries_are_not_decoded_positionally() {
        let shots = build_shots(TaskId::new(), ProjectId::new(), &[json!(["t", "d", "p"])]);
        assert!(shots.is_empty());
    }
}
