//! Task model: lifecycle status, typed parameters, and the task record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{ProjectId, ShotId, TaskId};
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of requested generation work.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,

    /// Owning project. Always set.
    pub project_id: ProjectId,

    /// Typed input. Fixed at creation; also carries the task type and, for
    /// shot generation, the target shot.
    pub payload: TaskPayload,

    pub status: TaskStatus,

    /// Worker result. Set on `Success`; may be retained on `Failed` when the
    /// failure happened after the worker answered.
    pub result: Option<Value>,

    /// Human-readable failure message. Only set on `Failed`.
    pub error: Option<String>,

    /// True while the task sits in `Failed` because of a transport failure,
    /// meaning a queue redelivery may pick it up again.
    pub retryable: bool,

    /// Number of times a dispatcher has moved this task into `Processing`.
    pub attempts: u32,

    /// Rendered storyboard manifest reported by the worker, if any.
    pub manifest_url: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build a fresh `Pending` task from a creation request.
    pub fn pending(new: NewTask) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            project_id: new.project_id,
            payload: new.payload,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            retryable: false,
            attempts: 0,
            manifest_url: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn task_type(&self) -> TaskType {
        self.payload.task_type()
    }

    pub fn shot_id(&self) -> Option<ShotId> {
        self.payload.shot_id()
    }

    /// Whether a dispatcher may move this task into `Processing`.
    pub fn is_claimable(&self) -> bool {
        match self.status {
            TaskStatus::Pending | TaskStatus::Processing => true,
            TaskStatus::Failed => self.retryable,
            TaskStatus::Success => false,
        }
    }

    /// Whether a delivery may still settle this task: `Processing`, or a
    /// retryable `Failed` awaiting redelivery.
    pub fn is_in_flight(&self) -> bool {
        match self.status {
            TaskStatus::Processing => true,
            TaskStatus::Failed => self.retryable,
            TaskStatus::Pending | TaskStatus::Success => false,
        }
    }
}

/// Request to create a task. The producer's public input.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub project_id: ProjectId,
    pub payload: TaskPayload,
}

impl NewTask {
    pub fn storyboard(project_id: ProjectId, params: StoryboardParams) -> Self {
        Self {
            project_id,
            payload: TaskPayload::Storyboard(params),
        }
    }

    pub fn shot_generation(project_id: ProjectId, shot_id: ShotId, params: ShotGenParams) -> Self {
        Self {
            project_id,
            payload: TaskPayload::ShotGeneration { shot_id, params },
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created and handed to the queue, not yet picked up.
    Pending,
    /// A dispatcher is talking to the worker.
    Processing,
    /// Worker succeeded and its result was reconciled. Terminal.
    Success,
    /// Failed. Terminal unless the task is flagged retryable.
    Failed,
}

impl TaskStatus {
    /// Can a status write move from self to `to`?
    ///
    /// `Failed -> Processing` is not listed: re-entry after a transport
    /// failure is decided per task via [`Task::is_claimable`].
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Pending, Failed)         // enqueue compensation
                | (Processing, Processing)  // re-claim after a lost handler
                | (Processing, Success)
                | (Processing, Failed)
                | (Failed, Failed)          // give up on a retryable failure
        )
    }

    /// Statuses a write into `to` may start from.
    pub fn sources(to: TaskStatus) -> Vec<TaskStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(to))
            .collect()
    }

    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Success,
        TaskStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(Error::Other(format!("unknown task status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Type + parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Storyboard,
    ShotGeneration,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Storyboard => "storyboard",
            TaskType::ShotGeneration => "shot_generation",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "storyboard" => Ok(TaskType::Storyboard),
            "shot_generation" => Ok(TaskType::ShotGeneration),
            other => Err(Error::InvalidParams(format!("unknown task type: {other}"))),
        }
    }
}

fn default_need_images() -> bool {
    true
}

/// Input of a storyboard task: split a story into shots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryboardParams {
    pub story_text: String,
    pub style: String,
    #[serde(default = "default_need_images")]
    pub need_images: bool,
    /// Any further keys the caller supplied. Forwarded to the worker as-is.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StoryboardParams {
    pub fn new(story_text: impl Into<String>, style: impl Into<String>) -> Self {
        Self {
            story_text: story_text.into(),
            style: style.into(),
            need_images: true,
            extra: Map::new(),
        }
    }
}

/// Input of a shot generation task: (re)render one shot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotGenParams {
    pub prompt: String,
    pub style: String,
    #[serde(default = "default_need_images")]
    pub need_images: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ShotGenParams {
    pub fn new(prompt: impl Into<String>, style: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            style: style.into(),
            need_images: true,
            extra: Map::new(),
        }
    }
}

/// Typed task input, one variant per task type.
///
/// A shot id exists exactly when the task is a shot generation.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskPayload {
    Storyboard(StoryboardParams),
    ShotGeneration { shot_id: ShotId, params: ShotGenParams },
}

impl TaskPayload {
    /// Rebuild a payload from its stored parts, checking the parameter schema
    /// and the shot id / type pairing.
    pub fn from_parts(task_type: TaskType, shot_id: Option<ShotId>, parameters: Value) -> Result<Self> {
        match (task_type, shot_id) {
            (TaskType::Storyboard, None) => serde_json::from_value(parameters)
                .map(TaskPayload::Storyboard)
                .map_err(|e| Error::InvalidParams(format!("storyboard: {e}"))),
            (TaskType::ShotGeneration, Some(shot_id)) => serde_json::from_value(parameters)
                .map(|params| TaskPayload::ShotGeneration { shot_id, params })
                .map_err(|e| Error::InvalidParams(format!("shot_generation: {e}"))),
            (TaskType::Storyboard, Some(shot_id)) => Err(Error::InvalidParams(format!(
                "storyboard task must not reference shot {shot_id}"
            ))),
            (TaskType::ShotGeneration, None) => Err(Error::InvalidParams(
                "shot_generation task requires a shot id".to_string(),
            )),
        }
    }

    pub fn task_type(&self) -> TaskType {
        match self {
            TaskPayload::Storyboard(_) => TaskType::Storyboard,
            TaskPayload::ShotGeneration { .. } => TaskType::ShotGeneration,
        }
    }

    pub fn shot_id(&self) -> Option<ShotId> {
        match self {
            TaskPayload::Storyboard(_) => None,
            TaskPayload::ShotGeneration { shot_id, .. } => Some(*shot_id),
        }
    }

    /// The text to generate from. Storyboards read `story_text`, shot
    /// generation reads `prompt`; the worker sees both as `prompt`.
    pub fn prompt(&self) -> &str {
        match self {
            TaskPayload::Storyboard(params) => &params.story_text,
            TaskPayload::ShotGeneration { params, .. } => &params.prompt,
        }
    }

    /// The full parameter map as persisted.
    pub fn parameters(&self) -> Result<Value> {
        let value = match self {
            TaskPayload::Storyboard(params) => serde_json::to_value(params)?,
            TaskPayload::ShotGeneration { params, .. } => serde_json::to_value(params)?,
        };
        Ok(value)
    }

    /// Parameters plus the normalized `prompt` field, as sent to the worker.
    pub fn worker_payload(&self) -> Result<Map<String, Value>> {
        let mut payload = match self.parameters()? {
            Value::Object(map) => map,
            other => {
                return Err(Error::InvalidParams(format!(
                    "parameters serialized to non-object: {other}"
                )));
            }
        };
        payload.insert("prompt".to_string(), Value::String(self.prompt().to_string()));
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn storyboard_payload_normalizes_story_text_to_prompt() {
        let payload = TaskPayload::Storyboard(StoryboardParams::new("once upon a time", "anime"));
        let map = payload.worker_payload().unwrap();
        assert_eq!(map["prompt"], json!("once upon a time"));
        assert_eq!(map["story_text"], json!("once upon a time"));
        assert_eq!(map["style"], json!("anime"));
        assert_eq!(map["need_images"], json!(true));
    }

    #[test]
    fn shot_payload_uses_prompt() {
        let payload = TaskPayload::ShotGeneration {
            shot_id: ShotId::new(),
            params: ShotGenParams::new("a red door", "movie"),
        };
        assert_eq!(payload.prompt(), "a red door");
        assert_eq!(payload.worker_payload().unwrap()["prompt"], json!("a red door"));
    }

    #[test]
    fn extra_parameters_survive_round_trip() {
        let stored = json!({"story_text": "s", "style": "x", "ratio": "16:9"});
        let payload = TaskPayload::from_parts(TaskType::Storyboard, None, stored).unwrap();
        let map = payload.worker_payload().unwrap();
        assert_eq!(map["ratio"], json!("16:9"));
    }

    #[test]
    fn from_parts_rejects_missing_required_key() {
        let err = TaskPayload::from_parts(TaskType::Storyboard, None, json!({"style": "x"}));
        assert!(matches!(err, Err(Error::InvalidParams(_))));
    }

    #[test]
    fn from_parts_enforces_shot_id_pairing() {
        let params = json!({"prompt": "p", "style": "s"});
        assert!(TaskPayload::from_parts(TaskType::ShotGeneration, None, params.clone()).is_err());
        assert!(
            TaskPayload::from_parts(TaskType::Storyboard, Some(ShotId::new()), params).is_err()
        );
    }

    #[test]
    fn status_graph_is_forward_only() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Success));
        assert!(!Success.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Success));
        assert!(!Success.can_transition_to(Processing));
        assert!(!Processing.can_transition_to(Pending));
        assert_eq!(TaskStatus::sources(Success), vec![Processing]);
        assert_eq!(TaskStatus::sources(Pending), vec![]);
    }

    #[test]
    fn only_transport_failures_are_claimable_again() {
        let mut task = Task::pending(NewTask::storyboard(
            ProjectId::new(),
            StoryboardParams::new("s", "x"),
        ));
        assert!(task.is_claimable());
        task.status = TaskStatus::Failed;
        assert!(!task.is_claimable());
        task.retryable = true;
        assert!(task.is_claimable());
        task.status = TaskStatus::Success;
        assert!(!task.is_claimable());
    }

    #[test]
    fn pending_task_is_not_in_flight() {
        let mut task = Task::pending(NewTask::storyboard(
            ProjectId::new(),
            StoryboardParams::new("s", "x"),
        ));
        assert!(!task.is_in_flight());
        task.status = TaskStatus::Processing;
        assert!(task.is_in_flight());
        task.status = TaskStatus::Failed;
        assert!(!task.is_in_flight());
        task.retryable = true;
        assert!(task.is_in_flight());
    }

    #[test]
    fn unknown_task_type_is_invalid_params() {
        assert!(matches!(
            "upscale".parse::<TaskType>(),
            Err(Error::InvalidParams(_))
        ));
    }
}
