//! Delivery service contract between the producer and the dispatcher pool.
//!
//! Messages carry only a task identifier; parameters stay in the store. The
//! queue delivers at least once: a delivery that is neither acked nor
//! rescheduled reappears after its visibility timeout.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::TaskId;

pub use memory::MemoryQueue;

/// Message body placed on the queue for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: TaskId,
}

impl TaskEnvelope {
    pub fn new(task_id: TaskId) -> Self {
        Self { task_id }
    }

    pub fn encode(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn decode(payload: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(payload.clone())
            .map_err(|e| Error::Queue(format!("malformed task envelope: {e}")))
    }
}

/// A message handed to a dispatcher slot.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Queue-assigned message id, used to ack or reschedule.
    pub msg_id: i64,
    /// How many times this message has been delivered, including this one.
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue one message referencing `task_id`.
    async fn submit(&self, task_id: TaskId) -> Result<()>;

    /// Take the next visible message, if any.
    async fn receive(&self) -> Result<Option<Delivery>>;

    /// Settle a delivery for good. It will not be redelivered.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Make the delivery visible again after `delay`.
    async fn retry_later(&self, delivery: &Delivery, delay: Duration) -> Result<()>;

    /// Block until new work may be available or `max_wait` elapses.
    async fn wait_for_work(&self, max_wait: Duration) {
        tokio::time::sleep(max_wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_decodes_task_id() {
        let id = TaskId::new();
        let env = TaskEnvelope::decode(&TaskEnvelope::new(id).encode().unwrap()).unwrap();
        assert_eq!(env.task_id, id);
    }

    #[test]
    fn envelope_rejects_garbage() {
        assert!(TaskEnvelope::decode(&json!({"task_id": "not-a-uuid"})).is_err());
        assert!(TaskEnvelope::decode(&json!("hello")).is_err());
        assert!(TaskEnvelope::decode(&json!({})).is_err());
    }
}
