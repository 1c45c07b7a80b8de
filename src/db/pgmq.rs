//! pgmq queue operations via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read,
//! pgmq.archive, pgmq.set_vt. [`PgmqQueue`] wraps them as the
//! [`TaskQueue`] the dispatcher pool consumes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use sqlx::postgres::PgListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::Db;
use crate::error::{Error, Result};
use crate::model::TaskId;
use crate::queue::{Delivery, TaskEnvelope, TaskQueue};
use crate::telemetry::metrics;

/// A message read from a pgmq queue.
#[derive(Debug, Clone)]
pub struct PgmqMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub vt: chrono::DateTime<chrono::Utc>,
    pub message: serde_json::Value,
}

fn count_op(queue_name: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue_name.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

impl Db {
    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(&self.pool)
            .await?;
        count_op(queue_name, "create");
        Ok(())
    }

    /// Send a message to a pgmq queue. Returns the message ID.
    /// delay_seconds: 0 for immediate, >0 for delayed delivery.
    pub async fn send_to_queue(
        &self,
        queue_name: &str,
        payload: &serde_json::Value,
        delay_seconds: i32,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
            .bind(queue_name)
            .bind(payload)
            .bind(delay_seconds)
            .fetch_one(&self.pool)
            .await?;
        count_op(queue_name, "send");
        Ok(row.0)
    }

    /// Read the next message from a queue (visibility timeout in seconds).
    /// Returns None if queue is empty.
    pub async fn read_from_queue(
        &self,
        queue_name: &str,
        vt_seconds: i32,
    ) -> Result<Option<PgmqMessage>> {
        let row = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >("SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.read($1, $2, 1)")
        .bind(queue_name)
        .bind(vt_seconds)
        .fetch_optional(&self.pool)
        .await?;

        let msg = row.map(|(msg_id, read_ct, enqueued_at, vt, message)| PgmqMessage {
            msg_id,
            read_ct,
            enqueued_at,
            vt,
            message,
        });
        count_op(queue_name, if msg.is_some() { "read" } else { "read_empty" });
        Ok(msg)
    }

    /// Archive a message (moves to archive table, preserves for audit).
    pub async fn archive_message(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .execute(&self.pool)
            .await?;
        count_op(queue_name, "archive");
        Ok(())
    }

    /// Hide a message for `vt_seconds` from now.
    pub async fn set_visibility(&self, queue_name: &str, msg_id: i64, vt_seconds: i32) -> Result<()> {
        sqlx::query("SELECT msg_id FROM pgmq.set_vt($1, $2, $3)")
            .bind(queue_name)
            .bind(msg_id)
            .bind(vt_seconds)
            .execute(&self.pool)
            .await?;
        count_op(queue_name, "set_vt");
        Ok(())
    }
}

/// Task queue on a pgmq queue, with a `LISTEN/NOTIFY` wake-up.
#[derive(Clone)]
pub struct PgmqQueue {
    db: Db,
    name: String,
    visibility_timeout_secs: i32,
    wake: Arc<Notify>,
}

impl PgmqQueue {
    pub fn new(db: Db, name: impl Into<String>, visibility_timeout_secs: i32) -> Self {
        Self {
            db,
            name: name.into(),
            visibility_timeout_secs,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Notification channel signalled on every submit.
    pub fn channel(&self) -> String {
        format!("{}_ready", self.name)
    }

    /// Create the underlying pgmq queue if it does not exist.
    pub async fn ensure(&self) -> Result<()> {
        self.db.create_queue(&self.name).await
    }

    /// Spawn a listener that wakes idle slots when a task is submitted.
    /// Without it slots still find work on their poll interval.
    pub async fn start_listener(&self) -> Result<JoinHandle<()>> {
        let mut listener = PgListener::connect_with(self.db.pool()).await?;
        let channel = self.channel();
        listener.listen(&channel).await?;
        let wake = Arc::clone(&self.wake);

        Ok(tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(note) => {
                        debug!(channel = note.channel(), "queue wake-up");
                        wake.notify_waiters();
                    }
                    Err(e) => {
                        // PgListener reconnects on the next recv.
                        warn!(channel = %channel, "queue listener error: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }))
    }
}

#[async_trait]
impl TaskQueue for PgmqQueue {
    async fn submit(&self, task_id: TaskId) -> Result<()> {
        let payload = TaskEnvelope::new(task_id).encode()?;
        let mut tx = self.db.pool().begin().await?;
        sqlx::query("SELECT pgmq.send($1, $2, $3)")
            .bind(&self.name)
            .bind(&payload)
            .bind(0i32)
            .execute(&mut *tx)
            .await?;
        // NOTIFY is transactional: only fires on commit
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(self.channel())
            .bind(task_id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        count_op(&self.name, "send");
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>> {
        let Some(msg) = self
            .db
            .read_from_queue(&self.name, self.visibility_timeout_secs)
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(Delivery {
            msg_id: msg.msg_id,
            attempt: u32::try_from(msg.read_ct)
                .map_err(|_| Error::Queue(format!("negative read count on message {}", msg.msg_id)))?,
            enqueued_at: msg.enqueued_at,
            payload: msg.message,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.db.archive_message(&self.name, delivery.msg_id).await
    }

    async fn retry_later(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        let secs = i32::try_from(delay.as_secs()).unwrap_or(i32::MAX);
        self.db.set_visibility(&self.name, delivery.msg_id, secs).await
    }

    async fn wait_for_work(&self, max_wait: Duration) {
        tokio::select! {
            _ = self.wake.notified() => {}
            _ = tokio::time::sleep(max_wait) => {}
        }
    }
}
