//! In-process queue with at-least-once semantics.
//!
//! Received messages move to an in-flight set until acked; rescheduled
//! messages go straight back to the ready list (the delay is not simulated).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use super::{Delivery, TaskEnvelope, TaskQueue};
use crate::error::{Error, Result};
use crate::model::TaskId;

struct Message {
    msg_id: i64,
    read_ct: u32,
    enqueued_at: DateTime<Utc>,
    payload: serde_json::Value,
}

#[derive(Default)]
struct State {
    next_id: i64,
    ready: VecDeque<Message>,
    in_flight: HashMap<i64, Message>,
}

#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<State>,
    wake: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an arbitrary payload, bypassing the envelope encoding.
    pub fn send_raw(&self, payload: serde_json::Value) -> Result<i64> {
        let mut state = self.lock()?;
        state.next_id += 1;
        let msg_id = state.next_id;
        state.ready.push_back(Message {
            msg_id,
            read_ct: 0,
            enqueued_at: Utc::now(),
            payload,
        });
        drop(state);
        self.wake.notify_waiters();
        Ok(msg_id)
    }

    /// Messages waiting to be received.
    pub fn ready_len(&self) -> usize {
        self.lock().map(|s| s.ready.len()).unwrap_or(0)
    }

    /// Messages received but not yet settled.
    pub fn in_flight_len(&self) -> usize {
        self.lock().map(|s| s.in_flight.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Queue("memory queue lock poisoned".to_string()))
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn submit(&self, task_id: TaskId) -> Result<()> {
        self.send_raw(TaskEnvelope::new(task_id).encode()?)?;
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>> {
        let mut state = self.lock()?;
        let Some(mut msg) = state.ready.pop_front() else {
            return Ok(None);
        };
        msg.read_ct += 1;
        let delivery = Delivery {
            msg_id: msg.msg_id,
            attempt: msg.read_ct,
            enqueued_at: msg.enqueued_at,
            payload: msg.payload.clone(),
        };
        state.in_flight.insert(msg.msg_id, msg);
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.lock()?.in_flight.remove(&delivery.msg_id);
        Ok(())
    }

    async fn retry_later(&self, delivery: &Delivery, _delay: Duration) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(msg) = state.in_flight.remove(&delivery.msg_id) {
            state.ready.push_back(msg);
        }
        drop(state);
        self.wake.notify_waiters();
        Ok(())
    }

    async fn wait_for_work(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.wake.notified()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn received_message_stays_in_flight_until_acked() {
        let queue = MemoryQueue::new();
        queue.submit(TaskId::new()).await.unwrap();

        let delivery = queue.receive().await.unwrap().unwrap();
        assert_eq!(delivery.attempt, 1);
        assert_eq!(queue.ready_len(), 0);
        assert_eq!(queue.in_flight_len(), 1);

        queue.ack(&delivery).await.unwrap();
        assert_eq!(queue.in_flight_len(), 0);
        assert!(queue.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retry_redelivers_with_higher_attempt() {
        let queue = MemoryQueue::new();
        queue.submit(TaskId::new()).await.unwrap();

        let first = queue.receive().await.unwrap().unwrap();
        queue.retry_later(&first, Duration::from_secs(30)).await.unwrap();

        let second = queue.receive().await.unwrap().unwrap();
        assert_eq!(second.msg_id, first.msg_id);
        assert_eq!(second.attempt, 2);
    }
}
