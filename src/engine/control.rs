//! Control plane: a fixed-size pool of slots draining the task queue.
//!
//! Each slot takes one delivery, runs it through the [`Dispatcher`] to
//! completion, settles it with the queue, then takes the next. Parallelism
//! exists only across slots.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::dispatch::{Disposition, Dispatcher};
use crate::error::Result;
use crate::queue::{Delivery, TaskQueue};
use crate::telemetry::metrics;

/// Configuration for the control plane.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Number of deliveries processed concurrently.
    pub pool_size: usize,
    /// Idle wait between queue reads when no wake-up arrives.
    pub poll_interval: Duration,
    /// How long a retryable delivery stays invisible before redelivery.
    pub retry_delay: Duration,
    /// Deliveries after which a retryable message is given up on.
    pub max_deliveries: u32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            poll_interval: Duration::from_secs(5),
            retry_delay: Duration::from_secs(30),
            max_deliveries: 5,
        }
    }
}

/// The queue consumer pool.
#[derive(Clone)]
pub struct ControlPlane {
    queue: Arc<dyn TaskQueue>,
    dispatcher: Arc<Dispatcher>,
    config: ControlConfig,
    shutdown: Arc<watch::Sender<bool>>,
    active: Arc<AtomicUsize>,
}

impl ControlPlane {
    pub fn new(queue: Arc<dyn TaskQueue>, dispatcher: Arc<Dispatcher>, config: ControlConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            queue,
            dispatcher,
            config,
            shutdown: Arc::new(shutdown),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Signal all slots to stop after their current delivery.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Deliveries currently being handled.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Run `pool_size` slots until shutdown.
    pub async fn run(&self) -> Result<()> {
        let slots = self.config.pool_size.max(1);
        info!(slots, "control plane started");

        let mut set = JoinSet::new();
        for slot in 0..slots {
            let plane = self.clone();
            set.spawn(async move { plane.run_slot(slot).await });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!("dispatcher slot panicked: {e}");
            }
        }

        info!("control plane stopped");
        Ok(())
    }

    async fn run_slot(&self, slot: usize) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                return;
            }

            let processed = match self.process_next().await {
                Ok(processed) => processed,
                Err(e) => {
                    error!(slot, "queue read failed: {e}");
                    false
                }
            };
            if processed {
                continue;
            }

            // Queue empty (or unreachable): wait for a wake-up, the poll
            // interval, or shutdown.
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = self.queue.wait_for_work(self.config.poll_interval) => {}
            }
        }
    }

    /// Take and fully handle one delivery. Returns false if the queue was
    /// empty.
    pub async fn process_next(&self) -> Result<bool> {
        let Some(delivery) = self.queue.receive().await? else {
            return Ok(false);
        };

        self.active.fetch_add(1, Ordering::Relaxed);
        let disposition = self.dispatcher.handle(&delivery).await;
        self.active.fetch_sub(1, Ordering::Relaxed);

        self.settle(&delivery, disposition).await;
        Ok(true)
    }

    async fn settle(&self, delivery: &Delivery, disposition: Disposition) {
        let mut label = disposition.label();
        let outcome = match disposition {
            Disposition::Completed | Disposition::TerminalFailure { .. } => {
                self.queue.ack(delivery).await
            }
            Disposition::RetryableFailure { task_id, error } => {
                if delivery.attempt >= self.config.max_deliveries {
                    label = "dead";
                    let reason = format!(
                        "giving up after {} deliveries: {error}",
                        delivery.attempt
                    );
                    self.dispatcher.abandon(task_id, &reason).await;
                    self.queue.ack(delivery).await
                } else {
                    warn!(
                        task_id = %task_id,
                        attempt = delivery.attempt,
                        delay_secs = self.config.retry_delay.as_secs(),
                        "scheduling redelivery"
                    );
                    self.queue.retry_later(delivery, self.config.retry_delay).await
                }
            }
        };

        metrics::deliveries().add(1, &[KeyValue::new("disposition", label)]);

        // A failed settle is not fatal: the visibility timeout brings the
        // message back and the next delivery sees the task's real status.
        if let Err(e) = outcome {
            error!(msg_id = delivery.msg_id, "failed to settle delivery: {e}");
        }
    }
}
