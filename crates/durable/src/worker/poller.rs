//! Task polling with adaptive wait
//!
//! Polls block on the router until a task arrives or the wait expires. An
//! idle poller lengthens its wait; a poll that finds work shortens it again.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, trace};

use crate::duration_serde;
use crate::queue::{QueueTask, RouterError, TaskQueueRouter};

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollerConfig {
    /// Shortest poll wait (while tasks keep arriving)
    #[serde(with = "duration_serde")]
    pub min_interval: Duration,

    /// Longest poll wait (when idle)
    #[serde(with = "duration_serde")]
    pub max_interval: Duration,

    /// Wait growth when a poll comes back empty
    pub backoff_multiplier: f64,

    /// Pause after a failed poll
    #[serde(with = "duration_serde")]
    pub error_backoff: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl PollerConfig {
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }
}

/// Poller errors
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("router error: {0}")]
    Router(#[from] RouterError),

    #[error("poller is shutting down")]
    Shutdown,
}

/// Long-polls one task queue on behalf of one worker
pub struct TaskPoller {
    router: Arc<TaskQueueRouter>,
    task_queue: String,
    worker_id: String,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl TaskPoller {
    pub fn new(
        router: Arc<TaskQueueRouter>,
        task_queue: impl Into<String>,
        worker_id: impl Into<String>,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            router,
            task_queue: task_queue.into(),
            worker_id: worker_id.into(),
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    /// Wait for the next task
    ///
    /// Returns `Ok(None)` when the wait expired without work and
    /// [`PollerError::Shutdown`] once shutdown is signaled.
    #[instrument(skip(self), fields(worker_id = %self.worker_id, task_queue = %self.task_queue))]
    pub async fn poll(&mut self) -> Result<Option<QueueTask>, PollerError> {
        if self.is_shutdown() {
            return Err(PollerError::Shutdown);
        }

        let mut shutdown_rx = self.shutdown_rx.clone();
        let polled = tokio::select! {
            polled = self.router.poll(&self.task_queue, &self.worker_id, self.current_interval) => polled?,
            _ = shutdown_rx.changed() => {
                debug!("Shutdown signal received during poll");
                return Err(PollerError::Shutdown);
            }
        };

        match &polled {
            Some(task) => {
                self.reset_backoff();
                trace!(run_id = %task.run_id(), "Polled task");
            }
            None => {
                self.increase_backoff();
                trace!(
                    interval_ms = self.current_interval.as_millis() as u64,
                    "No tasks, lengthening poll wait"
                );
            }
        }
        Ok(polled)
    }

    /// Sleep for `duration` unless shutdown arrives first
    ///
    /// Returns `true` if shutdown was signaled.
    pub async fn pause(&mut self, duration: Duration) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = shutdown_rx.changed() => true,
        }
    }

    /// Pause after a failed poll
    pub async fn back_off(&mut self) -> bool {
        let backoff = self.config.error_backoff;
        self.pause(backoff).await
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let next = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = next.min(self.config.max_interval);
    }
}
