//! Activity execution context

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

/// Payload sent with heartbeats
#[derive(Debug, Clone)]
pub struct HeartbeatPayload {
    /// Optional progress details
    pub details: Option<serde_json::Value>,
}

/// Error from heartbeat operations
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    /// Heartbeat channel closed (attempt already resolved)
    #[error("heartbeat channel closed")]
    ChannelClosed,

    /// Activity was cancelled
    #[error("activity was cancelled")]
    Cancelled,
}

/// Context provided to activities during execution
///
/// The context provides:
/// - Information about the current execution attempt
/// - Heartbeat functionality for long-running activities
/// - Cancellation detection
///
/// # Example
///
/// ```ignore
/// async fn execute(&self, ctx: &ActivityContext, input: Input) -> Result<Output, ActivityError> {
///     for i in 0..100 {
///         if ctx.is_cancelled() {
///             return Err(ActivityError::cancelled("cancelled"));
///         }
///
///         do_work(i).await?;
///
///         ctx.heartbeat(Some(json!({"progress": i}))).await?;
///     }
///
///     Ok(Output { ... })
/// }
/// ```
#[derive(Debug)]
pub struct ActivityContext {
    /// Id of this attempt
    pub task_id: Uuid,

    /// Run that scheduled the activity
    pub run_id: Uuid,

    /// Workflow id of that run
    pub workflow_id: String,

    /// Activity ID within the run
    pub activity_id: String,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed
    pub max_attempts: u32,

    /// Heartbeat sender
    heartbeat_tx: Option<mpsc::Sender<HeartbeatPayload>>,

    /// Cancellation flag
    cancelled: CancellationHandle,
}

impl ActivityContext {
    /// Create a new activity context
    pub fn new(
        task_id: Uuid,
        run_id: Uuid,
        workflow_id: impl Into<String>,
        activity_id: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            task_id,
            run_id,
            workflow_id: workflow_id.into(),
            activity_id: activity_id.into(),
            attempt,
            max_attempts,
            heartbeat_tx: None,
            cancelled: CancellationHandle::new(),
        }
    }

    /// Create a context with heartbeat support
    pub fn with_heartbeat(mut self, tx: mpsc::Sender<HeartbeatPayload>) -> Self {
        self.heartbeat_tx = Some(tx);
        self
    }

    /// Share a cancellation flag owned by the dispatcher
    pub fn with_cancellation(mut self, handle: CancellationHandle) -> Self {
        self.cancelled = handle;
        self
    }

    /// Get a handle that can be used to cancel this activity
    pub fn cancellation_handle(&self) -> CancellationHandle {
        self.cancelled.clone()
    }

    /// Record a heartbeat
    ///
    /// Heartbeats serve two purposes:
    /// 1. Keep the attempt alive (prevent heartbeat timeout)
    /// 2. Report progress
    ///
    /// # Errors
    ///
    /// Returns an error if the activity has been cancelled or the
    /// heartbeat channel is closed.
    pub async fn heartbeat(
        &self,
        details: Option<serde_json::Value>,
    ) -> Result<(), HeartbeatError> {
        if self.is_cancelled() {
            return Err(HeartbeatError::Cancelled);
        }

        if let Some(tx) = &self.heartbeat_tx {
            tx.send(HeartbeatPayload { details })
                .await
                .map_err(|_| HeartbeatError::ChannelClosed)?;
        }

        Ok(())
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }

    /// Get a future that resolves when cancellation is requested
    ///
    /// This is useful for select! patterns:
    ///
    /// ```ignore
    /// tokio::select! {
    ///     result = do_work() => { ... }
    ///     _ = ctx.cancelled() => {
    ///         return Err(ActivityError::cancelled("cancelled"));
    ///     }
    /// }
    /// ```
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Check if this is the last retry attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Handle to cancel an activity attempt
#[derive(Debug, Clone, Default)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    /// Create a fresh, uncancelled handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the activity
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Check the flag
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}
