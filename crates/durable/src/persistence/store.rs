//! WorkflowEventStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::workflow::{HistoryEvent, WorkflowEvent};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Run not found
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    /// A run with this id already exists
    #[error("run already exists: {0}")]
    RunAlreadyExists(Uuid),

    /// The workflow id has a run that has not reached a terminal status
    #[error("workflow {workflow_id} already has an open run {run_id}")]
    WorkflowAlreadyRunning { workflow_id: String, run_id: Uuid },

    /// Append used a stale expected sequence number
    #[error("sequence conflict: expected last sequence {expected}, found {actual}")]
    Conflict { expected: u64, actual: u64 },

    /// Run already has a terminal event
    #[error("run {0} is closed")]
    RunClosed(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether the caller should re-read and try again
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Run status, a projection of the run's history
///
/// `Created` is the state between accepting a start request and
/// persisting `WorkflowStarted`; both happen in one store call, so readers
/// only see it if that call fails halfway on a store without transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Accepted, no history yet
    Created,

    /// Running
    Running,

    /// Completed successfully
    Completed,

    /// Failed (workflow error, exhausted compensation or non-determinism)
    Failed,

    /// Execution timeout exceeded
    TimedOut,

    /// Terminated without compensation
    Terminated,

    /// Closed and succeeded by a new run
    ContinuedAsNew,
}

impl RunStatus {
    /// Whether no further events can be appended
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Created | Self::Running)
    }

    /// Name stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Terminated => "terminated",
            Self::ContinuedAsNew => "continued_as_new",
        }
    }

    /// Parse a stored status name
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "created" => Self::Created,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "timed_out" => Self::TimedOut,
            "terminated" => Self::Terminated,
            "continued_as_new" => Self::ContinuedAsNew,
            _ => return None,
        })
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to create a run and its seed event
#[derive(Debug, Clone)]
pub struct NewRun {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow_type: String,
    pub task_queue: String,
    pub version: String,
    pub input: serde_json::Value,
    pub continued_from: Option<Uuid>,
    pub execution_timeout: Option<Duration>,
}

impl NewRun {
    /// The `WorkflowStarted` event that seeds the history
    pub fn started_event(&self) -> WorkflowEvent {
        WorkflowEvent::WorkflowStarted {
            workflow_type: self.workflow_type.clone(),
            task_queue: self.task_queue.clone(),
            input: self.input.clone(),
            version: self.version.clone(),
            continued_from: self.continued_from,
            execution_timeout_ms: self.execution_timeout.map(|t| t.as_millis() as u64),
        }
    }
}

/// Run metadata
#[derive(Debug, Clone, PartialEq)]
pub struct RunInfo {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow_type: String,
    pub task_queue: String,
    pub version: String,
    pub status: RunStatus,
    pub last_sequence: u64,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
}

/// Filter for listing runs
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub workflow_id: Option<String>,
    pub status: Option<RunStatus>,
    pub include_archived: bool,
    pub limit: Option<usize>,
}

impl RunFilter {
    /// Runs that still need to make progress
    pub fn running() -> Self {
        Self {
            status: Some(RunStatus::Running),
            ..Default::default()
        }
    }

    /// Restrict to a status
    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restrict to a workflow id
    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    /// Check a run against the filter (limit is applied by the caller)
    pub fn matches(&self, run: &RunInfo) -> bool {
        if !self.include_archived && run.archived_at.is_some() {
            return false;
        }
        if let Some(status) = self.status {
            if run.status != status {
                return false;
            }
        }
        if let Some(workflow_id) = &self.workflow_id {
            if &run.workflow_id != workflow_id {
                return false;
            }
        }
        true
    }
}

/// Durable, append-only event log
///
/// Implementations must be thread-safe, make every append atomic and
/// durable before returning, and enforce optimistic concurrency on the last
/// sequence number. There is intentionally no way to delete or rewrite
/// events.
#[async_trait]
pub trait WorkflowEventStore: Send + Sync + 'static {
    // =========================================================================
    // Run Operations
    // =========================================================================

    /// Create a run and append its `WorkflowStarted` event atomically
    ///
    /// Fails with [`StoreError::WorkflowAlreadyRunning`] when the workflow id
    /// has a run that is not terminal.
    async fn create_run(&self, run: NewRun) -> Result<RunInfo, StoreError>;

    /// Get run metadata
    async fn get_run(&self, run_id: Uuid) -> Result<RunInfo, StoreError>;

    /// Latest run for a workflow id
    async fn current_run(&self, workflow_id: &str) -> Result<Option<RunInfo>, StoreError>;

    /// List runs matching a filter, oldest first
    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<RunInfo>, StoreError>;

    // =========================================================================
    // Event Operations
    // =========================================================================

    /// Append events with optimistic concurrency
    ///
    /// `expected_sequence` is the last sequence number the caller has seen
    /// (0 for an empty history). Returns the new last sequence number.
    async fn append_events(
        &self,
        run_id: Uuid,
        expected_sequence: u64,
        events: Vec<WorkflowEvent>,
    ) -> Result<u64, StoreError>;

    /// Append a single event, returning its sequence number
    async fn append(
        &self,
        run_id: Uuid,
        expected_sequence: u64,
        event: WorkflowEvent,
    ) -> Result<u64, StoreError> {
        self.append_events(run_id, expected_sequence, vec![event])
            .await
    }

    /// Load the full history of a run, ordered by sequence number
    async fn load_events(&self, run_id: Uuid) -> Result<Vec<HistoryEvent>, StoreError>;

    // =========================================================================
    // Retention
    // =========================================================================

    /// Mark terminal runs closed before `closed_before` as archived
    ///
    /// Archived runs keep their history but drop out of listings.
    async fn archive_closed_runs(
        &self,
        closed_before: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError>;
}

/// Append a fact that does not depend on the history
///
/// Writers that record outcomes (activity results, timers, signals) do not
/// make decisions from what they read, so on a conflict they simply re-read
/// the last sequence number and try again.
pub async fn append_with_retry(
    store: &dyn WorkflowEventStore,
    run_id: Uuid,
    event: WorkflowEvent,
    max_attempts: u32,
) -> Result<u64, StoreError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let run = store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(StoreError::RunClosed(run_id));
        }

        match store.append(run_id, run.last_sequence, event.clone()).await {
            Err(StoreError::Conflict { expected, actual }) if attempt < max_attempts => {
                debug!(%run_id, expected, actual, attempt, "append conflict, retrying");
                tokio::task::yield_now().await;
            }
            other => return other,
        }
    }
}

/// Validate a batch against a run's current state
///
/// Shared by store implementations so they reject the same things.
pub(crate) fn check_append(
    run: &RunInfo,
    expected_sequence: u64,
    events: &[WorkflowEvent],
) -> Result<(), StoreError> {
    if run.status.is_terminal() {
        return Err(StoreError::RunClosed(run.run_id));
    }
    if run.last_sequence != expected_sequence {
        return Err(StoreError::Conflict {
            expected: expected_sequence,
            actual: run.last_sequence,
        });
    }
    // A terminal event may only close the batch
    if let Some(pos) = events.iter().position(|e| e.is_terminal()) {
        if pos + 1 != events.len() {
            return Err(StoreError::RunClosed(run.run_id));
        }
    }
    Ok(())
}

/// Status after appending a batch
pub(crate) fn status_after(current: RunStatus, events: &[WorkflowEvent]) -> RunStatus {
    events.iter().fold(current, |status, event| {
        if let Some(terminal) = event.terminal_status() {
            terminal
        } else if matches!(event, WorkflowEvent::WorkflowStarted { .. }) {
            RunStatus::Running
        } else {
            status
        }
    })
}
