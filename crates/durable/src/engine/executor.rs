//! Workflow engine with replay support
//!
//! The `WorkflowEngine` is responsible for:
//! - Starting new runs
//! - Advancing runs: replaying history and recording the commands it yields
//! - Recording external input (signals, cancellation, execution timeouts)
//! - Creating the successor of a continue-as-new

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::persistence::{
    append_with_retry, NewRun, RunInfo, StoreError, WorkflowEventStore,
};
use crate::workflow::{HistoryEvent, WorkflowEvent, WorkflowSignal};

use super::command::Command;
use super::registry::{RegistryError, WorkflowRegistry};
use super::replay::{replay, ReplayError};

/// Configuration for the workflow engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Hard limit on history length; `advance` refuses longer runs
    pub max_events_per_run: usize,

    /// History length at which a warning suggests continue-as-new
    pub history_warning_threshold: usize,

    /// Re-reads after a sequence conflict before giving up
    pub max_conflict_retries: u32,

    /// Attempts for appends that do not depend on the history
    pub append_retry_attempts: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_events_per_run: 10_000,
            history_warning_threshold: 8_000,
            max_conflict_retries: 5,
            append_retry_attempts: 10,
        }
    }
}

impl ExecutorConfig {
    pub fn with_max_events_per_run(mut self, max: usize) -> Self {
        self.max_events_per_run = max;
        self
    }

    pub fn with_history_warning_threshold(mut self, threshold: usize) -> Self {
        self.history_warning_threshold = threshold;
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries.max(1);
        self
    }
}

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Replay diverged from history; the run has been failed
    #[error("run {run_id} is non-deterministic: {message}")]
    NonDeterminism { run_id: Uuid, message: String },

    /// History grew past the configured limit
    #[error("run {run_id} has too many events ({count} > {limit})")]
    TooManyEvents {
        run_id: Uuid,
        count: usize,
        limit: usize,
    },

    /// Every attempt to record decisions lost a sequence race
    #[error("run {run_id}: gave up after {attempts} sequence conflicts")]
    ConflictRetriesExhausted { run_id: Uuid, attempts: u32 },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Request to start a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartWorkflowRequest {
    /// Caller-chosen business identifier
    pub workflow_id: String,

    /// Queue carrying the run's workflow tasks
    pub task_queue: String,

    /// Registered workflow type
    pub workflow_type: String,

    /// Workflow input
    pub input: serde_json::Value,

    /// Limit on the whole run, including retries and compensation
    #[serde(default, with = "crate::duration_serde::option")]
    pub execution_timeout: Option<Duration>,
}

impl StartWorkflowRequest {
    pub fn new(
        workflow_id: impl Into<String>,
        task_queue: impl Into<String>,
        workflow_type: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            task_queue: task_queue.into(),
            workflow_type: workflow_type.into(),
            input,
            execution_timeout: None,
        }
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }
}

/// Identifiers of an accepted run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartWorkflowResponse {
    pub workflow_id: String,
    pub run_id: Uuid,
}

/// Workflow engine
///
/// The engine drives runs by replaying their history and recording the
/// commands that replay yields, using the history's last sequence number as
/// the expected sequence. Side effects are left to the caller and must only
/// happen after `advance` returns.
///
/// # Example
///
/// ```ignore
/// use keelrun_durable::prelude::*;
///
/// let store = Arc::new(InMemoryWorkflowEventStore::new());
/// let registry = Arc::new(WorkflowRegistry::new().with::<OrderWorkflow>());
/// let engine = WorkflowEngine::new(store, registry, ExecutorConfig::default());
///
/// let started = engine
///     .start_workflow(StartWorkflowRequest::new("order-42", "orders", "order_workflow", input))
///     .await?;
/// let commands = engine.advance(started.run_id).await?;
/// ```
pub struct WorkflowEngine {
    store: Arc<dyn WorkflowEventStore>,
    registry: Arc<WorkflowRegistry>,
    config: ExecutorConfig,
    run_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl WorkflowEngine {
    /// Create a new engine
    pub fn new(
        store: Arc<dyn WorkflowEventStore>,
        registry: Arc<WorkflowRegistry>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            run_locks: DashMap::new(),
        }
    }

    /// Get a reference to the store
    pub fn store(&self) -> &Arc<dyn WorkflowEventStore> {
        &self.store
    }

    /// Get a reference to the registry
    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Start a new run
    ///
    /// Creates the run with its `WorkflowStarted` event. No workflow code
    /// runs here; the first `advance` does that.
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id, workflow_type = %request.workflow_type))]
    pub async fn start_workflow(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<StartWorkflowResponse, ExecutorError> {
        let version = self.registry.version(&request.workflow_type)?;
        // Reject input the workflow cannot decode before anything is persisted
        self.registry
            .create(&request.workflow_type, request.input.clone())?;

        let run = self
            .store
            .create_run(NewRun {
                workflow_id: request.workflow_id,
                run_id: Uuid::now_v7(),
                workflow_type: request.workflow_type,
                task_queue: request.task_queue,
                version: version.to_string(),
                input: request.input,
                continued_from: None,
                execution_timeout: request.execution_timeout,
            })
            .await?;

        info!(run_id = %run.run_id, "started workflow run");
        Ok(StartWorkflowResponse {
            workflow_id: run.workflow_id,
            run_id: run.run_id,
        })
    }

    /// Replay a run and record the commands it has not recorded yet
    ///
    /// Returns the newly recorded commands for the caller to carry out. A
    /// closed run yields no commands. At most one `advance` per run is in
    /// progress in this process; other writers are fenced by the expected
    /// sequence number.
    #[instrument(skip(self))]
    pub async fn advance(&self, run_id: Uuid) -> Result<Vec<Command>, ExecutorError> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        for attempt in 1..=self.config.max_conflict_retries {
            let run = self.store.get_run(run_id).await?;
            if run.status.is_terminal() {
                debug!(status = %run.status, "run already closed");
                return Ok(vec![]);
            }

            let history = self.store.load_events(run_id).await?;
            self.check_history_len(run_id, history.len())?;

            let outcome = match replay(&self.registry, &history) {
                Ok(outcome) => outcome,
                Err(ReplayError::NonDeterminism {
                    sequence_no,
                    message,
                }) => {
                    let message = format!("sequence {sequence_no}: {message}");
                    self.fail_task(run_id, &message).await?;
                    return Err(ExecutorError::NonDeterminism { run_id, message });
                }
                Err(ReplayError::EmptyHistory) => {
                    return Err(StoreError::RunNotFound(run_id).into());
                }
                Err(ReplayError::Registry(e)) => return Err(e.into()),
            };

            if outcome.commands.is_empty() {
                return Ok(vec![]);
            }

            let last_sequence = history.last().map(|e| e.sequence_no).unwrap_or(0);
            let successor = outcome
                .commands
                .iter()
                .any(|c| matches!(c, Command::ContinueAsNew { .. }))
                .then(Uuid::now_v7);
            let events = outcome
                .commands
                .iter()
                .map(|c| c.to_event(&run, successor))
                .collect();

            match self.store.append_events(run_id, last_sequence, events).await {
                Ok(sequence_no) => {
                    debug!(
                        commands = outcome.commands.len(),
                        last_sequence = sequence_no,
                        compensating = outcome.compensating,
                        "recorded commands"
                    );
                    if successor.is_some() {
                        self.ensure_successor(run_id).await?;
                    }
                    return Ok(outcome.commands);
                }
                Err(StoreError::Conflict { expected, actual }) => {
                    debug!(attempt, expected, actual, "history moved during advance, replaying again");
                }
                Err(StoreError::RunClosed(_)) => {
                    debug!("run closed during advance");
                    return Ok(vec![]);
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(%run_id, "advance kept losing sequence races");
        Err(ExecutorError::ConflictRetriesExhausted {
            run_id,
            attempts: self.config.max_conflict_retries,
        })
    }

    /// Record a signal for a run
    #[instrument(skip(self, signal), fields(signal = %signal.name))]
    pub async fn signal(&self, run_id: Uuid, signal: WorkflowSignal) -> Result<u64, ExecutorError> {
        let sequence_no = self
            .append(run_id, WorkflowEvent::SignalReceived { signal })
            .await?;
        info!(sequence_no, "signal recorded");
        Ok(sequence_no)
    }

    /// Record a cancellation request for a run
    #[instrument(skip(self))]
    pub async fn request_cancel(&self, run_id: Uuid, reason: &str) -> Result<u64, ExecutorError> {
        let sequence_no = self
            .append(
                run_id,
                WorkflowEvent::CancelRequested {
                    reason: reason.to_string(),
                },
            )
            .await?;
        info!(sequence_no, "cancellation requested");
        Ok(sequence_no)
    }

    /// Close a run that exceeded its execution timeout
    #[instrument(skip(self))]
    pub async fn time_out(&self, run_id: Uuid, timeout: Duration) -> Result<u64, ExecutorError> {
        let sequence_no = self
            .append(
                run_id,
                WorkflowEvent::WorkflowTimedOut {
                    timeout_ms: timeout.as_millis() as u64,
                },
            )
            .await?;
        warn!(sequence_no, ?timeout, "run timed out");
        Ok(sequence_no)
    }

    /// Run metadata
    pub async fn describe(&self, run_id: Uuid) -> Result<RunInfo, ExecutorError> {
        Ok(self.store.get_run(run_id).await?)
    }

    /// Full history of a run
    pub async fn history(&self, run_id: Uuid) -> Result<Vec<HistoryEvent>, ExecutorError> {
        Ok(self.store.load_events(run_id).await?)
    }

    /// Create the successor of a run that continued as new, if missing
    ///
    /// Safe to call repeatedly; recovery uses it to finish a handover that
    /// crashed between closing the old run and creating the new one.
    #[instrument(skip(self))]
    pub async fn ensure_successor(&self, run_id: Uuid) -> Result<Option<RunInfo>, ExecutorError> {
        let history = self.store.load_events(run_id).await?;
        let Some(WorkflowEvent::WorkflowContinuedAsNew { new_run_id, input }) =
            history.last().map(|e| &e.event)
        else {
            return Ok(None);
        };

        match self.store.get_run(*new_run_id).await {
            Ok(existing) => return Ok(Some(existing)),
            Err(StoreError::RunNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let Some(WorkflowEvent::WorkflowStarted {
            workflow_type,
            task_queue,
            execution_timeout_ms,
            ..
        }) = history.first().map(|e| &e.event)
        else {
            return Err(ExecutorError::NonDeterminism {
                run_id,
                message: "history does not start with WorkflowStarted".to_string(),
            });
        };

        let previous = self.store.get_run(run_id).await?;
        let successor = self
            .store
            .create_run(NewRun {
                workflow_id: previous.workflow_id,
                run_id: *new_run_id,
                workflow_type: workflow_type.clone(),
                task_queue: task_queue.clone(),
                version: self.registry.version(workflow_type)?.to_string(),
                input: input.clone(),
                continued_from: Some(run_id),
                execution_timeout: execution_timeout_ms.map(Duration::from_millis),
            })
            .await;

        match successor {
            Ok(info) => {
                info!(new_run_id = %info.run_id, "continued as new");
                Ok(Some(info))
            }
            // Lost a race with another process creating the same successor
            Err(StoreError::RunAlreadyExists(id)) => Ok(Some(self.store.get_run(id).await?)),
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // Internal Methods
    // =========================================================================

    fn run_lock(&self, run_id: Uuid) -> Arc<Mutex<()>> {
        self.run_locks
            .entry(run_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry of a closed run
    pub fn forget(&self, run_id: Uuid) {
        self.run_locks.remove(&run_id);
    }

    fn check_history_len(&self, run_id: Uuid, count: usize) -> Result<(), ExecutorError> {
        if count > self.config.max_events_per_run {
            error!(%run_id, count, limit = self.config.max_events_per_run, "history too long");
            return Err(ExecutorError::TooManyEvents {
                run_id,
                count,
                limit: self.config.max_events_per_run,
            });
        }
        if count >= self.config.history_warning_threshold {
            warn!(%run_id, count, "history is getting long, consider continue-as-new");
        }
        Ok(())
    }

    async fn fail_task(&self, run_id: Uuid, message: &str) -> Result<(), ExecutorError> {
        error!(%run_id, %message, "non-deterministic workflow, failing run");
        match self
            .append(
                run_id,
                WorkflowEvent::WorkflowTaskFailed {
                    message: message.to_string(),
                },
            )
            .await
        {
            Ok(_) | Err(ExecutorError::Store(StoreError::RunClosed(_))) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn append(&self, run_id: Uuid, event: WorkflowEvent) -> Result<u64, ExecutorError> {
        Ok(append_with_retry(
            self.store.as_ref(),
            run_id,
            event,
            self.config.append_retry_attempts,
        )
        .await?)
    }
}
