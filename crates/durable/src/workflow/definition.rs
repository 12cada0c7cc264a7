//! Workflow trait definition

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{WorkflowAction, WorkflowSignal};
use crate::activity::ActivityError;

/// Error type for workflow failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    pub code: Option<String>,
}

impl WorkflowError {
    /// Create a new workflow error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{}] {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for WorkflowError {}

impl From<&ActivityError> for WorkflowError {
    fn from(err: &ActivityError) -> Self {
        let error = Self::new(err.message.clone());
        match &err.error_type {
            Some(error_type) => error.with_code(error_type.clone()),
            None => error,
        }
    }
}

/// A workflow is a deterministic state machine driven by events
///
/// Workflows define:
/// - How to start execution (`on_start`)
/// - How to handle activity outcomes (`on_activity_completed`, `on_activity_failed`)
/// - How to handle timers (`on_timer_fired`)
/// - How to handle external signals and cancellation (`on_signal`, `on_cancel_requested`)
///
/// # Determinism
///
/// Handlers are replayed from the run's history every time the engine makes a
/// decision. Given the same sequence of events they must return the same
/// sequence of actions. Handlers therefore never read the clock, draw random
/// numbers or perform IO; anything like that belongs in an activity whose
/// result comes back as an event.
///
/// # Example
///
/// ```ignore
/// use keelrun_durable::prelude::*;
///
/// struct OrderWorkflow {
///     order_id: String,
/// }
///
/// impl Workflow for OrderWorkflow {
///     const TYPE: &'static str = "order_workflow";
///     type Input = OrderInput;
///     type Output = OrderResult;
///
///     fn new(input: Self::Input) -> Self {
///         Self { order_id: input.order_id }
///     }
///
///     fn on_start(&mut self) -> Vec<WorkflowAction> {
///         vec![WorkflowAction::schedule_activity(
///             "reserve",
///             "ReserveInventory",
///             json!({ "order_id": self.order_id }),
///         )]
///     }
///
///     // ... implement other methods
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// Unique type identifier for this workflow
    ///
    /// This is used to look up the workflow in the registry during replay.
    const TYPE: &'static str;

    /// Version tag recorded in `WorkflowStarted`
    ///
    /// Bump it when the handlers change in a way that would produce different
    /// commands for an existing history. Runs recorded under another version
    /// fail replay instead of silently diverging.
    const VERSION: &'static str = "1";

    /// Input type for starting the workflow
    type Input: Serialize + DeserializeOwned + Send + Clone;

    /// Output type when workflow completes successfully
    type Output: Serialize + DeserializeOwned + Send;

    /// Create a new workflow instance from input
    ///
    /// This is called at the beginning of every replay.
    fn new(input: Self::Input) -> Self;

    /// Called once per replay, right after construction
    fn on_start(&mut self) -> Vec<WorkflowAction>;

    /// Called when an activity completes successfully
    fn on_activity_completed(
        &mut self,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Vec<WorkflowAction>;

    /// Called when an activity fails terminally (retries exhausted,
    /// non-retryable error, or schedule-to-close timeout)
    fn on_activity_failed(
        &mut self,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction>;

    /// Called when a timer fires
    fn on_timer_fired(&mut self, timer_id: &str) -> Vec<WorkflowAction> {
        let _ = timer_id;
        vec![]
    }

    /// Called when an external signal is received
    fn on_signal(&mut self, signal: &WorkflowSignal) -> Vec<WorkflowAction> {
        let _ = signal;
        vec![]
    }

    /// Called when cancellation of the run is requested
    ///
    /// The default terminates the run. `Terminate` records a cancellation
    /// request for every in-flight activity and `WorkflowTerminated` in the
    /// same batch, so the run is closed before those activities stop and
    /// whatever they report afterwards is dropped. Registered compensations
    /// do not run.
    ///
    /// Return `FailWorkflow` instead when cleanup matters: in-flight
    /// activities are cancelled first, then the registered compensations run
    /// newest-first before `WorkflowFailed` is recorded.
    fn on_cancel_requested(&mut self, reason: &str) -> Vec<WorkflowAction> {
        vec![WorkflowAction::terminate(reason)]
    }
}
