//! Workflow actions and activity options

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::WorkflowError;
use crate::duration_serde;
use crate::reliability::RetryPolicy;

/// Actions a workflow can request
///
/// These are the only way workflow code affects the outside world. The
/// engine turns them into [`Command`](crate::engine::Command)s and records
/// each command as a [`WorkflowEvent`](super::WorkflowEvent) before any side
/// effect happens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowAction {
    /// Schedule an activity for execution
    ScheduleActivity {
        /// Unique identifier for this activity within the run
        activity_id: String,

        /// Type of activity to execute (used to look up the handler)
        activity_type: String,

        /// Input data for the activity (JSON)
        input: serde_json::Value,

        /// Execution options (queue, retries, timeouts)
        options: ActivityOptions,
    },

    /// Start a timer that fires after the specified duration
    StartTimer {
        /// Unique identifier for this timer within the run
        timer_id: String,

        /// Duration to wait before firing
        #[serde(with = "duration_serde")]
        duration: Duration,
    },

    /// Complete the workflow successfully with a result
    CompleteWorkflow {
        /// Result value (JSON)
        result: serde_json::Value,
    },

    /// Fail the workflow with an error
    ///
    /// Registered compensations run first, newest to oldest.
    FailWorkflow {
        /// Error details
        error: WorkflowError,
    },

    /// Close this run and start a fresh one with the same workflow id
    ContinueAsNew {
        /// Input for the next run
        input: serde_json::Value,
    },

    /// Push a compensating activity onto the saga stack
    RegisterCompensation {
        /// Activity type that undoes the completed step
        activity_type: String,

        /// Captured input for the compensation
        input: serde_json::Value,

        /// Execution options for the compensation
        options: ActivityOptions,
    },

    /// Request cancellation of an in-flight activity
    CancelActivity {
        /// ID of the activity to cancel
        activity_id: String,
    },

    /// Stop the run without running compensations
    Terminate {
        /// Reason recorded in the final event
        reason: String,
    },
}

impl WorkflowAction {
    /// Create a schedule activity action with default options
    pub fn schedule_activity(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::ScheduleActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options: ActivityOptions::default(),
        }
    }

    /// Create a schedule activity action with explicit options
    pub fn schedule_activity_with(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
        options: ActivityOptions,
    ) -> Self {
        Self::ScheduleActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options,
        }
    }

    /// Create a complete workflow action
    pub fn complete(result: serde_json::Value) -> Self {
        Self::CompleteWorkflow { result }
    }

    /// Create a fail workflow action
    pub fn fail(error: WorkflowError) -> Self {
        Self::FailWorkflow { error }
    }

    /// Create a timer action
    pub fn timer(timer_id: impl Into<String>, duration: Duration) -> Self {
        Self::StartTimer {
            timer_id: timer_id.into(),
            duration,
        }
    }

    /// Create a continue-as-new action
    pub fn continue_as_new(input: serde_json::Value) -> Self {
        Self::ContinueAsNew { input }
    }

    /// Register a compensation with default options
    pub fn compensate_with(activity_type: impl Into<String>, input: serde_json::Value) -> Self {
        Self::RegisterCompensation {
            activity_type: activity_type.into(),
            input,
            options: ActivityOptions::default(),
        }
    }

    /// Create a terminate action
    pub fn terminate(reason: impl Into<String>) -> Self {
        Self::Terminate {
            reason: reason.into(),
        }
    }
}

/// Options for activity execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityOptions {
    /// Task queue to route the activity to (defaults to the run's queue)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_queue: Option<String>,

    /// Retry policy for this activity
    pub retry_policy: RetryPolicy,

    /// Maximum time an attempt may wait before a worker picks it up
    #[serde(with = "duration_serde")]
    pub schedule_to_start_timeout: Duration,

    /// Maximum time for a single attempt once started
    #[serde(with = "duration_serde")]
    pub start_to_close_timeout: Duration,

    /// Overall budget across all attempts, including backoff
    #[serde(default, with = "duration_serde::option")]
    pub schedule_to_close_timeout: Option<Duration>,

    /// Heartbeat interval for long-running activities
    /// If set, workers must send heartbeats within this interval
    #[serde(default, with = "duration_serde::option")]
    pub heartbeat_timeout: Option<Duration>,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            task_queue: None,
            retry_policy: RetryPolicy::default(),
            schedule_to_start_timeout: Duration::from_secs(60),
            start_to_close_timeout: Duration::from_secs(300),
            schedule_to_close_timeout: None,
            heartbeat_timeout: None,
        }
    }
}

impl ActivityOptions {
    /// Route the activity to a specific task queue
    pub fn with_task_queue(mut self, queue: impl Into<String>) -> Self {
        self.task_queue = Some(queue.into());
        self
    }

    /// Create options with a specific retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the schedule-to-start timeout
    pub fn with_schedule_to_start_timeout(mut self, timeout: Duration) -> Self {
        self.schedule_to_start_timeout = timeout;
        self
    }

    /// Set the start-to-close timeout
    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }

    /// Set the schedule-to-close timeout
    pub fn with_schedule_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.schedule_to_close_timeout = Some(timeout);
        self
    }

    /// Enable heartbeating with the specified timeout
    pub fn with_heartbeat(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schedule_activity_action() {
        let action =
            WorkflowAction::schedule_activity("step-1", "my_activity", json!({"key": "value"}));

        match action {
            WorkflowAction::ScheduleActivity {
                activity_id,
                activity_type,
                input,
                options,
            } => {
                assert_eq!(activity_id, "step-1");
                assert_eq!(activity_type, "my_activity");
                assert_eq!(input, json!({"key": "value"}));
                assert!(options.task_queue.is_none());
            }
            _ => panic!("Expected ScheduleActivity"),
        }
    }

    #[test]
    fn test_activity_options_serialization() {
        let options = ActivityOptions::default()
            .with_task_queue("payments")
            .with_schedule_to_close_timeout(Duration::from_secs(90))
            .with_heartbeat(Duration::from_secs(30));

        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["schedule_to_start_timeout"], json!(60_000));
        assert_eq!(json["schedule_to_close_timeout"], json!(90_000));

        let parsed: ActivityOptions = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, options);
    }

    #[test]
    fn test_options_tolerate_missing_optional_fields() {
        let json = json!({
            "retry_policy": serde_json::to_value(RetryPolicy::no_retry()).unwrap(),
            "schedule_to_start_timeout": 1000,
            "start_to_close_timeout": 2000
        });

        let parsed: ActivityOptions = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.task_queue, None);
        assert_eq!(parsed.schedule_to_close_timeout, None);
        assert_eq!(parsed.heartbeat_timeout, None);
    }

    #[test]
    fn test_workflow_action_tagging() {
        let action = WorkflowAction::compensate_with("release_inventory", json!({"sku": "A"}));

        let json = serde_json::to_string(&action).unwrap();
        assert!(json.contains("\"type\":\"register_compensation\""));

        let parsed: WorkflowAction = serde_json::from_str(&json).unwrap();
        assert_eq!(action, parsed);
    }

    #[test]
    fn test_timer_action() {
        let action = WorkflowAction::timer("delay", Duration::from_secs(60));

        match action {
            WorkflowAction::StartTimer { timer_id, duration } => {
                assert_eq!(timer_id, "delay");
                assert_eq!(duration, Duration::from_secs(60));
            }
            _ => panic!("Expected StartTimer"),
        }
    }
}
