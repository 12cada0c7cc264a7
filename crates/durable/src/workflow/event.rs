//! Workflow events for persistence

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ActivityOptions, WorkflowError, WorkflowSignal};
use crate::activity::ActivityError;
use crate::engine::CompensationEntry;
use crate::persistence::RunStatus;

/// Types of timeouts that can occur
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutType {
    /// Attempt was not picked up by a worker within schedule_to_start_timeout
    ScheduleToStart,

    /// Attempt did not report within start_to_close_timeout
    StartToClose,

    /// Whole activity, across attempts, exceeded schedule_to_close_timeout
    ScheduleToClose,

    /// Worker did not send heartbeat within heartbeat_timeout
    Heartbeat,
}

impl TimeoutType {
    /// Stable name used as the activity error type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScheduleToStart => "schedule_to_start",
            Self::StartToClose => "start_to_close",
            Self::ScheduleToClose => "schedule_to_close",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// Events in a run's append-only history
///
/// These events are the only state a run has. They are used for:
/// - Replaying the workflow to reach the same decisions on any node
/// - Reconstructing in-flight activities and timers after a crash
/// - Auditing and debugging
///
/// Events are immutable once written. Two groups matter to replay:
/// command events record a decision the workflow made (`ActivityScheduled`
/// for the first attempt, `TimerStarted`, `ActivityCancelRequested` and the
/// closing `WorkflowCompleted`/`WorkflowFailed`/`WorkflowTerminated`/
/// `WorkflowContinuedAsNew`); everything else is an input fed to handlers or
/// purely informational.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    // =========================================================================
    // Workflow Lifecycle Events
    // =========================================================================
    /// Run was started; always the first event of a history
    WorkflowStarted {
        /// Registered workflow type
        workflow_type: String,

        /// Queue carrying this run's workflow tasks
        task_queue: String,

        /// The input provided when starting the run
        input: serde_json::Value,

        /// Workflow version the run was started under
        version: String,

        /// Previous run when this run was created by continue-as-new
        #[serde(default, skip_serializing_if = "Option::is_none")]
        continued_from: Option<Uuid>,

        /// Execution timeout in milliseconds
        #[serde(default, skip_serializing_if = "Option::is_none")]
        execution_timeout_ms: Option<u64>,
    },

    /// Run completed successfully
    WorkflowCompleted {
        /// The result value
        result: serde_json::Value,
    },

    /// Run failed
    WorkflowFailed {
        /// Error details
        error: WorkflowError,

        /// Compensations that never ran, newest first
        #[serde(default)]
        uncompensated: Vec<CompensationEntry>,
    },

    /// Run exceeded its execution timeout
    WorkflowTimedOut {
        /// Configured timeout in milliseconds
        timeout_ms: u64,
    },

    /// Run was terminated without compensation
    WorkflowTerminated {
        /// Reason for termination
        reason: String,
    },

    /// Run closed and handed over to a fresh run
    WorkflowContinuedAsNew {
        /// Run id of the successor
        new_run_id: Uuid,

        /// Input for the successor
        input: serde_json::Value,
    },

    /// Replay diverged from the recorded history
    WorkflowTaskFailed {
        /// Description of the mismatch
        message: String,
    },

    // =========================================================================
    // Activity Lifecycle Events
    // =========================================================================
    /// An attempt of an activity was scheduled
    ///
    /// Attempt 1 is recorded by the engine; later attempts by the retry
    /// controller.
    ActivityScheduled {
        /// Unique activity identifier within the run
        activity_id: String,

        /// Type of activity to execute
        activity_type: String,

        /// Queue the attempt was routed to
        task_queue: String,

        /// Input for the activity
        input: serde_json::Value,

        /// Execution options
        options: ActivityOptions,

        /// Attempt number (1-based)
        attempt: u32,

        /// Failure of the previous attempt, for retries
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_failure: Option<ActivityError>,
    },

    /// Activity completed successfully
    ActivityCompleted {
        /// Activity identifier
        activity_id: String,

        /// Result returned by the activity
        result: serde_json::Value,
    },

    /// Activity failed terminally
    ActivityFailed {
        /// Activity identifier
        activity_id: String,

        /// Error of the last attempt
        error: ActivityError,

        /// Number of attempts made
        attempts: u32,
    },

    /// An attempt timed out
    ActivityTimedOut {
        /// Activity identifier
        activity_id: String,

        /// Attempt that timed out
        attempt: u32,

        /// Type of timeout that occurred
        timeout_type: TimeoutType,
    },

    /// Workflow asked for an activity to be cancelled
    ActivityCancelRequested {
        /// Activity identifier
        activity_id: String,
    },

    // =========================================================================
    // Timer Events
    // =========================================================================
    /// Timer was started
    TimerStarted {
        /// Timer identifier
        timer_id: String,

        /// Duration in milliseconds
        duration_ms: u64,
    },

    /// Timer fired (duration elapsed)
    TimerFired {
        /// Timer identifier
        timer_id: String,
    },

    // =========================================================================
    // External Input Events
    // =========================================================================
    /// External signal was received
    SignalReceived {
        /// The signal that was received
        signal: WorkflowSignal,
    },

    /// Cancellation of the run was requested
    CancelRequested {
        /// Reason given by the caller
        reason: String,
    },
}

/// Discriminant of a [`WorkflowEvent`], persisted as `event_kind`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowTimedOut,
    WorkflowTerminated,
    WorkflowContinuedAsNew,
    WorkflowTaskFailed,
    ActivityScheduled,
    ActivityCompleted,
    ActivityFailed,
    ActivityTimedOut,
    ActivityCancelRequested,
    TimerStarted,
    TimerFired,
    SignalReceived,
    CancelRequested,
}

impl EventKind {
    /// Name stored in the `event_kind` column
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowStarted => "WorkflowStarted",
            Self::WorkflowCompleted => "WorkflowCompleted",
            Self::WorkflowFailed => "WorkflowFailed",
            Self::WorkflowTimedOut => "WorkflowTimedOut",
            Self::WorkflowTerminated => "WorkflowTerminated",
            Self::WorkflowContinuedAsNew => "WorkflowContinuedAsNew",
            Self::WorkflowTaskFailed => "WorkflowTaskFailed",
            Self::ActivityScheduled => "ActivityScheduled",
            Self::ActivityCompleted => "ActivityCompleted",
            Self::ActivityFailed => "ActivityFailed",
            Self::ActivityTimedOut => "ActivityTimedOut",
            Self::ActivityCancelRequested => "ActivityCancelRequested",
            Self::TimerStarted => "TimerStarted",
            Self::TimerFired => "TimerFired",
            Self::SignalReceived => "SignalReceived",
            Self::CancelRequested => "CancelRequested",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl WorkflowEvent {
    /// Kind of this event
    pub fn kind(&self) -> EventKind {
        match self {
            Self::WorkflowStarted { .. } => EventKind::WorkflowStarted,
            Self::WorkflowCompleted { .. } => EventKind::WorkflowCompleted,
            Self::WorkflowFailed { .. } => EventKind::WorkflowFailed,
            Self::WorkflowTimedOut { .. } => EventKind::WorkflowTimedOut,
            Self::WorkflowTerminated { .. } => EventKind::WorkflowTerminated,
            Self::WorkflowContinuedAsNew { .. } => EventKind::WorkflowContinuedAsNew,
            Self::WorkflowTaskFailed { .. } => EventKind::WorkflowTaskFailed,
            Self::ActivityScheduled { .. } => EventKind::ActivityScheduled,
            Self::ActivityCompleted { .. } => EventKind::ActivityCompleted,
            Self::ActivityFailed { .. } => EventKind::ActivityFailed,
            Self::ActivityTimedOut { .. } => EventKind::ActivityTimedOut,
            Self::ActivityCancelRequested { .. } => EventKind::ActivityCancelRequested,
            Self::TimerStarted { .. } => EventKind::TimerStarted,
            Self::TimerFired { .. } => EventKind::TimerFired,
            Self::SignalReceived { .. } => EventKind::SignalReceived,
            Self::CancelRequested { .. } => EventKind::CancelRequested,
        }
    }

    /// Get the activity_id if this is an activity-related event
    pub fn activity_id(&self) -> Option<&str> {
        match self {
            Self::ActivityScheduled { activity_id, .. }
            | Self::ActivityCompleted { activity_id, .. }
            | Self::ActivityFailed { activity_id, .. }
            | Self::ActivityTimedOut { activity_id, .. }
            | Self::ActivityCancelRequested { activity_id } => Some(activity_id),
            _ => None,
        }
    }

    /// Status a run moves to once this event is appended, if terminal
    pub fn terminal_status(&self) -> Option<RunStatus> {
        match self {
            Self::WorkflowCompleted { .. } => Some(RunStatus::Completed),
            Self::WorkflowFailed { .. } | Self::WorkflowTaskFailed { .. } => {
                Some(RunStatus::Failed)
            }
            Self::WorkflowTimedOut { .. } => Some(RunStatus::TimedOut),
            Self::WorkflowTerminated { .. } => Some(RunStatus::Terminated),
            Self::WorkflowContinuedAsNew { .. } => Some(RunStatus::ContinuedAsNew),
            _ => None,
        }
    }

    /// Check if this is a terminal workflow event
    pub fn is_terminal(&self) -> bool {
        self.terminal_status().is_some()
    }
}

/// A persisted event: `(run_id, sequence_no, event_kind, timestamp, payload)`
///
/// `sequence_no` starts at 1 and has no gaps within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Run the event belongs to
    pub run_id: Uuid,

    /// Position in the run's history (1-based)
    pub sequence_no: u64,

    /// When the event was appended
    pub timestamp: DateTime<Utc>,

    /// Event payload
    pub event: WorkflowEvent,
}

impl HistoryEvent {
    /// Kind of the wrapped event
    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn started() -> WorkflowEvent {
        WorkflowEvent::WorkflowStarted {
            workflow_type: "order".to_string(),
            task_queue: "order-task-queue".to_string(),
            input: json!({"order_id": "123"}),
            version: "1".to_string(),
            continued_from: None,
            execution_timeout_ms: None,
        }
    }

    #[test]
    fn test_workflow_event_serialization() {
        let event = started();

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"workflow_started\""));
        assert!(!json.contains("continued_from"));

        let parsed: WorkflowEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_kind_names_are_stable() {
        assert_eq!(started().kind().to_string(), "WorkflowStarted");
        assert_eq!(
            WorkflowEvent::ActivityCancelRequested {
                activity_id: "a".to_string()
            }
            .kind()
            .as_str(),
            "ActivityCancelRequested"
        );
    }

    #[test]
    fn test_activity_id_extraction() {
        let event = WorkflowEvent::ActivityTimedOut {
            activity_id: "my-activity".to_string(),
            attempt: 2,
            timeout_type: TimeoutType::StartToClose,
        };

        assert_eq!(event.activity_id(), Some("my-activity"));
        assert_eq!(started().activity_id(), None);
    }

    #[test]
    fn test_terminal_status() {
        assert_eq!(
            WorkflowEvent::WorkflowCompleted { result: json!({}) }.terminal_status(),
            Some(RunStatus::Completed)
        );
        assert_eq!(
            WorkflowEvent::WorkflowTaskFailed {
                message: "mismatch".to_string()
            }
            .terminal_status(),
            Some(RunStatus::Failed)
        );
        assert_eq!(
            WorkflowEvent::WorkflowContinuedAsNew {
                new_run_id: Uuid::now_v7(),
                input: json!({})
            }
            .terminal_status(),
            Some(RunStatus::ContinuedAsNew)
        );

        assert!(!started().is_terminal());
        assert!(!WorkflowEvent::ActivityCompleted {
            activity_id: "x".to_string(),
            result: json!({})
        }
        .is_terminal());
    }

    #[test]
    fn test_failed_event_defaults_uncompensated() {
        let json = json!({
            "type": "workflow_failed",
            "error": { "message": "boom", "code": null }
        });

        let parsed: WorkflowEvent = serde_json::from_value(json).unwrap();
        match parsed {
            WorkflowEvent::WorkflowFailed { uncompensated, .. } => {
                assert!(uncompensated.is_empty())
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
