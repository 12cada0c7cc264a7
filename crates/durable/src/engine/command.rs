//! Commands decided by replay

use std::time::Duration;

use uuid::Uuid;

use super::saga::CompensationEntry;
use crate::persistence::RunInfo;
use crate::workflow::{ActivityOptions, EventKind, WorkflowError, WorkflowEvent};

/// A decision produced by replaying a run
///
/// Each command is recorded as exactly one command event before any side
/// effect is performed, so a later replay can check that the workflow still
/// makes the same decisions.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Hand the first attempt of an activity to the dispatcher
    ScheduleActivity {
        activity_id: String,
        activity_type: String,
        input: serde_json::Value,
        options: ActivityOptions,
    },

    /// Arm a durable timer
    StartTimer { timer_id: String, duration: Duration },

    /// Close the run successfully
    CompleteWorkflow { result: serde_json::Value },

    /// Close the run as failed
    FailWorkflow {
        error: WorkflowError,
        uncompensated: Vec<CompensationEntry>,
    },

    /// Close the run and start a successor
    ContinueAsNew { input: serde_json::Value },

    /// Raise the cancellation flag of an in-flight activity
    CancelActivity { activity_id: String },

    /// Close the run without compensation
    TerminateWorkflow { reason: String },
}

impl Command {
    /// Kind of the event that records this command
    pub fn event_kind(&self) -> EventKind {
        match self {
            Self::ScheduleActivity { .. } => EventKind::ActivityScheduled,
            Self::StartTimer { .. } => EventKind::TimerStarted,
            Self::CompleteWorkflow { .. } => EventKind::WorkflowCompleted,
            Self::FailWorkflow { .. } => EventKind::WorkflowFailed,
            Self::ContinueAsNew { .. } => EventKind::WorkflowContinuedAsNew,
            Self::CancelActivity { .. } => EventKind::ActivityCancelRequested,
            Self::TerminateWorkflow { .. } => EventKind::WorkflowTerminated,
        }
    }

    /// Whether this command closes the run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompleteWorkflow { .. }
                | Self::FailWorkflow { .. }
                | Self::ContinueAsNew { .. }
                | Self::TerminateWorkflow { .. }
        )
    }

    /// Check a recorded command event against this command
    ///
    /// Returns a description of the mismatch, if any. Only kind and identity
    /// are compared; payloads may legitimately differ (for example the
    /// successor run id of a continue-as-new).
    pub fn mismatch(&self, recorded: &WorkflowEvent) -> Option<String> {
        let matches = match (self, recorded) {
            (
                Self::ScheduleActivity {
                    activity_id,
                    activity_type,
                    ..
                },
                WorkflowEvent::ActivityScheduled {
                    activity_id: recorded_id,
                    activity_type: recorded_type,
                    attempt: 1,
                    ..
                },
            ) => activity_id == recorded_id && activity_type == recorded_type,
            (
                Self::StartTimer { timer_id, .. },
                WorkflowEvent::TimerStarted {
                    timer_id: recorded_id,
                    ..
                },
            ) => timer_id == recorded_id,
            (
                Self::CancelActivity { activity_id },
                WorkflowEvent::ActivityCancelRequested {
                    activity_id: recorded_id,
                },
            ) => activity_id == recorded_id,
            (Self::CompleteWorkflow { .. }, WorkflowEvent::WorkflowCompleted { .. })
            | (Self::FailWorkflow { .. }, WorkflowEvent::WorkflowFailed { .. })
            | (Self::ContinueAsNew { .. }, WorkflowEvent::WorkflowContinuedAsNew { .. })
            | (Self::TerminateWorkflow { .. }, WorkflowEvent::WorkflowTerminated { .. }) => true,
            _ => false,
        };

        (!matches).then(|| {
            format!(
                "workflow produced {}, history has {}",
                self.describe(),
                describe_event(recorded)
            )
        })
    }

    /// Event recording this command
    ///
    /// `successor` is the run id reserved for a continue-as-new.
    pub fn to_event(&self, run: &RunInfo, successor: Option<Uuid>) -> WorkflowEvent {
        match self.clone() {
            Self::ScheduleActivity {
                activity_id,
                activity_type,
                input,
                options,
            } => WorkflowEvent::ActivityScheduled {
                activity_id,
                activity_type,
                task_queue: options
                    .task_queue
                    .clone()
                    .unwrap_or_else(|| run.task_queue.clone()),
                input,
                options,
                attempt: 1,
                last_failure: None,
            },
            Self::StartTimer { timer_id, duration } => WorkflowEvent::TimerStarted {
                timer_id,
                duration_ms: duration.as_millis() as u64,
            },
            Self::CompleteWorkflow { result } => WorkflowEvent::WorkflowCompleted { result },
            Self::FailWorkflow {
                error,
                uncompensated,
            } => WorkflowEvent::WorkflowFailed {
                error,
                uncompensated,
            },
            Self::ContinueAsNew { input } => WorkflowEvent::WorkflowContinuedAsNew {
                new_run_id: successor.unwrap_or_else(Uuid::now_v7),
                input,
            },
            Self::CancelActivity { activity_id } => {
                WorkflowEvent::ActivityCancelRequested { activity_id }
            }
            Self::TerminateWorkflow { reason } => WorkflowEvent::WorkflowTerminated { reason },
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::ScheduleActivity {
                activity_id,
                activity_type,
                ..
            } => format!("ScheduleActivity({activity_id}, {activity_type})"),
            Self::StartTimer { timer_id, .. } => format!("StartTimer({timer_id})"),
            Self::CancelActivity { activity_id } => format!("CancelActivity({activity_id})"),
            other => other.event_kind().to_string(),
        }
    }
}

fn describe_event(event: &WorkflowEvent) -> String {
    match event {
        WorkflowEvent::ActivityScheduled {
            activity_id,
            activity_type,
            attempt,
            ..
        } => format!("ActivityScheduled({activity_id}, {activity_type}, attempt {attempt})"),
        WorkflowEvent::TimerStarted { timer_id, .. } => format!("TimerStarted({timer_id})"),
        WorkflowEvent::ActivityCancelRequested { activity_id } => {
            format!("ActivityCancelRequested({activity_id})")
        }
        other => other.kind().to_string(),
    }
}
