//! Deterministic replay
//!
//! Replay rebuilds a workflow from its history and works out which commands
//! have not been recorded yet. It is a pure function of the history and the
//! registered workflow code: no store, no clock, no randomness.
//!
//! Every command a handler produces is queued and paired, in order, with the
//! next command event found in the history:
//!
//! | command             | command event                         |
//! |---------------------|---------------------------------------|
//! | `ScheduleActivity`  | `ActivityScheduled` with `attempt: 1` |
//! | `StartTimer`        | `TimerStarted`                        |
//! | `CancelActivity`    | `ActivityCancelRequested`             |
//! | `CompleteWorkflow`  | `WorkflowCompleted`                   |
//! | `FailWorkflow`      | `WorkflowFailed`                      |
//! | `ContinueAsNew`     | `WorkflowContinuedAsNew`              |
//! | `TerminateWorkflow` | `WorkflowTerminated`                  |
//!
//! Commands left in the queue once the history is exhausted are new.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::command::Command;
use super::registry::{AnyWorkflow, RegistryError, WorkflowRegistry};
use super::saga::{compensation_activity_id, CompensationEntry, CompensationStack};
use crate::activity::ActivityError;
use crate::workflow::{ActivityOptions, HistoryEvent, WorkflowAction, WorkflowError, WorkflowEvent};

/// Errors from replay
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// Nothing to replay
    #[error("history is empty")]
    EmptyHistory,

    /// The workflow no longer makes the decisions recorded in its history
    #[error("non-deterministic replay at sequence {sequence_no}: {message}")]
    NonDeterminism { sequence_no: u64, message: String },

    /// Workflow type missing or its input no longer deserializes
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Result of replaying a history
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayOutcome {
    /// Commands not yet recorded, in the order they must be appended
    pub commands: Vec<Command>,

    /// The run is unwinding its compensation stack
    pub compensating: bool,

    /// The history already ends with a terminal event
    pub closed: bool,

    /// Activities scheduled and not yet resolved or cancelled, in schedule order
    pub in_flight: Vec<String>,
}

enum Phase {
    Running,
    Compensating {
        error: WorkflowError,
        activity_id: String,
        entry: CompensationEntry,
    },
    /// A terminal command has been decided
    Closing,
}

struct Replayer {
    workflow: Box<dyn AnyWorkflow>,
    pending: VecDeque<Command>,
    saga: CompensationStack,
    phase: Phase,
    in_flight: Vec<String>,
    closed: bool,
}

/// Replay a run's history against the registered workflow code
pub fn replay(
    registry: &WorkflowRegistry,
    history: &[HistoryEvent],
) -> Result<ReplayOutcome, ReplayError> {
    let first = history.first().ok_or(ReplayError::EmptyHistory)?;
    let WorkflowEvent::WorkflowStarted {
        workflow_type,
        input,
        version,
        ..
    } = &first.event
    else {
        return Err(ReplayError::NonDeterminism {
            sequence_no: first.sequence_no,
            message: format!("history starts with {}, not WorkflowStarted", first.kind()),
        });
    };

    let registered = registry.version(workflow_type)?;
    if registered != version {
        return Err(ReplayError::NonDeterminism {
            sequence_no: first.sequence_no,
            message: format!(
                "run started under {workflow_type} version {version}, registered version is {registered}"
            ),
        });
    }

    let mut replayer = Replayer {
        workflow: registry.create(workflow_type, input.clone())?,
        pending: VecDeque::new(),
        saga: CompensationStack::new(),
        phase: Phase::Running,
        in_flight: Vec::new(),
        closed: false,
    };

    let actions = replayer.workflow.on_start();
    replayer.apply(actions);

    for event in &history[1..] {
        replayer.replay_event(event)?;
    }

    Ok(replayer.finish())
}

impl Replayer {
    fn replay_event(&mut self, event: &HistoryEvent) -> Result<(), ReplayError> {
        if self.closed {
            return Err(ReplayError::NonDeterminism {
                sequence_no: event.sequence_no,
                message: format!("{} recorded after the run closed", event.kind()),
            });
        }

        match &event.event {
            WorkflowEvent::ActivityScheduled { attempt: 1, .. }
            | WorkflowEvent::TimerStarted { .. }
            | WorkflowEvent::ActivityCancelRequested { .. }
            | WorkflowEvent::WorkflowCompleted { .. }
            | WorkflowEvent::WorkflowFailed { .. }
            | WorkflowEvent::WorkflowContinuedAsNew { .. }
            | WorkflowEvent::WorkflowTerminated { .. } => self.match_command(event)?,

            WorkflowEvent::WorkflowStarted { .. } => {
                return Err(ReplayError::NonDeterminism {
                    sequence_no: event.sequence_no,
                    message: "WorkflowStarted recorded twice".to_string(),
                });
            }

            // Closed from outside the workflow code
            WorkflowEvent::WorkflowTimedOut { .. } | WorkflowEvent::WorkflowTaskFailed { .. } => {
                self.closed = true;
                self.pending.clear();
            }

            WorkflowEvent::ActivityCompleted {
                activity_id,
                result,
            } => {
                self.resolve(activity_id);
                match &self.phase {
                    Phase::Running => {
                        let actions = self
                            .workflow
                            .on_activity_completed(activity_id, result.clone());
                        self.apply(actions);
                    }
                    Phase::Compensating {
                        activity_id: current,
                        ..
                    } if current == activity_id => self.compensation_completed(),
                    _ => debug!(%activity_id, "ignoring result of an abandoned activity"),
                }
            }

            WorkflowEvent::ActivityFailed {
                activity_id, error, ..
            } => {
                self.resolve(activity_id);
                match &self.phase {
                    Phase::Running => {
                        let actions = self.workflow.on_activity_failed(activity_id, error);
                        self.apply(actions);
                    }
                    Phase::Compensating {
                        activity_id: current,
                        ..
                    } if current == activity_id => self.compensation_failed(error),
                    _ => debug!(%activity_id, "ignoring failure of an abandoned activity"),
                }
            }

            WorkflowEvent::TimerFired { timer_id } => {
                if matches!(self.phase, Phase::Running) {
                    let actions = self.workflow.on_timer_fired(timer_id);
                    self.apply(actions);
                }
            }

            WorkflowEvent::SignalReceived { signal } => {
                if matches!(self.phase, Phase::Running) {
                    let actions = self.workflow.on_signal(signal);
                    self.apply(actions);
                }
            }

            WorkflowEvent::CancelRequested { reason } => {
                if matches!(self.phase, Phase::Running) {
                    let actions = self.workflow.on_cancel_requested(reason);
                    self.apply(actions);
                }
            }

            // Retries and attempt timeouts are the dispatcher's business
            WorkflowEvent::ActivityScheduled { .. } | WorkflowEvent::ActivityTimedOut { .. } => {}
        }

        Ok(())
    }

    fn match_command(&mut self, event: &HistoryEvent) -> Result<(), ReplayError> {
        let Some(command) = self.pending.pop_front() else {
            return Err(ReplayError::NonDeterminism {
                sequence_no: event.sequence_no,
                message: format!(
                    "history has {} but the workflow produced no command",
                    event.kind()
                ),
            });
        };

        if let Some(message) = command.mismatch(&event.event) {
            return Err(ReplayError::NonDeterminism {
                sequence_no: event.sequence_no,
                message,
            });
        }

        if command.is_terminal() {
            self.closed = true;
        }
        Ok(())
    }

    fn apply(&mut self, actions: Vec<WorkflowAction>) {
        for action in actions {
            if !matches!(self.phase, Phase::Running) {
                debug!(?action, "ignoring action after the run started closing");
                continue;
            }

            match action {
                WorkflowAction::ScheduleActivity {
                    activity_id,
                    activity_type,
                    input,
                    options,
                } => self.schedule(activity_id, activity_type, input, options),

                WorkflowAction::StartTimer { timer_id, duration } => {
                    self.pending
                        .push_back(Command::StartTimer { timer_id, duration });
                }

                WorkflowAction::RegisterCompensation {
                    activity_type,
                    input,
                    options,
                } => self.saga.push(CompensationEntry {
                    activity_type,
                    input,
                    options,
                }),

                WorkflowAction::CancelActivity { activity_id } => {
                    if self.resolve(&activity_id) {
                        self.pending
                            .push_back(Command::CancelActivity { activity_id });
                    }
                }

                WorkflowAction::CompleteWorkflow { result } => {
                    self.saga.clear();
                    self.close(Command::CompleteWorkflow { result });
                }

                WorkflowAction::ContinueAsNew { input } => {
                    self.saga.clear();
                    self.close(Command::ContinueAsNew { input });
                }

                WorkflowAction::FailWorkflow { error } => match self.saga.pop() {
                    Some((index, entry)) => {
                        // Forward steps still running are cancelled before unwinding
                        self.cancel_in_flight();
                        self.compensate(error, index, entry);
                    }
                    None => self.close(Command::FailWorkflow {
                        error,
                        uncompensated: vec![],
                    }),
                },

                WorkflowAction::Terminate { reason } => {
                    self.cancel_in_flight();
                    self.close(Command::TerminateWorkflow { reason });
                }
            }
        }
    }

    fn schedule(
        &mut self,
        activity_id: String,
        activity_type: String,
        input: serde_json::Value,
        options: ActivityOptions,
    ) {
        self.in_flight.push(activity_id.clone());
        self.pending.push_back(Command::ScheduleActivity {
            activity_id,
            activity_type,
            input,
            options,
        });
    }

    fn cancel_in_flight(&mut self) {
        for activity_id in std::mem::take(&mut self.in_flight) {
            self.pending
                .push_back(Command::CancelActivity { activity_id });
        }
    }

    fn compensate(&mut self, error: WorkflowError, index: usize, entry: CompensationEntry) {
        let activity_id = compensation_activity_id(index, &entry.activity_type);
        self.schedule(
            activity_id.clone(),
            entry.activity_type.clone(),
            entry.input.clone(),
            entry.options.clone(),
        );
        self.phase = Phase::Compensating {
            error,
            activity_id,
            entry,
        };
    }

    fn compensation_completed(&mut self) {
        let Phase::Compensating { error, .. } = std::mem::replace(&mut self.phase, Phase::Closing)
        else {
            return;
        };

        match self.saga.pop() {
            Some((index, entry)) => self.compensate(error, index, entry),
            None => self.pending.push_back(Command::FailWorkflow {
                error,
                uncompensated: vec![],
            }),
        }
    }

    fn compensation_failed(&mut self, failure: &ActivityError) {
        let Phase::Compensating { error, entry, .. } =
            std::mem::replace(&mut self.phase, Phase::Closing)
        else {
            return;
        };

        debug!(
            activity_type = %entry.activity_type,
            error = %failure.message,
            "compensation failed, abandoning remaining compensations"
        );
        let mut uncompensated = vec![entry];
        uncompensated.extend(self.saga.entries());
        self.saga.clear();
        self.pending.push_back(Command::FailWorkflow {
            error,
            uncompensated,
        });
    }

    fn close(&mut self, command: Command) {
        self.pending.push_back(command);
        self.phase = Phase::Closing;
    }

    /// Drop an activity from the in-flight list, returning whether it was there
    fn resolve(&mut self, activity_id: &str) -> bool {
        let before = self.in_flight.len();
        self.in_flight.retain(|id| id != activity_id);
        self.in_flight.len() != before
    }

    fn finish(self) -> ReplayOutcome {
        ReplayOutcome {
            commands: if self.closed {
                vec![]
            } else {
                self.pending.into()
            },
            compensating: matches!(self.phase, Phase::Compensating { .. }),
            closed: self.closed,
            in_flight: self.in_flight,
        }
    }
}

// =============================================================================
// Recovery views
// =============================================================================

/// An activity whose first attempt is recorded but which has no outcome yet
#[derive(Debug, Clone, PartialEq)]
pub struct PendingActivity {
    pub activity_id: String,
    pub activity_type: String,
    pub task_queue: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,

    /// Latest recorded attempt
    pub attempt: u32,

    /// When attempt 1 was recorded
    pub first_scheduled_at: DateTime<Utc>,

    /// The workflow asked for it to be cancelled
    pub cancel_requested: bool,
}

/// A started timer that has not fired
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTimer {
    pub timer_id: String,
    pub fire_at: DateTime<Utc>,
}

fn is_closed(history: &[HistoryEvent]) -> bool {
    history.last().is_some_and(|e| e.event.is_terminal())
}

/// Unresolved activities of an open run, in schedule order
pub fn pending_activities(history: &[HistoryEvent]) -> Vec<PendingActivity> {
    if is_closed(history) {
        return vec![];
    }

    let mut order: Vec<String> = Vec::new();
    let mut pending: HashMap<String, PendingActivity> = HashMap::new();

    for event in history {
        match &event.event {
            WorkflowEvent::ActivityScheduled {
                activity_id,
                activity_type,
                task_queue,
                input,
                options,
                attempt,
                ..
            } => {
                if let Some(existing) = pending.get_mut(activity_id) {
                    existing.attempt = *attempt;
                    existing.task_queue = task_queue.clone();
                } else {
                    order.push(activity_id.clone());
                    pending.insert(
                        activity_id.clone(),
                        PendingActivity {
                            activity_id: activity_id.clone(),
                            activity_type: activity_type.clone(),
                            task_queue: task_queue.clone(),
                            input: input.clone(),
                            options: options.clone(),
                            attempt: *attempt,
                            first_scheduled_at: event.timestamp,
                            cancel_requested: false,
                        },
                    );
                }
            }
            WorkflowEvent::ActivityCancelRequested { activity_id } => {
                if let Some(existing) = pending.get_mut(activity_id) {
                    existing.cancel_requested = true;
                }
            }
            WorkflowEvent::ActivityCompleted { activity_id, .. }
            | WorkflowEvent::ActivityFailed { activity_id, .. } => {
                pending.remove(activity_id);
            }
            _ => {}
        }
    }

    order
        .into_iter()
        .filter_map(|id| pending.remove(&id))
        .collect()
}

/// Timers of an open run that have not fired
pub fn pending_timers(history: &[HistoryEvent]) -> Vec<PendingTimer> {
    if is_closed(history) {
        return vec![];
    }

    let mut timers: Vec<PendingTimer> = Vec::new();
    for event in history {
        match &event.event {
            WorkflowEvent::TimerStarted {
                timer_id,
                duration_ms,
            } => {
                let duration = chrono::Duration::milliseconds(*duration_ms as i64);
                timers.push(PendingTimer {
                    timer_id: timer_id.clone(),
                    fire_at: event.timestamp + duration,
                });
            }
            WorkflowEvent::TimerFired { timer_id } => {
                timers.retain(|t| &t.timer_id != timer_id);
            }
            _ => {}
        }
    }
    timers
}

/// Start time and execution timeout of an open run
pub fn execution_deadline(history: &[HistoryEvent]) -> Option<(DateTime<Utc>, Duration)> {
    if is_closed(history) {
        return None;
    }

    match history.first().map(|e| (&e.event, e.timestamp)) {
        Some((
            WorkflowEvent::WorkflowStarted {
                execution_timeout_ms: Some(ms),
                ..
            },
            started_at,
        )) => Some((started_at, Duration::from_millis(*ms))),
        _ => None,
    }
}
