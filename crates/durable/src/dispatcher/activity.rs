//! Activity dispatch, retries and timeouts

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::activity::{ActivityError, CancellationHandle};
use crate::duration_serde;
use crate::engine::replay::pending_activities;
use crate::persistence::{append_with_retry, RunInfo, StoreError, WorkflowEventStore};
use crate::queue::{ActivityTask, QueueTask, RouterError, TaskQueueRouter, WorkflowTask};
use crate::reliability::{detect_timeout, RetryDecision, RetryState, TimeoutViolation};
use crate::workflow::{HistoryEvent, TimeoutType, WorkflowEvent};

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// How often the sweeper checks activity timeouts
    #[serde(with = "duration_serde")]
    pub sweep_interval: Duration,

    /// Attempts for appends racing other writers
    pub append_retry_attempts: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
            append_retry_attempts: 10,
        }
    }
}

impl DispatcherConfig {
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Errors from dispatcher operations
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Router error
    #[error("router error: {0}")]
    Router(#[from] RouterError),
}

/// Attempt owned by the dispatcher
struct InFlight {
    task: ActivityTask,
    retry: RetryState,
    cancel: CancellationHandle,
    cancel_requested: bool,
    /// Failed and waiting for its retry delay
    in_backoff: bool,
    /// Its outcome is being appended
    recording: bool,
}

/// Hands activity attempts to workers and turns their outcomes into events
///
/// The dispatcher owns every activity between its scheduling and its
/// terminal outcome. Attempts are keyed by task id; an outcome reported for
/// an attempt that is no longer current is dropped.
///
/// An attempt stays tracked until its outcome is in the log. Workflow wakes
/// the router refuses are parked and re-queued by the sweeper.
pub struct ActivityDispatcher {
    store: Arc<dyn WorkflowEventStore>,
    router: Arc<TaskQueueRouter>,
    config: DispatcherConfig,
    in_flight: DashMap<Uuid, InFlight>,
    by_activity: DashMap<(Uuid, String), Uuid>,
    pending_wakes: DashMap<Uuid, WorkflowTask>,
}

impl ActivityDispatcher {
    pub fn new(
        store: Arc<dyn WorkflowEventStore>,
        router: Arc<TaskQueueRouter>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            router,
            config,
            in_flight: DashMap::new(),
            by_activity: DashMap::new(),
            pending_wakes: DashMap::new(),
        }
    }

    /// Take ownership of an attempt and queue it
    ///
    /// The attempt must already be recorded as `ActivityScheduled`.
    #[instrument(skip(self, task), fields(run_id = %task.run_id, activity_id = %task.activity_id, attempt = task.attempt))]
    pub fn dispatch(
        &self,
        task: ActivityTask,
        first_scheduled_at: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        let key = (task.run_id, task.activity_id.clone());
        if let Some(previous) = self.by_activity.insert(key, task.task_id) {
            if let Some((_, stale)) = self.in_flight.remove(&previous) {
                stale.cancel.cancel();
            }
        }

        self.in_flight.insert(
            task.task_id,
            InFlight {
                task: task.clone(),
                retry: RetryState::new(task.attempt, first_scheduled_at),
                cancel: CancellationHandle::new(),
                cancel_requested: false,
                in_backoff: false,
                recording: false,
            },
        );

        let task_queue = task.task_queue.clone();
        debug!(%task_queue, activity_type = %task.activity_type, "dispatching activity");
        self.router.enqueue(&task_queue, QueueTask::Activity(task))?;
        Ok(())
    }

    /// A worker picked up an attempt
    ///
    /// Returns `None` for stale or cancelled attempts, which must not run.
    pub fn record_started(&self, task_id: Uuid) -> Option<CancellationHandle> {
        let mut entry = self.in_flight.get_mut(&task_id)?;
        if entry.cancel_requested || entry.in_backoff {
            return None;
        }
        entry.retry.started_at = Some(Utc::now());
        Some(entry.cancel.clone())
    }

    /// A running attempt reported liveness
    pub fn record_heartbeat(&self, task_id: Uuid) -> bool {
        match self.in_flight.get_mut(&task_id) {
            Some(mut entry) if !entry.in_backoff => {
                entry.retry.last_heartbeat_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Record a successful attempt
    ///
    /// Returns `false` if the attempt was stale and nothing was recorded.
    #[instrument(skip(self, result))]
    pub async fn complete(
        &self,
        task_id: Uuid,
        result: serde_json::Value,
    ) -> Result<bool, DispatchError> {
        let Some(task) = self.claim(task_id, |e| !e.in_backoff) else {
            debug!("ignoring result of stale attempt");
            return Ok(false);
        };

        info!(
            run_id = %task.run_id,
            activity_id = %task.activity_id,
            attempt = task.attempt,
            "activity completed"
        );
        let event = WorkflowEvent::ActivityCompleted {
            activity_id: task.activity_id.clone(),
            result,
        };
        self.settle(&task, event).await?;
        Ok(true)
    }

    /// Record a failed attempt and retry it or give up
    ///
    /// Returns `false` if the attempt was stale and nothing was recorded.
    #[instrument(skip(self, error), fields(error = %error.message))]
    pub async fn fail(
        self: &Arc<Self>,
        task_id: Uuid,
        error: ActivityError,
    ) -> Result<bool, DispatchError> {
        let (decision, task, attempts, cancelled) = {
            let Some(mut entry) = self.in_flight.get_mut(&task_id) else {
                debug!("ignoring failure of stale attempt");
                return Ok(false);
            };
            if entry.in_backoff || entry.recording {
                return Ok(false);
            }

            let decision = if entry.cancel_requested {
                RetryDecision::GiveUp
            } else {
                let policy = entry.task.options.retry_policy.clone();
                entry.retry.on_failure(&policy, &error)
            };

            let decision = match decision {
                RetryDecision::Retry { delay, .. }
                    if exceeds_schedule_to_close(&entry.retry, &entry.task, delay) =>
                {
                    debug!("next attempt would start after schedule-to-close, giving up");
                    RetryDecision::GiveUp
                }
                other => other,
            };

            if matches!(decision, RetryDecision::Retry { .. }) {
                entry.in_backoff = true;
            }
            (
                decision,
                entry.task.clone(),
                entry.retry.attempts,
                entry.cancel_requested,
            )
        };

        match decision {
            RetryDecision::GiveUp => {
                let error = if cancelled {
                    ActivityError::cancelled("activity cancelled")
                } else {
                    error
                };
                self.finish_failed(task_id, error, attempts).await?;
            }
            RetryDecision::Retry {
                next_attempt,
                delay,
            } => {
                warn!(
                    run_id = %task.run_id,
                    activity_id = %task.activity_id,
                    attempt = attempts,
                    next_attempt,
                    ?delay,
                    error = %error.message,
                    "activity attempt failed, retrying"
                );
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    let mut wait = delay;
                    loop {
                        tokio::time::sleep(wait).await;
                        match this.start_retry(task_id, next_attempt, error.clone()).await {
                            Ok(()) => break,
                            Err(e) => {
                                error!(%task_id, "failed to schedule retry: {}", e);
                                wait = delay.max(this.config.sweep_interval);
                            }
                        }
                    }
                });
            }
        }
        Ok(true)
    }

    /// Ask an activity to stop and record it as cancelled
    ///
    /// A queued or backing-off attempt fails right away with a `cancelled`
    /// error. A running attempt sees its cancellation flag and its outcome
    /// is recorded when it returns; no further retries happen.
    #[instrument(skip(self))]
    pub async fn cancel(&self, run_id: Uuid, activity_id: &str) -> Result<bool, DispatchError> {
        let Some(task_id) = self
            .by_activity
            .get(&(run_id, activity_id.to_string()))
            .map(|id| *id)
        else {
            return Ok(false);
        };

        let (idle, task, attempts) = {
            let Some(mut entry) = self.in_flight.get_mut(&task_id) else {
                return Ok(false);
            };
            entry.cancel_requested = true;
            entry.cancel.cancel();
            let idle =
                !entry.recording && (entry.in_backoff || entry.retry.started_at.is_none());
            (idle, entry.task.clone(), entry.retry.attempts)
        };

        info!(attempt = attempts, "activity cancellation requested");
        if idle {
            self.router.remove_activity(&task.task_queue, task_id);
            self.finish_failed(task_id, ActivityError::cancelled("activity cancelled"), attempts)
                .await?;
        }
        Ok(true)
    }

    /// Drop every attempt of a closed run
    ///
    /// Raises cancellation flags and removes queued attempts; nothing is
    /// recorded because the run no longer accepts events.
    pub fn cancel_run(&self, run_id: Uuid) -> usize {
        let task_ids: Vec<Uuid> = self
            .by_activity
            .iter()
            .filter(|e| e.key().0 == run_id)
            .map(|e| *e.value())
            .collect();
        self.by_activity.retain(|(run, _), _| *run != run_id);
        self.pending_wakes.remove(&run_id);

        for task_id in &task_ids {
            if let Some((_, entry)) = self.in_flight.remove(task_id) {
                entry.cancel.cancel();
                self.router.remove_activity(&entry.task.task_queue, *task_id);
            }
        }

        if !task_ids.is_empty() {
            debug!(%run_id, count = task_ids.len(), "dropped activities of closed run");
        }
        task_ids.len()
    }

    /// Re-dispatch unresolved activities of a run after a restart
    #[instrument(skip(self, run, history), fields(run_id = %run.run_id))]
    pub async fn recover(
        &self,
        run: &RunInfo,
        history: &[HistoryEvent],
    ) -> Result<usize, DispatchError> {
        let mut recovered = 0;
        for pending in pending_activities(history) {
            if self
                .by_activity
                .contains_key(&(run.run_id, pending.activity_id.clone()))
            {
                continue;
            }

            let task = ActivityTask::new(
                run,
                pending.activity_id,
                pending.activity_type,
                pending.task_queue,
                pending.input,
                pending.options,
                pending.attempt,
            );

            if pending.cancel_requested {
                let event = WorkflowEvent::ActivityFailed {
                    activity_id: task.activity_id.clone(),
                    error: ActivityError::cancelled("activity cancelled"),
                    attempts: task.attempt,
                };
                if self.append_outcome(&task, event).await? {
                    self.wake(&task);
                }
            } else {
                self.dispatch(task, pending.first_scheduled_at)?;
            }
            recovered += 1;
        }

        if recovered > 0 {
            info!(recovered, "recovered pending activities");
        }
        Ok(recovered)
    }

    /// Check every attempt against its timeouts
    ///
    /// Also re-queues parked workflow wakes.
    pub async fn sweep_timeouts(self: &Arc<Self>) -> Result<usize, DispatchError> {
        self.requeue_wakes();

        let now = Utc::now();
        let violations: Vec<(Uuid, TimeoutViolation)> = self
            .in_flight
            .iter()
            .filter(|e| !e.in_backoff && !e.cancel_requested && !e.recording)
            .filter_map(|e| detect_timeout(&e.retry, &e.task.options, now).map(|v| (*e.key(), v)))
            .collect();

        let count = violations.len();
        for (task_id, violation) in violations {
            self.handle_timeout(task_id, violation).await?;
        }
        Ok(count)
    }

    /// Run the timeout sweeper until shutdown
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_timeouts().await {
                        error!("Timeout sweep failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    debug!("Sweeper: shutdown requested");
                    break;
                }
            }
        }
    }

    /// Number of activities owned by the dispatcher
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Workflow wakes waiting for room in their queue
    pub fn pending_wake_count(&self) -> usize {
        self.pending_wakes.len()
    }

    /// Whether an activity of a run is still owned by the dispatcher
    pub fn is_tracking(&self, run_id: Uuid, activity_id: &str) -> bool {
        self.by_activity
            .contains_key(&(run_id, activity_id.to_string()))
    }

    // =========================================================================
    // Internal Methods
    // =========================================================================

    async fn handle_timeout(
        self: &Arc<Self>,
        task_id: Uuid,
        violation: TimeoutViolation,
    ) -> Result<(), DispatchError> {
        let Some((task, attempts, cancel)) = self
            .in_flight
            .get(&task_id)
            .filter(|e| !e.recording)
            .map(|e| (e.task.clone(), e.retry.attempts, e.cancel.clone()))
        else {
            return Ok(());
        };

        warn!(
            run_id = %task.run_id,
            activity_id = %task.activity_id,
            attempt = attempts,
            "activity {}",
            violation
        );

        let event = WorkflowEvent::ActivityTimedOut {
            activity_id: task.activity_id.clone(),
            attempt: attempts,
            timeout_type: violation.timeout_type,
        };
        match append_with_retry(
            self.store.as_ref(),
            task.run_id,
            event,
            self.config.append_retry_attempts,
        )
        .await
        {
            Ok(_) => {}
            Err(StoreError::RunClosed(_)) => {
                self.cancel_run(task.run_id);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        // The timed-out attempt may still be queued or running
        self.router.remove_activity(&task.task_queue, task_id);
        cancel.cancel();

        let error = ActivityError::timeout(violation.timeout_type);
        if violation.timeout_type == TimeoutType::ScheduleToClose {
            self.finish_failed(task_id, error, attempts).await?;
        } else {
            self.fail(task_id, error).await?;
        }
        Ok(())
    }

    async fn start_retry(
        &self,
        task_id: Uuid,
        next_attempt: u32,
        last_failure: ActivityError,
    ) -> Result<(), DispatchError> {
        // Cancelled or dropped while backing off
        let Some(task) = self
            .claim(task_id, |e| e.in_backoff)
            .map(|task| task.next_attempt(next_attempt))
        else {
            return Ok(());
        };

        let event = WorkflowEvent::ActivityScheduled {
            activity_id: task.activity_id.clone(),
            activity_type: task.activity_type.clone(),
            task_queue: task.task_queue.clone(),
            input: task.input.clone(),
            options: task.options.clone(),
            attempt: next_attempt,
            last_failure: Some(last_failure),
        };

        match append_with_retry(
            self.store.as_ref(),
            task.run_id,
            event,
            self.config.append_retry_attempts,
        )
        .await
        {
            Ok(_) => {}
            Err(StoreError::RunClosed(_)) => {
                if let Some((_, entry)) = self.in_flight.remove(&task_id) {
                    self.release(&entry.task);
                }
                debug!(run_id = %task.run_id, "run closed during backoff, dropping retry");
                return Ok(());
            }
            Err(e) => {
                if let Some(mut entry) = self.in_flight.get_mut(&task_id) {
                    entry.recording = false;
                }
                return Err(e.into());
            }
        }

        let Some((_, mut entry)) = self.in_flight.remove(&task_id) else {
            return Ok(());
        };
        entry.retry.begin_attempt(next_attempt);
        entry.in_backoff = false;
        entry.recording = false;
        entry.task = task.clone();
        let cancelled = entry.cancel_requested;
        self.by_activity
            .insert((task.run_id, task.activity_id.clone()), task.task_id);
        self.in_flight.insert(task.task_id, entry);

        // Cancelled while the retry was being recorded
        if cancelled {
            let error = ActivityError::cancelled("activity cancelled");
            return self.finish_failed(task.task_id, error, next_attempt).await;
        }

        debug!(run_id = %task.run_id, activity_id = %task.activity_id, attempt = next_attempt, "retrying activity");
        self.router
            .enqueue(&task.task_queue.clone(), QueueTask::Activity(task))?;
        Ok(())
    }

    async fn finish_failed(
        &self,
        task_id: Uuid,
        error: ActivityError,
        attempts: u32,
    ) -> Result<(), DispatchError> {
        let Some(task) = self.claim(task_id, |_| true) else {
            return Ok(());
        };

        warn!(
            run_id = %task.run_id,
            activity_id = %task.activity_id,
            attempts,
            error = %error.message,
            "activity failed"
        );
        let event = WorkflowEvent::ActivityFailed {
            activity_id: task.activity_id.clone(),
            error,
            attempts,
        };
        self.settle(&task, event).await
    }

    /// Mark an attempt as recording its outcome
    ///
    /// Returns `None` if the attempt is gone, already recording, or refused
    /// by `accept`.
    fn claim(
        &self,
        task_id: Uuid,
        accept: impl FnOnce(&InFlight) -> bool,
    ) -> Option<ActivityTask> {
        let mut entry = self.in_flight.get_mut(&task_id)?;
        if entry.recording || !accept(entry.value()) {
            return None;
        }
        entry.recording = true;
        Some(entry.task.clone())
    }

    /// Record the outcome of a claimed attempt, then stop tracking it
    ///
    /// If the append fails the attempt stays tracked so its timeouts still fire.
    async fn settle(&self, task: &ActivityTask, event: WorkflowEvent) -> Result<(), DispatchError> {
        let appended = match self.append_outcome(task, event).await {
            Ok(appended) => appended,
            Err(e) => {
                if let Some(mut entry) = self.in_flight.get_mut(&task.task_id) {
                    entry.recording = false;
                }
                return Err(e);
            }
        };

        self.in_flight.remove(&task.task_id);
        self.release(task);
        if appended {
            self.wake(task);
        }
        Ok(())
    }

    /// Append an outcome, returning `false` if the run had already closed
    async fn append_outcome(
        &self,
        task: &ActivityTask,
        event: WorkflowEvent,
    ) -> Result<bool, DispatchError> {
        match append_with_retry(
            self.store.as_ref(),
            task.run_id,
            event,
            self.config.append_retry_attempts,
        )
        .await
        {
            Ok(_) => Ok(true),
            Err(StoreError::RunClosed(_)) => {
                debug!(run_id = %task.run_id, "run closed, dropping activity outcome");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Queue a workflow task for the run, parking it if the queue refuses
    fn wake(&self, task: &ActivityTask) {
        let workflow_task = WorkflowTask {
            run_id: task.run_id,
            workflow_id: task.workflow_id.clone(),
            workflow_type: task.workflow_type.clone(),
            task_queue: task.workflow_task_queue.clone(),
        };
        let queued = self.router.enqueue(
            &task.workflow_task_queue,
            QueueTask::Workflow(workflow_task.clone()),
        );
        if let Err(e) = queued {
            warn!(run_id = %task.run_id, "workflow wake deferred: {}", e);
            self.pending_wakes.insert(task.run_id, workflow_task);
        }
    }

    fn requeue_wakes(&self) {
        let parked: Vec<WorkflowTask> = self
            .pending_wakes
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for workflow_task in parked {
            let run_id = workflow_task.run_id;
            let task_queue = workflow_task.task_queue.clone();
            match self.router.enqueue(&task_queue, QueueTask::Workflow(workflow_task)) {
                Ok(_) => {
                    self.pending_wakes.remove(&run_id);
                    debug!(%run_id, "deferred workflow wake queued");
                }
                Err(RouterError::QueueFull(_)) => {}
                Err(e) => warn!(%run_id, "deferred workflow wake failed: {}", e),
            }
        }
    }

    fn release(&self, task: &ActivityTask) {
        self.by_activity
            .remove_if(&(task.run_id, task.activity_id.clone()), |_, id| {
                *id == task.task_id
            });
    }
}

fn exceeds_schedule_to_close(retry: &RetryState, task: &ActivityTask, delay: Duration) -> bool {
    let Some(limit) = task.options.schedule_to_close_timeout else {
        return false;
    };
    let Some(next_start) = chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| Utc::now().checked_add_signed(delay))
    else {
        return true;
    };
    next_start
        .signed_duration_since(retry.first_scheduled_at)
        .to_std()
        .is_ok_and(|elapsed| elapsed > limit)
}
