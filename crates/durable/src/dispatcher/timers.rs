//! Durable timers and execution deadlines

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::engine::replay::{execution_deadline, pending_timers};
use crate::persistence::{append_with_retry, RunInfo, StoreError, WorkflowEventStore};
use crate::queue::{QueueTask, TaskQueueRouter, WorkflowTask};
use crate::workflow::{HistoryEvent, WorkflowEvent};

const EXECUTION_TIMER: &str = "$execution-timeout";

/// Fires workflow timers and execution timeouts
///
/// Every timer is recorded in the history before it is armed here, so the
/// service holds nothing that cannot be rebuilt with [`TimerService::recover`].
pub struct TimerService {
    store: Arc<dyn WorkflowEventStore>,
    router: Arc<TaskQueueRouter>,
    append_retry_attempts: u32,
    timers: DashMap<(Uuid, String), JoinHandle<()>>,
}

impl TimerService {
    pub fn new(
        store: Arc<dyn WorkflowEventStore>,
        router: Arc<TaskQueueRouter>,
        append_retry_attempts: u32,
    ) -> Self {
        Self {
            store,
            router,
            append_retry_attempts,
            timers: DashMap::new(),
        }
    }

    /// Arm a workflow timer; fires `TimerFired` at `fire_at`
    pub fn start_timer(&self, run: &RunInfo, timer_id: &str, fire_at: DateTime<Utc>) {
        debug!(run_id = %run.run_id, %timer_id, %fire_at, "arming timer");
        let event = WorkflowEvent::TimerFired {
            timer_id: timer_id.to_string(),
        };
        self.arm(run, timer_id.to_string(), fire_at, event);
    }

    /// Arm the deadline of a whole run; fires `WorkflowTimedOut`
    pub fn start_execution_timeout(
        &self,
        run: &RunInfo,
        started_at: DateTime<Utc>,
        timeout: Duration,
    ) {
        let fire_at = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|t| started_at.checked_add_signed(t))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        debug!(run_id = %run.run_id, %fire_at, "arming execution timeout");
        let event = WorkflowEvent::WorkflowTimedOut {
            timeout_ms: timeout.as_millis() as u64,
        };
        self.arm(run, EXECUTION_TIMER.to_string(), fire_at, event);
    }

    /// Disarm every timer of a run
    pub fn cancel_run(&self, run_id: Uuid) -> usize {
        let mut cancelled = 0;
        self.timers.retain(|(run, _), handle| {
            if *run == run_id {
                handle.abort();
                cancelled += 1;
                false
            } else {
                true
            }
        });
        cancelled
    }

    /// Re-arm the unfired timers of a run after a restart
    pub fn recover(&self, run: &RunInfo, history: &[HistoryEvent]) -> usize {
        let timers = pending_timers(history);
        for timer in &timers {
            self.start_timer(run, &timer.timer_id, timer.fire_at);
        }

        let mut recovered = timers.len();
        if let Some((started_at, timeout)) = execution_deadline(history) {
            self.start_execution_timeout(run, started_at, timeout);
            recovered += 1;
        }

        if recovered > 0 {
            info!(run_id = %run.run_id, recovered, "recovered timers");
        }
        recovered
    }

    /// Number of armed timers
    pub fn active_count(&self) -> usize {
        self.timers.iter().filter(|h| !h.is_finished()).count()
    }

    fn arm(&self, run: &RunInfo, key: String, fire_at: DateTime<Utc>, event: WorkflowEvent) {
        self.timers.retain(|_, handle| !handle.is_finished());

        let store = Arc::clone(&self.store);
        let router = Arc::clone(&self.router);
        let attempts = self.append_retry_attempts;
        let workflow_task = WorkflowTask::for_run(run);

        let handle = tokio::spawn(async move {
            let delay = fire_at
                .signed_duration_since(Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::time::sleep(delay).await;
            fire(store.as_ref(), &router, workflow_task, event, attempts).await;
        });

        if let Some(previous) = self.timers.insert((run.run_id, key), handle) {
            previous.abort();
        }
    }
}

async fn fire(
    store: &dyn WorkflowEventStore,
    router: &TaskQueueRouter,
    task: WorkflowTask,
    event: WorkflowEvent,
    attempts: u32,
) {
    let kind = event.kind();
    match append_with_retry(store, task.run_id, event, attempts).await {
        Ok(sequence_no) => {
            debug!(run_id = %task.run_id, %kind, sequence_no, "timer fired");
            let task_queue = task.task_queue.clone();
            if let Err(e) = router.enqueue(&task_queue, QueueTask::Workflow(task)) {
                error!("Failed to enqueue workflow task after timer: {}", e);
            }
        }
        Err(StoreError::RunClosed(_)) => {
            debug!(run_id = %task.run_id, %kind, "run closed before timer fired");
        }
        Err(e) => {
            error!(run_id = %task.run_id, %kind, "Failed to record timer: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryWorkflowEventStore, NewRun, RunStatus};
    use serde_json::json;

    async fn setup() -> (Arc<InMemoryWorkflowEventStore>, Arc<TaskQueueRouter>, RunInfo) {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let router = Arc::new(TaskQueueRouter::default());
        let run = store
            .create_run(NewRun {
                workflow_id: "timer-1".to_string(),
                run_id: Uuid::now_v7(),
                workflow_type: "sleepy".to_string(),
                task_queue: "default".to_string(),
                version: "1".to_string(),
                input: json!(null),
                continued_from: None,
                execution_timeout: None,
            })
            .await
            .unwrap();
        (store, router, run)
    }

    #[tokio::test]
    async fn test_timer_fires_and_wakes_workflow() {
        let (store, router, run) = setup().await;
        let timers = TimerService::new(store.clone(), router.clone(), 5);

        timers.start_timer(&run, "nap", Utc::now() + chrono::Duration::milliseconds(10));
        tokio::time::sleep(Duration::from_millis(60)).await;

        let events = store.load_events(run.run_id).await.unwrap();
        assert!(matches!(
            &events.last().unwrap().event,
            WorkflowEvent::TimerFired { timer_id } if timer_id == "nap"
        ));
        assert_eq!(router.queue_depth("default"), 1);
    }

    #[tokio::test]
    async fn test_execution_timeout_closes_run() {
        let (store, router, run) = setup().await;
        let timers = TimerService::new(store.clone(), router, 5);

        timers.start_execution_timeout(&run, Utc::now(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(60)).await;

        let run = store.get_run(run.run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_cancel_run_disarms() {
        let (store, router, run) = setup().await;
        let timers = TimerService::new(store.clone(), router, 5);

        timers.start_timer(&run, "later", Utc::now() + chrono::Duration::milliseconds(20));
        assert_eq!(timers.cancel_run(run.run_id), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.load_events(run.run_id).await.unwrap().len(), 1);
        assert_eq!(timers.active_count(), 0);
    }
}
