//! End-to-end tests for the in-process runtime
//!
//! Every test runs a real `DurableRuntime` with workflow pollers and an
//! activity worker pool against the in-memory store.

mod common;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keelrun_durable::prelude::*;
use keelrun_durable::queue::RouterConfig;
use keelrun_durable::workflow::{EventKind, TimeoutType};
use serde_json::json;

use common::{count, kinds, WAIT};

// =============================================================================
// Test workflows
// =============================================================================

/// Runs one activity with the options given in its input
struct SingleActivity {
    options: ActivityOptions,
}

impl Workflow for SingleActivity {
    const TYPE: &'static str = "single_activity";
    type Input = ActivityOptions;
    type Output = serde_json::Value;

    fn new(input: Self::Input) -> Self {
        Self { options: input }
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        vec![WorkflowAction::schedule_activity_with(
            "work",
            "Work",
            json!({}),
            self.options.clone(),
        )]
    }

    fn on_activity_completed(
        &mut self,
        _activity_id: &str,
        result: serde_json::Value,
    ) -> Vec<WorkflowAction> {
        vec![WorkflowAction::complete(result)]
    }

    fn on_activity_failed(
        &mut self,
        _activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction> {
        vec![WorkflowAction::fail(WorkflowError::from(error))]
    }
}

/// Waits for an `approve` signal or a deadline timer
struct Approval {
    deadline_ms: u64,
}

impl Workflow for Approval {
    const TYPE: &'static str = "approval";
    type Input = u64;
    type Output = serde_json::Value;

    fn new(input: Self::Input) -> Self {
        Self { deadline_ms: input }
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        vec![WorkflowAction::timer(
            "deadline",
            Duration::from_millis(self.deadline_ms),
        )]
    }

    fn on_activity_completed(&mut self, _: &str, _: serde_json::Value) -> Vec<WorkflowAction> {
        vec![]
    }

    fn on_activity_failed(&mut self, _: &str, _: &ActivityError) -> Vec<WorkflowAction> {
        vec![]
    }

    fn on_timer_fired(&mut self, timer_id: &str) -> Vec<WorkflowAction> {
        vec![WorkflowAction::complete(json!({ "expired": timer_id }))]
    }

    fn on_signal(&mut self, signal: &WorkflowSignal) -> Vec<WorkflowAction> {
        if signal.is("approve") {
            vec![WorkflowAction::complete(signal.payload.clone())]
        } else {
            vec![]
        }
    }
}

/// Counts up by continuing as new until `n == limit`
struct Countdown {
    n: u32,
    limit: u32,
}

impl Workflow for Countdown {
    const TYPE: &'static str = "countdown";
    type Input = (u32, u32);
    type Output = u32;

    fn new((n, limit): Self::Input) -> Self {
        Self { n, limit }
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        if self.n >= self.limit {
            return vec![WorkflowAction::complete(json!(self.n))];
        }
        vec![WorkflowAction::schedule_activity("tick", "Tick", json!(self.n))]
    }

    fn on_activity_completed(&mut self, _: &str, _: serde_json::Value) -> Vec<WorkflowAction> {
        vec![WorkflowAction::continue_as_new(json!([self.n + 1, self.limit]))]
    }

    fn on_activity_failed(&mut self, _: &str, error: &ActivityError) -> Vec<WorkflowAction> {
        vec![WorkflowAction::fail(WorkflowError::from(error))]
    }
}

fn registry() -> WorkflowRegistry {
    WorkflowRegistry::new()
        .with::<SingleActivity>()
        .with::<Approval>()
        .with::<Countdown>()
}

async fn start(
    runtime: &DurableRuntime,
    workflow_id: &str,
    workflow_type: &str,
    input: serde_json::Value,
) -> uuid::Uuid {
    runtime
        .start_workflow(StartWorkflowRequest::new(
            workflow_id,
            common::QUEUE,
            workflow_type,
            input,
        ))
        .await
        .unwrap()
        .run_id
}

fn options(policy: RetryPolicy) -> serde_json::Value {
    serde_json::to_value(ActivityOptions::default().with_retry(policy)).unwrap()
}

// =============================================================================
// Retries and Timeouts
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_flaky_activity_succeeds_on_third_attempt() {
    let (runtime, _store) = common::runtime(registry());
    let calls = Arc::new(AtomicU32::new(0));

    let pool = common::pool(&runtime);
    let counter = Arc::clone(&calls);
    pool.register_handler("Work", move |ctx, _input| {
        let calls = Arc::clone(&counter);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            if ctx.attempt < 3 {
                return Err(ActivityError::retryable("connection reset"));
            }
            Ok(json!({ "attempt": ctx.attempt }))
        }
    });
    pool.start().unwrap();

    let run_id = start(
        &runtime,
        "flaky",
        SingleActivity::TYPE,
        options(RetryPolicy::fixed(Duration::from_millis(10), 5)),
    )
    .await;

    let run = runtime.wait_for_close(run_id, WAIT).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let history = runtime.history(run_id).await.unwrap();
    assert_eq!(count(&history, EventKind::ActivityScheduled), 3);
    assert_eq!(count(&history, EventKind::ActivityFailed), 0);
    match &history.last().unwrap().event {
        WorkflowEvent::WorkflowCompleted { result } => assert_eq!(result["attempt"], 3),
        other => panic!("expected WorkflowCompleted, got {other:?}"),
    }

    pool.shutdown().await.unwrap();
    runtime.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_retries_back_off_exponentially() {
    let (runtime, _store) = common::runtime(registry());
    let pool = common::pool(&runtime);
    pool.register_handler("Work", |_ctx, _input| async move {
        Err(ActivityError::retryable("still down"))
    });
    pool.start().unwrap();

    let policy = RetryPolicy::exponential()
        .with_initial_interval(Duration::from_millis(40))
        .with_backoff_coefficient(2.0)
        .with_jitter(0.0)
        .with_max_attempts(3);
    let run_id = start(&runtime, "backoff", SingleActivity::TYPE, options(policy)).await;

    let run = runtime.wait_for_close(run_id, WAIT).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);

    let history = runtime.history(run_id).await.unwrap();
    let scheduled: Vec<_> = history
        .iter()
        .filter(|e| e.kind() == EventKind::ActivityScheduled)
        .map(|e| e.timestamp)
        .collect();
    assert_eq!(scheduled.len(), 3);

    // Each retry is recorded only after its backoff delay has elapsed
    let first_gap = scheduled[1] - scheduled[0];
    let second_gap = scheduled[2] - scheduled[1];
    assert!(first_gap >= chrono::Duration::milliseconds(40), "{first_gap}");
    assert!(second_gap >= chrono::Duration::milliseconds(80), "{second_gap}");

    pool.shutdown().await.unwrap();
    runtime.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_non_retryable_error_fails_without_retry() {
    let (runtime, _store) = common::runtime(registry());
    let pool = common::pool(&runtime);
    pool.register_handler("Work", |_ctx, _input| async move {
        Err(ActivityError::non_retryable("invalid card").with_type("card_declined"))
    });
    pool.start().unwrap();

    let run_id = start(
        &runtime,
        "declined",
        SingleActivity::TYPE,
        options(RetryPolicy::fixed(Duration::from_millis(10), 5)),
    )
    .await;

    let run = runtime.wait_for_close(run_id, WAIT).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);

    let history = runtime.history(run_id).await.unwrap();
    assert_eq!(
        kinds(&history),
        vec![
            EventKind::WorkflowStarted,
            EventKind::ActivityScheduled,
            EventKind::ActivityFailed,
            EventKind::WorkflowFailed,
        ]
    );
    match &history[3].event {
        WorkflowEvent::WorkflowFailed { error, .. } => {
            assert_eq!(error.code.as_deref(), Some("card_declined"));
        }
        other => panic!("expected WorkflowFailed, got {other:?}"),
    }

    pool.shutdown().await.unwrap();
    runtime.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_start_to_close_timeout_is_retried_then_fails() {
    let (runtime, _store) = common::runtime(registry());
    let pool = common::pool(&runtime);
    pool.register_handler("Work", |_ctx, _input| async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(json!("too late"))
    });
    pool.start().unwrap();

    let activity_options = ActivityOptions::default()
        .with_retry(RetryPolicy::fixed(Duration::from_millis(10), 2))
        .with_start_to_close_timeout(Duration::from_millis(50));
    let run_id = start(
        &runtime,
        "slow",
        SingleActivity::TYPE,
        serde_json::to_value(activity_options).unwrap(),
    )
    .await;

    let run = runtime.wait_for_close(run_id, WAIT).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);

    let history = runtime.history(run_id).await.unwrap();
    let timeouts: Vec<_> = history
        .iter()
        .filter_map(|e| match &e.event {
            WorkflowEvent::ActivityTimedOut {
                attempt,
                timeout_type,
                ..
            } => Some((*attempt, *timeout_type)),
            _ => None,
        })
        .collect();
    assert_eq!(
        timeouts,
        vec![(1, TimeoutType::StartToClose), (2, TimeoutType::StartToClose)]
    );
    assert_eq!(count(&history, EventKind::ActivityFailed), 1);
    assert_eq!(count(&history, EventKind::ActivityCompleted), 0);

    pool.shutdown().await.unwrap();
    runtime.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_schedule_to_start_timeout_without_workers() {
    let (runtime, _store) = common::runtime(registry());

    // Nobody polls the activity queue
    let activity_options = ActivityOptions::default()
        .with_retry(RetryPolicy::no_retry())
        .with_schedule_to_start_timeout(Duration::from_millis(30));
    let run_id = start(
        &runtime,
        "unserved",
        SingleActivity::TYPE,
        serde_json::to_value(activity_options).unwrap(),
    )
    .await;

    let run = runtime.wait_for_close(run_id, WAIT).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);

    let history = runtime.history(run_id).await.unwrap();
    assert!(history.iter().any(|e| matches!(
        e.event,
        WorkflowEvent::ActivityTimedOut {
            timeout_type: TimeoutType::ScheduleToStart,
            ..
        }
    )));
    assert_eq!(runtime.dispatcher().in_flight_count(), 0);

    runtime.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_activity_waits_for_a_capable_worker() {
    let (runtime, _store) = common::runtime(registry());

    // A worker on the queue that cannot run "Work"
    let other = common::pool(&runtime);
    other.register_handler("SomethingElse", |_ctx, input| async move { Ok(input) });
    other.start().unwrap();

    let run_id = start(
        &runtime,
        "routed",
        SingleActivity::TYPE,
        options(RetryPolicy::fixed(Duration::from_millis(10), 3)),
    )
    .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(runtime.describe(run_id).await.unwrap().status, RunStatus::Running);
    assert_eq!(runtime.router().queue_depth(common::QUEUE), 1);

    let capable = common::pool(&runtime);
    capable.register_handler("Work", |_ctx, _input| async move { Ok(json!("done")) });
    capable.start().unwrap();

    let run = runtime.wait_for_close(run_id, WAIT).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(runtime.router().queue_depth(common::QUEUE), 0);

    other.shutdown().await.unwrap();
    capable.shutdown().await.unwrap();
    runtime.shutdown().await;
}

// =============================================================================
// Timers, Signals and Cancellation
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_timer_fires_and_completes_run() {
    let (runtime, _store) = common::runtime(registry());
    let run_id = start(&runtime, "nap", Approval::TYPE, json!(30)).await;

    let run = runtime.wait_for_close(run_id, WAIT).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let history = runtime.history(run_id).await.unwrap();
    assert_eq!(
        kinds(&history),
        vec![
            EventKind::WorkflowStarted,
            EventKind::TimerStarted,
            EventKind::TimerFired,
            EventKind::WorkflowCompleted,
        ]
    );
    assert_eq!(runtime.timers().active_count(), 0);

    runtime.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_signal_completes_run_before_timer() {
    let (runtime, _store) = common::runtime(registry());
    let run_id = start(&runtime, "approval-1", Approval::TYPE, json!(60_000)).await;

    // Let the first workflow task record the timer
    tokio::time::sleep(Duration::from_millis(50)).await;
    let signalled = runtime
        .signal(
            "approval-1",
            WorkflowSignal::new("approve", json!({ "approved_by": "ops" })),
        )
        .await
        .unwrap();
    assert_eq!(signalled, run_id);

    let run = runtime.wait_for_close(run_id, WAIT).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let history = runtime.history(run_id).await.unwrap();
    assert_eq!(count(&history, EventKind::SignalReceived), 1);
    assert_eq!(count(&history, EventKind::TimerFired), 0);
    match &history.last().unwrap().event {
        WorkflowEvent::WorkflowCompleted { result } => assert_eq!(result["approved_by"], "ops"),
        other => panic!("expected WorkflowCompleted, got {other:?}"),
    }

    // The pending deadline timer is dropped once the run is released
    tokio::time::timeout(WAIT, async {
        while runtime.timers().active_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    runtime.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_signal_unknown_workflow() {
    let (runtime, _store) = common::runtime(registry());
    let err = runtime
        .signal("missing", WorkflowSignal::new("approve", json!(null)))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::WorkflowNotFound(id) if id == "missing"));
    runtime.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_execution_timeout_closes_run() {
    let (runtime, _store) = common::runtime(registry());
    let started = runtime
        .start_workflow(
            StartWorkflowRequest::new("expiring", common::QUEUE, Approval::TYPE, json!(60_000))
                .with_execution_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap();

    let run = runtime.wait_for_close(started.run_id, WAIT).await.unwrap();
    assert_eq!(run.status, RunStatus::TimedOut);

    let history = runtime.history(started.run_id).await.unwrap();
    match &history.last().unwrap().event {
        WorkflowEvent::WorkflowTimedOut { timeout_ms } => assert_eq!(*timeout_ms, 50),
        other => panic!("expected WorkflowTimedOut, got {other:?}"),
    }

    runtime.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_cancel_terminates_and_cancels_running_activity() {
    let (runtime, _store) = common::runtime(registry());
    let started_flag = Arc::new(AtomicBool::new(false));
    let cancelled_flag = Arc::new(AtomicBool::new(false));

    let pool = common::pool(&runtime);
    let (started_seen, cancelled_seen) = (Arc::clone(&started_flag), Arc::clone(&cancelled_flag));
    pool.register_handler("Work", move |ctx, _input| {
        let started = Arc::clone(&started_seen);
        let cancelled = Arc::clone(&cancelled_seen);
        async move {
            started.store(true, Ordering::SeqCst);
            for _ in 0..500 {
                if ctx.is_cancelled() {
                    cancelled.store(true, Ordering::SeqCst);
                    return Err(ActivityError::cancelled("run cancelled"));
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(json!("finished"))
        }
    });
    pool.start().unwrap();

    let run_id = start(
        &runtime,
        "cancel-me",
        SingleActivity::TYPE,
        options(RetryPolicy::no_retry()),
    )
    .await;

    tokio::time::timeout(WAIT, async {
        while !started_flag.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    runtime.cancel("cancel-me", "customer request").await.unwrap();

    let run = runtime.wait_for_close(run_id, WAIT).await.unwrap();
    assert_eq!(run.status, RunStatus::Terminated);

    let history = runtime.history(run_id).await.unwrap();
    assert_eq!(
        kinds(&history),
        vec![
            EventKind::WorkflowStarted,
            EventKind::ActivityScheduled,
            EventKind::CancelRequested,
            EventKind::ActivityCancelRequested,
            EventKind::WorkflowTerminated,
        ]
    );

    tokio::time::timeout(WAIT, async {
        while !cancelled_flag.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // The run closed in the same batch, so the activity's own outcome is dropped
    tokio::time::sleep(Duration::from_millis(50)).await;
    let history = runtime.history(run_id).await.unwrap();
    assert_eq!(history.len(), 5);
    assert_eq!(count(&history, EventKind::ActivityFailed), 0);

    pool.shutdown().await.unwrap();
    runtime.shutdown().await;
}

// =============================================================================
// Continue-as-new
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_continue_as_new_chains_runs() {
    let (runtime, _store) = common::runtime(registry());
    let pool = common::pool(&runtime);
    pool.register_handler("Tick", |_ctx, input| async move { Ok(input) });
    pool.start().unwrap();

    let first = start(&runtime, "countdown", Countdown::TYPE, json!([0, 2])).await;

    let last = tokio::time::timeout(WAIT, async {
        loop {
            let run = runtime.current_run("countdown").await.unwrap();
            if run.status == RunStatus::Completed {
                break run;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_ne!(last.run_id, first);
    assert_eq!(
        runtime.describe(first).await.unwrap().status,
        RunStatus::ContinuedAsNew
    );

    // Walk the chain back from the final run
    let mut chain = vec![last.run_id];
    loop {
        let history = runtime.history(*chain.last().unwrap()).await.unwrap();
        match &history[0].event {
            WorkflowEvent::WorkflowStarted {
                continued_from: Some(previous),
                ..
            } => chain.push(*previous),
            _ => break,
        }
    }
    assert_eq!(chain.len(), 3);
    assert_eq!(*chain.last().unwrap(), first);

    let final_history = runtime.history(last.run_id).await.unwrap();
    match &final_history.last().unwrap().event {
        WorkflowEvent::WorkflowCompleted { result } => assert_eq!(result, &json!(2)),
        other => panic!("expected WorkflowCompleted, got {other:?}"),
    }

    pool.shutdown().await.unwrap();
    runtime.shutdown().await;
}

// =============================================================================
// Recovery
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_recovery_resumes_open_runs_on_a_new_runtime() {
    let store = Arc::new(InMemoryWorkflowEventStore::new());

    // First process records the activity but has no activity workers
    let first = common::runtime_on(store.clone(), registry(), "process-1");
    let run_id = start(
        &first,
        "survivor",
        SingleActivity::TYPE,
        options(RetryPolicy::fixed(Duration::from_millis(10), 3)),
    )
    .await;
    tokio::time::timeout(WAIT, async {
        loop {
            let history = first.history(run_id).await.unwrap();
            if count(&history, EventKind::ActivityScheduled) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    first.shutdown().await;
    drop(first);

    // Second process picks the run up from its history alone
    let second = common::runtime_on(store.clone(), registry(), "process-2");
    let pool = common::pool(&second);
    pool.register_handler("Work", |_ctx, _input| async move { Ok(json!("recovered")) });
    pool.start().unwrap();

    assert_eq!(second.recover().await.unwrap(), 1);

    let run = second.wait_for_close(run_id, WAIT).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let history = second.history(run_id).await.unwrap();
    common::assert_gap_free(&history);
    // The attempt is re-dispatched without recording a new ActivityScheduled
    assert_eq!(count(&history, EventKind::ActivityScheduled), 1);
    assert_eq!(count(&history, EventKind::ActivityCompleted), 1);

    pool.shutdown().await.unwrap();
    second.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_recovery_rearms_timers() {
    let store = Arc::new(InMemoryWorkflowEventStore::new());

    let first = common::runtime_on(store.clone(), registry(), "process-1");
    let run_id = start(&first, "sleeper", Approval::TYPE, json!(80)).await;
    tokio::time::timeout(WAIT, async {
        loop {
            let history = first.history(run_id).await.unwrap();
            if count(&history, EventKind::TimerStarted) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    first.timers().cancel_run(run_id);
    first.shutdown().await;
    drop(first);

    let second = common::runtime_on(store.clone(), registry(), "process-2");
    second.recover().await.unwrap();

    let run = second.wait_for_close(run_id, WAIT).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    let history = second.history(run_id).await.unwrap();
    assert_eq!(count(&history, EventKind::TimerFired), 1);

    second.shutdown().await;
}

// =============================================================================
// Command application
// =============================================================================

/// Parks two activities on a side queue, then does its real work on the main one
struct SideQueue;

impl Workflow for SideQueue {
    const TYPE: &'static str = "side_queue";
    type Input = serde_json::Value;
    type Output = serde_json::Value;

    fn new(_input: Self::Input) -> Self {
        Self
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        let side = ActivityOptions::default().with_task_queue("side-queue");
        vec![
            WorkflowAction::schedule_activity_with("a", "Side", json!({}), side.clone()),
            WorkflowAction::schedule_activity_with("b", "Side", json!({}), side),
            WorkflowAction::schedule_activity("main", "Work", json!({})),
        ]
    }

    fn on_activity_completed(
        &mut self,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Vec<WorkflowAction> {
        match activity_id {
            "main" => vec![WorkflowAction::complete(result)],
            _ => vec![],
        }
    }

    fn on_activity_failed(&mut self, _: &str, error: &ActivityError) -> Vec<WorkflowAction> {
        vec![WorkflowAction::fail(WorkflowError::from(error))]
    }
}

#[test_log::test(tokio::test)]
async fn test_refused_dispatch_does_not_hold_back_later_commands() {
    let store = Arc::new(InMemoryWorkflowEventStore::new());
    let config = common::fast_config("depth-limited")
        .with_router(RouterConfig::default().with_max_queue_depth(1));
    let runtime = Arc::new(DurableRuntime::new(
        store,
        Arc::new(WorkflowRegistry::new().with::<SideQueue>()),
        config,
    ));
    runtime.start();
    runtime.serve_workflows(common::QUEUE);

    let pool = common::pool(&runtime);
    pool.register_handler("Work", |_ctx, _input| async move { Ok(json!("main done")) });
    pool.start().unwrap();

    // "b" does not fit on the side queue; "main" must still be dispatched
    let run_id = start(&runtime, "side-queue-run", SideQueue::TYPE, json!({})).await;

    let run = runtime.wait_for_close(run_id, WAIT).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    let history = runtime.history(run_id).await.unwrap();
    assert_eq!(count(&history, EventKind::ActivityScheduled), 3);
    match &history.last().unwrap().event {
        WorkflowEvent::WorkflowCompleted { result } => assert_eq!(result, &json!("main done")),
        other => panic!("expected WorkflowCompleted, got {other:?}"),
    }

    pool.shutdown().await.unwrap();
    runtime.shutdown().await;
}
