//! Shared helpers for the runtime integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use keelrun_durable::dispatcher::DispatcherConfig;
use keelrun_durable::worker::PollerConfig;
use keelrun_durable::workflow::{EventKind, HistoryEvent};
use keelrun_durable::{
    DurableRuntime, InMemoryWorkflowEventStore, RuntimeConfig, WorkerPool, WorkerPoolConfig,
    WorkflowEventStore, WorkflowRegistry,
};

pub const QUEUE: &str = "order-task-queue";
pub const WAIT: Duration = Duration::from_secs(5);

/// Pollers and sweeps tuned for millisecond-scale tests
pub fn fast_config(worker_id: &str) -> RuntimeConfig {
    RuntimeConfig::default()
        .with_worker_id(worker_id)
        .with_workflow_pollers(2)
        .with_poller(fast_poller())
        .with_dispatcher(DispatcherConfig::default().with_sweep_interval(Duration::from_millis(10)))
        .with_shutdown_timeout(Duration::from_secs(1))
}

pub fn fast_poller() -> PollerConfig {
    PollerConfig::default()
        .with_min_interval(Duration::from_millis(5))
        .with_max_interval(Duration::from_millis(20))
        .with_error_backoff(Duration::from_millis(10))
}

/// Runtime serving [`QUEUE`] on the given store
pub fn runtime_on(
    store: Arc<dyn WorkflowEventStore>,
    registry: WorkflowRegistry,
    worker_id: &str,
) -> Arc<DurableRuntime> {
    let runtime = Arc::new(DurableRuntime::new(
        store,
        Arc::new(registry),
        fast_config(worker_id),
    ));
    runtime.start();
    runtime.serve_workflows(QUEUE);
    runtime
}

/// Runtime on a fresh in-memory store
pub fn runtime(
    registry: WorkflowRegistry,
) -> (Arc<DurableRuntime>, Arc<InMemoryWorkflowEventStore>) {
    let store = Arc::new(InMemoryWorkflowEventStore::new());
    let runtime = runtime_on(store.clone(), registry, "test-runtime");
    (runtime, store)
}

/// Activity pool on [`QUEUE`]; register handlers before calling `start`
pub fn pool(runtime: &DurableRuntime) -> WorkerPool {
    runtime.worker_pool(
        WorkerPoolConfig::new(QUEUE)
            .with_max_concurrency(4)
            .with_poller(fast_poller())
            .with_shutdown_timeout(Duration::from_secs(1)),
    )
}

pub fn kinds(history: &[HistoryEvent]) -> Vec<EventKind> {
    history.iter().map(HistoryEvent::kind).collect()
}

pub fn count(history: &[HistoryEvent], kind: EventKind) -> usize {
    history.iter().filter(|e| e.kind() == kind).count()
}

/// Panics unless sequence numbers run 1..=n without gaps
pub fn assert_gap_free(history: &[HistoryEvent]) {
    for (index, event) in history.iter().enumerate() {
        assert_eq!(event.sequence_no, index as u64 + 1, "gap at {index}");
    }
}
