//! Worker pool for activity execution
//!
//! Manages concurrent activity execution with backpressure and graceful shutdown.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::backpressure::{BackpressureConfig, BackpressureState, LoadGuard};
use super::poller::{PollerConfig, PollerError, TaskPoller};
use crate::activity::{Activity, ActivityContext, ActivityError, UNHANDLED_ERROR_TYPE};
use crate::dispatcher::ActivityDispatcher;
use crate::duration_serde;
use crate::queue::{ActivityTask, QueueTask, TaskQueueRouter, WorkerRegistration};

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Queue this pool polls
    pub task_queue: String,

    /// Maximum concurrent activity executions
    pub max_concurrency: usize,

    pub backpressure: BackpressureConfig,

    pub poller: PollerConfig,

    /// How long shutdown waits for running activities
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            task_queue: "default".to_string(),
            max_concurrency: 10,
            backpressure: BackpressureConfig::default(),
            poller: PollerConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Configuration for a pool polling `task_queue`
    pub fn new(task_queue: impl Into<String>) -> Self {
        Self {
            task_queue: task_queue.into(),
            ..Default::default()
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_backpressure(mut self, config: BackpressureConfig) -> Self {
        self.backpressure = config;
        self
    }

    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Running and polling
    Running,
    /// Finishing running activities, not polling
    Draining,
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("poller error: {0}")]
    Poller(#[from] PollerError),

    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Outcome of one activity attempt
pub type ActivityResult = Result<serde_json::Value, ActivityError>;

/// Type-erased activity implementation
pub type ActivityHandler =
    Arc<dyn Fn(ActivityContext, serde_json::Value) -> BoxFuture<'static, ActivityResult> + Send + Sync>;

/// Worker pool executing activities from one task queue
///
/// # Example
///
/// ```ignore
/// use keelrun_durable::worker::{WorkerPool, WorkerPoolConfig};
///
/// let pool = runtime.worker_pool(WorkerPoolConfig::new("orders").with_max_concurrency(10));
///
/// pool.register_activity(ChargePayment::new(gateway));
/// pool.register_handler("send_email", |_ctx, input| async move {
///     // Send the email...
///     Ok(json!({"sent": true}))
/// });
///
/// pool.start()?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    router: Arc<TaskQueueRouter>,
    dispatcher: Arc<ActivityDispatcher>,
    config: WorkerPoolConfig,
    backpressure: Arc<BackpressureState>,
    handlers: RwLock<HashMap<String, ActivityHandler>>,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<WorkerPoolStatus>,
    active_tasks: Arc<Semaphore>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        router: Arc<TaskQueueRouter>,
        dispatcher: Arc<ActivityDispatcher>,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let backpressure = Arc::new(BackpressureState::new(
            config.backpressure.clone(),
            config.max_concurrency,
        ));

        Self {
            router,
            dispatcher,
            backpressure,
            handlers: RwLock::new(HashMap::new()),
            shutdown_tx,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            active_tasks: Arc::new(Semaphore::new(config.max_concurrency)),
            poll_handle: Mutex::new(None),
            config,
        }
    }

    /// Register a handler for an activity type
    ///
    /// Handlers registered after [`WorkerPool::start`] take effect on the
    /// next start.
    pub fn register_handler<F, Fut>(&self, activity_type: &str, handler: F)
    where
        F: Fn(ActivityContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ActivityResult> + Send + 'static,
    {
        let handler: ActivityHandler = Arc::new(move |ctx, input| Box::pin(handler(ctx, input)));
        self.handlers
            .write()
            .insert(activity_type.to_string(), handler);
    }

    /// Register a typed activity under its `TYPE`
    pub fn register_activity<A: Activity>(&self, activity: A) {
        let activity = Arc::new(activity);
        self.register_handler(A::TYPE, move |ctx, input| {
            let activity = Arc::clone(&activity);
            async move {
                let input: A::Input = serde_json::from_value(input).map_err(|e| {
                    ActivityError::non_retryable(format!("invalid input for {}: {}", A::TYPE, e))
                })?;
                let output = activity.execute(&ctx, input).await?;
                serde_json::to_value(output).map_err(|e| {
                    ActivityError::non_retryable(format!("invalid output of {}: {}", A::TYPE, e))
                })
            }
        });
    }

    /// Register with the router and start polling
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Running {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Running;
        }
        self.shutdown_tx.send_replace(false);

        let handlers = self.handlers.read().clone();
        let activity_types: Vec<String> = handlers.keys().cloned().collect();

        info!(
            worker_id = %self.config.worker_id,
            task_queue = %self.config.task_queue,
            activity_types = ?activity_types,
            max_concurrency = self.config.max_concurrency,
            "Starting worker pool"
        );

        self.router.register_worker(
            WorkerRegistration::new(&self.config.worker_id, &self.config.task_queue)
                .with_activity_types(activity_types),
        );

        self.start_poll_loop(handlers);
        Ok(())
    }

    /// Stop polling and wait for running activities
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }

        info!(worker_id = %self.config.worker_id, "Initiating graceful shutdown");
        self.shutdown_tx.send_replace(true);
        self.router.deregister_worker(&self.config.worker_id);

        let handle = self.poll_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Poll loop panicked: {}", e);
            }
        }

        let max = self.config.max_concurrency as u32;
        let drained = tokio::time::timeout(
            self.config.shutdown_timeout,
            self.active_tasks.acquire_many(max),
        )
        .await;

        match drained {
            Ok(Ok(permits)) => drop(permits),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(
                    remaining_tasks = self.backpressure.current_load(),
                    "Shutdown timeout reached"
                );
                *self.status.write() = WorkerPoolStatus::Stopped;
                return Err(WorkerPoolError::ShutdownTimeout);
            }
        }

        *self.status.write() = WorkerPoolStatus::Stopped;
        info!(worker_id = %self.config.worker_id, "Worker pool stopped");
        Ok(())
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    pub fn current_load(&self) -> usize {
        self.backpressure.current_load()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn is_accepting(&self) -> bool {
        self.backpressure.is_accepting() && *self.status.read() == WorkerPoolStatus::Running
    }

    fn start_poll_loop(&self, handlers: HashMap<String, ActivityHandler>) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let backpressure = Arc::clone(&self.backpressure);
        let active_tasks = Arc::clone(&self.active_tasks);
        let config = self.config.clone();
        let mut poller = TaskPoller::new(
            Arc::clone(&self.router),
            config.task_queue.clone(),
            config.worker_id.clone(),
            config.poller.clone(),
            self.shutdown_tx.subscribe(),
        );

        let handle = tokio::spawn(async move {
            loop {
                if poller.is_shutdown() {
                    debug!("Poll loop: shutdown requested");
                    break;
                }

                // Only poll with a free slot, so a polled task never waits
                let permit = match Arc::clone(&active_tasks).try_acquire_owned() {
                    Ok(permit) if backpressure.should_accept() => permit,
                    _ => {
                        debug!("Poll loop: under backpressure, waiting");
                        if poller.pause(config.poller.min_interval).await {
                            break;
                        }
                        continue;
                    }
                };

                match poller.poll().await {
                    Ok(Some(QueueTask::Activity(task))) => {
                        let handler = handlers.get(&task.activity_type).cloned();
                        let guard = backpressure.track();
                        let dispatcher = Arc::clone(&dispatcher);
                        tokio::spawn(execute_task(dispatcher, handler, task, guard, permit));
                    }
                    Ok(Some(QueueTask::Workflow(task))) => {
                        // Activity workers never register workflow types
                        warn!(run_id = %task.run_id, "Activity worker received a workflow task");
                    }
                    Ok(None) => {}
                    Err(PollerError::Shutdown) => break,
                    Err(e) => {
                        error!("Poll error: {}", e);
                        if poller.back_off().await {
                            break;
                        }
                    }
                }
            }

            debug!("Poll loop exited");
        });

        *self.poll_handle.lock() = Some(handle);
    }
}

/// Run one attempt and report its outcome to the dispatcher
async fn execute_task(
    dispatcher: Arc<ActivityDispatcher>,
    handler: Option<ActivityHandler>,
    task: ActivityTask,
    _guard: LoadGuard,
    _permit: OwnedSemaphorePermit,
) {
    let task_id = task.task_id;
    let Some(cancel) = dispatcher.record_started(task_id) else {
        debug!(%task_id, "Skipping stale or cancelled task");
        return;
    };

    let result = match handler {
        Some(handler) => {
            let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel(16);
            let ctx = ActivityContext::new(
                task_id,
                task.run_id,
                task.workflow_id.clone(),
                task.activity_id.clone(),
                task.attempt,
                task.options.retry_policy.max_attempts,
            )
            .with_heartbeat(heartbeat_tx)
            .with_cancellation(cancel);

            let heartbeats = {
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    while heartbeat_rx.recv().await.is_some() {
                        dispatcher.record_heartbeat(task_id);
                    }
                })
            };

            debug!(
                %task_id,
                activity_type = %task.activity_type,
                attempt = task.attempt,
                "Executing activity"
            );
            let result = AssertUnwindSafe(handler(ctx, task.input.clone()))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(ActivityError::retryable("activity panicked")));
            heartbeats.abort();
            result
        }
        None => {
            warn!(activity_type = %task.activity_type, "No handler registered");
            Err(ActivityError::non_retryable(format!(
                "no handler registered for activity type {}",
                task.activity_type
            ))
            .with_type(UNHANDLED_ERROR_TYPE))
        }
    };

    let reported = match result {
        Ok(output) => dispatcher.complete(task_id, output).await,
        Err(error) => dispatcher.fail(task_id, error).await,
    };
    if let Err(e) = reported {
        error!(%task_id, "Failed to report activity outcome: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatcherConfig;
    use crate::persistence::{InMemoryWorkflowEventStore, NewRun, WorkflowEventStore};
    use crate::workflow::{ActivityOptions, WorkflowEvent};
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_config_builder() {
        let config = WorkerPoolConfig::new("orders")
            .with_worker_id("test-worker")
            .with_max_concurrency(0)
            .with_shutdown_timeout(Duration::from_secs(5));

        assert_eq!(config.worker_id, "test-worker");
        assert_eq!(config.task_queue, "orders");
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[test_log::test(tokio::test)]
    async fn test_executes_activity_and_reports() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let router = Arc::new(TaskQueueRouter::default());
        let dispatcher = Arc::new(ActivityDispatcher::new(
            store.clone(),
            router.clone(),
            DispatcherConfig::default(),
        ));
        let run = store
            .create_run(NewRun {
                workflow_id: "greet-1".to_string(),
                run_id: Uuid::now_v7(),
                workflow_type: "greeter".to_string(),
                task_queue: "default".to_string(),
                version: "1".to_string(),
                input: json!(null),
                continued_from: None,
                execution_timeout: None,
            })
            .await
            .unwrap();

        let pool = WorkerPool::new(
            router.clone(),
            dispatcher.clone(),
            WorkerPoolConfig::new("default").with_worker_id("w1"),
        );
        pool.register_handler("greet", |ctx, input| async move {
            ctx.heartbeat(None).await.ok();
            Ok(json!(format!("hello {}", input.as_str().unwrap_or("?"))))
        });
        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(WorkerPoolError::AlreadyRunning)));

        let task = ActivityTask::new(
            &run,
            "g1",
            "greet",
            "default",
            json!("ada"),
            ActivityOptions::default(),
            1,
        );
        store
            .append(
                run.run_id,
                1,
                WorkflowEvent::ActivityScheduled {
                    activity_id: "g1".to_string(),
                    activity_type: "greet".to_string(),
                    task_queue: "default".to_string(),
                    input: json!("ada"),
                    options: ActivityOptions::default(),
                    attempt: 1,
                    last_failure: None,
                },
            )
            .await
            .unwrap();
        dispatcher.dispatch(task, Utc::now()).unwrap();

        let mut completed = None;
        for _ in 0..50 {
            let events = store.load_events(run.run_id).await.unwrap();
            if let WorkflowEvent::ActivityCompleted { result, .. } = &events.last().unwrap().event {
                completed = Some(result.clone());
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(completed, Some(json!("hello ada")));

        pool.shutdown().await.unwrap();
        assert_eq!(pool.status(), WorkerPoolStatus::Stopped);
        assert!(router.workers("default").is_empty());
    }
}
