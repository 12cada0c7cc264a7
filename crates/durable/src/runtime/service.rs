//! In-process host for the engine, dispatcher and workers

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::config::RuntimeConfig;
use crate::dispatcher::{ActivityDispatcher, DispatchError, TimerService};
use crate::engine::{
    Command, ExecutorError, StartWorkflowRequest, StartWorkflowResponse, WorkflowEngine,
    WorkflowRegistry,
};
use crate::persistence::{RunFilter, RunInfo, RunStatus, StoreError, WorkflowEventStore};
use crate::queue::{
    ActivityTask, QueueTask, RouterError, TaskQueueRouter, WorkerRegistration, WorkflowTask,
};
use crate::worker::{PollerError, TaskPoller, WorkerPool, WorkerPoolConfig};
use crate::workflow::{HistoryEvent, WorkflowSignal};

/// Errors from runtime operations
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("router error: {0}")]
    Router(#[from] RouterError),

    /// No run was ever started under this workflow id
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// A run did not close within the wait
    #[error("run {0} still open after waiting")]
    WaitTimeout(Uuid),
}

/// Durable execution runtime
///
/// Wires a store to the engine, the task queue router, the activity
/// dispatcher and the timer service, and runs the workflow task loop:
/// every workflow task advances its run and carries out the commands
/// that were recorded.
///
/// # Example
///
/// ```ignore
/// let runtime = Arc::new(DurableRuntime::new(store, registry, RuntimeConfig::default()));
/// runtime.start();
/// runtime.recover().await?;
/// runtime.serve_workflows("orders");
///
/// let pool = runtime.worker_pool(WorkerPoolConfig::new("orders"));
/// pool.register_activity(ChargePayment);
/// pool.start()?;
///
/// let started = runtime
///     .start_workflow(StartWorkflowRequest::new("order-42", "orders", "order_workflow", input))
///     .await?;
/// ```
pub struct DurableRuntime {
    engine: Arc<WorkflowEngine>,
    router: Arc<TaskQueueRouter>,
    dispatcher: Arc<ActivityDispatcher>,
    timers: Arc<TimerService>,
    config: RuntimeConfig,
    tracker: TaskTracker,
    shutdown_tx: watch::Sender<bool>,
}

impl DurableRuntime {
    pub fn new(
        store: Arc<dyn WorkflowEventStore>,
        registry: Arc<WorkflowRegistry>,
        config: RuntimeConfig,
    ) -> Self {
        let router = Arc::new(TaskQueueRouter::new(config.router.clone()));
        let engine = Arc::new(WorkflowEngine::new(
            Arc::clone(&store),
            registry,
            config.executor.clone(),
        ));
        let dispatcher = Arc::new(ActivityDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&router),
            config.dispatcher.clone(),
        ));
        let timers = Arc::new(TimerService::new(
            store,
            Arc::clone(&router),
            config.dispatcher.append_retry_attempts,
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            engine,
            router,
            dispatcher,
            timers,
            config,
            tracker: TaskTracker::new(),
            shutdown_tx,
        }
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    pub fn router(&self) -> &Arc<TaskQueueRouter> {
        &self.router
    }

    pub fn dispatcher(&self) -> &Arc<ActivityDispatcher> {
        &self.dispatcher
    }

    pub fn timers(&self) -> &Arc<TimerService> {
        &self.timers
    }

    /// Activity worker pool sharing this runtime's router and dispatcher
    pub fn worker_pool(&self, config: WorkerPoolConfig) -> WorkerPool {
        WorkerPool::new(Arc::clone(&self.router), Arc::clone(&self.dispatcher), config)
    }

    // =========================================================================
    // Client Operations
    // =========================================================================

    /// Start a run and queue its first workflow task
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id))]
    pub async fn start_workflow(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<StartWorkflowResponse, RuntimeError> {
        let started = self.engine.start_workflow(request).await?;
        let run = self.engine.describe(started.run_id).await?;
        self.launch(&run).await?;
        Ok(started)
    }

    /// Signal the current run of a workflow
    #[instrument(skip(self, signal), fields(signal = %signal.name))]
    pub async fn signal(
        &self,
        workflow_id: &str,
        signal: WorkflowSignal,
    ) -> Result<Uuid, RuntimeError> {
        let run = self.current_run(workflow_id).await?;
        self.engine.signal(run.run_id, signal).await?;
        self.wake(&run)?;
        Ok(run.run_id)
    }

    /// Ask the current run of a workflow to cancel
    #[instrument(skip(self))]
    pub async fn cancel(&self, workflow_id: &str, reason: &str) -> Result<Uuid, RuntimeError> {
        let run = self.current_run(workflow_id).await?;
        self.engine.request_cancel(run.run_id, reason).await?;
        self.wake(&run)?;
        Ok(run.run_id)
    }

    /// Latest run of a workflow id
    pub async fn current_run(&self, workflow_id: &str) -> Result<RunInfo, RuntimeError> {
        self.engine
            .store()
            .current_run(workflow_id)
            .await?
            .ok_or_else(|| RuntimeError::WorkflowNotFound(workflow_id.to_string()))
    }

    pub async fn describe(&self, run_id: Uuid) -> Result<RunInfo, RuntimeError> {
        Ok(self.engine.describe(run_id).await?)
    }

    pub async fn history(&self, run_id: Uuid) -> Result<Vec<HistoryEvent>, RuntimeError> {
        Ok(self.engine.history(run_id).await?)
    }

    /// Wait until a run is closed
    pub async fn wait_for_close(
        &self,
        run_id: Uuid,
        timeout: Duration,
    ) -> Result<RunInfo, RuntimeError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let run = self.engine.describe(run_id).await?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RuntimeError::WaitTimeout(run_id));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    // =========================================================================
    // Workflow Tasks
    // =========================================================================

    /// Poll a queue for workflow tasks with the configured number of pollers
    pub fn serve_workflows(self: &Arc<Self>, task_queue: &str) {
        let worker_id = format!("{}-workflows-{}", self.config.worker_id, task_queue);
        let workflow_types: Vec<String> = self
            .engine
            .registry()
            .workflow_types()
            .map(str::to_string)
            .collect();
        self.router.register_worker(
            WorkerRegistration::new(&worker_id, task_queue).with_workflow_types(workflow_types),
        );

        for poller_index in 0..self.config.workflow_pollers {
            let runtime = Arc::clone(self);
            let poller = TaskPoller::new(
                Arc::clone(&self.router),
                task_queue,
                worker_id.clone(),
                self.config.poller.clone(),
                self.shutdown_tx.subscribe(),
            );
            self.tracker
                .spawn(async move { runtime.workflow_poll_loop(poller, poller_index).await });
        }
        info!(%task_queue, pollers = self.config.workflow_pollers, "Serving workflow tasks");
    }

    /// Advance a run and carry out the commands it recorded
    #[instrument(skip(self, task), fields(run_id = %task.run_id, workflow_type = %task.workflow_type))]
    pub async fn process_workflow_task(&self, task: &WorkflowTask) -> Result<(), RuntimeError> {
        let commands = match self.engine.advance(task.run_id).await {
            Ok(commands) => commands,
            Err(e @ ExecutorError::NonDeterminism { .. }) => {
                // The run was closed with WorkflowTaskFailed
                self.release_run(task.run_id);
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        // Commands are already recorded; apply the rest even if one fails
        let run = self.engine.describe(task.run_id).await?;
        let mut first_error = None;
        for command in &commands {
            if let Err(e) = self.apply(&run, command).await {
                error!(run_id = %run.run_id, kind = %command.event_kind(), "Failed to apply command: {}", e);
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        // Closed by something other than a command, e.g. an execution timeout
        if commands.is_empty() && run.status.is_terminal() {
            self.release_run(run.run_id);
        }
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawn the timeout sweeper and, with a retention set, the archiver
    pub fn start(&self) {
        let dispatcher = Arc::clone(&self.dispatcher);
        self.tracker
            .spawn(dispatcher.run_sweeper(self.shutdown_tx.subscribe()));

        if let Some(retention) = self.config.retention {
            let store = Arc::clone(self.engine.store());
            let interval = self.config.archive_interval;
            let shutdown_rx = self.shutdown_tx.subscribe();
            self.tracker
                .spawn(archive_loop(store, retention, interval, shutdown_rx));
        }
        info!(worker_id = %self.config.worker_id, "Durable runtime started");
    }

    /// Resume every open run after a restart
    ///
    /// Finishes interrupted continue-as-new handovers, re-dispatches
    /// unresolved activities, re-arms timers and queues a workflow task per
    /// run so anything not yet recorded gets decided.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize, RuntimeError> {
        let store = Arc::clone(self.engine.store());

        let handed_over = store
            .list_runs(RunFilter::default().with_status(RunStatus::ContinuedAsNew))
            .await?;
        for run in handed_over {
            self.engine.ensure_successor(run.run_id).await?;
        }

        let open = store.list_runs(RunFilter::running()).await?;
        let count = open.len();
        for run in open {
            let history = self.engine.history(run.run_id).await?;
            self.dispatcher.recover(&run, &history).await?;
            self.timers.recover(&run, &history);
            self.wake(&run)?;
        }

        info!(runs = count, "Recovered open runs");
        Ok(count)
    }

    /// Stop pollers and background loops
    pub async fn shutdown(&self) {
        info!(worker_id = %self.config.worker_id, "Shutting down durable runtime");
        self.shutdown_tx.send_replace(true);
        self.tracker.close();

        if tokio::time::timeout(self.config.shutdown_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("Shutdown timeout reached with background tasks still running");
        }
    }

    // =========================================================================
    // Internal Methods
    // =========================================================================

    async fn workflow_poll_loop(&self, mut poller: TaskPoller, poller_index: usize) {
        debug!(poller_index, "Workflow poller started");
        loop {
            match poller.poll().await {
                Ok(Some(QueueTask::Workflow(task))) => {
                    if let Err(e) = self.process_workflow_task(&task).await {
                        error!(run_id = %task.run_id, "Workflow task failed: {}", e);
                    }
                }
                Ok(Some(QueueTask::Activity(task))) => {
                    warn!(task_id = %task.task_id, "Workflow poller received an activity task");
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
        debug!(poller_index, "Workflow poller exited");
    }

    async fn apply(&self, run: &RunInfo, command: &Command) -> Result<(), RuntimeError> {
        match command {
            Command::ScheduleActivity {
                activity_id,
                activity_type,
                input,
                options,
            } => {
                let task_queue = options
                    .task_queue
                    .clone()
                    .unwrap_or_else(|| run.task_queue.clone());
                let task = ActivityTask::new(
                    run,
                    activity_id.clone(),
                    activity_type.clone(),
                    task_queue,
                    input.clone(),
                    options.clone(),
                    1,
                );
                self.dispatcher.dispatch(task, Utc::now())?;
            }
            Command::StartTimer { timer_id, duration } => {
                let fire_at = chrono::Duration::from_std(*duration)
                    .ok()
                    .and_then(|d| Utc::now().checked_add_signed(d))
                    .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC);
                self.timers.start_timer(run, timer_id, fire_at);
            }
            Command::CancelActivity { activity_id } => {
                self.dispatcher.cancel(run.run_id, activity_id).await?;
            }
            Command::ContinueAsNew { .. } => {
                self.release_run(run.run_id);
                if let Some(successor) = self.engine.ensure_successor(run.run_id).await? {
                    self.launch(&successor).await?;
                }
            }
            Command::CompleteWorkflow { .. }
            | Command::FailWorkflow { .. }
            | Command::TerminateWorkflow { .. } => {
                self.release_run(run.run_id);
            }
        }
        Ok(())
    }

    /// Arm a fresh run's deadline and queue its first workflow task
    async fn launch(&self, run: &RunInfo) -> Result<(), RuntimeError> {
        let history = self.engine.history(run.run_id).await?;
        self.timers.recover(run, &history);
        self.wake(run)
    }

    fn wake(&self, run: &RunInfo) -> Result<(), RuntimeError> {
        self.router
            .enqueue(&run.task_queue, QueueTask::Workflow(WorkflowTask::for_run(run)))?;
        Ok(())
    }

    /// Drop in-process state of a closed run
    fn release_run(&self, run_id: Uuid) {
        let activities = self.dispatcher.cancel_run(run_id);
        let timers = self.timers.cancel_run(run_id);
        self.engine.forget(run_id);
        debug!(%run_id, activities, timers, "released closed run");
    }
}

async fn archive_loop(
    store: Arc<dyn WorkflowEventStore>,
    retention: Duration,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(cutoff) = chrono::Duration::from_std(retention)
                    .ok()
                    .and_then(|r| Utc::now().checked_sub_signed(r))
                else {
                    continue;
                };
                match store.archive_closed_runs(cutoff).await {
                    Ok(archived) if !archived.is_empty() => {
                        info!(count = archived.len(), "Archived closed runs");
                    }
                    Ok(_) => {}
                    Err(e) => error!("Archiving failed: {}", e),
                }
            }
            _ = shutdown_rx.changed() => {
                debug!("Archiver: shutdown requested");
                break;
            }
        }
    }
}
