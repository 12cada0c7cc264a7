//! Named task queues with capability-matched polling

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::task::{QueueTask, WorkerRegistration};

/// Router configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Reject enqueues beyond this many waiting tasks per queue
    pub max_queue_depth: Option<usize>,
}

impl RouterConfig {
    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = Some(depth);
        self
    }
}

/// Errors from router operations
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Poll from a worker that is not registered on the queue
    #[error("worker {worker_id} is not registered on queue {task_queue}")]
    WorkerNotRegistered {
        worker_id: String,
        task_queue: String,
    },

    /// Queue is at its configured depth
    #[error("task queue {0} is full")]
    QueueFull(String),
}

#[derive(Default)]
struct TaskQueue {
    tasks: Mutex<VecDeque<QueueTask>>,
    notify: Notify,
}

impl TaskQueue {
    /// Remove the oldest task the worker can handle
    fn take_for(&self, worker: &WorkerRegistration) -> Option<QueueTask> {
        let mut tasks = self.tasks.lock();
        let position = tasks.iter().position(|t| worker.can_handle(t))?;
        tasks.remove(position)
    }
}

/// Routes tasks to workers by queue name
///
/// Each queue is FIFO. A poll hands out the oldest task the polling worker
/// has the code for, and each task goes to exactly one poller. Pending
/// workflow tasks for the same run are coalesced, since one advance picks
/// up everything recorded so far.
pub struct TaskQueueRouter {
    config: RouterConfig,
    queues: DashMap<String, Arc<TaskQueue>>,
    workers: DashMap<String, WorkerRegistration>,
}

impl Default for TaskQueueRouter {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

impl TaskQueueRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            queues: DashMap::new(),
            workers: DashMap::new(),
        }
    }

    /// Register (or re-register) a worker
    pub fn register_worker(&self, registration: WorkerRegistration) {
        info!(
            worker_id = %registration.worker_id,
            task_queue = %registration.task_queue,
            workflow_types = ?registration.workflow_types,
            activity_types = ?registration.activity_types,
            "worker registered"
        );
        self.workers
            .insert(registration.worker_id.clone(), registration);
    }

    /// Remove a worker; its queued tasks stay for other workers
    pub fn deregister_worker(&self, worker_id: &str) -> Option<WorkerRegistration> {
        let removed = self.workers.remove(worker_id).map(|(_, r)| r);
        if let Some(registration) = &removed {
            info!(%worker_id, task_queue = %registration.task_queue, "worker deregistered");
        }
        removed
    }

    /// Workers registered on a queue
    pub fn workers(&self, task_queue: &str) -> Vec<WorkerRegistration> {
        self.workers
            .iter()
            .filter(|w| w.task_queue == task_queue)
            .map(|w| w.value().clone())
            .collect()
    }

    /// Whether any registered worker on the queue can run the task
    pub fn has_capable_worker(&self, task_queue: &str, task: &QueueTask) -> bool {
        self.workers
            .iter()
            .any(|w| w.task_queue == task_queue && w.can_handle(task))
    }

    /// Add a task to the back of a queue
    ///
    /// Returns `false` when a workflow task for the same run was already
    /// waiting and the new one was folded into it.
    pub fn enqueue(&self, task_queue: &str, task: QueueTask) -> Result<bool, RouterError> {
        if !self.has_capable_worker(task_queue, &task) {
            // Not an error: the task waits until a capable worker registers
            warn!(%task_queue, run_id = %task.run_id(), "no registered worker can handle task");
        }

        let queue = self.queue(task_queue);
        {
            let mut tasks = queue.tasks.lock();
            if let QueueTask::Workflow(new) = &task {
                let duplicate = tasks
                    .iter()
                    .any(|t| matches!(t, QueueTask::Workflow(w) if w.run_id == new.run_id));
                if duplicate {
                    debug!(%task_queue, run_id = %new.run_id, "workflow task coalesced");
                    return Ok(false);
                }
            }
            if let Some(max) = self.config.max_queue_depth {
                if tasks.len() >= max {
                    return Err(RouterError::QueueFull(task_queue.to_string()));
                }
            }
            tasks.push_back(task);
        }

        queue.notify.notify_waiters();
        Ok(true)
    }

    /// Wait up to `timeout` for a task this worker can handle
    pub async fn poll(
        &self,
        task_queue: &str,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<Option<QueueTask>, RouterError> {
        let registration = self
            .workers
            .get(worker_id)
            .filter(|w| w.task_queue == task_queue)
            .map(|w| w.value().clone())
            .ok_or_else(|| RouterError::WorkerNotRegistered {
                worker_id: worker_id.to_string(),
                task_queue: task_queue.to_string(),
            })?;

        let queue = self.queue(task_queue);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register interest before looking so an enqueue in between is not missed
            let notified = queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = queue.take_for(&registration) {
                return Ok(Some(task));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    /// Drop a queued activity attempt that was not picked up
    pub fn remove_activity(&self, task_queue: &str, task_id: Uuid) -> bool {
        let Some(queue) = self.queues.get(task_queue).map(|q| Arc::clone(q.value())) else {
            return false;
        };
        let mut tasks = queue.tasks.lock();
        let before = tasks.len();
        tasks.retain(|t| !matches!(t, QueueTask::Activity(a) if a.task_id == task_id));
        tasks.len() != before
    }

    /// Number of waiting tasks
    pub fn queue_depth(&self, task_queue: &str) -> usize {
        self.queues
            .get(task_queue)
            .map(|q| q.tasks.lock().len())
            .unwrap_or(0)
    }

    fn queue(&self, task_queue: &str) -> Arc<TaskQueue> {
        if let Some(queue) = self.queues.get(task_queue) {
            return Arc::clone(queue.value());
        }
        Arc::clone(
            self.queues
                .entry(task_queue.to_string())
                .or_default()
                .value(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{ActivityTask, WorkflowTask};
    use crate::workflow::ActivityOptions;
    use serde_json::json;

    fn workflow_task(run_id: Uuid) -> QueueTask {
        QueueTask::Workflow(WorkflowTask {
            run_id,
            workflow_id: "wf".to_string(),
            workflow_type: "order".to_string(),
            task_queue: "orders".to_string(),
        })
    }

    fn activity_task(activity_type: &str) -> QueueTask {
        QueueTask::Activity(ActivityTask {
            task_id: Uuid::now_v7(),
            run_id: Uuid::now_v7(),
            workflow_id: "wf".to_string(),
            workflow_type: "order".to_string(),
            activity_id: "a".to_string(),
            activity_type: activity_type.to_string(),
            task_queue: "orders".to_string(),
            workflow_task_queue: "orders".to_string(),
            input: json!({}),
            options: ActivityOptions::default(),
            attempt: 1,
        })
    }

    fn router() -> TaskQueueRouter {
        let router = TaskQueueRouter::default();
        router.register_worker(
            WorkerRegistration::new("w1", "orders")
                .with_workflow_types(["order"])
                .with_activity_types(["charge"]),
        );
        router
    }

    #[tokio::test]
    async fn test_poll_returns_fifo() {
        let router = router();
        let first = activity_task("charge");
        let second = activity_task("charge");
        router.enqueue("orders", first.clone()).unwrap();
        router.enqueue("orders", second.clone()).unwrap();

        let timeout = Duration::from_millis(10);
        assert_eq!(router.poll("orders", "w1", timeout).await.unwrap(), Some(first));
        assert_eq!(router.poll("orders", "w1", timeout).await.unwrap(), Some(second));
        assert_eq!(router.poll("orders", "w1", timeout).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_skips_tasks_worker_cannot_handle() {
        let router = router();
        router.enqueue("orders", activity_task("ship")).unwrap();
        let charge = activity_task("charge");
        router.enqueue("orders", charge.clone()).unwrap();

        let polled = router
            .poll("orders", "w1", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(polled, Some(charge));
        assert_eq!(router.queue_depth("orders"), 1);
    }

    #[tokio::test]
    async fn test_workflow_tasks_coalesce() {
        let router = router();
        let run_id = Uuid::now_v7();

        assert!(router.enqueue("orders", workflow_task(run_id)).unwrap());
        assert!(!router.enqueue("orders", workflow_task(run_id)).unwrap());
        assert_eq!(router.queue_depth("orders"), 1);
    }

    #[tokio::test]
    async fn test_unregistered_worker_rejected() {
        let router = router();
        let err = router
            .poll("payments", "w1", Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::WorkerNotRegistered { .. }));
    }

    #[tokio::test]
    async fn test_waiting_poller_wakes_on_enqueue() {
        let router = Arc::new(router());
        let poller = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.poll("orders", "w1", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        router.enqueue("orders", activity_task("charge")).unwrap();

        let polled = poller.await.unwrap().unwrap();
        assert!(polled.is_some());
    }

    #[tokio::test]
    async fn test_each_task_goes_to_one_poller() {
        let router = Arc::new(router());
        router.register_worker(
            WorkerRegistration::new("w2", "orders").with_activity_types(["charge"]),
        );

        let mut pollers = Vec::new();
        for worker in ["w1", "w2"] {
            let router = Arc::clone(&router);
            pollers.push(tokio::spawn(async move {
                router.poll("orders", worker, Duration::from_millis(100)).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        router.enqueue("orders", activity_task("charge")).unwrap();

        let mut received = 0;
        for poller in pollers {
            if poller.await.unwrap().unwrap().is_some() {
                received += 1;
            }
        }
        assert_eq!(received, 1);
    }

    #[test]
    fn test_queue_depth_limit() {
        let router = TaskQueueRouter::new(RouterConfig::default().with_max_queue_depth(1));
        router.enqueue("orders", activity_task("charge")).unwrap();
        let err = router.enqueue("orders", activity_task("charge")).unwrap_err();
        assert!(matches!(err, RouterError::QueueFull(_)));
    }

    #[test]
    fn test_remove_activity() {
        let router = router();
        let task = activity_task("charge");
        let QueueTask::Activity(activity) = &task else {
            unreachable!()
        };
        let task_id = activity.task_id;
        router.enqueue("orders", task).unwrap();

        assert!(router.remove_activity("orders", task_id));
        assert!(!router.remove_activity("orders", task_id));
        assert_eq!(router.queue_depth("orders"), 0);
    }
}
