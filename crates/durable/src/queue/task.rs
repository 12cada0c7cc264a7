//! Units of work carried by task queues

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::persistence::RunInfo;
use crate::workflow::ActivityOptions;

/// One attempt of an activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityTask {
    /// Identifies this attempt; results for any other attempt are stale
    pub task_id: Uuid,

    pub run_id: Uuid,
    pub workflow_id: String,
    pub workflow_type: String,
    pub activity_id: String,
    pub activity_type: String,

    /// Queue this attempt is routed to
    pub task_queue: String,

    /// Queue of the run's workflow tasks, notified on an outcome
    pub workflow_task_queue: String,

    pub input: serde_json::Value,
    pub options: ActivityOptions,

    /// Attempt number (1-based)
    pub attempt: u32,
}

impl ActivityTask {
    /// Task for an attempt of an activity belonging to `run`
    pub fn new(
        run: &RunInfo,
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        task_queue: impl Into<String>,
        input: serde_json::Value,
        options: ActivityOptions,
        attempt: u32,
    ) -> Self {
        Self {
            task_id: Uuid::now_v7(),
            run_id: run.run_id,
            workflow_id: run.workflow_id.clone(),
            workflow_type: run.workflow_type.clone(),
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            task_queue: task_queue.into(),
            workflow_task_queue: run.task_queue.clone(),
            input,
            options,
            attempt,
        }
    }

    /// Same activity, next attempt
    pub fn next_attempt(&self, attempt: u32) -> Self {
        Self {
            task_id: Uuid::now_v7(),
            attempt,
            ..self.clone()
        }
    }
}

/// Request to advance a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTask {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: String,
}

impl WorkflowTask {
    pub fn for_run(run: &RunInfo) -> Self {
        Self {
            run_id: run.run_id,
            workflow_id: run.workflow_id.clone(),
            workflow_type: run.workflow_type.clone(),
            task_queue: run.task_queue.clone(),
        }
    }
}

/// Anything a worker can poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueTask {
    Workflow(WorkflowTask),
    Activity(ActivityTask),
}

impl QueueTask {
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::Workflow(task) => task.run_id,
            Self::Activity(task) => task.run_id,
        }
    }
}

/// A worker process announcing what it can execute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub task_queue: String,
    #[serde(default)]
    pub workflow_types: Vec<String>,
    #[serde(default)]
    pub activity_types: Vec<String>,
}

impl WorkerRegistration {
    pub fn new(worker_id: impl Into<String>, task_queue: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            task_queue: task_queue.into(),
            workflow_types: vec![],
            activity_types: vec![],
        }
    }

    pub fn with_workflow_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.workflow_types.extend(types.into_iter().map(Into::into));
        self
    }

    pub fn with_activity_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.activity_types.extend(types.into_iter().map(Into::into));
        self
    }

    /// Whether this worker has the code for a task
    pub fn can_handle(&self, task: &QueueTask) -> bool {
        match task {
            QueueTask::Workflow(t) => self.workflow_types.iter().any(|w| w == &t.workflow_type),
            QueueTask::Activity(t) => self.activity_types.iter().any(|a| a == &t.activity_type),
        }
    }
}
