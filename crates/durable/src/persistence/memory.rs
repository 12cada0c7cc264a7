//! In-memory implementation of WorkflowEventStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::workflow::{HistoryEvent, WorkflowEvent};

/// Internal run state
struct RunState {
    info: RunInfo,
    events: Vec<HistoryEvent>,
}

#[derive(Default)]
struct Inner {
    runs: HashMap<Uuid, RunState>,
    /// workflow_id -> run ids, oldest first
    by_workflow: HashMap<String, Vec<Uuid>>,
}

/// In-memory implementation of WorkflowEventStore
///
/// This is primarily for testing. It keeps everything behind a single lock
/// and provides the same semantics as the PostgreSQL implementation.
///
/// # Example
///
/// ```
/// use keelrun_durable::InMemoryWorkflowEventStore;
///
/// let store = InMemoryWorkflowEventStore::new();
/// assert_eq!(store.run_count(), 0);
/// ```
pub struct InMemoryWorkflowEventStore {
    inner: RwLock<Inner>,
}

impl InMemoryWorkflowEventStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Get the number of runs
    pub fn run_count(&self) -> usize {
        self.inner.read().runs.len()
    }

    /// Get the total number of events across all runs
    pub fn event_count(&self) -> usize {
        self.inner.read().runs.values().map(|r| r.events.len()).sum()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.runs.clear();
        inner.by_workflow.clear();
    }
}

impl Default for InMemoryWorkflowEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowEventStore for InMemoryWorkflowEventStore {
    async fn create_run(&self, run: NewRun) -> Result<RunInfo, StoreError> {
        let mut inner = self.inner.write();

        if inner.runs.contains_key(&run.run_id) {
            return Err(StoreError::RunAlreadyExists(run.run_id));
        }

        if let Some(open) = inner
            .by_workflow
            .get(&run.workflow_id)
            .and_then(|ids| ids.last())
            .and_then(|id| inner.runs.get(id))
            .filter(|r| !r.info.status.is_terminal())
        {
            return Err(StoreError::WorkflowAlreadyRunning {
                workflow_id: run.workflow_id.clone(),
                run_id: open.info.run_id,
            });
        }

        let now = Utc::now();
        let started = run.started_event();
        let info = RunInfo {
            workflow_id: run.workflow_id.clone(),
            run_id: run.run_id,
            workflow_type: run.workflow_type.clone(),
            task_queue: run.task_queue.clone(),
            version: run.version.clone(),
            status: status_after(RunStatus::Created, std::slice::from_ref(&started)),
            last_sequence: 1,
            created_at: now,
            closed_at: None,
            archived_at: None,
        };

        inner.runs.insert(
            run.run_id,
            RunState {
                info: info.clone(),
                events: vec![HistoryEvent {
                    run_id: run.run_id,
                    sequence_no: 1,
                    timestamp: now,
                    event: started,
                }],
            },
        );
        inner
            .by_workflow
            .entry(run.workflow_id)
            .or_default()
            .push(run.run_id);

        Ok(info)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<RunInfo, StoreError> {
        self.inner
            .read()
            .runs
            .get(&run_id)
            .map(|r| r.info.clone())
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn current_run(&self, workflow_id: &str) -> Result<Option<RunInfo>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .by_workflow
            .get(workflow_id)
            .and_then(|ids| ids.last())
            .and_then(|id| inner.runs.get(id))
            .map(|r| r.info.clone()))
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<RunInfo>, StoreError> {
        let inner = self.inner.read();
        let mut runs: Vec<RunInfo> = inner
            .runs
            .values()
            .map(|r| &r.info)
            .filter(|info| filter.matches(info))
            .cloned()
            .collect();

        // v7 ids sort by creation time
        runs.sort_by_key(|r| (r.created_at, r.run_id));
        if let Some(limit) = filter.limit {
            runs.truncate(limit);
        }
        Ok(runs)
    }

    async fn append_events(
        &self,
        run_id: Uuid,
        expected_sequence: u64,
        events: Vec<WorkflowEvent>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;

        check_append(&run.info, expected_sequence, &events)?;
        if events.is_empty() {
            return Ok(expected_sequence);
        }

        let now = Utc::now();
        let status = status_after(run.info.status, &events);
        let mut sequence_no = expected_sequence;
        for event in events {
            sequence_no += 1;
            run.events.push(HistoryEvent {
                run_id,
                sequence_no,
                timestamp: now,
                event,
            });
        }

        run.info.last_sequence = sequence_no;
        if status.is_terminal() && !run.info.status.is_terminal() {
            run.info.closed_at = Some(now);
        }
        run.info.status = status;

        Ok(sequence_no)
    }

    async fn load_events(&self, run_id: Uuid) -> Result<Vec<HistoryEvent>, StoreError> {
        self.inner
            .read()
            .runs
            .get(&run_id)
            .map(|r| r.events.clone())
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn archive_closed_runs(
        &self,
        closed_before: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        let mut archived = Vec::new();

        for run in inner.runs.values_mut() {
            let eligible = run.info.archived_at.is_none()
                && run.info.closed_at.is_some_and(|closed| closed < closed_before);
            if eligible {
                run.info.archived_at = Some(now);
                archived.push(run.info.run_id);
            }
        }

        Ok(archived)
    }
}
