//! PostgreSQL implementation of WorkflowEventStore
//!
//! Production persistence using PostgreSQL with:
//! - Optimistic concurrency control via the run's last sequence number
//! - Row locks on the run so appends to one run serialize
//! - A partial unique index allowing one open run per workflow id

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::workflow::{HistoryEvent, WorkflowEvent};

const RUN_COLUMNS: &str = "run_id, workflow_id, workflow_type, task_queue, version, status, \
                           last_sequence, created_at, closed_at, archived_at";

/// PostgreSQL implementation of WorkflowEventStore
///
/// # Example
///
/// ```ignore
/// use keelrun_durable::PostgresWorkflowEventStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/keelrun").await?;
/// let store = PostgresWorkflowEventStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowEventStore {
    pool: PgPool,
}

impl PostgresWorkflowEventStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to a database URL
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl WorkflowEventStore for PostgresWorkflowEventStore {
    #[instrument(skip(self, run), fields(workflow_id = %run.workflow_id, run_id = %run.run_id))]
    async fn create_run(&self, run: NewRun) -> Result<RunInfo, StoreError> {
        let started = run.started_event();
        let status = status_after(RunStatus::Created, std::slice::from_ref(&started));
        let payload = serde_json::to_value(&started)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let open: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT run_id FROM durable_runs
            WHERE workflow_id = $1 AND status IN ('created', 'running')
            "#,
        )
        .bind(&run.workflow_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if let Some(open_run) = open {
            return Err(StoreError::WorkflowAlreadyRunning {
                workflow_id: run.workflow_id,
                run_id: open_run,
            });
        }

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO durable_runs
                (run_id, workflow_id, workflow_type, task_queue, version, status,
                 last_sequence, continued_from)
            VALUES ($1, $2, $3, $4, $5, $6, 1, $7)
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run.run_id)
        .bind(&run.workflow_id)
        .bind(&run.workflow_type)
        .bind(&run.task_queue)
        .bind(&run.version)
        .bind(status.as_str())
        .bind(run.continued_from)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| create_error(e, &run))?;

        sqlx::query(
            r#"
            INSERT INTO durable_run_events (run_id, sequence_no, event_kind, payload)
            VALUES ($1, 1, $2, $3)
            "#,
        )
        .bind(run.run_id)
        .bind(started.kind().as_str())
        .bind(&payload)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!("created run");
        row_to_run_info(&row)
    }

    #[instrument(skip(self))]
    async fn get_run(&self, run_id: Uuid) -> Result<RunInfo, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM durable_runs WHERE run_id = $1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get run: {}", e);
            StoreError::Database(e.to_string())
        })?
        .ok_or(StoreError::RunNotFound(run_id))?;

        row_to_run_info(&row)
    }

    #[instrument(skip(self))]
    async fn current_run(&self, workflow_id: &str) -> Result<Option<RunInfo>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM durable_runs
            WHERE workflow_id = $1
            ORDER BY created_at DESC, run_id DESC
            LIMIT 1
            "#
        ))
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        row.as_ref().map(row_to_run_info).transpose()
    }

    #[instrument(skip(self))]
    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<RunInfo>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM durable_runs
            WHERE ($1::text IS NULL OR workflow_id = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3 OR archived_at IS NULL)
            ORDER BY created_at, run_id
            LIMIT $4
            "#
        ))
        .bind(filter.workflow_id.as_deref())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.include_archived)
        .bind(filter.limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_run_info).collect()
    }

    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn append_events(
        &self,
        run_id: Uuid,
        expected_sequence: u64,
        events: Vec<WorkflowEvent>,
    ) -> Result<u64, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        // Lock the run row; concurrent appenders queue here
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM durable_runs WHERE run_id = $1 FOR UPDATE"
        ))
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::RunNotFound(run_id))?;

        let run = row_to_run_info(&row)?;
        check_append(&run, expected_sequence, &events)?;
        if events.is_empty() {
            return Ok(expected_sequence);
        }

        let status = status_after(run.status, &events);
        let mut sequence_no = expected_sequence;
        for event in &events {
            sequence_no += 1;
            let payload = serde_json::to_value(event)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;

            sqlx::query(
                r#"
                INSERT INTO durable_run_events (run_id, sequence_no, event_kind, payload)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(run_id)
            .bind(sequence_no as i64)
            .bind(event.kind().as_str())
            .bind(&payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        sqlx::query(
            r#"
            UPDATE durable_runs
            SET last_sequence = $2,
                status = $3,
                closed_at = CASE WHEN $4 THEN NOW() ELSE closed_at END
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .bind(sequence_no as i64)
        .bind(status.as_str())
        .bind(status.is_terminal())
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(%run_id, last_sequence = sequence_no, "appended events");
        Ok(sequence_no)
    }

    #[instrument(skip(self))]
    async fn load_events(&self, run_id: Uuid) -> Result<Vec<HistoryEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence_no, payload, recorded_at
            FROM durable_run_events
            WHERE run_id = $1
            ORDER BY sequence_no
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if rows.is_empty() {
            // Distinguish "no such run" from an empty history
            self.get_run(run_id).await?;
        }

        rows.iter()
            .map(|row| {
                let data: serde_json::Value = row.get("payload");
                let event: WorkflowEvent = serde_json::from_value(data)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(HistoryEvent {
                    run_id,
                    sequence_no: row.get::<i64, _>("sequence_no") as u64,
                    timestamp: row.get("recorded_at"),
                    event,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn archive_closed_runs(
        &self,
        closed_before: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let archived: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE durable_runs
            SET archived_at = NOW()
            WHERE closed_at IS NOT NULL
              AND closed_at < $1
              AND archived_at IS NULL
            RETURNING run_id
            "#,
        )
        .bind(closed_before)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if !archived.is_empty() {
            debug!(count = archived.len(), "archived closed runs");
        }
        Ok(archived)
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn row_to_run_info(row: &PgRow) -> Result<RunInfo, StoreError> {
    let status: String = row.get("status");
    let status = RunStatus::parse(&status)
        .ok_or_else(|| StoreError::Database(format!("unknown run status: {}", status)))?;

    Ok(RunInfo {
        workflow_id: row.get("workflow_id"),
        run_id: row.get("run_id"),
        workflow_type: row.get("workflow_type"),
        task_queue: row.get("task_queue"),
        version: row.get("version"),
        status,
        last_sequence: row.get::<i64, _>("last_sequence") as u64,
        created_at: row.get("created_at"),
        closed_at: row.get("closed_at"),
        archived_at: row.get("archived_at"),
    })
}

/// Map insert failures on `durable_runs` to store errors
///
/// The partial unique index catches a concurrent start that slipped past the
/// open-run check.
fn create_error(e: sqlx::Error, run: &NewRun) -> StoreError {
    let unique = e
        .as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false);
    if !unique {
        return StoreError::Database(e.to_string());
    }

    let constraint = e
        .as_database_error()
        .and_then(|db| db.constraint().map(str::to_string));
    match constraint.as_deref() {
        Some("durable_runs_pkey") => StoreError::RunAlreadyExists(run.run_id),
        _ => StoreError::WorkflowAlreadyRunning {
            workflow_id: run.workflow_id.clone(),
            run_id: Uuid::nil(),
        },
    }
}
