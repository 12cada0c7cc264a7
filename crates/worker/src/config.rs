//! Worker process configuration

use std::time::Duration;

use keelrun_durable::worker::WorkerPoolConfig;
use keelrun_durable::RuntimeConfig;
use uuid::Uuid;

/// Settings read from the environment
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Queue for both workflow and activity tasks
    pub task_queue: String,
    /// Postgres URL; the in-memory store is used when unset
    pub database_url: Option<String>,
    pub max_concurrent_activities: usize,
    pub workflow_pollers: usize,
    /// Archive closed runs after this long
    pub retention: Option<Duration>,
    /// Share of charge attempts that fail, for exercising retries
    pub charge_failure_rate: f64,
    /// Start a sample order on boot
    pub start_demo_order: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            task_queue: "order-task-queue".to_string(),
            database_url: None,
            max_concurrent_activities: 10,
            workflow_pollers: 2,
            retention: None,
            charge_failure_rate: 0.0,
            start_demo_order: false,
        }
    }
}

impl WorkerConfig {
    /// Read the configuration from the environment
    ///
    /// - `WORKER_ID`, `TASK_QUEUE`, `DATABASE_URL`
    /// - `MAX_CONCURRENT_TASKS`, `WORKFLOW_POLLERS`
    /// - `RETENTION_HOURS`: archive closed runs older than this
    /// - `CHARGE_FAILURE_RATE`: 0.0 to 1.0
    /// - `RUN_DEMO`: "true" to start a sample order
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_id: std::env::var("WORKER_ID").unwrap_or(defaults.worker_id),
            task_queue: std::env::var("TASK_QUEUE").unwrap_or(defaults.task_queue),
            database_url: std::env::var("DATABASE_URL").ok(),
            max_concurrent_activities: parse_env("MAX_CONCURRENT_TASKS")
                .unwrap_or(defaults.max_concurrent_activities),
            workflow_pollers: parse_env("WORKFLOW_POLLERS").unwrap_or(defaults.workflow_pollers),
            retention: parse_env::<u64>("RETENTION_HOURS")
                .map(|hours| Duration::from_secs(hours * 3600)),
            charge_failure_rate: parse_env::<f64>("CHARGE_FAILURE_RATE")
                .map(|rate| rate.clamp(0.0, 1.0))
                .unwrap_or(defaults.charge_failure_rate),
            start_demo_order: std::env::var("RUN_DEMO")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        let config = RuntimeConfig::default()
            .with_worker_id(&self.worker_id)
            .with_workflow_pollers(self.workflow_pollers);
        match self.retention {
            Some(retention) => config.with_retention(retention),
            None => config,
        }
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new(&self.task_queue)
            .with_worker_id(format!("{}-activities", self.worker_id))
            .with_max_concurrency(self.max_concurrent_activities)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
