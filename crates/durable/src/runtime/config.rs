//! Runtime configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dispatcher::DispatcherConfig;
use crate::duration_serde;
use crate::engine::ExecutorConfig;
use crate::queue::RouterConfig;
use crate::worker::PollerConfig;

/// Configuration of a [`DurableRuntime`](super::DurableRuntime)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Identifies this process to the router
    pub worker_id: String,

    /// Concurrent workflow task pollers per served queue
    pub workflow_pollers: usize,

    pub poller: PollerConfig,
    pub executor: ExecutorConfig,
    pub dispatcher: DispatcherConfig,
    pub router: RouterConfig,

    /// Archive closed runs older than this; `None` keeps them live
    #[serde(with = "duration_serde::option")]
    pub retention: Option<Duration>,

    /// How often the archiver runs
    #[serde(with = "duration_serde")]
    pub archive_interval: Duration,

    /// How long shutdown waits for background loops
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("runtime-{}", Uuid::now_v7()),
            workflow_pollers: 2,
            poller: PollerConfig::default(),
            executor: ExecutorConfig::default(),
            dispatcher: DispatcherConfig::default(),
            router: RouterConfig::default(),
            retention: None,
            archive_interval: Duration::from_secs(3600),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl RuntimeConfig {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_workflow_pollers(mut self, pollers: usize) -> Self {
        self.workflow_pollers = pollers.max(1);
        self
    }

    pub fn with_poller(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }

    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_router(mut self, router: RouterConfig) -> Self {
        self.router = router;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn with_archive_interval(mut self, interval: Duration) -> Self {
        self.archive_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_partial_config() {
        let config: RuntimeConfig = serde_json::from_str(
            r#"{"worker_id": "w-1", "retention": 86400000, "dispatcher": {"sweep_interval": 250}}"#,
        )
        .unwrap();

        assert_eq!(config.worker_id, "w-1");
        assert_eq!(config.retention, Some(Duration::from_secs(86400)));
        assert_eq!(config.dispatcher.sweep_interval, Duration::from_millis(250));
        assert_eq!(config.workflow_pollers, 2);
    }
}
