//! # Durable Execution Engine
//!
//! An event-sourced workflow engine for long-running business processes that
//! must survive crashes, restarts and transient failures of the services they
//! call.
//!
//! ## Features
//!
//! - **Event-sourced runs**: every state change is an event in an append-only,
//!   gap-free history guarded by optimistic concurrency
//! - **Deterministic replay**: workflow code is re-run against its history and
//!   any divergence fails the run instead of corrupting it
//! - **Retries and timeouts**: activities retry with exponential backoff and
//!   are bounded by schedule-to-start, start-to-close, schedule-to-close and
//!   heartbeat timeouts
//! - **Task queues**: named queues route work to workers that registered the
//!   matching workflow and activity types
//! - **Sagas**: compensations registered by workflow code run newest-first
//!   when a run fails
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      DurableRuntime                          │
//! │  (workflow task pollers, recovery, archiving)               │
//! └─────────────────────────────────────────────────────────────┘
//!        │                      │                       │
//!        ▼                      ▼                       ▼
//! ┌──────────────┐    ┌──────────────────┐    ┌─────────────────┐
//! │WorkflowEngine│    │ActivityDispatcher│    │  TimerService   │
//! │(replay, saga)│    │(retries,timeouts)│    │(timers,deadline)│
//! └──────────────┘    └──────────────────┘    └─────────────────┘
//!        │                      │                       │
//!        ▼                      ▼                       ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   WorkflowEventStore                         │
//! │  (in-memory or PostgreSQL: durable_runs, durable_run_events)│
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │ outcomes
//! ┌─────────────────────────────────────────────────────────────┐
//! │          TaskQueueRouter  ──►  WorkerPool                    │
//! │  (named FIFO queues)          (executes activities)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use keelrun_durable::prelude::*;
//!
//! struct OrderWorkflow {
//!     order: Order,
//! }
//!
//! impl Workflow for OrderWorkflow {
//!     const TYPE: &'static str = "order_workflow";
//!     type Input = Order;
//!     type Output = Receipt;
//!
//!     fn new(input: Self::Input) -> Self {
//!         Self { order: input }
//!     }
//!
//!     fn on_start(&mut self) -> Vec<WorkflowAction> {
//!         vec![
//!             WorkflowAction::compensate_with("release_inventory", json!(self.order.sku)),
//!             WorkflowAction::schedule_activity("reserve", "reserve_inventory", json!(self.order)),
//!         ]
//!     }
//!
//!     // ... implement the other handlers
//! }
//! ```

pub mod activity;
pub mod dispatcher;
pub mod engine;
pub mod persistence;
pub mod queue;
pub mod reliability;
pub mod runtime;
pub mod worker;
pub mod workflow;

mod duration_serde;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{Activity, ActivityContext, ActivityError};
    pub use crate::engine::{
        ExecutorConfig, ExecutorError, StartWorkflowRequest, StartWorkflowResponse,
        WorkflowEngine, WorkflowRegistry,
    };
    pub use crate::persistence::{
        InMemoryWorkflowEventStore, PostgresWorkflowEventStore, RunInfo, RunStatus, StoreError,
        WorkflowEventStore,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::runtime::{DurableRuntime, RuntimeConfig, RuntimeError};
    pub use crate::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
    pub use crate::workflow::{
        ActivityOptions, Workflow, WorkflowAction, WorkflowError, WorkflowEvent, WorkflowSignal,
    };
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityContext, ActivityError};
pub use engine::{
    ExecutorConfig, ExecutorError, StartWorkflowRequest, WorkflowEngine, WorkflowRegistry,
};
pub use persistence::{
    InMemoryWorkflowEventStore, PostgresWorkflowEventStore, RunInfo, RunStatus, StoreError,
    WorkflowEventStore,
};
pub use reliability::RetryPolicy;
pub use runtime::{DurableRuntime, RuntimeConfig, RuntimeError};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
pub use workflow::{
    ActivityOptions, Workflow, WorkflowAction, WorkflowError, WorkflowEvent, WorkflowSignal,
};
