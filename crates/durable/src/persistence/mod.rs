//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`WorkflowEventStore`] trait for the append-only run history
//! - [`InMemoryWorkflowEventStore`] for tests and local runs
//! - [`PostgresWorkflowEventStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryWorkflowEventStore;
pub use postgres::PostgresWorkflowEventStore;
pub use store::{
    append_with_retry, NewRun, RunFilter, RunInfo, RunStatus, StoreError, WorkflowEventStore,
};
