//! Workflow execution engine
//!
//! The engine module provides the `WorkflowEngine` which drives workflow
//! state machines through event replay, along with the pure [`replay`]
//! function and the saga compensation stack it maintains.

mod command;
mod executor;
mod registry;
pub mod replay;
mod saga;

pub use command::Command;
pub use executor::{
    ExecutorConfig, ExecutorError, StartWorkflowRequest, StartWorkflowResponse, WorkflowEngine,
};
pub use registry::{AnyWorkflow, RegistryError, WorkflowFactory, WorkflowRegistry};
pub use replay::{replay, PendingActivity, PendingTimer, ReplayError, ReplayOutcome};
pub use saga::{compensation_activity_id, CompensationEntry, CompensationStack};
