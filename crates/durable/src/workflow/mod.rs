//! Workflow abstractions and types
//!
//! This module contains the core workflow primitives:
//! - [`Workflow`] trait for defining workflow state machines
//! - [`WorkflowAction`] enum for workflow decisions
//! - [`WorkflowEvent`] enum for persisted history events
//! - [`WorkflowSignal`] for external communication

mod action;
mod definition;
mod event;
mod signal;

pub use action::{ActivityOptions, WorkflowAction};
pub use definition::{Workflow, WorkflowError};
pub use event::{EventKind, HistoryEvent, TimeoutType, WorkflowEvent};
pub use signal::WorkflowSignal;
