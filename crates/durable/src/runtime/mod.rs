//! In-process runtime
//!
//! [`DurableRuntime`] hosts everything a process needs to execute workflows:
//! workflow task pollers, the activity dispatcher and its timeout sweeper,
//! durable timers, recovery after restart and archiving of closed runs.

mod config;
mod service;

pub use config::RuntimeConfig;
pub use service::{DurableRuntime, RuntimeError};
