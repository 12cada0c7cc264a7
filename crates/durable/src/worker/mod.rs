//! Worker pool for activity execution
//!
//! This module provides:
//! - [`WorkerPool`] - Polls a task queue and executes activities concurrently
//! - [`BackpressureConfig`] - Load-aware task acceptance configuration
//! - [`PollerConfig`] - Long polling with adaptive wait
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │  ┌─────────────┐                    ┌─────────────────────┐  │
//! │  │ TaskPoller  │ ◄── TaskQueueRouter│ ActivityDispatcher  │  │
//! │  │ (long poll) │                    │ (outcomes, retries) │  │
//! │  └──────┬──────┘                    └──────────▲──────────┘  │
//! │         │                                      │             │
//! │         ▼                                      │             │
//! │  ┌─────────────────────────────────────────────┴───────┐    │
//! │  │   BackpressureState + Semaphore-limited executors    │    │
//! │  │  [Activity 1] [Activity 2] ... [Activity N]          │    │
//! │  └──────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod backpressure;
mod poller;
mod pool;

pub use backpressure::{BackpressureConfig, BackpressureError, BackpressureState, LoadGuard};
pub use poller::{PollerConfig, PollerError, TaskPoller};
pub use pool::{
    ActivityHandler, ActivityResult, WorkerPool, WorkerPoolConfig, WorkerPoolError,
    WorkerPoolStatus,
};
