//! Reliability patterns for durable execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Configurable retry with exponential backoff
//! - [`RetryState`] - Per-activity attempt bookkeeping
//! - Timeout checks for schedule-to-start, start-to-close, schedule-to-close and heartbeats

mod retry;
mod timeout;

pub use retry::{RetryDecision, RetryPolicy, RetryState};
pub use timeout::{
    check_heartbeat, check_schedule_to_close, check_schedule_to_start, check_start_to_close,
    detect_timeout, TimeoutViolation,
};
