//! Activity timeout detection
//!
//! Pure checks over an attempt's [`RetryState`]; the dispatcher's sweeper
//! decides what to do with a violation.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::RetryState;
use crate::workflow::{ActivityOptions, TimeoutType};

/// A timeout that has been exceeded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutViolation {
    /// Which timeout fired
    pub timeout_type: TimeoutType,

    /// Time spent in the measured window
    pub elapsed: Duration,

    /// Configured limit
    pub limit: Duration,
}

impl fmt::Display for TimeoutViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} timeout exceeded (elapsed {:?}, limit {:?})",
            self.timeout_type.as_str(),
            self.elapsed,
            self.limit
        )
    }
}

fn elapsed_since(from: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    now.signed_duration_since(from)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

fn exceeded(
    timeout_type: TimeoutType,
    from: DateTime<Utc>,
    now: DateTime<Utc>,
    limit: Duration,
) -> Option<TimeoutViolation> {
    let elapsed = elapsed_since(from, now);
    (elapsed > limit).then_some(TimeoutViolation {
        timeout_type,
        elapsed,
        limit,
    })
}

/// Check the overall schedule-to-close budget
pub fn check_schedule_to_close(
    state: &RetryState,
    options: &ActivityOptions,
    now: DateTime<Utc>,
) -> Option<TimeoutViolation> {
    let limit = options.schedule_to_close_timeout?;
    exceeded(
        TimeoutType::ScheduleToClose,
        state.first_scheduled_at,
        now,
        limit,
    )
}

/// Check that a queued attempt was picked up in time
pub fn check_schedule_to_start(
    state: &RetryState,
    options: &ActivityOptions,
    now: DateTime<Utc>,
) -> Option<TimeoutViolation> {
    if state.started_at.is_some() {
        return None;
    }
    exceeded(
        TimeoutType::ScheduleToStart,
        state.attempt_scheduled_at,
        now,
        options.schedule_to_start_timeout,
    )
}

/// Check that a running attempt reported in time
pub fn check_start_to_close(
    state: &RetryState,
    options: &ActivityOptions,
    now: DateTime<Utc>,
) -> Option<TimeoutViolation> {
    let started = state.started_at?;
    exceeded(
        TimeoutType::StartToClose,
        started,
        now,
        options.start_to_close_timeout,
    )
}

/// Check that a running attempt keeps heartbeating
pub fn check_heartbeat(
    state: &RetryState,
    options: &ActivityOptions,
    now: DateTime<Utc>,
) -> Option<TimeoutViolation> {
    let limit = options.heartbeat_timeout?;
    let started = state.started_at?;
    let last_seen = state.last_heartbeat_at.unwrap_or(started);
    exceeded(TimeoutType::Heartbeat, last_seen, now, limit)
}

/// First violated timeout for an attempt, most severe first
pub fn detect_timeout(
    state: &RetryState,
    options: &ActivityOptions,
    now: DateTime<Utc>,
) -> Option<TimeoutViolation> {
    check_schedule_to_close(state, options, now)
        .or_else(|| check_schedule_to_start(state, options, now))
        .or_else(|| check_start_to_close(state, options, now))
        .or_else(|| check_heartbeat(state, options, now))
}
