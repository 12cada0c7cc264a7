//! Retry policy and per-activity retry state

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::activity::ActivityError;
use crate::duration_serde;

/// Configuration for activity retries
///
/// The delay after the n-th failed attempt is
/// `min(initial_interval * backoff_coefficient^(n-1), max_interval)`,
/// optionally spread by `jitter`.
///
/// # Example
///
/// ```
/// use keelrun_durable::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(5)
///     .with_initial_interval(Duration::from_secs(1))
///     .with_max_interval(Duration::from_secs(60));
///
/// assert_eq!(policy.backoff_delay(1), Duration::from_secs(1));
/// assert_eq!(policy.backoff_delay(2), Duration::from_secs(2));
/// assert_eq!(policy.backoff_delay(3), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including initial)
    pub max_attempts: u32,

    /// Delay after the first failed attempt
    #[serde(with = "duration_serde")]
    pub initial_interval: Duration,

    /// Maximum delay between attempts
    #[serde(with = "duration_serde")]
    pub max_interval: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0) to add randomness
    ///
    /// A value of 0.1 means ±10% randomness. Zero keeps delays exact and
    /// monotonic.
    #[serde(default)]
    pub jitter: f64,

    /// Error types that should NOT be retried
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Create an exponential backoff retry policy with sensible defaults
    ///
    /// - 5 max attempts
    /// - 1 second initial interval
    /// - 60 second max interval
    /// - 2x backoff coefficient
    /// - no jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Create a policy with fixed intervals (no backoff)
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the initial retry interval
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the maximum retry interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the backoff coefficient
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Add a non-retryable error type
    pub fn with_non_retryable_error(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_errors.push(error_type.into());
        self
    }

    /// Delay before the next attempt, given how many attempts have failed
    ///
    /// Out-of-range fields, e.g. from a hand-written policy document, are
    /// clamped rather than trusted.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }

        // f64::max also maps NaN to 1.0
        let coefficient = self.backoff_coefficient.max(1.0);
        let exponent = i32::try_from(attempts - 1).unwrap_or(i32::MAX);
        let base = self.initial_interval.as_secs_f64() * coefficient.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jitter = self.jitter.clamp(0.0, 1.0);
        let jittered = if jitter > 0.0 && capped > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * jitter;
            let jitter_offset = rng.gen_range(-jitter_range..=jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        Duration::try_from_secs_f64(jittered).unwrap_or(self.max_interval)
    }

    /// Check if an error type should be retried
    pub fn should_retry(&self, error_type: Option<&str>) -> bool {
        match error_type {
            Some(error_type) => !self.non_retryable_errors.iter().any(|e| e == error_type),
            None => true,
        }
    }

    /// Check if there are remaining attempts
    pub fn has_attempts_remaining(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Schedule another attempt after `delay`
    Retry { next_attempt: u32, delay: Duration },

    /// Give up; the activity fails terminally
    GiveUp,
}

/// Attempt bookkeeping for one activity
///
/// Owned by the dispatcher and dropped once the activity reaches a terminal
/// outcome. After a crash it is rebuilt from the history.
#[derive(Debug, Clone)]
pub struct RetryState {
    /// Attempts made so far, including the current one
    pub attempts: u32,

    /// When attempt 1 was scheduled
    pub first_scheduled_at: DateTime<Utc>,

    /// When the current attempt was handed to the queue
    pub attempt_scheduled_at: DateTime<Utc>,

    /// When a worker picked the current attempt up
    pub started_at: Option<DateTime<Utc>>,

    /// Last heartbeat of the current attempt
    pub last_heartbeat_at: Option<DateTime<Utc>>,

    /// Delay computed after the last failure
    pub last_delay: Duration,
}

impl RetryState {
    /// State for an attempt that was just scheduled
    pub fn new(attempt: u32, first_scheduled_at: DateTime<Utc>) -> Self {
        Self {
            attempts: attempt.max(1),
            first_scheduled_at,
            attempt_scheduled_at: Utc::now(),
            started_at: None,
            last_heartbeat_at: None,
            last_delay: Duration::ZERO,
        }
    }

    /// Decide whether a failed attempt is retried
    pub fn on_failure(&mut self, policy: &RetryPolicy, error: &ActivityError) -> RetryDecision {
        if !error.retryable
            || !policy.should_retry(error.error_type.as_deref())
            || !policy.has_attempts_remaining(self.attempts)
        {
            return RetryDecision::GiveUp;
        }

        self.last_delay = policy.backoff_delay(self.attempts);
        RetryDecision::Retry {
            next_attempt: self.attempts + 1,
            delay: self.last_delay,
        }
    }

    /// Move to the next attempt once it is handed to the queue
    pub fn begin_attempt(&mut self, attempt: u32) {
        self.attempts = attempt;
        self.attempt_scheduled_at = Utc::now();
        self.started_at = None;
        self.last_heartbeat_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_defaults() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_interval, Duration::from_secs(1));
        assert_eq!(policy.backoff_coefficient, 2.0);
        assert_eq!(policy.jitter, 0.0);
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.has_attempts_remaining(1));
    }

    #[test]
    fn test_fixed_interval() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5), 3);

        assert_eq!(policy.backoff_delay(1), Duration::from_secs(5));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_delay() {
        let policy = RetryPolicy::exponential();

        assert_eq!(policy.backoff_delay(0), Duration::ZERO);
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(4));
    }

    #[test]
    fn test_max_interval_cap() {
        let policy = RetryPolicy::exponential().with_max_interval(Duration::from_secs(5));

        assert_eq!(policy.backoff_delay(10), Duration::from_secs(5));
        assert_eq!(policy.backoff_delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_delays_never_decrease() {
        let policy = RetryPolicy::exponential()
            .with_initial_interval(Duration::from_millis(100))
            .with_backoff_coefficient(1.7)
            .with_max_interval(Duration::from_secs(3));

        let delays: Vec<_> = (1..20).map(|n| policy.backoff_delay(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(3)));
    }

    #[test]
    fn test_unbounded_interval_saturates() {
        let policy = RetryPolicy::fixed(Duration::MAX, 3);

        assert_eq!(policy.backoff_delay(1), Duration::MAX);
        assert_eq!(policy.backoff_delay(2), Duration::MAX);
    }

    #[test]
    fn test_decoded_policy_with_bad_fields_is_clamped() {
        let mut doc = serde_json::to_value(RetryPolicy::exponential()).unwrap();
        doc["backoff_coefficient"] = serde_json::json!(-2.0);
        doc["jitter"] = serde_json::json!(7.5);
        let policy: RetryPolicy = serde_json::from_value(doc).unwrap();
        assert_eq!(policy.backoff_coefficient, -2.0);

        // a coefficient below 1 is treated as a fixed interval
        for attempts in 1..5 {
            let delay = policy.backoff_delay(attempts);
            assert!(delay <= Duration::from_secs(2), "attempt {attempts}: {delay:?}");
        }
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::fixed(Duration::from_millis(1000), 5).with_jitter(0.1);

        for _ in 0..50 {
            let delay = policy.backoff_delay(1);
            assert!(delay >= Duration::from_millis(900));
            assert!(delay <= Duration::from_millis(1100));
        }
    }

    #[test]
    fn test_non_retryable_errors() {
        let policy = RetryPolicy::exponential()
            .with_non_retryable_error("INVALID_INPUT")
            .with_non_retryable_error("NOT_FOUND");

        assert!(!policy.should_retry(Some("INVALID_INPUT")));
        assert!(!policy.should_retry(Some("NOT_FOUND")));
        assert!(policy.should_retry(Some("TIMEOUT")));
        assert!(policy.should_retry(None));
    }

    #[test]
    fn test_has_attempts_remaining() {
        let policy = RetryPolicy::exponential().with_max_attempts(3);

        assert!(policy.has_attempts_remaining(1));
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));
    }

    #[test]
    fn test_retry_state_walks_attempts_until_exhausted() {
        let policy = RetryPolicy::exponential()
            .with_max_attempts(3)
            .with_initial_interval(Duration::from_millis(10));
        let error = ActivityError::retryable("flaky");
        let mut state = RetryState::new(1, Utc::now());

        assert_eq!(
            state.on_failure(&policy, &error),
            RetryDecision::Retry {
                next_attempt: 2,
                delay: Duration::from_millis(10)
            }
        );
        state.begin_attempt(2);

        assert_eq!(
            state.on_failure(&policy, &error),
            RetryDecision::Retry {
                next_attempt: 3,
                delay: Duration::from_millis(20)
            }
        );
        state.begin_attempt(3);

        assert_eq!(state.on_failure(&policy, &error), RetryDecision::GiveUp);
    }

    #[test]
    fn test_retry_state_gives_up_on_non_retryable() {
        let policy = RetryPolicy::exponential().with_non_retryable_error("declined");
        let mut state = RetryState::new(1, Utc::now());

        let declined = ActivityError::retryable("card declined").with_type("declined");
        assert_eq!(state.on_failure(&policy, &declined), RetryDecision::GiveUp);

        let fatal = ActivityError::non_retryable("bad input");
        assert_eq!(state.on_failure(&policy, &fatal), RetryDecision::GiveUp);
    }

    #[test]
    fn test_serialization() {
        let policy = RetryPolicy::exponential()
            .with_max_attempts(10)
            .with_non_retryable_error("TEST");

        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();

        assert_eq!(policy, parsed);
    }
}
