//! Activity trait definition

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::ActivityContext;
use crate::workflow::TimeoutType;

/// Error type prefix for timeout failures
const TIMEOUT_PREFIX: &str = "timeout.";

/// Error type for cancelled activities
pub const CANCELLED_ERROR_TYPE: &str = "cancelled";

/// Error type for activities nobody can execute
pub const UNHANDLED_ERROR_TYPE: &str = "unhandled_activity_type";

/// Error type for activity failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Whether this error is retryable
    ///
    /// Non-retryable errors will immediately fail the activity
    /// without further retry attempts.
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl ActivityError {
    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    /// Create a non-retryable error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    /// Timeout of an attempt or of the whole activity
    ///
    /// Attempt-level timeouts are retryable; a schedule-to-close timeout
    /// means the budget is spent and is not.
    pub fn timeout(timeout_type: TimeoutType) -> Self {
        let retryable = timeout_type != TimeoutType::ScheduleToClose;
        Self {
            message: format!("activity timed out ({})", timeout_type.as_str()),
            error_type: Some(format!("{}{}", TIMEOUT_PREFIX, timeout_type.as_str())),
            retryable,
            details: None,
        }
    }

    /// Activity was cancelled before it finished
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::non_retryable(reason).with_type(CANCELLED_ERROR_TYPE)
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Check if this error came from a timeout
    pub fn is_timeout(&self) -> bool {
        self.error_type
            .as_deref()
            .is_some_and(|t| t.starts_with(TIMEOUT_PREFIX))
    }

    /// Check if this error came from cancellation
    pub fn is_cancelled(&self) -> bool {
        self.error_type.as_deref() == Some(CANCELLED_ERROR_TYPE)
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActivityError {}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// An activity is a unit of work that may fail and be retried
///
/// Activities are the only place side effects happen. They:
/// - Are executed by workers outside the workflow
/// - May take a long time to complete
/// - Can fail and be retried independently per policy
/// - Can send heartbeats for liveness and observe cancellation
///
/// Because an attempt can run more than once (a worker may crash after
/// doing the work but before reporting), implementations should be
/// idempotent.
///
/// # Example
///
/// ```ignore
/// use keelrun_durable::prelude::*;
///
/// struct ChargePayment;
///
/// #[async_trait]
/// impl Activity for ChargePayment {
///     const TYPE: &'static str = "ChargePayment";
///     type Input = ChargeInput;
///     type Output = ChargeReceipt;
///
///     async fn execute(
///         &self,
///         ctx: &ActivityContext,
///         input: Self::Input,
///     ) -> Result<Self::Output, ActivityError> {
///         // Call the payment provider...
///         Ok(ChargeReceipt { charge_id: "..." })
///     }
/// }
/// ```
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Unique type identifier for this activity
    ///
    /// Workers register handlers under this name and the router matches
    /// tasks against it.
    const TYPE: &'static str;

    /// Input type for the activity
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type for the activity
    type Output: Serialize + DeserializeOwned + Send;

    /// Execute the activity
    ///
    /// # Errors
    ///
    /// Return `ActivityError::retryable()` for transient failures that should be retried.
    /// Return `ActivityError::non_retryable()` for permanent failures.
    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_error_retryable() {
        let error = ActivityError::retryable("timeout");
        assert!(error.retryable);
        assert_eq!(error.to_string(), "timeout");
    }

    #[test]
    fn test_activity_error_non_retryable() {
        let error = ActivityError::non_retryable("invalid input");
        assert!(!error.retryable);
    }

    #[test]
    fn test_timeout_errors() {
        let error = ActivityError::timeout(TimeoutType::StartToClose);
        assert!(error.retryable);
        assert!(error.is_timeout());
        assert_eq!(error.error_type.as_deref(), Some("timeout.start_to_close"));

        let error = ActivityError::timeout(TimeoutType::ScheduleToClose);
        assert!(!error.retryable);
        assert!(error.is_timeout());
    }

    #[test]
    fn test_cancelled_error() {
        let error = ActivityError::cancelled("run cancelled");
        assert!(error.is_cancelled());
        assert!(!error.retryable);
        assert!(!error.is_timeout());
    }

    #[test]
    fn test_activity_error_serialization() {
        let error = ActivityError::retryable("test error")
            .with_type("TEST")
            .with_details(serde_json::json!({"key": "value"}));

        let json = serde_json::to_string(&error).unwrap();
        let parsed: ActivityError = serde_json::from_str(&json).unwrap();

        assert_eq!(error, parsed);
    }
}
