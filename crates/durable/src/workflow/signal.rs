//! Workflow signals for external communication

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// External signal delivered to a running workflow
///
/// A signal is appended to the run's history as `SignalReceived` and handed
/// to `Workflow::on_signal` during replay. `sent_at` is captured when the
/// signal is accepted, so replay sees the recorded value.
///
/// # Example
///
/// ```ignore
/// let signal = WorkflowSignal::new("address_changed", json!({"zip": "94107"}));
/// runtime.signal("order-42", signal).await?;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSignal {
    /// Signal name
    pub name: String,

    /// Signal payload (JSON)
    pub payload: serde_json::Value,

    /// When the signal was accepted
    pub sent_at: DateTime<Utc>,
}

impl WorkflowSignal {
    /// Create a new signal
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
            sent_at: Utc::now(),
        }
    }

    /// Check the signal name
    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }
}
