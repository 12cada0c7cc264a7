//! Load-aware task acceptance for worker pools

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Backpressure configuration
///
/// A pool stops polling once its load reaches the high watermark and
/// resumes when load falls back to the low watermark.
///
/// # Example
///
/// ```
/// use keelrun_durable::worker::BackpressureConfig;
///
/// let config = BackpressureConfig::default()
///     .with_high_watermark(0.85)
///     .with_low_watermark(0.65);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Stop polling at this share of max concurrency
    pub high_watermark: f64,

    /// Resume polling at this share of max concurrency
    pub low_watermark: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_watermark: 0.9,
            low_watermark: 0.7,
        }
    }
}

impl BackpressureConfig {
    pub fn with_high_watermark(mut self, watermark: f64) -> Self {
        self.high_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    pub fn with_low_watermark(mut self, watermark: f64) -> Self {
        self.low_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    pub fn validate(&self) -> Result<(), BackpressureError> {
        if self.low_watermark >= self.high_watermark {
            return Err(BackpressureError::InvalidConfig(
                "low_watermark must be less than high_watermark".into(),
            ));
        }
        Ok(())
    }
}

/// Backpressure-related errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackpressureError {
    #[error("invalid backpressure configuration: {0}")]
    InvalidConfig(String),
}

/// Load tracking with hysteresis
pub struct BackpressureState {
    config: BackpressureConfig,
    current_load: AtomicUsize,
    max_concurrency: usize,
    accepting: AtomicBool,
    reason: RwLock<Option<String>>,
}

impl BackpressureState {
    pub fn new(config: BackpressureConfig, max_concurrency: usize) -> Self {
        Self {
            config,
            current_load: AtomicUsize::new(0),
            max_concurrency: max_concurrency.max(1),
            accepting: AtomicBool::new(true),
            reason: RwLock::new(None),
        }
    }

    /// Whether the pool should poll for more work
    pub fn should_accept(&self) -> bool {
        let ratio = self.load_ratio();

        if self.accepting.load(Ordering::Relaxed) {
            if ratio >= self.config.high_watermark {
                self.accepting.store(false, Ordering::Relaxed);
                *self.reason.write() = Some(format!(
                    "load ratio {:.1}% exceeds high watermark",
                    ratio * 100.0
                ));
                return false;
            }
            true
        } else {
            if ratio <= self.config.low_watermark {
                self.accepting.store(true, Ordering::Relaxed);
                *self.reason.write() = None;
                return true;
            }
            false
        }
    }

    /// Count a task as running until the guard drops
    pub fn track(self: &Arc<Self>) -> LoadGuard {
        self.current_load.fetch_add(1, Ordering::Relaxed);
        LoadGuard {
            state: Arc::clone(self),
        }
    }

    pub fn current_load(&self) -> usize {
        self.current_load.load(Ordering::Relaxed)
    }

    pub fn load_ratio(&self) -> f64 {
        self.current_load() as f64 / self.max_concurrency as f64
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }

    pub fn backpressure_reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    pub fn available_slots(&self) -> usize {
        self.max_concurrency.saturating_sub(self.current_load())
    }

    /// Stop polling regardless of load
    pub fn pause(&self, reason: &str) {
        self.accepting.store(false, Ordering::Relaxed);
        *self.reason.write() = Some(reason.to_string());
    }
}

/// Running task counted against the pool's load
pub struct LoadGuard {
    state: Arc<BackpressureState>,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.state.current_load.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(max: usize) -> Arc<BackpressureState> {
        let config = BackpressureConfig::default()
            .with_high_watermark(0.8)
            .with_low_watermark(0.5);
        Arc::new(BackpressureState::new(config, max))
    }

    #[test]
    fn test_config_validation() {
        let invalid = BackpressureConfig::default()
            .with_high_watermark(0.5)
            .with_low_watermark(0.8);
        assert!(invalid.validate().is_err());
        assert!(BackpressureConfig::default().validate().is_ok());
    }

    #[test]
    fn test_stops_at_high_watermark() {
        let state = state(10);
        let _guards: Vec<_> = (0..8).map(|_| state.track()).collect();

        assert!(!state.should_accept());
        assert!(state.backpressure_reason().is_some());
    }

    #[test]
    fn test_hysteresis() {
        let state = state(10);
        let mut guards: Vec<_> = (0..8).map(|_| state.track()).collect();
        assert!(!state.should_accept());

        // 70%: between watermarks, still paused
        guards.pop();
        assert!(!state.should_accept());

        // 50%: resumes
        guards.truncate(5);
        assert!(state.should_accept());
        assert!(state.backpressure_reason().is_none());
    }

    #[test]
    fn test_guard_releases_load() {
        let state = state(4);
        {
            let _a = state.track();
            let _b = state.track();
            assert_eq!(state.current_load(), 2);
            assert_eq!(state.available_slots(), 2);
        }
        assert_eq!(state.current_load(), 0);
    }

    #[test]
    fn test_pause() {
        let state = state(10);
        state.pause("draining");
        assert!(!state.is_accepting());
        assert_eq!(state.backpressure_reason().as_deref(), Some("draining"));
    }
}
