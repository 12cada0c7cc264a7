//! Keelrun worker
//!
//! A worker process hosting the durable runtime together with the order
//! fulfilment saga and its activities.

pub mod config;
pub mod order;
pub mod telemetry;

pub use config::WorkerConfig;
pub use order::{register_activities, ChargePayment, OrderInput, OrderWorkflow};
pub use telemetry::{init_telemetry, TelemetryConfig};
