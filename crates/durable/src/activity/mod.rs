//! Activity abstractions
//!
//! Activities are units of work that are executed by workers. They:
//! - May fail and be retried according to the retry policy
//! - Can send heartbeats to indicate liveness
//! - Observe cancellation through a shared flag

mod context;
mod definition;

pub use context::{ActivityContext, CancellationHandle, HeartbeatError, HeartbeatPayload};
pub use definition::{Activity, ActivityError, CANCELLED_ERROR_TYPE, UNHANDLED_ERROR_TYPE};
