//! Activity dispatch and timers
//!
//! The dispatcher owns activities from scheduling to their terminal outcome:
//! it queues attempts, applies retry policies, enforces timeouts and records
//! every outcome in the run history. The timer service does the same for
//! workflow timers and execution deadlines.

mod activity;
mod timers;

pub use activity::{ActivityDispatcher, DispatchError, DispatcherConfig};
pub use timers::TimerService;
