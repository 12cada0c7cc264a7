//! Task queues
//!
//! Workflow tasks and activity tasks travel through named queues; workers
//! register on a queue with the workflow and activity types they implement.

mod router;
mod task;

pub use router::{RouterConfig, RouterError, TaskQueueRouter};
pub use task::{ActivityTask, QueueTask, WorkerRegistration, WorkflowTask};
