pub mod bootstrap;
pub mod identity;
pub mod lifecycle;
pub mod markers;
pub mod scheduler;

pub use identity::{JobDescriptor, JobKey, JobParams, Trigger};
pub use lifecycle::{JobContext, JobHandler, JobOutcome, RunReport};
pub use scheduler::Scheduler;
