pub mod database_ops;
pub mod env_boot;
pub mod error;
pub mod fanout;
pub mod feed;
pub mod ingest;
pub mod jobs;
pub mod logging;
pub mod settings;
pub mod util;

pub use database_ops::{Entity, Repository, SaveReport};
pub use error::{FetchError, JobError, PersistenceError, ProcessError, SchedulerError};
pub use jobs::{JobContext, JobDescriptor, JobHandler, JobKey, JobOutcome, Scheduler, Trigger};
pub use settings::Settings;
pub use util::db::Db;
