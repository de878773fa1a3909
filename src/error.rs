use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::jobs::identity::JobKey;

/// Feed unreachable or returned something we could not decode.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("feed request for {resource} failed: {source}")]
    Http {
        resource: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("feed {resource} answered with HTTP {status}")]
    Status { resource: String, status: u16 },
    #[error("feed {resource} is malformed: {source}")]
    Malformed {
        resource: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("{table} has no row with key {key}")]
    NotFound { table: &'static str, key: String },
    /// A chunk transaction failed; the `committed` chunks before it stay written.
    #[error("upsert into {table} failed on chunk {chunk} ({committed} earlier chunks committed): {source}")]
    Chunk {
        table: &'static str,
        chunk: usize,
        committed: usize,
        #[source]
        source: sqlx::Error,
    },
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job {0} is already registered")]
    DuplicateJob(JobKey),
    #[error("no handler registered for job type {0}")]
    UnknownJobType(String),
    #[error("job {job} declares parent {parent} which is not registered")]
    UnknownParent { job: JobKey, parent: JobKey },
    #[error("job {0} is not registered")]
    UnknownJob(JobKey),
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} did not finish within {deadline:?} and was killed")]
    TimedOut { program: String, deadline: Duration },
    #[error("{program} exited with {status}")]
    ExitStatus { program: String, status: String },
    #[error("{program} did not produce {path}")]
    MissingOutput { program: String, path: PathBuf },
    #[error("i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Everything a job's business method can fail with. The lifecycle wrapper
/// logs it and records it in the run marker; it never reaches the trigger.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Scheduling(#[from] SchedulerError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("job parameter {0} is missing")]
    MissingParameter(&'static str),
    #[error("job parameter {name} is invalid: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error("grabber output {path} is malformed: {source}")]
    MalformedOutput {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl From<sqlx::Error> for JobError {
    fn from(e: sqlx::Error) -> Self {
        JobError::Persistence(PersistenceError::Database(e))
    }
}
