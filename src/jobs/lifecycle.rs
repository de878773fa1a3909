//! The envelope every job fire goes through.
//!
//! [`run_guarded`] checks parent markers, invokes the handler, contains both
//! errors and panics, and records the outcome. Nothing a handler does can
//! reach the trigger that fired it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::{error, info, warn, Instrument};

use super::identity::{JobKey, JobParams};
use super::markers::RunMarkers;
use super::scheduler::Scheduler;
use crate::error::JobError;

/// Business logic of one job type. One handler instance serves every job
/// registered with its type; per-job data arrives through [`JobContext`].
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn execute(&self, ctx: &JobContext) -> Result<JobOutcome, JobError>;
}

/// What a running job gets to see.
#[derive(Clone)]
pub struct JobContext {
    pub key: JobKey,
    pub params: Arc<JobParams>,
    pub scheduler: Scheduler,
    pub fired_at: DateTime<Utc>,
}

impl JobContext {
    pub fn param(&self, name: &'static str) -> Result<&str, JobError> {
        match self.params.get(name) {
            Some(v) if !v.trim().is_empty() => Ok(v),
            _ => Err(JobError::MissingParameter(name)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Work done; `items` is whatever the job counts (rows saved, jobs registered).
    Completed { items: usize },
    /// Nothing to do this time. Not a success: no marker is written.
    Skipped(String),
}

/// Result of one guarded fire, for callers that want to inspect it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReport {
    Completed { items: usize, took: Duration },
    Skipped(String),
    Failed(String),
}

pub async fn run_guarded(
    handler: Arc<dyn JobHandler>,
    ctx: JobContext,
    parents: &[JobKey],
    markers: &RunMarkers,
) -> RunReport {
    let span = tracing::info_span!("job", job = %ctx.key);
    async move {
        if !parents.is_empty() {
            match markers.pending_parents(parents).await {
                Ok(pending) if !pending.is_empty() => {
                    let waiting: Vec<String> = pending.iter().map(ToString::to_string).collect();
                    info!(waiting_on = ?waiting, "parents have not succeeded yet; skipping");
                    return RunReport::Skipped(format!("waiting on {}", waiting.join(", ")));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "could not read parent markers; skipping");
                    return RunReport::Skipped(format!("parent markers unavailable: {e}"));
                }
            }
        }

        let started = Instant::now();
        let outcome = AssertUnwindSafe(handler.execute(&ctx)).catch_unwind().await;
        let took = started.elapsed();

        match outcome {
            Ok(Ok(JobOutcome::Completed { items })) => {
                info!(items, took_ms = took.as_millis() as u64, "job completed");
                if let Err(e) = markers.record_success(&ctx.key, took).await {
                    warn!(error = %e, "failed to record success marker");
                }
                RunReport::Completed { items, took }
            }
            Ok(Ok(JobOutcome::Skipped(reason))) => {
                info!(reason = %reason, "job skipped");
                RunReport::Skipped(reason)
            }
            Ok(Err(e)) => {
                error!(error = %e, took_ms = took.as_millis() as u64, "job failed");
                let msg = e.to_string();
                if let Err(e) = markers.record_failure(&ctx.key, &msg, took).await {
                    warn!(error = %e, "failed to record failure marker");
                }
                RunReport::Failed(msg)
            }
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                error!(panic = %msg, "job panicked");
                if let Err(e) = markers.record_failure(&ctx.key, &msg, took).await {
                    warn!(error = %e, "failed to record failure marker");
                }
                RunReport::Failed(msg)
            }
        }
    }
    .instrument(span)
    .await
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::util::db::Db;

    struct Fails;

    #[async_trait]
    impl JobHandler for Fails {
        async fn execute(&self, _ctx: &JobContext) -> Result<JobOutcome, JobError> {
            Err(FetchError::Status {
                resource: "languages".into(),
                status: 503,
            }
            .into())
        }
    }

    struct Panics;

    #[async_trait]
    impl JobHandler for Panics {
        async fn execute(&self, _ctx: &JobContext) -> Result<JobOutcome, JobError> {
            panic!("mapper bug")
        }
    }

    struct Counts(usize);

    #[async_trait]
    impl JobHandler for Counts {
        async fn execute(&self, _ctx: &JobContext) -> Result<JobOutcome, JobError> {
            Ok(JobOutcome::Completed { items: self.0 })
        }
    }

    async fn setup() -> (Scheduler, RunMarkers) {
        let db = Db::in_memory().await.unwrap();
        let markers = RunMarkers::new(db);
        (Scheduler::new(markers.clone(), 2), markers)
    }

    fn ctx(scheduler: &Scheduler, name: &str) -> JobContext {
        JobContext {
            key: JobKey::catalog(name),
            params: Arc::new(JobParams::default()),
            scheduler: scheduler.clone(),
            fired_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn errors_are_contained_and_recorded() {
        let (scheduler, markers) = setup().await;
        let report = run_guarded(Arc::new(Fails), ctx(&scheduler, "languages"), &[], &markers).await;
        assert!(matches!(report, RunReport::Failed(ref m) if m.contains("503")));
        let all = markers.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].last_success_at.is_none());
        assert!(all[0].last_failure_at.is_some());
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let (scheduler, markers) = setup().await;
        let report = run_guarded(Arc::new(Panics), ctx(&scheduler, "channels"), &[], &markers).await;
        assert_eq!(report, RunReport::Failed("panic: mapper bug".into()));
    }

    #[tokio::test]
    async fn children_skip_until_parents_succeed() {
        let (scheduler, markers) = setup().await;
        let parent = JobKey::catalog("countries");
        let child = ctx(&scheduler, "subdivisions");

        let report = run_guarded(Arc::new(Counts(3)), child.clone(), &[parent.clone()], &markers).await;
        assert!(matches!(report, RunReport::Skipped(_)));
        assert!(markers.last_success(&child.key).await.unwrap().is_none());

        markers.record_success(&parent, Duration::ZERO).await.unwrap();
        let report = run_guarded(Arc::new(Counts(3)), child.clone(), &[parent], &markers).await;
        assert!(matches!(report, RunReport::Completed { items: 3, .. }));
        assert!(markers.last_success(&child.key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn blank_params_count_as_missing() {
        let (scheduler, _) = setup().await;
        let mut c = ctx(&scheduler, "grab");
        c.params = Arc::new([("site", "tv.com"), ("lang", " ")].into_iter().collect());
        assert_eq!(c.param("site").unwrap(), "tv.com");
        assert!(matches!(c.param("lang"), Err(JobError::MissingParameter("lang"))));
        assert!(matches!(c.param("days"), Err(JobError::MissingParameter("days"))));
    }
}
