//! In-process job scheduler.
//!
//! Owns the job-type registry and the set of registered jobs. Each registered
//! job gets one driver task that sleeps until the trigger's first fire and
//! then ticks at its interval (or fires once and deregisters). A fire is
//! dispatched onto its own task, bounded by the worker pool of its job group,
//! and always goes through [`run_guarded`]. Groups without a pool of their own
//! share the default pool. A non-concurrent job that is still
//! running when its next tick arrives has that tick dropped, not queued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::identity::{JobDescriptor, JobKey, Repeat, Trigger, TriggerStart};
use super::lifecycle::{run_guarded, JobContext, JobHandler, RunReport};
use super::markers::RunMarkers;
use crate::error::SchedulerError;

const MIN_PERIOD: Duration = Duration::from_millis(1);
/// Upper bound on the permits of any one worker pool.
pub const MAX_POOL_PERMITS: usize = 4_096;

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    jobs: Mutex<HashMap<JobKey, Arc<ScheduledJob>>>,
    markers: RunMarkers,
    default_pool: WorkerPool,
    group_pools: HashMap<String, WorkerPool>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
struct WorkerPool {
    permits: Arc<Semaphore>,
    size: u32,
}

impl WorkerPool {
    fn new(size: usize) -> Self {
        let size = size.clamp(1, MAX_POOL_PERMITS);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size: size as u32,
        }
    }
}

struct ScheduledJob {
    descriptor: JobDescriptor,
    trigger: Trigger,
    handler: Arc<dyn JobHandler>,
    pool: WorkerPool,
    in_flight: AtomicUsize,
    fires: AtomicU64,
    overlaps_skipped: AtomicU64,
    cancel: CancellationToken,
}

/// Point-in-time view of one registered job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub key: JobKey,
    pub job_type: String,
    pub parents: Vec<JobKey>,
    pub trigger: String,
    pub running: bool,
    pub fires: u64,
    pub overlaps_skipped: u64,
}

/// Decrements the in-flight count however the run ends.
struct InFlight(Arc<ScheduledJob>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Inner {
    fn jobs(&self) -> MutexGuard<'_, HashMap<JobKey, Arc<ScheduledJob>>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pool(&self, group: &str) -> WorkerPool {
        self.group_pools
            .get(group)
            .unwrap_or(&self.default_pool)
            .clone()
    }

    fn handler(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        let handlers = self.handlers.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.get(job_type).cloned()
    }

    /// Drop `job` from the registry unless it was already replaced.
    fn remove_if_same(&self, job: &Arc<ScheduledJob>) {
        let mut jobs = self.jobs();
        if let Some(current) = jobs.get(&job.descriptor.key) {
            if Arc::ptr_eq(current, job) {
                jobs.remove(&job.descriptor.key);
            }
        }
    }
}

impl Scheduler {
    /// `concurrency` caps how many job fires execute at once across all jobs.
    pub fn new(markers: RunMarkers, concurrency: usize) -> Self {
        Self::with_group_pools(markers, concurrency, &[])
    }

    /// Like [`Scheduler::new`], but jobs of each listed group draw from a pool
    /// of their own, so long runs in one group never hold the permits of
    /// another. Sizes are clamped to `1..=MAX_POOL_PERMITS`.
    pub fn with_group_pools(markers: RunMarkers, concurrency: usize, group_pools: &[(&str, usize)]) -> Self {
        Self {
            inner: Arc::new(Inner {
                handlers: RwLock::new(HashMap::new()),
                jobs: Mutex::new(HashMap::new()),
                markers,
                default_pool: WorkerPool::new(concurrency),
                group_pools: group_pools
                    .iter()
                    .map(|(group, size)| (group.to_string(), WorkerPool::new(*size)))
                    .collect(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn markers(&self) -> &RunMarkers {
        &self.inner.markers
    }

    /// Bind `job_type` to the handler that runs every job of that type.
    /// Re-registering a type replaces the handler for jobs scheduled later.
    pub fn register_handler(&self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.insert(job_type.into(), handler);
    }

    /// Register a job with its trigger and start driving it. Parents must
    /// already be registered; identities are unique.
    pub fn schedule(&self, descriptor: JobDescriptor, trigger: Trigger) -> Result<(), SchedulerError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        let handler = self
            .inner
            .handler(&descriptor.job_type)
            .ok_or_else(|| SchedulerError::UnknownJobType(descriptor.job_type.clone()))?;

        let job = {
            let mut jobs = self.inner.jobs();
            if jobs.contains_key(&descriptor.key) {
                return Err(SchedulerError::DuplicateJob(descriptor.key));
            }
            if let Some(parent) = descriptor.parents.iter().find(|p| !jobs.contains_key(*p)) {
                return Err(SchedulerError::UnknownParent {
                    job: descriptor.key.clone(),
                    parent: parent.clone(),
                });
            }
            let pool = self.inner.pool(&descriptor.key.group);
            let job = Arc::new(ScheduledJob {
                descriptor,
                trigger,
                handler,
                pool,
                in_flight: AtomicUsize::new(0),
                fires: AtomicU64::new(0),
                overlaps_skipped: AtomicU64::new(0),
                cancel: self.inner.shutdown.child_token(),
            });
            jobs.insert(job.descriptor.key.clone(), job.clone());
            job
        };

        info!(
            job = %job.descriptor.key,
            job_type = %job.descriptor.job_type,
            trigger = %job.trigger.key,
            schedule = %describe(&job.trigger),
            parents = job.descriptor.parents.len(),
            "job scheduled"
        );
        tokio::spawn(drive(self.inner.clone(), job));
        Ok(())
    }

    pub fn exists(&self, key: &JobKey) -> bool {
        self.inner.jobs().contains_key(key)
    }

    /// Stop future fires of `key`. A run already in flight finishes.
    pub fn unschedule(&self, key: &JobKey) -> Result<(), SchedulerError> {
        let job = self
            .inner
            .jobs()
            .remove(key)
            .ok_or_else(|| SchedulerError::UnknownJob(key.clone()))?;
        job.cancel.cancel();
        info!(job = %key, "job unscheduled");
        Ok(())
    }

    pub fn descriptor(&self, key: &JobKey) -> Option<JobDescriptor> {
        self.inner.jobs().get(key).map(|j| j.descriptor.clone())
    }

    /// Fire `key` immediately, outside its trigger, and wait for the result.
    /// The same overlap rule applies as for triggered fires.
    pub async fn run_now(&self, key: &JobKey) -> Result<RunReport, SchedulerError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        let job = self
            .inner
            .jobs()
            .get(key)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownJob(key.clone()))?;
        match fire(&self.inner, &job) {
            Some(handle) => Ok(join_report(handle).await),
            None => Ok(RunReport::Skipped("already running".to_string())),
        }
    }

    /// Registered jobs, sorted by identity.
    pub fn status(&self) -> Vec<JobStatus> {
        let jobs = self.inner.jobs();
        let mut out: Vec<JobStatus> = jobs
            .values()
            .map(|j| JobStatus {
                key: j.descriptor.key.clone(),
                job_type: j.descriptor.job_type.clone(),
                parents: j.descriptor.parents.clone(),
                trigger: describe(&j.trigger),
                running: j.in_flight.load(Ordering::Acquire) > 0,
                fires: j.fires.load(Ordering::Relaxed),
                overlaps_skipped: j.overlaps_skipped.load(Ordering::Relaxed),
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop every trigger, then wait up to `grace` for in-flight runs.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.shutdown.cancel();
        let pools: Vec<WorkerPool> = std::iter::once(self.inner.default_pool.clone())
            .chain(self.inner.group_pools.values().cloned())
            .collect();
        let drain = async {
            let mut held = Vec::with_capacity(pools.len());
            for pool in &pools {
                held.push(pool.permits.acquire_many(pool.size).await?);
            }
            Ok::<_, tokio::sync::AcquireError>(held)
        };
        match tokio::time::timeout(grace, drain).await {
            Ok(Ok(_permits)) => info!("scheduler stopped; no runs in flight"),
            Ok(Err(_)) => warn!("worker permits closed during shutdown"),
            Err(_) => warn!(grace_secs = grace.as_secs(), "runs still in flight after grace period"),
        };
    }
}

async fn drive(inner: Arc<Inner>, job: Arc<ScheduledJob>) {
    let delay = job.trigger.initial_delay(Utc::now());
    tokio::select! {
        _ = job.cancel.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
    }

    match job.trigger.repeat {
        Repeat::Once => {
            if let Some(handle) = fire(&inner, &job) {
                join_report(handle).await;
            }
            inner.remove_if_same(&job);
            debug!(job = %job.descriptor.key, "one-shot job done; removed");
        }
        Repeat::Every(period) => {
            let mut ticker = tokio::time::interval(period.max(MIN_PERIOD));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = job.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        fire(&inner, &job);
                    }
                }
            }
        }
    }
}

/// Dispatch one run of `job`, or `None` when it is non-concurrent and busy.
fn fire(inner: &Arc<Inner>, job: &Arc<ScheduledJob>) -> Option<JoinHandle<RunReport>> {
    let claimed = if job.descriptor.allow_concurrent {
        job.in_flight.fetch_add(1, Ordering::AcqRel);
        true
    } else {
        job.in_flight
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    };
    if !claimed {
        job.overlaps_skipped.fetch_add(1, Ordering::Relaxed);
        debug!(job = %job.descriptor.key, "previous run still in flight; fire dropped");
        return None;
    }
    job.fires.fetch_add(1, Ordering::Relaxed);

    let guard = InFlight(job.clone());
    let inner = inner.clone();
    let job = job.clone();
    Some(tokio::spawn(async move {
        let _guard = guard;
        let permit = tokio::select! {
            p = job.pool.permits.clone().acquire_owned() => p,
            _ = inner.shutdown.cancelled() => {
                return RunReport::Skipped("scheduler shutting down".to_string());
            }
        };
        let Ok(_permit) = permit else {
            return RunReport::Skipped("worker pool closed".to_string());
        };
        let ctx = JobContext {
            key: job.descriptor.key.clone(),
            params: job.descriptor.params.clone(),
            scheduler: Scheduler {
                inner: inner.clone(),
            },
            fired_at: Utc::now(),
        };
        run_guarded(
            job.handler.clone(),
            ctx,
            &job.descriptor.parents,
            &inner.markers,
        )
        .await
    }))
}

async fn join_report(handle: JoinHandle<RunReport>) -> RunReport {
    match handle.await {
        Ok(report) => report,
        Err(e) => {
            warn!(error = %e, "job task did not complete");
            RunReport::Failed(e.to_string())
        }
    }
}

fn describe(trigger: &Trigger) -> String {
    let start = match &trigger.start {
        TriggerStart::Now => "now".to_string(),
        TriggerStart::After(d) => format!("after {}s", d.as_secs()),
        TriggerStart::At(at) => format!("at {}", at.to_rfc3339()),
    };
    match trigger.repeat {
        Repeat::Once => format!("once, {start}"),
        Repeat::Every(p) => format!("every {}s, first {start}", p.as_secs()),
    }
}
