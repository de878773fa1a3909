//! Static job graph and its registration.
//!
//! Jobs are scheduled in dependency order so every parent is known before
//! the jobs that declare it. Parents gate their children through run
//! markers; the staggered intervals and first-fire delays are a second line.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use super::identity::{JobDescriptor, JobKey, Trigger, CATCHUP_GROUP};
use super::markers::RunMarkers;
use super::scheduler::Scheduler;
use crate::database_ops::upsert::Repository;
use crate::fanout::catchup::{CatchupJob, CatchupScheduler, CATCHUP_JOB_TYPE, CATCHUP_SCHEDULER_JOB_TYPE};
use crate::fanout::guide_grab::{GuideGrabJob, GuideGrabScheduler, GRAB_JOB_TYPE, GRAB_SCHEDULER_JOB_TYPE};
use crate::feed::{
    CategoryDto, ChannelDto, CountryDto, FeedClient, GuideDto, LanguageDto, RegionDto, StreamDto,
    SubdivisionDto,
};
use crate::ingest::{mappers, IngestionJob};
use crate::settings::Settings;
use crate::util::db::Db;

pub struct StaticJob {
    pub name: &'static str,
    pub job_type: &'static str,
    pub parents: &'static [&'static str],
    /// Delay before the first fire when starting normally.
    pub first_fire_secs: u64,
}

/// Dependency order: every parent precedes its children.
pub const STATIC_JOBS: &[StaticJob] = &[
    StaticJob { name: "languages", job_type: "languages", parents: &[], first_fire_secs: 0 },
    StaticJob { name: "categories", job_type: "categories", parents: &[], first_fire_secs: 0 },
    StaticJob { name: "countries", job_type: "countries", parents: &["languages"], first_fire_secs: 30 },
    StaticJob { name: "regions", job_type: "regions", parents: &["countries"], first_fire_secs: 60 },
    StaticJob { name: "subdivisions", job_type: "subdivisions", parents: &["countries"], first_fire_secs: 60 },
    StaticJob {
        name: "channels",
        job_type: "channels",
        parents: &["countries", "subdivisions", "categories", "languages"],
        first_fire_secs: 90,
    },
    StaticJob { name: "streams", job_type: "streams", parents: &["channels"], first_fire_secs: 120 },
    StaticJob { name: "guides", job_type: "guides", parents: &["channels"], first_fire_secs: 120 },
    StaticJob {
        name: "guide-grab-scheduler",
        job_type: GRAB_SCHEDULER_JOB_TYPE,
        parents: &["guides"],
        first_fire_secs: 150,
    },
    StaticJob {
        name: "catchup-scheduler",
        job_type: CATCHUP_SCHEDULER_JOB_TYPE,
        parents: &["streams"],
        first_fire_secs: 180,
    },
];

pub fn static_job(name: &str) -> Option<&'static StaticJob> {
    STATIC_JOBS.iter().find(|j| j.name == name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstFire {
    /// Staggered start: reference data first.
    Staggered,
    /// Nothing fires before a full interval has passed; for one-off runs.
    Deferred,
}

/// Bind every job type to its handler.
pub fn register_handlers(scheduler: &Scheduler, db: &Db, settings: &Settings) -> Result<()> {
    let feeds = FeedClient::new(&settings.feed_base_url, settings.http_timeout)
        .context("failed to build feed client")?;
    let chunk = settings.upsert_chunk_size;

    macro_rules! ingestion {
        ($name:literal, $dto:ty, $map:path) => {
            scheduler.register_handler(
                $name,
                Arc::new(IngestionJob::new(
                    Arc::new(feeds.feed::<$dto>($name)),
                    Repository::new(db.clone()).with_chunk_size(chunk),
                    $map,
                )),
            );
        };
    }
    ingestion!("languages", LanguageDto, mappers::language);
    ingestion!("categories", CategoryDto, mappers::category);
    ingestion!("countries", CountryDto, mappers::country);
    ingestion!("regions", RegionDto, mappers::region);
    ingestion!("subdivisions", SubdivisionDto, mappers::subdivision);
    ingestion!("channels", ChannelDto, mappers::channel);
    ingestion!("streams", StreamDto, mappers::stream);
    ingestion!("guides", GuideDto, mappers::guide);

    scheduler.register_handler(
        GRAB_SCHEDULER_JOB_TYPE,
        Arc::new(GuideGrabScheduler::new(
            db.clone(),
            settings.grab.interval,
            vec![JobKey::catalog("guides")],
        )),
    );
    scheduler.register_handler(
        GRAB_JOB_TYPE,
        Arc::new(GuideGrabJob::new(db.clone(), settings.grab.clone(), chunk)),
    );
    scheduler.register_handler(CATCHUP_SCHEDULER_JOB_TYPE, Arc::new(CatchupScheduler::new(db.clone())));
    scheduler.register_handler(
        CATCHUP_JOB_TYPE,
        Arc::new(CatchupJob::new(db.clone(), settings.catchup.clone())),
    );
    Ok(())
}

/// Schedule the static graph. Returns the number of jobs registered.
pub fn schedule_static_jobs(scheduler: &Scheduler, settings: &Settings, first_fire: FirstFire) -> Result<usize> {
    for job in STATIC_JOBS {
        let key = JobKey::catalog(job.name);
        let interval = settings
            .interval(job.name)
            .with_context(|| format!("no interval configured for {}", job.name))?;
        let delay = match first_fire {
            FirstFire::Staggered => Duration::from_secs(job.first_fire_secs),
            FirstFire::Deferred => interval,
        };
        let parents = job.parents.iter().map(|p| JobKey::catalog(*p)).collect();
        let descriptor = JobDescriptor::with(key.clone(), job.job_type, Default::default(), parents);
        scheduler
            .schedule(descriptor, Trigger::every(&key, interval, delay))
            .with_context(|| format!("failed to schedule {key}"))?;
    }
    info!(jobs = STATIC_JOBS.len(), ?first_fire, "static jobs scheduled");
    Ok(STATIC_JOBS.len())
}

/// Scheduler with every handler bound and the static graph scheduled.
pub fn start(db: &Db, settings: &Settings, first_fire: FirstFire) -> Result<Scheduler> {
    let scheduler = Scheduler::with_group_pools(
        RunMarkers::new(db.clone()),
        settings.job_concurrency,
        &[(CATCHUP_GROUP, settings.catchup_concurrency)],
    );
    register_handlers(&scheduler, db, settings)?;
    schedule_static_jobs(&scheduler, settings, first_fire)?;
    Ok(scheduler)
}
