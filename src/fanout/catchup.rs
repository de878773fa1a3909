//! Catch-up recording: a recurring fan-out that registers a one-shot
//! recording job per remaining programme of today on every catch-up enabled
//! channel, and the recording job itself.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Days, SubsecRound, Utc};
use tracing::{debug, info};

use crate::database_ops::entities::{CatchupRecording, Programme};
use crate::database_ops::queries;
use crate::database_ops::upsert::Repository;
use crate::error::{JobError, ProcessError, SchedulerError};
use crate::jobs::identity::{JobDescriptor, JobKey, JobParams, Trigger};
use crate::jobs::lifecycle::{JobContext, JobHandler, JobOutcome};
use crate::util::db::Db;
use crate::util::process::{self, Invocation};

pub const CATCHUP_SCHEDULER_JOB_TYPE: &str = "catchup-scheduler";
pub const CATCHUP_JOB_TYPE: &str = "catchup";

#[derive(Debug, Clone)]
pub struct CatchupSettings {
    pub transcoder_bin: String,
    pub output_dir: PathBuf,
    pub video_codec: String,
    pub audio_codec: String,
    /// Added to the programme length to form the transcoder deadline.
    pub grace: Duration,
}

/// Start of the UTC day after `now`.
fn end_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    let next = now.date_naive().checked_add_days(Days::new(1)).unwrap_or(now.date_naive());
    next.and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc())
        .unwrap_or(now)
}

pub struct CatchupScheduler {
    db: Db,
    recordings: Repository<CatchupRecording>,
}

impl CatchupScheduler {
    pub fn new(db: Db) -> Self {
        Self {
            recordings: Repository::new(db.clone()),
            db,
        }
    }
}

#[async_trait]
impl JobHandler for CatchupScheduler {
    async fn execute(&self, ctx: &JobContext) -> Result<JobOutcome, JobError> {
        let now = ctx.fired_at.trunc_subsecs(0);
        let until = end_of_day(now);
        let candidates = queries::catchup_candidates(&self.db).await?;
        if candidates.is_empty() {
            return Ok(JobOutcome::Completed { items: 0 });
        }

        let mut registered = 0usize;
        for candidate in &candidates {
            let programmes = queries::programmes_between(&self.db, &candidate.channel, now, until).await?;
            for programme in programmes {
                let key = JobKey::catchup(&programme.id);
                if ctx.scheduler.exists(&key) {
                    continue;
                }
                if self.recordings.find_by_key(&programme.id).await?.is_some() {
                    continue;
                }
                let params: JobParams = [
                    ("programme_id", programme.id.as_str()),
                    ("stream_url", candidate.stream_url.as_str()),
                ]
                .into_iter()
                .collect();
                let trigger = Trigger::once_at(&key, programme.start_at);
                let descriptor = JobDescriptor::with(key.clone(), CATCHUP_JOB_TYPE, params, Vec::new());
                match ctx.scheduler.schedule(descriptor, trigger) {
                    Ok(()) => {
                        registered += 1;
                        debug!(job = %key, channel = %candidate.channel, start = %programme.start_at, "catch-up job registered");
                    }
                    Err(SchedulerError::DuplicateJob(_)) => debug!(job = %key, "catch-up job already present"),
                    Err(e) => return Err(e.into()),
                }
            }
        }
        info!(channels = candidates.len(), registered, "catch-up fan-out finished");
        Ok(JobOutcome::Completed { items: registered })
    }
}

/// Records one programme from its live stream through the transcoder.
pub struct CatchupJob {
    settings: CatchupSettings,
    programmes: Repository<Programme>,
    recordings: Repository<CatchupRecording>,
}

impl CatchupJob {
    pub fn new(db: Db, settings: CatchupSettings) -> Self {
        Self {
            settings,
            programmes: Repository::new(db.clone()),
            recordings: Repository::new(db),
        }
    }

    fn output_path(&self, programme_id: &str) -> PathBuf {
        self.settings
            .output_dir
            .join(format!("{}.mp4", JobKey::catchup(programme_id).name))
    }
}

#[async_trait]
impl JobHandler for CatchupJob {
    async fn execute(&self, ctx: &JobContext) -> Result<JobOutcome, JobError> {
        let programme_id = ctx.param("programme_id")?;
        let stream_url = ctx.param("stream_url")?;
        url::Url::parse(stream_url).map_err(|e| JobError::InvalidParameter {
            name: "stream_url",
            reason: e.to_string(),
        })?;

        let programme = self.programmes.get_by_key(programme_id).await?;
        let now = Utc::now().trunc_subsecs(0);
        let from = programme.start_at.max(now);
        let secs = (programme.stop_at - from).num_seconds();
        if secs <= 0 {
            return Ok(JobOutcome::Skipped(format!("{programme_id} already ended")));
        }
        let length = Duration::from_secs(secs as u64);

        let dir = &self.settings.output_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| ProcessError::Io {
                path: dir.clone(),
                source,
            })?;
        let output = self.output_path(programme_id);

        let inv = Invocation::new(&self.settings.transcoder_bin, length + self.settings.grace)
            .args(["-y", "-i", stream_url, "-t"])
            .arg(secs.to_string())
            .args(["-c:v", self.settings.video_codec.as_str(), "-c:a", self.settings.audio_codec.as_str()])
            .arg(output.to_string_lossy())
            .expect_output(&output);
        process::run(&inv).await?;

        self.recordings
            .save(CatchupRecording {
                programme_id: programme.id.clone(),
                stream_url: stream_url.to_string(),
                output_path: output.to_string_lossy().into_owned(),
                recorded_at: Utc::now().trunc_subsecs(0),
            })
            .await?;
        info!(programme = %programme.id, title = %programme.title, secs, "catch-up recorded");
        Ok(JobOutcome::Completed { items: 1 })
    }
}
