//! Guide grabbing: a recurring fan-out that registers one grabbing job per
//! (site, lang) unit, and the grabbing job itself.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::database_ops::entities::{Guide, Programme};
use crate::database_ops::queries;
use crate::database_ops::upsert::Repository;
use crate::error::{JobError, ProcessError, SchedulerError};
use crate::ingest::resolve_parents;
use crate::jobs::identity::{JobDescriptor, JobKey, JobParams, Trigger};
use crate::jobs::lifecycle::{JobContext, JobHandler, JobOutcome};
use crate::util::db::Db;
use crate::util::process::{self, Invocation};

pub const GRAB_SCHEDULER_JOB_TYPE: &str = "guide-grab-scheduler";
pub const GRAB_JOB_TYPE: &str = "guide-grab";

#[derive(Debug, Clone)]
pub struct GrabSettings {
    pub grabber_bin: String,
    pub sites_dir: PathBuf,
    pub work_dir: PathBuf,
    pub days: u32,
    pub timeout: Duration,
    /// Interval of each registered per-unit job.
    pub interval: Duration,
}

impl GrabSettings {
    /// `{sites_dir}/{site}/{site}.config.js`. The site must be a single plain
    /// path component.
    pub fn config_path(&self, site: &str) -> Result<PathBuf, JobError> {
        let mut components = Path::new(site).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) if name == site => {
                Ok(self.sites_dir.join(site).join(format!("{site}.config.js")))
            }
            _ => Err(JobError::InvalidParameter {
                name: "site",
                reason: format!("{site:?} is not a plain directory name"),
            }),
        }
    }

    /// Scratch file of one unit, named after its job so feed values never
    /// reach the path.
    fn unit_file(&self, unit: &JobKey, suffix: &str) -> PathBuf {
        self.work_dir.join(format!("{}.{}", unit.name, suffix))
    }
}

/// Registers a grabbing job for every unit that does not have one yet.
pub struct GuideGrabScheduler {
    db: Db,
    interval: Duration,
    /// Declared on every registered job; must already be scheduled.
    parents: Vec<JobKey>,
}

impl GuideGrabScheduler {
    pub fn new(db: Db, interval: Duration, parents: Vec<JobKey>) -> Self {
        Self {
            db,
            interval,
            parents,
        }
    }
}

#[async_trait]
impl JobHandler for GuideGrabScheduler {
    async fn execute(&self, ctx: &JobContext) -> Result<JobOutcome, JobError> {
        let units = queries::grab_units(&self.db).await?;
        let mut registered = 0usize;
        for unit in &units {
            let key = JobKey::guide_grab(&unit.site, &unit.lang);
            if ctx.scheduler.exists(&key) {
                continue;
            }
            let params: JobParams = [("site", unit.site.as_str()), ("lang", unit.lang.as_str())]
                .into_iter()
                .collect();
            let trigger = Trigger::every(&key, self.interval, Duration::ZERO);
            let descriptor = JobDescriptor::with(key.clone(), GRAB_JOB_TYPE, params, self.parents.clone());
            match ctx.scheduler.schedule(descriptor, trigger) {
                Ok(()) => {
                    registered += 1;
                    info!(job = %key, site = %unit.site, lang = %unit.lang, channels = unit.channels, "grab job registered");
                }
                // registered concurrently since the existence check
                Err(SchedulerError::DuplicateJob(_)) => debug!(job = %key, "grab job already present"),
                Err(e) => return Err(e.into()),
            }
        }
        info!(units = units.len(), registered, "grab fan-out finished");
        Ok(JobOutcome::Completed { items: registered })
    }
}

/// Channel list entry handed to the grabber.
#[derive(Debug, Serialize)]
struct GrabChannel<'a> {
    site: &'a str,
    site_id: &'a str,
    xmltv_id: &'a str,
    lang: &'a str,
    name: &'a str,
}

/// One programme as the grabber writes it.
#[derive(Debug, Clone, Deserialize)]
pub struct GrabbedProgramme {
    pub channel: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub lang: Option<String>,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
}

/// Map grabber output onto programmes of `channels`. Entries for other
/// channels, without a title or with a non-positive slot are dropped.
pub fn to_programmes(grabbed: Vec<GrabbedProgramme>, channels: &HashSet<String>, unit_lang: &str) -> Vec<Programme> {
    grabbed
        .into_iter()
        .filter_map(|g| {
            let channel = g.channel.trim();
            let title = g.title.trim();
            if !channels.contains(channel) || title.is_empty() {
                return None;
            }
            let start_at = g.start.trunc_subsecs(0);
            let stop_at = g.stop.trunc_subsecs(0);
            if stop_at <= start_at {
                return None;
            }
            let clean = |s: Option<String>| s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
            Some(Programme {
                id: Programme::compose_id(channel, start_at),
                channel: channel.to_string(),
                title: title.to_string(),
                description: clean(g.description),
                category: clean(g.category),
                lang: clean(g.lang).or_else(|| Some(unit_lang.to_string())),
                start_at,
                stop_at,
            })
        })
        .collect()
}

/// Runs the external grabber for one (site, lang) unit and stores its programmes.
pub struct GuideGrabJob {
    db: Db,
    settings: GrabSettings,
    programmes: Repository<Programme>,
}

impl GuideGrabJob {
    pub fn new(db: Db, settings: GrabSettings, chunk_size: usize) -> Self {
        Self {
            programmes: Repository::new(db.clone()).with_chunk_size(chunk_size),
            db,
            settings,
        }
    }

    async fn write_channel_list(&self, path: &Path, guides: &[Guide]) -> Result<(), JobError> {
        let list: Vec<GrabChannel<'_>> = guides
            .iter()
            .filter_map(|g| {
                Some(GrabChannel {
                    site: &g.site,
                    site_id: &g.site_id,
                    xmltv_id: g.channel.as_deref()?,
                    lang: &g.lang,
                    name: &g.site_name,
                })
            })
            .collect();
        let body = serde_json::to_vec_pretty(&list).map_err(|source| JobError::MalformedOutput {
            path: path.to_path_buf(),
            source,
        })?;
        tokio::fs::write(path, body).await.map_err(|source| ProcessError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for GuideGrabJob {
    async fn execute(&self, ctx: &JobContext) -> Result<JobOutcome, JobError> {
        let site = ctx.param("site")?;
        let lang = ctx.param("lang")?;

        let guides = queries::guides_for_unit(&self.db, site, lang).await?;
        if guides.is_empty() {
            return Ok(JobOutcome::Skipped(format!("no guides left for {site}/{lang}")));
        }

        let config_path = self.settings.config_path(site)?;
        let work_dir = &self.settings.work_dir;
        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|source| ProcessError::Io {
                path: work_dir.clone(),
                source,
            })?;
        let unit = JobKey::guide_grab(site, lang);
        let channels_path = self.settings.unit_file(&unit, "channels.json");
        let output_path = self.settings.unit_file(&unit, "guide.json");
        self.write_channel_list(&channels_path, &guides).await?;
        // stale output from an earlier run must not be mistaken for this one
        let _ = tokio::fs::remove_file(&output_path).await;

        let inv = Invocation::new(&self.settings.grabber_bin, self.settings.timeout)
            .arg("--config")
            .arg(config_path.to_string_lossy())
            .arg("--channels")
            .arg(channels_path.to_string_lossy())
            .arg("--output")
            .arg(output_path.to_string_lossy())
            .arg("--lang")
            .arg(lang)
            .arg("--days")
            .arg(self.settings.days.to_string())
            .expect_output(&output_path);
        process::run(&inv).await?;

        let body = tokio::fs::read(&output_path)
            .await
            .map_err(|source| ProcessError::Io {
                path: output_path.clone(),
                source,
            })?;
        let grabbed: Vec<GrabbedProgramme> =
            serde_json::from_slice(&body).map_err(|source| JobError::MalformedOutput {
                path: output_path.clone(),
                source,
            })?;
        let grabbed_count = grabbed.len();

        let channels: HashSet<String> = guides.iter().filter_map(|g| g.channel.clone()).collect();
        let programmes = to_programmes(grabbed, &channels, lang);
        let (programmes, dropped) = resolve_parents(&self.db, programmes).await?;
        if !dropped.is_empty() {
            warn!(site, lang, dropped = dropped.len(), "programmes for unknown channels skipped");
        }
        let report = self.programmes.save_all(programmes).await?;
        info!(site, lang, grabbed = grabbed_count, saved = report.records, "guide grabbed");
        Ok(JobOutcome::Completed {
            items: report.records,
        })
    }
}
