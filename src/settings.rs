//! Process configuration, read once from the environment.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

use crate::fanout::catchup::CatchupSettings;
use crate::fanout::guide_grab::GrabSettings;
use crate::jobs::scheduler::MAX_POOL_PERMITS;
use crate::util::env::{self, env_opt, env_parse, env_secs};

pub const DEFAULT_FEED_BASE_URL: &str = "https://iptv-org.github.io/api";

/// Default interval per static job. Upstream entities refresh more often
/// than the entities that reference them.
pub const DEFAULT_INTERVALS: &[(&str, u64)] = &[
    ("languages", 5 * 3600),
    ("categories", 5 * 3600),
    ("countries", 6 * 3600),
    ("regions", 7 * 3600),
    ("subdivisions", 7 * 3600),
    ("channels", 8 * 3600),
    ("streams", 9 * 3600),
    ("guides", 9 * 3600),
    ("guide-grab-scheduler", 10 * 3600),
    ("catchup-scheduler", 3600),
];

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub db_max_connections: u32,
    pub feed_base_url: String,
    pub http_timeout: Duration,
    /// Shared worker pool of catalog and grab jobs.
    pub job_concurrency: usize,
    /// Separate pool for catch-up recordings, which hold a permit for a whole programme.
    pub catchup_concurrency: usize,
    pub upsert_chunk_size: usize,
    pub intervals: BTreeMap<String, Duration>,
    pub shutdown_grace: Duration,
    pub grab: GrabSettings,
    pub catchup: CatchupSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: env::DEFAULT_DATABASE_URL.to_string(),
            db_max_connections: 8,
            feed_base_url: DEFAULT_FEED_BASE_URL.to_string(),
            http_timeout: Duration::from_secs(30),
            job_concurrency: 4,
            catchup_concurrency: 4,
            upsert_chunk_size: 1_000,
            intervals: DEFAULT_INTERVALS
                .iter()
                .map(|(name, secs)| (name.to_string(), Duration::from_secs(*secs)))
                .collect(),
            shutdown_grace: Duration::from_secs(30),
            grab: GrabSettings {
                grabber_bin: "epg-grab".to_string(),
                sites_dir: PathBuf::from("sites"),
                work_dir: PathBuf::from("work/guides"),
                days: 2,
                timeout: Duration::from_secs(900),
                interval: Duration::from_secs(12 * 3600),
            },
            catchup: CatchupSettings {
                transcoder_bin: "ffmpeg".to_string(),
                output_dir: PathBuf::from("work/catchup"),
                video_codec: "copy".to_string(),
                audio_codec: "aac".to_string(),
                grace: Duration::from_secs(120),
            },
        }
    }
}

/// `channels` → `INTERVAL_CHANNELS_SECS`, `guide-grab-scheduler` → `INTERVAL_GUIDE_GRAB_SCHEDULER_SECS`.
pub fn interval_key(job: &str) -> String {
    format!("INTERVAL_{}_SECS", job.to_ascii_uppercase().replace('-', "_"))
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Self::default();
        let intervals = d
            .intervals
            .iter()
            .map(|(name, default)| (name.clone(), env_secs(&interval_key(name), default.as_secs())))
            .collect();
        Self {
            database_url: env::db_url(),
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", d.db_max_connections).max(1),
            feed_base_url: env_opt("FEED_BASE_URL").unwrap_or(d.feed_base_url),
            http_timeout: env_secs("HTTP_TIMEOUT_SECS", d.http_timeout.as_secs()),
            job_concurrency: env_parse("JOB_CONCURRENCY", d.job_concurrency).clamp(1, MAX_POOL_PERMITS),
            catchup_concurrency: env_parse("CATCHUP_CONCURRENCY", d.catchup_concurrency)
                .clamp(1, MAX_POOL_PERMITS),
            upsert_chunk_size: env_parse("UPSERT_CHUNK_SIZE", d.upsert_chunk_size).max(1),
            intervals,
            shutdown_grace: env_secs("SHUTDOWN_GRACE_SECS", d.shutdown_grace.as_secs()),
            grab: GrabSettings {
                grabber_bin: env_opt("GRABBER_BIN").unwrap_or(d.grab.grabber_bin),
                sites_dir: env_opt("GRABBER_SITES_DIR").map(PathBuf::from).unwrap_or(d.grab.sites_dir),
                work_dir: env_opt("GRAB_WORK_DIR").map(PathBuf::from).unwrap_or(d.grab.work_dir),
                days: env_parse("GRAB_DAYS", d.grab.days).max(1),
                timeout: env_secs("GRAB_TIMEOUT_SECS", d.grab.timeout.as_secs()),
                interval: env_secs("GRAB_INTERVAL_SECS", d.grab.interval.as_secs()),
            },
            catchup: CatchupSettings {
                transcoder_bin: env_opt("TRANSCODER_BIN").unwrap_or(d.catchup.transcoder_bin),
                output_dir: env_opt("CATCHUP_OUTPUT_DIR").map(PathBuf::from).unwrap_or(d.catchup.output_dir),
                video_codec: env_opt("TRANSCODE_VIDEO_CODEC").unwrap_or(d.catchup.video_codec),
                audio_codec: env_opt("TRANSCODE_AUDIO_CODEC").unwrap_or(d.catchup.audio_codec),
                grace: env_secs("TRANSCODE_GRACE_SECS", d.catchup.grace.as_secs()),
            },
        }
    }

    pub fn interval(&self, job: &str) -> Option<Duration> {
        self.intervals.get(job).copied()
    }

    /// One structured line with everything except the store URL.
    pub fn log_summary(&self) {
        info!(
            feed = %self.feed_base_url,
            concurrency = self.job_concurrency,
            catchup_concurrency = self.catchup_concurrency,
            chunk_size = self.upsert_chunk_size,
            db_max_connections = self.db_max_connections,
            grabber = %self.grab.grabber_bin,
            grab_days = self.grab.days,
            transcoder = %self.catchup.transcoder_bin,
            "settings loaded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_keys_are_shouty_snake() {
        assert_eq!(interval_key("channels"), "INTERVAL_CHANNELS_SECS");
        assert_eq!(
            interval_key("guide-grab-scheduler"),
            "INTERVAL_GUIDE_GRAB_SCHEDULER_SECS"
        );
    }

    #[test]
    fn defaults_cover_every_static_job() {
        let s = Settings::default();
        assert_eq!(s.intervals.len(), DEFAULT_INTERVALS.len());
        assert_eq!(s.interval("channels"), Some(Duration::from_secs(8 * 3600)));
        assert_eq!(s.interval("nope"), None);
    }

    #[test]
    fn worker_pool_sizes_are_clamped() {
        std::env::set_var("JOB_CONCURRENCY", "18446744073709551615");
        std::env::set_var("CATCHUP_CONCURRENCY", "0");
        let s = Settings::from_env();
        std::env::remove_var("JOB_CONCURRENCY");
        std::env::remove_var("CATCHUP_CONCURRENCY");
        assert_eq!(s.job_concurrency, MAX_POOL_PERMITS);
        assert_eq!(s.catchup_concurrency, 1);
    }

    #[test]
    fn env_overrides_interval() {
        std::env::set_var("INTERVAL_REGIONS_SECS", "42");
        let s = Settings::from_env();
        std::env::remove_var("INTERVAL_REGIONS_SECS");
        assert_eq!(s.interval("regions"), Some(Duration::from_secs(42)));
    }
}
