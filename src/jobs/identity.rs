//! Job and trigger identities plus the immutable descriptors the scheduler
//! consumes. Everything here is a plain value built by constructor functions;
//! nothing is mutated after it is handed to [`Scheduler::schedule`].
//!
//! [`Scheduler::schedule`]: super::scheduler::Scheduler::schedule

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Group for the per-entity ingestion jobs and the two fan-out schedulers.
pub const CATALOG_GROUP: &str = "catalog";
/// Group for dynamically created per-(site, lang) grabbing jobs.
pub const GRAB_GROUP: &str = "guide-grab";
/// Group for dynamically created per-programme catch-up jobs.
pub const CATCHUP_GROUP: &str = "catchup";

/// Identity of a job; `name` is unique within `group`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobKey {
    pub group: String,
    pub name: String,
}

impl JobKey {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }

    pub fn catalog(name: impl Into<String>) -> Self {
        Self::new(CATALOG_GROUP, name)
    }

    /// Deterministic identity of the grabbing job for one (site, lang) unit.
    /// Units that differ in any character get different identities; the
    /// slugged prefix is only for reading.
    pub fn guide_grab(site: &str, lang: &str) -> Self {
        let site = site.trim();
        let lang = lang.trim();
        Self::new(
            GRAB_GROUP,
            format!(
                "grab-{}-{}-{}",
                slug(site),
                slug(lang),
                short_digest(&[site, lang])
            ),
        )
    }

    /// Deterministic identity of the catch-up job for one programme.
    pub fn catchup(programme_id: &str) -> Self {
        Self::new(
            CATCHUP_GROUP,
            format!(
                "catchup-{}-{}",
                slug(programme_id),
                short_digest(&[programme_id])
            ),
        )
    }

    pub fn trigger_key(&self) -> TriggerKey {
        TriggerKey(format!("{}.{}-trigger", self.group, self.name))
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct TriggerKey(pub String);

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase, keep alphanumerics, collapse everything else into single `_`.
/// Identities derived this way stay stable for the same discriminators.
pub fn slug(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_sep = false;
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_sep = false;
        } else if !last_sep && !out.is_empty() {
            out.push('_');
            last_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// First 8 hex chars of the SHA-256 over the NUL-joined parts. Keeps slugged
/// identities distinct when discriminators differ only in punctuation.
fn short_digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0u8]);
        }
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    digest[..4].iter().map(|b| format!("{:02x}", b)).collect()
}

/// String-keyed parameters handed to a running job.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct JobParams(BTreeMap<String, String>);

impl JobParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for JobParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TriggerStart {
    Now,
    After(Duration),
    At(DateTime<Utc>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Repeat {
    /// Fire once, then drop the job from the scheduler.
    Once,
    Every(Duration),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trigger {
    pub key: TriggerKey,
    pub start: TriggerStart,
    pub repeat: Repeat,
}

impl Trigger {
    /// Fixed-interval recurring trigger, first fire after `initial_delay`.
    pub fn every(job: &JobKey, interval: Duration, initial_delay: Duration) -> Self {
        let start = if initial_delay.is_zero() {
            TriggerStart::Now
        } else {
            TriggerStart::After(initial_delay)
        };
        Self {
            key: job.trigger_key(),
            start,
            repeat: Repeat::Every(interval),
        }
    }

    /// Single fire at `at` (immediately if `at` already passed).
    pub fn once_at(job: &JobKey, at: DateTime<Utc>) -> Self {
        Self {
            key: job.trigger_key(),
            start: TriggerStart::At(at),
            repeat: Repeat::Once,
        }
    }

    pub fn once_now(job: &JobKey) -> Self {
        Self {
            key: job.trigger_key(),
            start: TriggerStart::Now,
            repeat: Repeat::Once,
        }
    }

    /// Delay from `now` until the first fire.
    pub fn initial_delay(&self, now: DateTime<Utc>) -> Duration {
        match &self.start {
            TriggerStart::Now => Duration::ZERO,
            TriggerStart::After(d) => *d,
            TriggerStart::At(at) => (*at - now).to_std().unwrap_or(Duration::ZERO),
        }
    }
}

/// Immutable description of a job: who it is, which handler runs it, what it
/// is given and which jobs must have succeeded before it does useful work.
#[derive(Clone, Debug)]
pub struct JobDescriptor {
    pub key: JobKey,
    pub job_type: String,
    pub params: Arc<JobParams>,
    pub parents: Vec<JobKey>,
    pub allow_concurrent: bool,
}

impl JobDescriptor {
    pub fn new(key: JobKey, job_type: impl Into<String>) -> Self {
        Self::with(key, job_type, JobParams::default(), Vec::new())
    }

    pub fn with(
        key: JobKey,
        job_type: impl Into<String>,
        params: JobParams,
        parents: Vec<JobKey>,
    ) -> Self {
        Self {
            key,
            job_type: job_type.into(),
            params: Arc::new(params),
            parents,
            allow_concurrent: false,
        }
    }
}
