//! Per-entity ingestion: fetch a full feed snapshot, map it, drop rows whose
//! parents are not loaded yet, and batch-save the rest.

pub mod mappers;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::database_ops::upsert::{Entity, Repository};
use crate::error::{JobError, PersistenceError};
use crate::feed::Feed;
use crate::jobs::lifecycle::{JobContext, JobHandler, JobOutcome};
use crate::util::db::Db;

/// Dropped-row keys logged per run.
const DROP_SAMPLE: usize = 5;

/// A row in another table that must exist before this record can be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentRef<'a> {
    pub table: &'static str,
    pub column: &'static str,
    pub key: &'a str,
}

impl<'a> ParentRef<'a> {
    pub fn new(table: &'static str, column: &'static str, key: &'a str) -> Self {
        Self { table, column, key }
    }
}

pub trait ParentRefs {
    fn required_parents(&self) -> Vec<ParentRef<'_>> {
        Vec::new()
    }
}

/// Keep the records whose required parents all exist. Each parent table is
/// read once per call.
pub async fn resolve_parents<E>(db: &Db, records: Vec<E>) -> Result<(Vec<E>, Vec<String>), PersistenceError>
where
    E: Entity + ParentRefs,
{
    let mut wanted: HashSet<(&'static str, &'static str)> = HashSet::new();
    for r in &records {
        for p in r.required_parents() {
            wanted.insert((p.table, p.column));
        }
    }
    if wanted.is_empty() {
        return Ok((records, Vec::new()));
    }

    let mut known: HashMap<(&'static str, &'static str), HashSet<String>> = HashMap::new();
    for (table, column) in wanted {
        let sql = format!("SELECT {} FROM {}", column, table);
        let keys: Vec<String> = sqlx::query_scalar(&sql).fetch_all(&db.pool).await?;
        known.insert((table, column), keys.into_iter().collect());
    }

    let mut dropped = Vec::new();
    let kept = records
        .into_iter()
        .filter(|r| {
            let ok = r.required_parents().iter().all(|p| {
                known
                    .get(&(p.table, p.column))
                    .is_some_and(|keys| keys.contains(p.key))
            });
            if !ok {
                dropped.push(r.key().to_string());
            }
            ok
        })
        .collect();
    Ok((kept, dropped))
}

/// Recurring full-refresh job for one entity type.
pub struct IngestionJob<D, E> {
    feed: Arc<dyn Feed<D>>,
    repo: Repository<E>,
    map: fn(D) -> Option<E>,
}

impl<D, E: Entity> IngestionJob<D, E> {
    pub fn new(feed: Arc<dyn Feed<D>>, repo: Repository<E>, map: fn(D) -> Option<E>) -> Self {
        Self { feed, repo, map }
    }
}

#[async_trait]
impl<D, E> JobHandler for IngestionJob<D, E>
where
    D: Send + 'static,
    E: Entity + ParentRefs,
{
    async fn execute(&self, ctx: &JobContext) -> Result<JobOutcome, JobError> {
        let items = self.feed.fetch_content().await?;
        let fetched = items.len();
        if fetched == 0 {
            info!(job = %ctx.key, resource = self.feed.resource(), "feed is empty; store left as is");
            return Ok(JobOutcome::Completed { items: 0 });
        }

        let records: Vec<E> = items.into_iter().filter_map(self.map).collect();
        let unmappable = fetched - records.len();
        if unmappable > 0 {
            warn!(job = %ctx.key, unmappable, "feed items without required fields skipped");
        }

        let (records, dropped) = resolve_parents(self.repo.db(), records).await?;
        if !dropped.is_empty() {
            warn!(
                job = %ctx.key,
                table = E::TABLE,
                dropped = dropped.len(),
                sample = ?&dropped[..dropped.len().min(DROP_SAMPLE)],
                "rows reference parents that are not loaded; skipped"
            );
        }

        let report = self.repo.save_all(records).await?;
        info!(
            job = %ctx.key,
            table = E::TABLE,
            fetched,
            saved = report.records,
            chunks = report.chunks,
            join_rows = report.join_rows,
            "ingestion run finished"
        );
        Ok(JobOutcome::Completed {
            items: report.records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::entities::{Category, Channel, Country, Subdivision};
    use crate::error::FetchError;
    use crate::feed::{CategoryDto, ChannelDto, CountryDto, SubdivisionDto};
    use crate::jobs::identity::{JobKey, JobParams};
    use crate::jobs::markers::RunMarkers;
    use crate::jobs::scheduler::Scheduler;
    use chrono::Utc;

    struct StaticFeed<T>(Vec<T>);

    #[async_trait]
    impl<T: Clone + Send + Sync> Feed<T> for StaticFeed<T> {
        fn resource(&self) -> &str {
            "static"
        }

        async fn fetch_content(&self) -> Result<Vec<T>, FetchError> {
            Ok(self.0.clone())
        }
    }

    struct DownFeed;

    #[async_trait]
    impl<T: Send> Feed<T> for DownFeed {
        fn resource(&self) -> &str {
            "down"
        }

        async fn fetch_content(&self) -> Result<Vec<T>, FetchError> {
            Err(FetchError::Status {
                resource: "down".into(),
                status: 502,
            })
        }
    }

    fn ctx(db: &Db, name: &str) -> JobContext {
        JobContext {
            key: JobKey::catalog(name),
            params: Arc::new(JobParams::default()),
            scheduler: Scheduler::new(RunMarkers::new(db.clone()), 1),
            fired_at: Utc::now(),
        }
    }

    fn cat(id: &str) -> CategoryDto {
        CategoryDto {
            id: id.into(),
            name: id.to_uppercase(),
        }
    }

    #[tokio::test]
    async fn empty_feed_leaves_store_unchanged() {
        let db = Db::in_memory().await.unwrap();
        let repo = Repository::<Category>::new(db.clone());
        repo.save(Category {
            id: "news".into(),
            name: "News".into(),
        })
        .await
        .unwrap();

        let job = IngestionJob::new(Arc::new(StaticFeed(Vec::<CategoryDto>::new())), repo.clone(), mappers::category);
        let outcome = job.execute(&ctx(&db, "categories")).await.unwrap();
        assert_eq!(outcome, JobOutcome::Completed { items: 0 });
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn fetch_failure_aborts_before_any_write() {
        let db = Db::in_memory().await.unwrap();
        let repo = Repository::<Category>::new(db.clone());
        let job: IngestionJob<CategoryDto, Category> =
            IngestionJob::new(Arc::new(DownFeed), repo.clone(), mappers::category);
        let err = job.execute(&ctx(&db, "categories")).await.unwrap_err();
        assert!(matches!(err, JobError::Fetch(FetchError::Status { status: 502, .. })));
        assert_eq!(repo.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rerunning_same_snapshot_is_idempotent() {
        let db = Db::in_memory().await.unwrap();
        let repo = Repository::<Category>::new(db.clone());
        let job = IngestionJob::new(
            Arc::new(StaticFeed(vec![cat("news"), cat("kids"), cat("  ")])),
            repo.clone(),
            mappers::category,
        );
        let c = ctx(&db, "categories");
        assert_eq!(job.execute(&c).await.unwrap(), JobOutcome::Completed { items: 2 });
        let first = repo.find_all().await.unwrap();
        job.execute(&c).await.unwrap();
        assert_eq!(repo.find_all().await.unwrap(), first);
    }

    #[tokio::test]
    async fn countries_against_empty_languages_persist_no_join_rows() {
        let db = Db::in_memory().await.unwrap();
        let repo = Repository::<Country>::new(db.clone());
        let job = IngestionJob::new(
            Arc::new(StaticFeed(vec![CountryDto {
                code: "CA".into(),
                name: "Canada".into(),
                languages: vec!["eng".into(), "fra".into()],
                flag: None,
            }])),
            repo.clone(),
            mappers::country,
        );
        job.execute(&ctx(&db, "countries")).await.unwrap();
        assert_eq!(repo.count().await.unwrap(), 1);
        assert_eq!(db.count("country_languages").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rows_with_missing_parents_are_dropped_individually() {
        let db = Db::in_memory().await.unwrap();
        let sub = |code: &str, country: &str| SubdivisionDto {
            country: country.into(),
            code: code.into(),
            name: code.into(),
        };

        // no countries at all: nothing eligible, still a clean run
        let subs = Repository::<Subdivision>::new(db.clone());
        let job = IngestionJob::new(
            Arc::new(StaticFeed(vec![sub("US-CA", "US"), sub("FR-75", "FR")])),
            subs.clone(),
            mappers::subdivision,
        );
        assert_eq!(
            job.execute(&ctx(&db, "subdivisions")).await.unwrap(),
            JobOutcome::Completed { items: 0 }
        );

        Repository::<Country>::new(db.clone())
            .save(Country {
                code: "US".into(),
                name: "United States".into(),
                ..Country::default()
            })
            .await
            .unwrap();
        assert_eq!(
            job.execute(&ctx(&db, "subdivisions")).await.unwrap(),
            JobOutcome::Completed { items: 1 }
        );
        assert!(subs.find_by_key("US-CA").await.unwrap().is_some());
        assert!(subs.find_by_key("FR-75").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn channels_keep_going_when_some_references_are_unknown() {
        let db = Db::in_memory().await.unwrap();
        Repository::<Country>::new(db.clone())
            .save(Country {
                code: "US".into(),
                name: "United States".into(),
                ..Country::default()
            })
            .await
            .unwrap();
        let ch = |id: &str, country: Option<&str>| ChannelDto {
            id: id.into(),
            name: id.into(),
            country: country.map(str::to_string),
            categories: vec!["news".into()],
            ..ChannelDto::default()
        };
        let repo = Repository::<Channel>::new(db.clone());
        let job = IngestionJob::new(
            Arc::new(StaticFeed(vec![ch("A", Some("US")), ch("B", Some("ZZ")), ch("C", None)])),
            repo.clone(),
            mappers::channel,
        );
        assert_eq!(
            job.execute(&ctx(&db, "channels")).await.unwrap(),
            JobOutcome::Completed { items: 2 }
        );
        // categories not loaded yet: channels saved, associations filtered
        assert_eq!(db.count("channel_categories").await.unwrap(), 0);
    }
}
