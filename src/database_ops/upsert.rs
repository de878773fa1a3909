//! Generic keyed-entity access with insert-or-update-on-conflict writes.
//!
//! Every catalog record implements [`Entity`]: the table, its key column and
//! the exact column list it writes. [`Repository::save_all`] splits a batch
//! into fixed-size chunks, commits each chunk as one multi-row
//! `INSERT .. ON CONFLICT (key) DO UPDATE SET col = excluded.col` over the
//! listed columns only, and after each commit hands the whole chunk to the
//! entity's join folding so associations are synchronised per chunk.
//!
//! Chunks commit strictly in order. A failing chunk leaves the earlier ones
//! committed and is reported as [`PersistenceError::Chunk`].

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;

use sqlx::query_builder::Separated;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, QueryBuilder, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::join_sync::{self, JoinTuples};
use crate::error::PersistenceError;
use crate::util::db::Db;

pub const DEFAULT_CHUNK_SIZE: usize = 1_000;

pub trait Entity: for<'r> FromRow<'r, SqliteRow> + Send + Sync + Unpin + Sized + 'static {
    const TABLE: &'static str;
    const KEY_COLUMN: &'static str;
    /// Columns written on insert, key first, in `bind_row` order.
    const COLUMNS: &'static [&'static str];
    /// True when `self_reference` may point at another row of the same table.
    const SELF_REFERENCING: bool = false;

    fn key(&self) -> &str;

    /// Push one bind per entry of `COLUMNS`, in the same order.
    fn bind_row(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>);

    /// Columns overwritten on key conflict. Anything not listed here keeps its
    /// stored value.
    fn update_columns() -> Vec<&'static str> {
        Self::COLUMNS
            .iter()
            .copied()
            .filter(|c| *c != Self::KEY_COLUMN)
            .collect()
    }

    fn self_reference(&self) -> Option<&str> {
        None
    }

    fn clear_self_reference(&mut self) {}

    /// Fold a committed chunk into join tuples. Default: no associations.
    fn join_tuples(_chunk: &[Self]) -> Vec<JoinTuples> {
        Vec::new()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SaveReport {
    pub records: usize,
    /// Write transactions committed for the records themselves.
    pub chunks: usize,
    pub join_rows: u64,
    /// Self references dropped because their target exists nowhere.
    pub cleared_references: usize,
}

impl SaveReport {
    fn absorb(&mut self, other: SaveReport) {
        self.records += other.records;
        self.chunks += other.chunks;
        self.join_rows += other.join_rows;
        self.cleared_references += other.cleared_references;
    }
}

pub struct Repository<E> {
    db: Db,
    chunk_size: usize,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for Repository<E> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            chunk_size: self.chunk_size,
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> Repository<E> {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            chunk_size: DEFAULT_CHUNK_SIZE,
            _entity: PhantomData,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// All rows, newest key first. The ordering carries no business meaning.
    pub async fn find_all(&self) -> Result<Vec<E>, PersistenceError> {
        let sql = format!(
            "SELECT * FROM {} ORDER BY {} DESC",
            E::TABLE,
            E::KEY_COLUMN
        );
        Ok(sqlx::query_as::<_, E>(&sql).fetch_all(&self.db.pool).await?)
    }

    /// `Ok(None)` when absent; errors are reserved for the store itself.
    pub async fn find_by_key(&self, key: &str) -> Result<Option<E>, PersistenceError> {
        let sql = format!("SELECT * FROM {} WHERE {} = ?", E::TABLE, E::KEY_COLUMN);
        Ok(sqlx::query_as::<_, E>(&sql)
            .bind(key)
            .fetch_optional(&self.db.pool)
            .await?)
    }

    /// Like `find_by_key` for callers that require the row.
    pub async fn get_by_key(&self, key: &str) -> Result<E, PersistenceError> {
        self.find_by_key(key)
            .await?
            .ok_or_else(|| PersistenceError::NotFound {
                table: E::TABLE,
                key: key.to_string(),
            })
    }

    pub async fn existing_keys(&self) -> Result<HashSet<String>, PersistenceError> {
        let sql = format!("SELECT {} FROM {}", E::KEY_COLUMN, E::TABLE);
        let keys: Vec<String> = sqlx::query_scalar(&sql).fetch_all(&self.db.pool).await?;
        Ok(keys.into_iter().collect())
    }

    pub async fn count(&self) -> Result<i64, PersistenceError> {
        Ok(self.db.count(E::TABLE).await?)
    }

    /// Upsert one record, then synchronise its associations.
    #[instrument(skip(self, record), fields(table = E::TABLE, key = record.key()))]
    pub async fn save(&self, record: E) -> Result<SaveReport, PersistenceError> {
        self.save_all(vec![record]).await
    }

    /// Chunked batch upsert. Duplicate keys inside the batch collapse to the
    /// last occurrence before chunking.
    #[instrument(skip(self, records), fields(table = E::TABLE))]
    pub async fn save_all(&self, records: Vec<E>) -> Result<SaveReport, PersistenceError> {
        let mut report = SaveReport::default();
        if records.is_empty() {
            return Ok(report);
        }
        let mut records = dedupe_last_wins(records);
        if E::SELF_REFERENCING {
            let stored = self.existing_keys().await?;
            report.cleared_references = clear_unresolvable_references(&mut records, &stored);
            if report.cleared_references > 0 {
                warn!(
                    table = E::TABLE,
                    cleared = report.cleared_references,
                    "self references point at unknown rows; cleared"
                );
            }
            records = order_referenced_first(records);
        }

        let total_chunks = records.len().div_ceil(self.chunk_size);
        for (idx, chunk) in records.chunks(self.chunk_size).enumerate() {
            if let Err(source) = self.write_chunk(chunk).await {
                return Err(PersistenceError::Chunk {
                    table: E::TABLE,
                    chunk: idx + 1,
                    committed: report.chunks,
                    source,
                });
            }
            let join_rows = join_sync::apply(&self.db, E::join_tuples(chunk)).await?;
            report.absorb(SaveReport {
                records: chunk.len(),
                chunks: 1,
                join_rows,
                cleared_references: 0,
            });
            debug!(
                table = E::TABLE,
                chunk = idx + 1,
                of = total_chunks,
                rows = chunk.len(),
                join_rows,
                "chunk committed"
            );
        }
        info!(
            table = E::TABLE,
            records = report.records,
            chunks = report.chunks,
            join_rows = report.join_rows,
            "upsert batch saved"
        );
        Ok(report)
    }

    /// One transaction, one multi-row upsert.
    async fn write_chunk(&self, chunk: &[E]) -> Result<(), sqlx::Error> {
        let mut tx = self.db.pool.begin().await?;
        if E::SELF_REFERENCING {
            // Checked again at COMMIT; SQLite resets the pragma afterwards.
            sqlx::query("PRAGMA defer_foreign_keys = ON")
                .execute(&mut *tx)
                .await?;
        }
        let mut qb = upsert_statement::<E>(chunk);
        qb.build().execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_by_key(&self, key: &str) -> Result<bool, PersistenceError> {
        let sql = format!("DELETE FROM {} WHERE {} = ?", E::TABLE, E::KEY_COLUMN);
        let res = sqlx::query(&sql).bind(key).execute(&self.db.pool).await?;
        Ok(res.rows_affected() > 0)
    }

    /// Reset operation; not used by steady-state ingestion.
    pub async fn delete_all(&self) -> Result<u64, PersistenceError> {
        let sql = format!("DELETE FROM {}", E::TABLE);
        let res = sqlx::query(&sql).execute(&self.db.pool).await?;
        Ok(res.rows_affected())
    }
}

/// `INSERT INTO t (cols) VALUES (..), (..) ON CONFLICT (key) DO UPDATE SET c = excluded.c`.
pub(crate) fn upsert_statement<E: Entity>(chunk: &[E]) -> QueryBuilder<'static, Sqlite> {
    let mut qb: QueryBuilder<'static, Sqlite> = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) ",
        E::TABLE,
        E::COLUMNS.join(", ")
    ));
    qb.push_values(chunk.iter(), |mut b, record| record.bind_row(&mut b));
    let updates = E::update_columns();
    if updates.is_empty() {
        qb.push(format!(" ON CONFLICT ({}) DO NOTHING", E::KEY_COLUMN));
    } else {
        let set = updates
            .iter()
            .map(|c| format!("{c} = excluded.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        qb.push(format!(
            " ON CONFLICT ({}) DO UPDATE SET {}",
            E::KEY_COLUMN,
            set
        ));
    }
    qb
}

fn dedupe_last_wins<E: Entity>(records: Vec<E>) -> Vec<E> {
    let mut last: HashMap<String, usize> = HashMap::with_capacity(records.len());
    for (idx, r) in records.iter().enumerate() {
        last.insert(r.key().to_string(), idx);
    }
    if last.len() == records.len() {
        return records;
    }
    records
        .into_iter()
        .enumerate()
        .filter(|(idx, r)| last.get(r.key()) == Some(idx))
        .map(|(_, r)| r)
        .collect()
}

/// Clear references whose target is neither stored nor part of the batch.
fn clear_unresolvable_references<E: Entity>(records: &mut [E], stored: &HashSet<String>) -> usize {
    let batch: HashSet<String> = records.iter().map(|r| r.key().to_string()).collect();
    let mut cleared = 0;
    for r in records.iter_mut() {
        let unresolvable = match r.self_reference() {
            Some(target) => !stored.contains(target) && !batch.contains(target),
            None => false,
        };
        if unresolvable {
            r.clear_self_reference();
            cleared += 1;
        }
    }
    cleared
}

/// Stable order in which every batch-internal reference target precedes its
/// referrers, so a target never lands in a later chunk than the row pointing
/// at it. Cycles are broken arbitrarily; their members still share the
/// deferred check when they fall in one chunk.
fn order_referenced_first<E: Entity>(records: Vec<E>) -> Vec<E> {
    let index: HashMap<&str, usize> = records
        .iter()
        .enumerate()
        .map(|(i, r)| (r.key(), i))
        .collect();
    let mut depth: Vec<Option<usize>> = vec![None; records.len()];
    for start in 0..records.len() {
        if depth[start].is_some() {
            continue;
        }
        // Walk the reference chain, then assign depths on the way back.
        let mut path: Vec<usize> = Vec::new();
        let mut on_path: HashSet<usize> = HashSet::new();
        let mut cur = Some(start);
        let mut base = 0usize;
        while let Some(i) = cur {
            if let Some(d) = depth[i] {
                base = d + 1;
                break;
            }
            if !on_path.insert(i) {
                break;
            }
            path.push(i);
            cur = records[i]
                .self_reference()
                .and_then(|target| index.get(target).copied())
                .filter(|&t| t != i);
        }
        for (offset, &i) in path.iter().rev().enumerate() {
            depth[i] = Some(base + offset);
        }
    }
    drop(index);
    let mut ranked: Vec<(usize, E)> = records
        .into_iter()
        .enumerate()
        .map(|(i, r)| (depth[i].unwrap_or(0), r))
        .collect();
    ranked.sort_by_key(|(d, _)| *d);
    ranked.into_iter().map(|(_, r)| r).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::entities::{Category, Channel, Country, Subdivision};

    fn category(id: &str, name: &str) -> Category {
        Category {
            id: id.into(),
            name: name.into(),
        }
    }

    fn channel(id: &str, categories: &[&str]) -> Channel {
        Channel {
            id: id.into(),
            name: id.to_uppercase(),
            categories: categories.iter().map(|c| c.to_string()).collect(),
            ..Channel::default()
        }
    }

    async fn join_rows(db: &Db) -> Vec<(String, String)> {
        sqlx::query_as(
            "SELECT channel_id, category_id FROM channel_categories ORDER BY channel_id, category_id",
        )
        .fetch_all(&db.pool)
        .await
        .unwrap()
    }

    #[test]
    fn upsert_statement_lists_only_mapped_columns() {
        let qb = upsert_statement::<Category>(&[category("news", "News")]);
        let sql = qb.sql();
        assert!(sql.starts_with("INSERT INTO categories (id, name) VALUES"));
        assert!(sql.ends_with("ON CONFLICT (id) DO UPDATE SET name = excluded.name"));
    }

    #[tokio::test]
    async fn saving_same_batch_twice_is_idempotent() {
        let db = Db::in_memory().await.unwrap();
        let repo = Repository::<Category>::new(db.clone());
        let batch = || vec![category("news", "News"), category("kids", "Kids")];

        repo.save_all(batch()).await.unwrap();
        let first = repo.find_all().await.unwrap();
        repo.save_all(batch()).await.unwrap();
        let second = repo.find_all().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(repo.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn later_save_overwrites_mapped_columns() {
        let db = Db::in_memory().await.unwrap();
        let repo = Repository::<Category>::new(db);
        repo.save(category("news", "News")).await.unwrap();
        repo.save(category("news", "Current Affairs")).await.unwrap();

        let all = repo.find_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "Current Affairs");
    }

    #[tokio::test]
    async fn find_by_key_distinguishes_absence_from_errors() {
        let db = Db::in_memory().await.unwrap();
        let repo = Repository::<Category>::new(db);
        assert!(repo.find_by_key("nope").await.unwrap().is_none());
        match repo.get_by_key("nope").await {
            Err(PersistenceError::NotFound { table, key }) => {
                assert_eq!(table, "categories");
                assert_eq!(key, "nope");
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn find_all_orders_by_descending_key() {
        let db = Db::in_memory().await.unwrap();
        let repo = Repository::<Category>::new(db);
        repo.save_all(vec![
            category("b", "B"),
            category("c", "C"),
            category("a", "A"),
        ])
        .await
        .unwrap();
        let keys: Vec<String> = repo.find_all().await.unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(keys, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn batch_is_split_into_ceil_n_over_c_transactions() {
        let db = Db::in_memory().await.unwrap();
        let repo = Repository::<Category>::new(db).with_chunk_size(3);
        let batch: Vec<Category> = (0..7)
            .map(|i| category(&format!("c{i}"), &format!("Cat {i}")))
            .collect();
        let report = repo.save_all(batch).await.unwrap();
        assert_eq!(report.chunks, 3);
        assert_eq!(report.records, 7);
        assert_eq!(repo.count().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn failing_chunk_keeps_earlier_chunks_committed() {
        let db = Db::in_memory().await.unwrap();
        Repository::<Country>::new(db.clone())
            .save(Country {
                code: "US".into(),
                name: "United States".into(),
                ..Country::default()
            })
            .await
            .unwrap();
        let repo = Repository::<Subdivision>::new(db).with_chunk_size(2);
        let sub = |code: &str, country: &str| Subdivision {
            code: code.into(),
            country: country.into(),
            name: code.into(),
        };
        let batch = vec![
            sub("US-CA", "US"),
            sub("US-NY", "US"),
            sub("US-TX", "US"),
            sub("ZZ-1", "ZZ"),
            sub("US-WA", "US"),
        ];

        match repo.save_all(batch).await {
            Err(PersistenceError::Chunk {
                chunk, committed, ..
            }) => {
                assert_eq!(chunk, 2);
                assert_eq!(committed, 1);
            }
            other => panic!("expected chunk failure, got {other:?}"),
        }
        // chunk 1 stays, chunk 2 rolled back, chunk 3 never attempted
        assert_eq!(repo.count().await.unwrap(), 2);
        assert!(repo.find_by_key("US-TX").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_keys_in_one_batch_collapse_to_last() {
        let db = Db::in_memory().await.unwrap();
        let repo = Repository::<Category>::new(db);
        let report = repo
            .save_all(vec![category("news", "Old"), category("news", "New")])
            .await
            .unwrap();
        assert_eq!(report.records, 1);
        assert_eq!(repo.get_by_key("news").await.unwrap().name, "New");
    }

    #[tokio::test]
    async fn channel_batch_synchronises_categories_per_chunk() {
        let db = Db::in_memory().await.unwrap();
        Repository::<Category>::new(db.clone())
            .save_all(vec![category("x", "X"), category("y", "Y")])
            .await
            .unwrap();
        let repo = Repository::<Channel>::new(db.clone()).with_chunk_size(2);
        repo.save_all(vec![
            channel("a", &["x", "x"]),
            channel("b", &["x", "y"]),
            channel("c", &[]),
        ])
        .await
        .unwrap();

        assert_eq!(
            join_rows(&db).await,
            vec![
                ("a".to_string(), "x".to_string()),
                ("b".to_string(), "x".to_string()),
                ("b".to_string(), "y".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn resaving_channel_replaces_stale_associations() {
        let db = Db::in_memory().await.unwrap();
        Repository::<Category>::new(db.clone())
            .save_all(vec![category("x", "X"), category("y", "Y")])
            .await
            .unwrap();
        let repo = Repository::<Channel>::new(db.clone());
        repo.save(channel("a", &["x", "y"])).await.unwrap();
        repo.save(channel("a", &["y"])).await.unwrap();
        assert_eq!(
            join_rows(&db).await,
            vec![("a".to_string(), "y".to_string())]
        );
    }

    #[tokio::test]
    async fn unknown_children_are_filtered_not_fatal() {
        let db = Db::in_memory().await.unwrap();
        let repo = Repository::<Channel>::new(db.clone());
        let report = repo.save(channel("a", &["x"])).await.unwrap();
        assert_eq!(report.join_rows, 0);
        assert!(join_rows(&db).await.is_empty());
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn ingestion_leaves_unlisted_columns_untouched() {
        let db = Db::in_memory().await.unwrap();
        let repo = Repository::<Channel>::new(db.clone());
        repo.save(channel("a", &[])).await.unwrap();
        sqlx::query("UPDATE channels SET catchup_enabled = 1 WHERE id = 'a'")
            .execute(&db.pool)
            .await
            .unwrap();

        let mut renamed = channel("a", &[]);
        renamed.name = "Renamed".into();
        repo.save(renamed).await.unwrap();

        let stored = repo.get_by_key("a").await.unwrap();
        assert_eq!(stored.name, "Renamed");
        assert!(stored.catchup_enabled);
    }

    #[tokio::test]
    async fn replaced_by_targets_in_later_positions_are_written_first() {
        let db = Db::in_memory().await.unwrap();
        let repo = Repository::<Channel>::new(db.clone()).with_chunk_size(1);
        let mut old = channel("old", &[]);
        old.replaced_by = Some("new".into());
        let mut ghost = channel("ghost", &[]);
        ghost.replaced_by = Some("missing".into());

        let report = repo
            .save_all(vec![old, ghost, channel("new", &[])])
            .await
            .unwrap();
        assert_eq!(report.chunks, 3);
        assert_eq!(report.cleared_references, 1);
        assert_eq!(
            repo.get_by_key("old").await.unwrap().replaced_by.as_deref(),
            Some("new")
        );
        assert_eq!(repo.get_by_key("ghost").await.unwrap().replaced_by, None);
    }

    #[tokio::test]
    async fn delete_by_key_and_delete_all() {
        let db = Db::in_memory().await.unwrap();
        let repo = Repository::<Category>::new(db);
        repo.save_all(vec![category("a", "A"), category("b", "B")])
            .await
            .unwrap();
        assert!(repo.delete_by_key("a").await.unwrap());
        assert!(!repo.delete_by_key("a").await.unwrap());
        assert_eq!(repo.delete_all().await.unwrap(), 1);
        assert_eq!(repo.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_batch_touches_nothing() {
        let db = Db::in_memory().await.unwrap();
        let repo = Repository::<Category>::new(db);
        let report = repo.save_all(Vec::new()).await.unwrap();
        assert_eq!(report, SaveReport::default());
    }
}
