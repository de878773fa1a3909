//! Batched synchronisation of many-to-many join relations.
//!
//! A chunk of parent records is folded into flat `(parent, child)` tuples for
//! every relation the entity owns, then applied in one transaction: existing
//! rows for the chunk's parents are removed and the deduplicated tuple set is
//! upserted on the relation's composite key. Children that must exist in
//! another table are filtered in SQL, so an empty or partially loaded parent
//! table yields fewer join rows instead of a constraint failure.

use std::collections::BTreeSet;

use sqlx::{QueryBuilder, Sqlite};
use tracing::debug;

use crate::error::PersistenceError;
use crate::util::db::Db;

/// Tuples per INSERT statement; two binds each.
const TUPLES_PER_STATEMENT: usize = 2_000;
/// Parent keys per DELETE statement.
const PARENTS_PER_STATEMENT: usize = 1_000;

#[derive(Debug)]
pub struct JoinRelation {
    pub table: &'static str,
    pub parent_column: &'static str,
    pub child_column: &'static str,
    /// `(table, key column)` children must exist in; `None` for free-text children.
    pub child_ref: Option<(&'static str, &'static str)>,
}

/// Deduplicated tuples of one relation for one chunk of parents.
#[derive(Debug)]
pub struct JoinTuples {
    pub relation: &'static JoinRelation,
    /// Every parent of the chunk, including those with no children, so their
    /// stale associations are cleared too.
    pub parents: BTreeSet<String>,
    pub tuples: BTreeSet<(String, String)>,
}

impl JoinTuples {
    /// Fold `children(record)` of every record into one tuple set. Blank
    /// children are skipped and repeated tuples collapse.
    pub fn fold<P, K, C>(relation: &'static JoinRelation, records: &[P], key: K, children: C) -> Self
    where
        K: Fn(&P) -> &str,
        C: Fn(&P) -> &[String],
    {
        let mut parents = BTreeSet::new();
        let mut tuples = BTreeSet::new();
        for record in records {
            let parent = key(record);
            parents.insert(parent.to_string());
            for child in children(record) {
                let child = child.trim();
                if !child.is_empty() {
                    tuples.insert((parent.to_string(), child.to_string()));
                }
            }
        }
        Self {
            relation,
            parents,
            tuples,
        }
    }
}

/// Apply the tuple sets of one chunk in a single transaction. Returns the
/// number of join rows written.
pub async fn apply(db: &Db, sets: Vec<JoinTuples>) -> Result<u64, PersistenceError> {
    if sets.iter().all(|s| s.parents.is_empty()) {
        return Ok(0);
    }
    let mut tx = db.pool.begin().await?;
    let mut written = 0u64;

    for set in &sets {
        let rel = set.relation;
        let parents: Vec<&String> = set.parents.iter().collect();
        for slice in parents.chunks(PARENTS_PER_STATEMENT) {
            let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
                "DELETE FROM {} WHERE {} IN (",
                rel.table, rel.parent_column
            ));
            let mut sep = qb.separated(", ");
            for p in slice {
                sep.push_bind((*p).clone());
            }
            qb.push(")");
            qb.build().execute(&mut *tx).await?;
        }

        let tuples: Vec<&(String, String)> = set.tuples.iter().collect();
        for slice in tuples.chunks(TUPLES_PER_STATEMENT) {
            let mut qb: QueryBuilder<'_, Sqlite> = match rel.child_ref {
                Some(_) => QueryBuilder::new(format!(
                    "INSERT INTO {} ({}, {}) SELECT v.column1, v.column2 FROM (",
                    rel.table, rel.parent_column, rel.child_column
                )),
                None => QueryBuilder::new(format!(
                    "INSERT INTO {} ({}, {}) ",
                    rel.table, rel.parent_column, rel.child_column
                )),
            };
            qb.push_values(slice.iter(), |mut b, (parent, child)| {
                b.push_bind(parent.clone()).push_bind(child.clone());
            });
            if let Some((child_table, child_key)) = rel.child_ref {
                qb.push(format!(
                    ") AS v WHERE EXISTS (SELECT 1 FROM {t} WHERE {t}.{k} = v.column2)",
                    t = child_table,
                    k = child_key
                ));
            }
            qb.push(format!(
                " ON CONFLICT ({}, {}) DO NOTHING",
                rel.parent_column, rel.child_column
            ));
            let res = qb.build().execute(&mut *tx).await?;
            written += res.rows_affected();
        }
        debug!(
            relation = rel.table,
            parents = set.parents.len(),
            tuples = set.tuples.len(),
            "join relation synchronised"
        );
    }

    tx.commit().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    static TAGS: JoinRelation = JoinRelation {
        table: "channel_owners",
        parent_column: "channel_id",
        child_column: "owner",
        child_ref: None,
    };

    struct Rec {
        id: String,
        tags: Vec<String>,
    }

    #[test]
    fn fold_dedupes_and_skips_blank_children() {
        let recs = vec![
            Rec {
                id: "a".into(),
                tags: vec!["x".into(), "x".into(), "  ".into()],
            },
            Rec {
                id: "b".into(),
                tags: vec![],
            },
        ];
        let set = JoinTuples::fold(&TAGS, &recs, |r| r.id.as_str(), |r| r.tags.as_slice());
        assert_eq!(set.parents.len(), 2);
        assert_eq!(
            set.tuples.into_iter().collect::<Vec<_>>(),
            vec![("a".to_string(), "x".to_string())]
        );
    }
}
