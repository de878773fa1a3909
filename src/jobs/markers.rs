//! Last-success / last-failure bookkeeping per job, kept in `job_runs`.

use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use sqlx::FromRow;

use super::identity::JobKey;
use crate::error::PersistenceError;
use crate::util::db::Db;

/// Longest error text kept in a marker.
const MAX_ERROR_LEN: usize = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct RunMarker {
    pub job_group: String,
    pub job_name: String,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_duration_ms: Option<i64>,
}

#[derive(Clone)]
pub struct RunMarkers {
    db: Db,
}

impl RunMarkers {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn record_success(&self, key: &JobKey, took: Duration) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO job_runs (job_group, job_name, last_success_at, last_duration_ms)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (job_group, job_name) DO UPDATE SET
                last_success_at = excluded.last_success_at,
                last_duration_ms = excluded.last_duration_ms
            "#,
        )
        .bind(&key.group)
        .bind(&key.name)
        .bind(Utc::now().trunc_subsecs(0))
        .bind(took.as_millis() as i64)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    /// Failure never clears an earlier success: a parent that succeeded once
    /// keeps its children unblocked.
    pub async fn record_failure(&self, key: &JobKey, error: &str, took: Duration) -> Result<(), PersistenceError> {
        let mut error = error.to_string();
        if error.len() > MAX_ERROR_LEN {
            let mut cut = MAX_ERROR_LEN;
            while !error.is_char_boundary(cut) {
                cut -= 1;
            }
            error.truncate(cut);
        }
        sqlx::query(
            r#"
            INSERT INTO job_runs (job_group, job_name, last_failure_at, last_error, last_duration_ms)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (job_group, job_name) DO UPDATE SET
                last_failure_at = excluded.last_failure_at,
                last_error = excluded.last_error,
                last_duration_ms = excluded.last_duration_ms
            "#,
        )
        .bind(&key.group)
        .bind(&key.name)
        .bind(Utc::now().trunc_subsecs(0))
        .bind(error)
        .bind(took.as_millis() as i64)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    pub async fn last_success(&self, key: &JobKey) -> Result<Option<DateTime<Utc>>, PersistenceError> {
        let at: Option<Option<DateTime<Utc>>> = sqlx::query_scalar(
            "SELECT last_success_at FROM job_runs WHERE job_group = ? AND job_name = ?",
        )
        .bind(&key.group)
        .bind(&key.name)
        .fetch_optional(&self.db.pool)
        .await?;
        Ok(at.flatten())
    }

    /// Parents that have never completed successfully, in declaration order.
    pub async fn pending_parents(&self, parents: &[JobKey]) -> Result<Vec<JobKey>, PersistenceError> {
        let mut pending = Vec::new();
        for parent in parents {
            if self.last_success(parent).await?.is_none() {
                pending.push(parent.clone());
            }
        }
        Ok(pending)
    }

    pub async fn all(&self) -> Result<Vec<RunMarker>, PersistenceError> {
        let rows = sqlx::query_as::<_, RunMarker>(
            "SELECT * FROM job_runs ORDER BY job_group, job_name",
        )
        .fetch_all(&self.db.pool)
        .await?;
        Ok(rows)
    }

    pub async fn clear(&self) -> Result<u64, PersistenceError> {
        let res = sqlx::query("DELETE FROM job_runs").execute(&self.db.pool).await?;
        Ok(res.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failure_keeps_previous_success() {
        let db = Db::in_memory().await.unwrap();
        let markers = RunMarkers::new(db);
        let key = JobKey::catalog("languages");

        assert!(markers.last_success(&key).await.unwrap().is_none());
        markers.record_success(&key, Duration::from_millis(12)).await.unwrap();
        let ok_at = markers.last_success(&key).await.unwrap();
        assert!(ok_at.is_some());

        markers
            .record_failure(&key, "feed unreachable", Duration::from_millis(3))
            .await
            .unwrap();
        assert_eq!(markers.last_success(&key).await.unwrap(), ok_at);

        let all = markers.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].last_error.as_deref(), Some("feed unreachable"));
        assert_eq!(all[0].last_duration_ms, Some(3));
    }

    #[tokio::test]
    async fn pending_parents_lists_only_unsuccessful() {
        let db = Db::in_memory().await.unwrap();
        let markers = RunMarkers::new(db);
        let a = JobKey::catalog("languages");
        let b = JobKey::catalog("countries");
        markers.record_success(&a, Duration::ZERO).await.unwrap();
        markers.record_failure(&b, "x", Duration::ZERO).await.unwrap();

        let pending = markers.pending_parents(&[a, b.clone()]).await.unwrap();
        assert_eq!(pending, vec![b]);
    }

    #[tokio::test]
    async fn long_errors_are_truncated() {
        let db = Db::in_memory().await.unwrap();
        let markers = RunMarkers::new(db);
        let key = JobKey::catalog("channels");
        markers
            .record_failure(&key, &"é".repeat(900), Duration::ZERO)
            .await
            .unwrap();
        let stored = markers.all().await.unwrap().remove(0).last_error.unwrap();
        assert!(stored.len() <= MAX_ERROR_LEN);
    }
}
