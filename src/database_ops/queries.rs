//! Read-side queries behind the fan-out jobs, plus the operator-only catch-up toggle.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

use super::entities::{Guide, Programme};
use crate::error::PersistenceError;
use crate::util::db::Db;

/// One (site, lang) grabbing unit and how many guide rows feed it.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct GrabUnit {
    pub site: String,
    pub lang: String,
    pub channels: i64,
}

/// Distinct grabbing units over guides that resolve to a known channel.
pub async fn grab_units(db: &Db) -> Result<Vec<GrabUnit>, PersistenceError> {
    let rows = sqlx::query_as::<_, GrabUnit>(
        r#"
        SELECT site, lang, COUNT(*) AS channels
        FROM guides
        WHERE channel IS NOT NULL AND site <> '' AND lang <> ''
        GROUP BY site, lang
        ORDER BY site, lang
        "#,
    )
    .fetch_all(&db.pool)
    .await?;
    Ok(rows)
}

pub async fn guides_for_unit(db: &Db, site: &str, lang: &str) -> Result<Vec<Guide>, PersistenceError> {
    let rows = sqlx::query_as::<_, Guide>(
        "SELECT * FROM guides WHERE site = ? AND lang = ? AND channel IS NOT NULL ORDER BY id",
    )
    .bind(site)
    .bind(lang)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows)
}

/// A catch-up enabled channel and the live stream recordings are taken from.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct CatchupCandidate {
    pub channel: String,
    pub stream_url: String,
}

/// Enabled channels with at least one stream; the lowest URL is picked so
/// repeated runs resolve the same stream.
pub async fn catchup_candidates(db: &Db) -> Result<Vec<CatchupCandidate>, PersistenceError> {
    let rows = sqlx::query_as::<_, CatchupCandidate>(
        r#"
        SELECT c.id AS channel, MIN(s.url) AS stream_url
        FROM channels c
        JOIN streams s ON s.channel = c.id
        WHERE c.catchup_enabled = 1
        GROUP BY c.id
        ORDER BY c.id
        "#,
    )
    .fetch_all(&db.pool)
    .await?;
    Ok(rows)
}

/// Programmes of `channel` starting in `[from, until)`, earliest first.
pub async fn programmes_between(
    db: &Db,
    channel: &str,
    from: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Vec<Programme>, PersistenceError> {
    let rows = sqlx::query_as::<_, Programme>(
        r#"
        SELECT * FROM programmes
        WHERE channel = ? AND start_at >= ? AND start_at < ?
        ORDER BY start_at
        "#,
    )
    .bind(channel)
    .bind(from)
    .bind(until)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows)
}

/// Flip the operator-owned catch-up flag. `false` when the channel is unknown.
pub async fn set_catchup(db: &Db, channel: &str, enabled: bool) -> Result<bool, PersistenceError> {
    let res = sqlx::query("UPDATE channels SET catchup_enabled = ? WHERE id = ?")
        .bind(enabled)
        .bind(channel)
        .execute(&db.pool)
        .await?;
    Ok(res.rows_affected() > 0)
}
