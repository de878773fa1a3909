//! Catalog records and their mapping onto the store.
//!
//! The column lists below are the upsert contract: a column that is not listed
//! is never written by ingestion (e.g. `channels.catchup_enabled`).

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::query_builder::Separated;
use sqlx::{FromRow, Sqlite};

use super::join_sync::{JoinRelation, JoinTuples};
use super::upsert::Entity;

#[derive(Debug, Clone, Default, PartialEq, Eq, FromRow, Serialize)]
pub struct Language {
    pub code: String,
    pub name: String,
}

impl Entity for Language {
    const TABLE: &'static str = "languages";
    const KEY_COLUMN: &'static str = "code";
    const COLUMNS: &'static [&'static str] = &["code", "name"];

    fn key(&self) -> &str {
        &self.code
    }

    fn bind_row(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        row.push_bind(self.code.clone()).push_bind(self.name.clone());
    }
}

pub static COUNTRY_LANGUAGES: JoinRelation = JoinRelation {
    table: "country_languages",
    parent_column: "country_code",
    child_column: "language_code",
    child_ref: Some(("languages", "code")),
};

#[derive(Debug, Clone, Default, PartialEq, Eq, FromRow, Serialize)]
pub struct Country {
    pub code: String,
    pub name: String,
    pub flag: Option<String>,
    #[sqlx(skip)]
    pub languages: Vec<String>,
}

impl Entity for Country {
    const TABLE: &'static str = "countries";
    const KEY_COLUMN: &'static str = "code";
    const COLUMNS: &'static [&'static str] = &["code", "name", "flag"];

    fn key(&self) -> &str {
        &self.code
    }

    fn bind_row(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        row.push_bind(self.code.clone())
            .push_bind(self.name.clone())
            .push_bind(self.flag.clone());
    }

    fn join_tuples(chunk: &[Self]) -> Vec<JoinTuples> {
        vec![JoinTuples::fold(
            &COUNTRY_LANGUAGES,
            chunk,
            |c| c.code.as_str(),
            |c| c.languages.as_slice(),
        )]
    }
}

pub static REGION_COUNTRIES: JoinRelation = JoinRelation {
    table: "region_countries",
    parent_column: "region_code",
    child_column: "country_code",
    child_ref: Some(("countries", "code")),
};

#[derive(Debug, Clone, Default, PartialEq, Eq, FromRow, Serialize)]
pub struct Region {
    pub code: String,
    pub name: String,
    #[sqlx(skip)]
    pub countries: Vec<String>,
}

impl Entity for Region {
    const TABLE: &'static str = "regions";
    const KEY_COLUMN: &'static str = "code";
    const COLUMNS: &'static [&'static str] = &["code", "name"];

    fn key(&self) -> &str {
        &self.code
    }

    fn bind_row(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        row.push_bind(self.code.clone()).push_bind(self.name.clone());
    }

    fn join_tuples(chunk: &[Self]) -> Vec<JoinTuples> {
        vec![JoinTuples::fold(
            &REGION_COUNTRIES,
            chunk,
            |r| r.code.as_str(),
            |r| r.countries.as_slice(),
        )]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, FromRow, Serialize)]
pub struct Subdivision {
    pub code: String,
    pub country: String,
    pub name: String,
}

impl Entity for Subdivision {
    const TABLE: &'static str = "subdivisions";
    const KEY_COLUMN: &'static str = "code";
    const COLUMNS: &'static [&'static str] = &["code", "country", "name"];

    fn key(&self) -> &str {
        &self.code
    }

    fn bind_row(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        row.push_bind(self.code.clone())
            .push_bind(self.country.clone())
            .push_bind(self.name.clone());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, FromRow, Serialize)]
pub struct Category {
    pub id: String,
    pub name: String,
}

impl Entity for Category {
    const TABLE: &'static str = "categories";
    const KEY_COLUMN: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &["id", "name"];

    fn key(&self) -> &str {
        &self.id
    }

    fn bind_row(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        row.push_bind(self.id.clone()).push_bind(self.name.clone());
    }
}

pub static CHANNEL_CATEGORIES: JoinRelation = JoinRelation {
    table: "channel_categories",
    parent_column: "channel_id",
    child_column: "category_id",
    child_ref: Some(("categories", "id")),
};

pub static CHANNEL_LANGUAGES: JoinRelation = JoinRelation {
    table: "channel_languages",
    parent_column: "channel_id",
    child_column: "language_code",
    child_ref: Some(("languages", "code")),
};

pub static CHANNEL_OWNERS: JoinRelation = JoinRelation {
    table: "channel_owners",
    parent_column: "channel_id",
    child_column: "owner",
    child_ref: None,
};

pub static CHANNEL_ALT_NAMES: JoinRelation = JoinRelation {
    table: "channel_alt_names",
    parent_column: "channel_id",
    child_column: "alt_name",
    child_ref: None,
};

pub static CHANNEL_BROADCAST_AREAS: JoinRelation = JoinRelation {
    table: "channel_broadcast_areas",
    parent_column: "channel_id",
    child_column: "area",
    child_ref: None,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, FromRow, Serialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub network: Option<String>,
    pub country: Option<String>,
    pub subdivision: Option<String>,
    pub city: Option<String>,
    pub is_nsfw: bool,
    pub launched: Option<String>,
    pub closed: Option<String>,
    pub replaced_by: Option<String>,
    pub website: Option<String>,
    pub logo: Option<String>,
    /// Operator-owned; read back but never written by ingestion.
    pub catchup_enabled: bool,
    #[sqlx(skip)]
    pub alt_names: Vec<String>,
    #[sqlx(skip)]
    pub owners: Vec<String>,
    #[sqlx(skip)]
    pub broadcast_area: Vec<String>,
    #[sqlx(skip)]
    pub languages: Vec<String>,
    #[sqlx(skip)]
    pub categories: Vec<String>,
}

impl Entity for Channel {
    const TABLE: &'static str = "channels";
    const KEY_COLUMN: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "name",
        "network",
        "country",
        "subdivision",
        "city",
        "is_nsfw",
        "launched",
        "closed",
        "replaced_by",
        "website",
        "logo",
    ];
    const SELF_REFERENCING: bool = true;

    fn key(&self) -> &str {
        &self.id
    }

    fn bind_row(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        row.push_bind(self.id.clone())
            .push_bind(self.name.clone())
            .push_bind(self.network.clone())
            .push_bind(self.country.clone())
            .push_bind(self.subdivision.clone())
            .push_bind(self.city.clone())
            .push_bind(self.is_nsfw)
            .push_bind(self.launched.clone())
            .push_bind(self.closed.clone())
            .push_bind(self.replaced_by.clone())
            .push_bind(self.website.clone())
            .push_bind(self.logo.clone());
    }

    fn self_reference(&self) -> Option<&str> {
        self.replaced_by.as_deref()
    }

    fn clear_self_reference(&mut self) {
        self.replaced_by = None;
    }

    fn join_tuples(chunk: &[Self]) -> Vec<JoinTuples> {
        fn id(c: &Channel) -> &str {
            c.id.as_str()
        }
        vec![
            JoinTuples::fold(&CHANNEL_CATEGORIES, chunk, id, |c| c.categories.as_slice()),
            JoinTuples::fold(&CHANNEL_LANGUAGES, chunk, id, |c| c.languages.as_slice()),
            JoinTuples::fold(&CHANNEL_OWNERS, chunk, id, |c| c.owners.as_slice()),
            JoinTuples::fold(&CHANNEL_ALT_NAMES, chunk, id, |c| c.alt_names.as_slice()),
            JoinTuples::fold(&CHANNEL_BROADCAST_AREAS, chunk, id, |c| {
                c.broadcast_area.as_slice()
            }),
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, FromRow, Serialize)]
pub struct Stream {
    pub url: String,
    pub channel: Option<String>,
    pub title: Option<String>,
    pub quality: Option<String>,
    pub referrer: Option<String>,
    pub user_agent: Option<String>,
}

impl Entity for Stream {
    const TABLE: &'static str = "streams";
    const KEY_COLUMN: &'static str = "url";
    const COLUMNS: &'static [&'static str] =
        &["url", "channel", "title", "quality", "referrer", "user_agent"];

    fn key(&self) -> &str {
        &self.url
    }

    fn bind_row(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        row.push_bind(self.url.clone())
            .push_bind(self.channel.clone())
            .push_bind(self.title.clone())
            .push_bind(self.quality.clone())
            .push_bind(self.referrer.clone())
            .push_bind(self.user_agent.clone());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, FromRow, Serialize)]
pub struct Guide {
    /// `site/site_id/lang`
    pub id: String,
    pub channel: Option<String>,
    pub site: String,
    pub site_id: String,
    pub site_name: String,
    pub lang: String,
}

impl Guide {
    pub fn compose_id(site: &str, site_id: &str, lang: &str) -> String {
        format!("{}/{}/{}", site, site_id, lang)
    }
}

impl Entity for Guide {
    const TABLE: &'static str = "guides";
    const KEY_COLUMN: &'static str = "id";
    const COLUMNS: &'static [&'static str] =
        &["id", "channel", "site", "site_id", "site_name", "lang"];

    fn key(&self) -> &str {
        &self.id
    }

    fn bind_row(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        row.push_bind(self.id.clone())
            .push_bind(self.channel.clone())
            .push_bind(self.site.clone())
            .push_bind(self.site_id.clone())
            .push_bind(self.site_name.clone())
            .push_bind(self.lang.clone());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct Programme {
    /// `channel@unix_start`
    pub id: String,
    pub channel: String,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub lang: Option<String>,
    pub start_at: DateTime<Utc>,
    pub stop_at: DateTime<Utc>,
}

impl Programme {
    pub fn compose_id(channel: &str, start_at: DateTime<Utc>) -> String {
        format!("{}@{}", channel, start_at.timestamp())
    }

    pub fn duration(&self) -> chrono::Duration {
        self.stop_at - self.start_at
    }
}

impl Entity for Programme {
    const TABLE: &'static str = "programmes";
    const KEY_COLUMN: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "channel",
        "title",
        "description",
        "category",
        "lang",
        "start_at",
        "stop_at",
    ];

    fn key(&self) -> &str {
        &self.id
    }

    fn bind_row(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        row.push_bind(self.id.clone())
            .push_bind(self.channel.clone())
            .push_bind(self.title.clone())
            .push_bind(self.description.clone())
            .push_bind(self.category.clone())
            .push_bind(self.lang.clone())
            .push_bind(self.start_at)
            .push_bind(self.stop_at);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct CatchupRecording {
    pub programme_id: String,
    pub stream_url: String,
    pub output_path: String,
    pub recorded_at: DateTime<Utc>,
}

impl Entity for CatchupRecording {
    const TABLE: &'static str = "catchup_recordings";
    const KEY_COLUMN: &'static str = "programme_id";
    const COLUMNS: &'static [&'static str] =
        &["programme_id", "stream_url", "output_path", "recorded_at"];

    fn key(&self) -> &str {
        &self.programme_id
    }

    fn bind_row(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        row.push_bind(self.programme_id.clone())
            .push_bind(self.stream_url.clone())
            .push_bind(self.output_path.clone())
            .push_bind(self.recorded_at);
    }
}
