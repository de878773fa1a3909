//! Full-snapshot reads of the upstream catalog feed.
//!
//! Each resource is a JSON array served at `{base}/{resource}.json`. There is
//! no cursor: every call returns the complete current set.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::FetchError;

#[async_trait]
pub trait Feed<T>: Send + Sync {
    /// Resource name, used for logs and errors.
    fn resource(&self) -> &str;

    async fn fetch_content(&self) -> Result<Vec<T>, FetchError>;
}

/// Shared HTTP client plus base URL; hands out typed feeds.
#[derive(Debug, Clone)]
pub struct FeedClient {
    http: Client,
    base_url: String,
}

impl FeedClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .user_agent(concat!("catalog-refresh/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn feed<T>(&self, resource: &str) -> HttpFeed<T> {
        HttpFeed {
            http: self.http.clone(),
            url: format!("{}/{}.json", self.base_url, resource),
            resource: resource.to_string(),
            _item: PhantomData,
        }
    }
}

pub struct HttpFeed<T> {
    http: Client,
    url: String,
    resource: String,
    _item: PhantomData<fn() -> T>,
}

impl<T> HttpFeed<T> {
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl<T> Feed<T> for HttpFeed<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn resource(&self) -> &str {
        &self.resource
    }

    #[instrument(skip(self), fields(resource = %self.resource))]
    async fn fetch_content(&self) -> Result<Vec<T>, FetchError> {
        let http_err = |source| FetchError::Http {
            resource: self.resource.clone(),
            source,
        };
        let resp = self.http.get(&self.url).send().await.map_err(http_err)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                resource: self.resource.clone(),
                status: status.as_u16(),
            });
        }
        let body = resp.bytes().await.map_err(http_err)?;
        let items = decode(&self.resource, &body)?;
        debug!(items = items.len(), bytes = body.len(), "feed fetched");
        Ok(items)
    }
}

/// Decode a feed body; any shape mismatch fails the whole snapshot.
pub fn decode<T: DeserializeOwned>(resource: &str, body: &[u8]) -> Result<Vec<T>, FetchError> {
    serde_json::from_slice(body).map_err(|source| FetchError::Malformed {
        resource: resource.to_string(),
        source,
    })
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LanguageDto {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CountryDto {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub flag: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RegionDto {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub countries: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SubdivisionDto {
    pub country: String,
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CategoryDto {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelDto {
    pub id: String,
    pub name: String,
    pub alt_names: Vec<String>,
    pub network: Option<String>,
    pub owners: Vec<String>,
    pub country: Option<String>,
    pub subdivision: Option<String>,
    pub city: Option<String>,
    pub broadcast_area: Vec<String>,
    pub languages: Vec<String>,
    pub categories: Vec<String>,
    pub is_nsfw: bool,
    pub launched: Option<String>,
    pub closed: Option<String>,
    pub replaced_by: Option<String>,
    pub website: Option<String>,
    pub logo: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StreamDto {
    #[serde(default)]
    pub channel: Option<String>,
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default, alias = "http_referrer")]
    pub referrer: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GuideDto {
    #[serde(default)]
    pub channel: Option<String>,
    pub site: String,
    pub site_id: String,
    pub site_name: String,
    pub lang: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_url_joins_base_and_resource() {
        let client = FeedClient::new("https://feed.example/api/", Duration::from_secs(5)).unwrap();
        let feed: HttpFeed<LanguageDto> = client.feed("languages");
        assert_eq!(feed.url(), "https://feed.example/api/languages.json");
        assert_eq!(feed.resource(), "languages");
    }

    #[test]
    fn channel_dto_tolerates_missing_and_null_fields() {
        let body = br#"[{"id":"A.us","name":"A","categories":["news"],"replaced_by":null}]"#;
        let items: Vec<ChannelDto> = decode("channels", body).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].categories, vec!["news"]);
        assert!(items[0].languages.is_empty());
        assert!(!items[0].is_nsfw);
    }

    #[test]
    fn stream_referrer_accepts_legacy_name() {
        let body = br#"[{"channel":"A.us","url":"http://x/a.m3u8","http_referrer":"http://ref"}]"#;
        let items: Vec<StreamDto> = decode("streams", body).unwrap();
        assert_eq!(items[0].referrer.as_deref(), Some("http://ref"));
    }

    #[test]
    fn malformed_body_is_a_fetch_error() {
        let err = decode::<CategoryDto>("categories", b"{not json").unwrap_err();
        assert!(matches!(err, FetchError::Malformed { ref resource, .. } if resource == "categories"));
        let empty: Vec<CategoryDto> = decode("categories", b"[]").unwrap();
        assert!(empty.is_empty());
    }
}
