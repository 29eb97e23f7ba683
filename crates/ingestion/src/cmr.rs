//! Client for the granule metadata catalog (CMR search API).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, instrument};

use granule_common::TimeRange;

#[derive(Error, Debug)]
pub enum CmrError {
    #[error("CMR request failed: {0}")]
    Request(String),

    #[error("CMR returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode CMR response: {0}")]
    Decode(String),
}

/// A link attached to a granule (data file, browse image, metadata, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GranuleLink {
    pub href: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GranuleLink {
    pub fn new(href: impl Into<String>, title: Option<&str>) -> Self {
        Self {
            href: href.into(),
            title: title.map(str::to_string),
            rel: None,
            media_type: None,
            extra: Map::new(),
        }
    }
}

/// One granule entry from a CMR JSON feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Granule {
    /// CMR concept id
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_end: Option<String>,
    #[serde(default)]
    pub links: Vec<GranuleLink>,
    /// Every other field of the entry, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Granule {
    /// All metadata fields of the entry as a JSON object.
    pub fn metadata(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FeedResponse {
    feed: Feed,
}

#[derive(Debug, Deserialize)]
struct Feed {
    #[serde(default)]
    entry: Vec<Granule>,
}

/// Read-only access to granule metadata.
#[async_trait]
pub trait CmrClient: Send + Sync {
    /// One page (1-based) of granules for a collection within a time range.
    async fn search_granules(
        &self,
        short_name: &str,
        time_range: &TimeRange,
        page_size: usize,
        page_num: usize,
    ) -> Result<Vec<Granule>, CmrError>;

    /// Look up a single granule by concept id.
    async fn granule(&self, concept_id: &str) -> Result<Option<Granule>, CmrError>;
}

/// CMR client over HTTPS.
pub struct HttpCmrClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCmrClient {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> Result<Self, CmrError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("granule-ingester/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CmrError::Request(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn fetch(&self, query: &[(&str, String)]) -> Result<Vec<Granule>, CmrError> {
        let url = format!("{}/search/granules.json", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| CmrError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CmrError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let feed: FeedResponse = response
            .json()
            .await
            .map_err(|e| CmrError::Decode(e.to_string()))?;
        Ok(feed.feed.entry)
    }
}

#[async_trait]
impl CmrClient for HttpCmrClient {
    #[instrument(skip(self, time_range), fields(time = %time_range.to_query_param()))]
    async fn search_granules(
        &self,
        short_name: &str,
        time_range: &TimeRange,
        page_size: usize,
        page_num: usize,
    ) -> Result<Vec<Granule>, CmrError> {
        let granules = self
            .fetch(&[
                ("short_name", short_name.to_string()),
                ("temporal", time_range.to_query_param()),
                ("page_size", page_size.to_string()),
                ("page_num", page_num.to_string()),
            ])
            .await?;
        debug!(count = granules.len(), "Fetched granule page");
        Ok(granules)
    }

    #[instrument(skip(self))]
    async fn granule(&self, concept_id: &str) -> Result<Option<Granule>, CmrError> {
        let mut granules = self.fetch(&[("concept_id", concept_id.to_string())]).await?;
        Ok(if granules.is_empty() {
            None
        } else {
            Some(granules.swap_remove(0))
        })
    }
}
