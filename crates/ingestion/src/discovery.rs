//! Granule discovery: enumerate source files and submit one queue message each.
//!
//! Two discoverers are provided. [`CmrDiscoverer`] pages through the granule
//! catalog and picks one link per granule. [`StorageDiscoverer`] lists a
//! bucket prefix, optionally in another account. Both return lazy, finite
//! streams; per-file problems are yielded as `Err` items and never end the
//! stream early unless the source itself fails.

use std::sync::Arc;

use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use metrics::counter;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use granule_common::{DatetimeInterval, GranuleResult, TimeRange};
use storage::{ObjectInfo, ObjectStorage, ObjectStorageConfig, StorageCredentials, WorkQueue};

use crate::cmr::{CmrClient, Granule, GranuleLink};
use crate::credentials::CredentialProvider;
use crate::error::DiscoveryError;
use crate::event::{FilenamePattern, IngestMessage};

/// A source file found by a discoverer. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    source_uri: String,
    collection_id: String,
    link_role: Option<String>,
    granule_id: Option<String>,
}

impl DiscoveredFile {
    pub fn new(source_uri: impl Into<String>, collection_id: impl Into<String>) -> Self {
        Self {
            source_uri: source_uri.into(),
            collection_id: collection_id.into(),
            link_role: None,
            granule_id: None,
        }
    }

    /// A file selected from a catalog granule's links.
    pub fn from_granule(
        source_uri: impl Into<String>,
        collection_id: impl Into<String>,
        granule_id: impl Into<String>,
        link_role: Option<String>,
    ) -> Self {
        Self {
            source_uri: source_uri.into(),
            collection_id: collection_id.into(),
            link_role,
            granule_id: Some(granule_id.into()),
        }
    }

    pub fn source_uri(&self) -> &str {
        &self.source_uri
    }

    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }

    /// Title of the granule link this file was selected by.
    pub fn link_role(&self) -> Option<&str> {
        self.link_role.as_deref()
    }

    pub fn granule_id(&self) -> Option<&str> {
        self.granule_id.as_deref()
    }
}

/// Chooses which of a granule's links is the file to ingest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSelector {
    /// Exact link title; the first link is used when unset.
    #[serde(default)]
    pub title: Option<String>,
}

impl LinkSelector {
    pub fn by_title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
        }
    }

    pub fn select<'a>(&self, links: &'a [GranuleLink]) -> Option<&'a GranuleLink> {
        match &self.title {
            Some(title) => links
                .iter()
                .find(|link| link.title.as_deref() == Some(title.as_str())),
            None => links.first(),
        }
    }
}

impl std::fmt::Display for LinkSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.title {
            Some(title) => write!(f, "title '{}'", title),
            None => f.write_str("any link"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryRequest {
    pub collection: String,
    pub time_range: TimeRange,
    pub link_selector: LinkSelector,
}

/// Enumerates source files for a collection.
pub trait Discoverer: Send + Sync {
    /// Lazily yield discovered files. Re-invoke with the same request to replay.
    fn discover<'a>(
        &'a self,
        request: &'a DiscoveryRequest,
    ) -> BoxStream<'a, Result<DiscoveredFile, DiscoveryError>>;
}

// ============================================================================
// Catalog-driven discovery
// ============================================================================

pub struct CmrDiscoverer {
    client: Arc<dyn CmrClient>,
    page_size: usize,
    max_granules: Option<usize>,
}

struct PageCursor {
    page_num: usize,
    seen: usize,
    done: bool,
}

impl CmrDiscoverer {
    pub fn new(client: Arc<dyn CmrClient>, page_size: usize) -> Self {
        Self {
            client,
            page_size: page_size.max(1),
            max_granules: None,
        }
    }

    pub fn with_max_granules(mut self, max_granules: usize) -> Self {
        self.max_granules = Some(max_granules);
        self
    }

    fn file_for(
        &self,
        request: &DiscoveryRequest,
        granule: &Granule,
    ) -> Result<DiscoveredFile, DiscoveryError> {
        let link = request
            .link_selector
            .select(&granule.links)
            .ok_or_else(|| DiscoveryError::NoMatchingLink {
                granule_id: granule.id.clone(),
                selector: request.link_selector.to_string(),
            })?;

        Ok(DiscoveredFile::from_granule(
            link.href.clone(),
            request.collection.clone(),
            granule.id.clone(),
            link.title.clone(),
        ))
    }
}

impl Discoverer for CmrDiscoverer {
    fn discover<'a>(
        &'a self,
        request: &'a DiscoveryRequest,
    ) -> BoxStream<'a, Result<DiscoveredFile, DiscoveryError>> {
        let start = PageCursor {
            page_num: 1,
            seen: 0,
            done: false,
        };

        stream::unfold(start, move |mut cursor| async move {
            if cursor.done || self.max_granules.is_some_and(|max| cursor.seen >= max) {
                return None;
            }

            let page = self
                .client
                .search_granules(
                    &request.collection,
                    &request.time_range,
                    self.page_size,
                    cursor.page_num,
                )
                .await;

            match page {
                Err(e) => {
                    warn!(page = cursor.page_num, error = %e, "Granule search failed");
                    cursor.done = true;
                    Some((vec![Err(DiscoveryError::Catalog(e.to_string()))], cursor))
                }
                Ok(granules) if granules.is_empty() => None,
                Ok(granules) => {
                    debug!(page = cursor.page_num, count = granules.len(), "Granule page");
                    cursor.done = granules.len() < self.page_size;
                    cursor.page_num += 1;

                    let mut items = Vec::with_capacity(granules.len());
                    for granule in &granules {
                        if self.max_granules.is_some_and(|max| cursor.seen >= max) {
                            cursor.done = true;
                            break;
                        }
                        cursor.seen += 1;
                        items.push(self.file_for(request, granule));
                    }
                    Some((items, cursor))
                }
            }
        })
        .flat_map(stream::iter)
        .boxed()
    }
}

// ============================================================================
// Bucket listing discovery
// ============================================================================

/// Where and what to list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingSource {
    pub store: ObjectStorageConfig,
    #[serde(default)]
    pub prefix: String,
    /// Keys must match this regex to be discovered.
    #[serde(default)]
    pub filename_regex: Option<String>,
    /// Only keep objects modified within the request's time range.
    #[serde(default)]
    pub restrict_to_time_range: bool,
}

/// Opens an object store for a listing source.
pub trait StoreConnector: Send + Sync {
    fn connect(
        &self,
        config: &ObjectStorageConfig,
        credentials: Option<&StorageCredentials>,
    ) -> GranuleResult<ObjectStorage>;
}

/// Connects to S3 (or an S3-compatible endpoint).
pub struct S3Connector;

impl StoreConnector for S3Connector {
    fn connect(
        &self,
        config: &ObjectStorageConfig,
        credentials: Option<&StorageCredentials>,
    ) -> GranuleResult<ObjectStorage> {
        match credentials {
            Some(credentials) => ObjectStorage::with_credentials(config, credentials),
            None => ObjectStorage::new(config),
        }
    }
}

pub struct StorageDiscoverer {
    source: ListingSource,
    filter: Option<Regex>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    connector: Arc<dyn StoreConnector>,
    store: OnceCell<ObjectStorage>,
}

impl StorageDiscoverer {
    pub fn new(source: ListingSource) -> Result<Self, DiscoveryError> {
        let filter = source
            .filename_regex
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| DiscoveryError::InvalidFilter(e.to_string()))?;

        Ok(Self {
            source,
            filter,
            credentials: None,
            connector: Arc::new(S3Connector),
            store: OnceCell::new(),
        })
    }

    /// Use `provider` for a bucket owned by another account.
    pub fn with_credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn StoreConnector>) -> Self {
        self.connector = connector;
        self
    }

    async fn store(&self) -> Result<&ObjectStorage, DiscoveryError> {
        self.store
            .get_or_try_init(|| async {
                let credentials = match &self.credentials {
                    Some(provider) => Some(provider.credentials().await?),
                    None => None,
                };
                self.connector
                    .connect(&self.source.store, credentials.as_ref())
                    .map_err(|e| DiscoveryError::Storage(e.to_string()))
            })
            .await
    }

    fn accepts(&self, info: &ObjectInfo, request: &DiscoveryRequest) -> bool {
        if info.key.ends_with('/') {
            return false;
        }
        if let Some(filter) = &self.filter {
            if !filter.is_match(&info.key) {
                return false;
            }
        }
        !self.source.restrict_to_time_range || request.time_range.contains(&info.last_modified)
    }
}

impl Discoverer for StorageDiscoverer {
    fn discover<'a>(
        &'a self,
        request: &'a DiscoveryRequest,
    ) -> BoxStream<'a, Result<DiscoveredFile, DiscoveryError>> {
        stream::once(self.store())
            .flat_map(move |opened| match opened {
                Err(e) => stream::once(future::ready(Err(e))).boxed(),
                Ok(store) => store
                    .list_stream(&self.source.prefix)
                    .filter_map(move |item| {
                        future::ready(match item {
                            Err(e) => Some(Err(DiscoveryError::Storage(e.to_string()))),
                            Ok(info) if self.accepts(&info, request) => Some(Ok(
                                DiscoveredFile::new(store.object_uri(&info.key), request.collection.clone()),
                            )),
                            Ok(_) => None,
                        })
                    })
                    .boxed(),
            })
            .boxed()
    }
}

// ============================================================================
// Submission
// ============================================================================

/// Fields copied into every message built from a discovered file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageTemplate {
    #[serde(default)]
    pub filename_pattern: Option<FilenamePattern>,
    #[serde(default)]
    pub start_datetime: Option<String>,
    #[serde(default)]
    pub end_datetime: Option<String>,
    #[serde(default)]
    pub single_datetime: Option<String>,
    #[serde(default)]
    pub datetime_range: Option<DatetimeInterval>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub asset_name: Option<String>,
    #[serde(default)]
    pub asset_roles: Option<Vec<String>>,
    #[serde(default)]
    pub asset_media_type: Option<String>,
}

impl MessageTemplate {
    /// Build the queue message for `file`. Catalog granules carry their
    /// granule id; other files need a filename pattern.
    pub fn message_for(&self, file: &DiscoveredFile) -> Result<IngestMessage, DiscoveryError> {
        let mut message = IngestMessage {
            collection: file.collection_id().to_string(),
            object_key: file.source_uri().to_string(),
            asset_name: self.asset_name.clone(),
            asset_roles: self.asset_roles.clone(),
            asset_media_type: self.asset_media_type.clone(),
            ..Default::default()
        };

        match (file.granule_id(), &self.filename_pattern) {
            (Some(granule_id), _) => {
                message.granule_id = Some(granule_id.to_string());
            }
            (None, Some(pattern)) => {
                message.filename_pattern = Some(pattern.clone());
                message.start_datetime = self.start_datetime.clone();
                message.end_datetime = self.end_datetime.clone();
                message.single_datetime = self.single_datetime.clone();
                message.datetime_range = self.datetime_range;
                message.properties = self.properties.clone();
            }
            (None, None) => {
                return Err(DiscoveryError::MissingTemplate(file.source_uri().to_string()));
            }
        }

        Ok(message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryFailure {
    pub source_uri: Option<String>,
    pub error: String,
}

/// Totals for one discovery run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub discovered: usize,
    pub submitted: usize,
    pub failures: Vec<DiscoveryFailure>,
}

/// Drains a discoverer into the work queue.
pub struct DiscoveryRunner {
    queue: Arc<dyn WorkQueue>,
    template: MessageTemplate,
}

impl DiscoveryRunner {
    pub fn new(queue: Arc<dyn WorkQueue>, template: MessageTemplate) -> Self {
        Self { queue, template }
    }

    async fn submit(&self, file: &DiscoveredFile) -> Result<(), DiscoveryError> {
        let body = self
            .template
            .message_for(file)?
            .to_json()
            .map_err(|e| DiscoveryError::Submit {
                source_uri: file.source_uri().to_string(),
                message: e.to_string(),
            })?;

        let id = self
            .queue
            .send(&body)
            .await
            .map_err(|e| DiscoveryError::Submit {
                source_uri: file.source_uri().to_string(),
                message: e.to_string(),
            })?;
        debug!(message_id = %id, source = file.source_uri(), "Submitted file");
        Ok(())
    }

    /// Discover and submit every file. Per-file failures are collected, never fatal.
    #[instrument(skip(self, discoverer, request), fields(collection = %request.collection))]
    pub async fn run(&self, discoverer: &dyn Discoverer, request: &DiscoveryRequest) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        let mut files = discoverer.discover(request);

        while let Some(item) = files.next().await {
            match item {
                Ok(file) => {
                    report.discovered += 1;
                    match self.submit(&file).await {
                        Ok(()) => {
                            report.submitted += 1;
                            counter!("discovery_files_submitted_total").increment(1);
                        }
                        Err(e) => {
                            warn!(source = file.source_uri(), error = %e, "Failed to submit file");
                            report.failures.push(DiscoveryFailure {
                                source_uri: Some(file.source_uri().to_string()),
                                error: e.to_string(),
                            });
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Discovery error");
                    report.failures.push(DiscoveryFailure {
                        source_uri: None,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            discovered = report.discovered,
            submitted = report.submitted,
            failed = report.failures.len(),
            "Discovery complete"
        );
        report
    }
}
