//! In-process fakes and a wired-up worker for integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;

use granule_common::{GranuleError, GranuleResult, TimeRange};
use ingestion::cmr::{CmrClient, CmrError, Granule};
use ingestion::discovery::StoreConnector;
use ingestion::transcode::{output_uri_for, SourceFile};
use ingestion::{
    BatchDispatcher, BuilderConfig, CatalogItemBuilder, CatalogLoader, Coordinator, GeoTiffInspector,
    ItemPipeline, LoaderConfig, PipelineConfig, TranscodeError, Transcoder, Worker,
};
use storage::{
    CatalogStore, DeadLetter, Delivery, MemoryCatalogStore, MemoryQueue, MessageId, ObjectStorage,
    ObjectStorageConfig, QueueConfig, QueueDepth, StorageCredentials, WorkQueue,
};
use test_utils::fixtures::{CMR_COLLECTION, PATTERN_COLLECTION};
use test_utils::{create_test_grid, GeoTiffBuilder};

pub const SOURCE_BUCKET: &str = "granule-sources";
pub const OUTPUT_BUCKET: &str = "granule-outputs";

/// 36x18 global grid at 10 degrees per pixel in EPSG:4326.
pub fn global_tiff() -> Vec<u8> {
    GeoTiffBuilder::new(36, 18, create_test_grid(36, 18))
        .origin(-180.0, 90.0)
        .pixel_size(10.0, 10.0)
        .nodata("-9999")
        .build()
}

pub fn granule(id: &str, href: &str, time_start: &str) -> Granule {
    serde_json::from_value(test_utils::fixtures::cmr_granule(id, href, time_start)).unwrap()
}

// ============================================================================
// Catalog API
// ============================================================================

#[derive(Default)]
pub struct FakeCmr {
    granules: Vec<Granule>,
    pub search_calls: AtomicUsize,
    pub lookup_calls: AtomicUsize,
    /// Page number that returns a server error.
    pub failing_page: Option<usize>,
}

impl FakeCmr {
    pub fn new(granules: Vec<Granule>) -> Self {
        Self {
            granules,
            ..Default::default()
        }
    }

    pub fn failing_on_page(mut self, page: usize) -> Self {
        self.failing_page = Some(page);
        self
    }
}

#[async_trait]
impl CmrClient for FakeCmr {
    async fn search_granules(
        &self,
        _short_name: &str,
        _time_range: &TimeRange,
        page_size: usize,
        page_num: usize,
    ) -> Result<Vec<Granule>, CmrError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_page == Some(page_num) {
            return Err(CmrError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }
        Ok(self
            .granules
            .iter()
            .skip((page_num - 1) * page_size)
            .take(page_size)
            .cloned()
            .collect())
    }

    async fn granule(&self, concept_id: &str) -> Result<Option<Granule>, CmrError> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.granules.iter().find(|g| g.id == concept_id).cloned())
    }
}

// ============================================================================
// Transcoding service
// ============================================================================

/// Writes a fixed GeoTIFF to the deterministic output key for every source,
/// failing for file names registered with `fail_on`.
pub struct ScriptedTranscoder {
    output: ObjectStorage,
    tiff: Bytes,
    failing: Mutex<HashSet<String>>,
    pub calls: AtomicUsize,
}

impl ScriptedTranscoder {
    pub fn new(output: ObjectStorage, tiff: Vec<u8>) -> Self {
        Self {
            output,
            tiff: Bytes::from(tiff),
            failing: Mutex::new(HashSet::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_on(&self, file_name: &str) {
        self.failing.lock().unwrap().insert(file_name.to_string());
    }

    pub fn recover(&self, file_name: &str) {
        self.failing.lock().unwrap().remove(file_name);
    }
}

#[async_trait]
impl Transcoder for ScriptedTranscoder {
    async fn transcode(&self, collection: &str, source_uri: &str) -> Result<String, TranscodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let source = SourceFile::parse(source_uri)?;
        if self.failing.lock().unwrap().contains(source.file_name) {
            return Err(TranscodeError::Service {
                status: 500,
                message: format!("cannot convert {}", source.file_name),
            });
        }

        let output_uri = output_uri_for(&format!("s3://{}/cogs", OUTPUT_BUCKET), collection, &source);
        let key = self
            .output
            .key_for_uri(&output_uri)
            .map_err(|e| TranscodeError::Request(e.to_string()))?;
        self.output
            .put(&key, self.tiff.clone())
            .await
            .map_err(|e| TranscodeError::Request(e.to_string()))?;
        Ok(output_uri)
    }
}

// ============================================================================
// Storage access
// ============================================================================

/// Hands out a prepared in-memory store and records the credentials used.
pub struct FixedConnector {
    store: ObjectStorage,
    pub seen_credentials: Mutex<Vec<Option<StorageCredentials>>>,
}

impl FixedConnector {
    pub fn new(store: ObjectStorage) -> Self {
        Self {
            store,
            seen_credentials: Mutex::new(Vec::new()),
        }
    }
}

impl StoreConnector for FixedConnector {
    fn connect(
        &self,
        _config: &ObjectStorageConfig,
        credentials: Option<&StorageCredentials>,
    ) -> GranuleResult<ObjectStorage> {
        self.seen_credentials.lock().unwrap().push(credentials.cloned());
        Ok(self.store.clone())
    }
}

// ============================================================================
// Queue
// ============================================================================

/// A memory queue whose acknowledgements always fail.
pub struct AckFailingQueue {
    pub inner: Arc<MemoryQueue>,
}

#[async_trait]
impl WorkQueue for AckFailingQueue {
    async fn send(&self, body: &str) -> GranuleResult<MessageId> {
        self.inner.send(body).await
    }

    async fn receive_batch(&self) -> GranuleResult<Vec<Delivery>> {
        self.inner.receive_batch().await
    }

    async fn ack(&self, _ids: &[MessageId]) -> GranuleResult<()> {
        Err(GranuleError::QueueError("connection reset".into()))
    }

    async fn dead_letter(&self, id: &MessageId, reason: &str) -> GranuleResult<()> {
        self.inner.dead_letter(id, reason).await
    }

    async fn dead_letters(&self) -> GranuleResult<Vec<DeadLetter>> {
        self.inner.dead_letters().await
    }

    async fn depth(&self) -> GranuleResult<QueueDepth> {
        self.inner.depth().await
    }
}

// ============================================================================
// Wiring
// ============================================================================

pub struct Harness {
    pub source: ObjectStorage,
    pub output: ObjectStorage,
    pub cmr: Arc<FakeCmr>,
    pub transcoder: Arc<ScriptedTranscoder>,
    pub catalog: Arc<MemoryCatalogStore>,
    pub queue: Arc<MemoryQueue>,
    pub staging: TempDir,
}

impl Harness {
    pub async fn new(queue_config: QueueConfig, granules: Vec<Granule>) -> Self {
        let output = ObjectStorage::in_memory(OUTPUT_BUCKET);
        let catalog = Arc::new(MemoryCatalogStore::new());
        catalog.ensure_collection(PATTERN_COLLECTION).await.unwrap();
        catalog.ensure_collection(CMR_COLLECTION).await.unwrap();

        Self {
            source: ObjectStorage::in_memory(SOURCE_BUCKET),
            transcoder: Arc::new(ScriptedTranscoder::new(output.clone(), global_tiff())),
            output,
            cmr: Arc::new(FakeCmr::new(granules)),
            catalog,
            queue: Arc::new(MemoryQueue::new(queue_config)),
            staging: tempfile::tempdir().unwrap(),
        }
    }

    /// Store a source object and return its URI.
    pub async fn put_source(&self, key: &str) -> String {
        self.source.put(key, Bytes::from_static(b"raw granule")).await.unwrap();
        self.source.object_uri(key)
    }

    pub fn dispatcher(&self, pipeline: &PipelineConfig) -> BatchDispatcher {
        let builder_config = BuilderConfig::default();
        let inspector = GeoTiffInspector::new(self.output.clone(), &builder_config);
        let builder = CatalogItemBuilder::new(self.cmr.clone(), Arc::new(inspector), builder_config);
        let loader = CatalogLoader::new(
            self.catalog.clone(),
            &LoaderConfig {
                staging_dir: Some(self.staging.path().to_path_buf()),
            },
        );
        let item_pipeline = ItemPipeline::new(self.transcoder.clone(), Arc::new(builder), Arc::new(loader));
        BatchDispatcher::new(Arc::new(Coordinator::new(Arc::new(item_pipeline), pipeline)))
    }

    pub fn worker(&self) -> Worker {
        Worker::new(self.queue.clone(), self.dispatcher(&PipelineConfig::default()))
    }

    pub async fn stored(&self, collection: &str, id: &str) -> Option<serde_json::Value> {
        self.catalog.get_item(collection, id).await.unwrap()
    }
}

/// Queue settings that return immediately and redeliver after one second.
pub fn fast_queue(max_receive_count: u32) -> QueueConfig {
    QueueConfig {
        max_batch_size: 10,
        max_batch_window_secs: 0,
        visibility_timeout_secs: 1,
        max_receive_count,
        dlq_retention_days: 14,
    }
}

pub async fn wait_for_visibility() {
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
}
