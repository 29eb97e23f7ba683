//! Builds queue, catalog, discoverer and worker from the loaded configuration.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use ingestion::{
    BatchDispatcher, CatalogItemBuilder, CatalogLoader, CmrDiscoverer, Coordinator, Discoverer,
    GeoTiffInspector, HttpCmrClient, HttpTranscoder, ItemPipeline, PassthroughTranscoder,
    StorageDiscoverer, StsAssumeRoleProvider, Transcoder, Worker,
};
use storage::{CatalogStore, ObjectStorage, PgCatalogStore, RedisWorkQueue};

use crate::config::{IngesterConfig, SourceSection};

pub async fn connect_queue(config: &IngesterConfig) -> Result<Arc<RedisWorkQueue>> {
    let queue = RedisWorkQueue::connect(
        &config.queue.redis_url,
        &config.queue.stream,
        config.queue.settings.clone(),
    )
    .await
    .context("Failed to connect to work queue")?;
    Ok(Arc::new(queue))
}

pub async fn connect_catalog(config: &IngesterConfig) -> Result<Arc<PgCatalogStore>> {
    let store = PgCatalogStore::connect(&config.catalog.database_url, config.catalog.max_connections)
        .await
        .context("Failed to connect to catalog database")?;
    Ok(Arc::new(store))
}

/// Create the catalog schema and register `collections`.
pub async fn migrate(config: &IngesterConfig, collections: &[String]) -> Result<()> {
    let catalog = connect_catalog(config).await?;
    catalog.migrate().await.context("Catalog migration failed")?;

    let configured = config.discovery.as_ref().map(|d| d.collection.clone());
    for collection in collections.iter().cloned().chain(configured) {
        catalog
            .ensure_collection(&collection)
            .await
            .with_context(|| format!("Failed to register collection {}", collection))?;
        info!(collection = %collection, "Collection ready");
    }
    Ok(())
}

fn transcoder(config: &IngesterConfig) -> Result<Arc<dyn Transcoder>> {
    match &config.transcoder.endpoint {
        Some(endpoint) => {
            info!(endpoint = %endpoint, "Using HTTP transcoding service");
            Ok(Arc::new(HttpTranscoder::new(endpoint.clone(), &config.transcoder)?))
        }
        None => {
            info!("No transcoding service configured; sources must already be GeoTIFFs");
            Ok(Arc::new(PassthroughTranscoder))
        }
    }
}

fn inspector(config: &IngesterConfig) -> Result<GeoTiffInspector> {
    let output = ObjectStorage::new(&config.output_storage)?;
    let mut inspector = GeoTiffInspector::new(output, &config.builder);

    // Passthrough outputs live in the listed bucket. Cross-account buckets
    // are only readable during discovery.
    if let Some(SourceSection::Listing {
        listing,
        role_arn: None,
        ..
    }) = config.discovery.as_ref().map(|d| &d.source)
    {
        if listing.store.bucket != config.output_storage.bucket {
            inspector = inspector.with_store(ObjectStorage::new(&listing.store)?);
        }
    }
    Ok(inspector)
}

/// Wire the full item pipeline behind a worker.
pub async fn build_worker(config: &IngesterConfig) -> Result<(Worker, Arc<RedisWorkQueue>)> {
    let queue = connect_queue(config).await?;
    let catalog = connect_catalog(config).await?;
    let cmr = Arc::new(HttpCmrClient::new(config.cmr.base_url.clone(), config.cmr.timeout())?);

    let builder = CatalogItemBuilder::new(cmr, Arc::new(inspector(config)?), config.builder.clone());
    let loader = CatalogLoader::new(catalog, &config.loader);
    let pipeline = ItemPipeline::new(transcoder(config)?, Arc::new(builder), Arc::new(loader));
    let coordinator = Coordinator::new(Arc::new(pipeline), &config.pipeline);

    let worker = Worker::new(queue.clone(), BatchDispatcher::new(Arc::new(coordinator)));
    Ok((worker, queue))
}

pub fn build_discoverer(config: &IngesterConfig) -> Result<Box<dyn Discoverer>> {
    let discovery = config
        .discovery
        .as_ref()
        .context("No discovery section in configuration")?;

    match &discovery.source {
        SourceSection::Cmr => {
            let client = HttpCmrClient::new(config.cmr.base_url.clone(), config.cmr.timeout())?;
            let mut discoverer = CmrDiscoverer::new(Arc::new(client), config.cmr.page_size);
            if let Some(max) = config.cmr.max_granules {
                discoverer = discoverer.with_max_granules(max);
            }
            Ok(Box::new(discoverer))
        }
        SourceSection::Listing {
            listing,
            role_arn,
            external_id,
        } => {
            let mut discoverer = StorageDiscoverer::new(listing.clone())?;
            if let Some(role_arn) = role_arn {
                let mut provider = StsAssumeRoleProvider::new(role_arn.clone(), listing.store.region.clone());
                if let Some(external_id) = external_id {
                    provider = provider.with_external_id(external_id.clone());
                }
                discoverer = discoverer.with_credentials(Arc::new(provider));
            }
            Ok(Box::new(discoverer))
        }
    }
}
