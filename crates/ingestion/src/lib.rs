//! Granule ingestion library.
//!
//! Turns discovered source files into catalog records, one queue message at a time.
//!
//! # Architecture
//!
//! - Discovery (CMR search or bucket listing) submits one [`IngestMessage`] per file
//! - A [`Worker`] receives batches from the work queue and hands them to the
//!   [`BatchDispatcher`]
//! - Each message becomes an [`IngestEvent`] and runs through the item pipeline:
//!   transcode to a COG, build the STAC record, load it into the catalog
//! - Successes are acknowledged; non-retryable failures are dead-lettered

pub mod builder;
pub mod cmr;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod geotiff;
pub mod loader;
pub mod raster;
pub mod record;
pub mod transcode;
pub mod worker;

// Re-exports
pub use builder::CatalogItemBuilder;
pub use cmr::{CmrClient, CmrError, Granule, GranuleLink, HttpCmrClient};
pub use config::{BuilderConfig, CmrConfig, LoaderConfig, PipelineConfig, TranscoderConfig};
pub use coordinator::{Coordinator, ItemPipeline, ItemProcessor, ItemReport, ItemState};
pub use credentials::{CredentialProvider, StaticCredentialProvider, StsAssumeRoleProvider};
pub use discovery::{
    CmrDiscoverer, DiscoveredFile, Discoverer, DiscoveryReport, DiscoveryRequest, DiscoveryRunner,
    LinkSelector, ListingSource, MessageTemplate, StorageDiscoverer,
};
pub use dispatch::{BatchDispatcher, BatchOutcome};
pub use error::{BuildError, DiscoveryError, ErrorKind, ItemError, LoadError, Result, TranscodeError};
pub use event::{FilenamePattern, IngestEvent, IngestMessage};
pub use loader::{CatalogLoader, LoadOutcome};
pub use raster::{GeoTiffInspector, RasterInfo, RasterInspector};
pub use record::CatalogRecord;
pub use transcode::{HttpTranscoder, PassthroughTranscoder, Transcoder};
pub use worker::{BatchSummary, Worker};
