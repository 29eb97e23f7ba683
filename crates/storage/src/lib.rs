//! Storage abstractions for the granule ingestion services.
//!
//! Provides unified interfaces for:
//! - Object storage (S3 compatible) for source granules and transcoded outputs
//! - Redis Streams (or memory) for the durable work queue
//! - PostgreSQL (or memory) for the item catalog

pub mod catalog;
pub mod memory_queue;
pub mod object_store;
pub mod queue;
pub mod redis_queue;

pub use self::object_store::{
    parse_object_uri, ObjectInfo, ObjectStorage, ObjectStorageConfig, StorageCredentials,
};
pub use catalog::{CatalogStore, CatalogStoreError, InsertOutcome, MemoryCatalogStore, PgCatalogStore};
pub use memory_queue::MemoryQueue;
pub use queue::{
    DeadLetter, Delivery, MessageId, QueueConfig, QueueDepth, WorkQueue, MAX_RECEIVES_EXCEEDED,
};
pub use redis_queue::RedisWorkQueue;
