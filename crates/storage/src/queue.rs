//! Durable work queue with at-least-once delivery and a dead-letter side queue.
//!
//! Messages become invisible for `visibility_timeout` once received. A message
//! that is not acknowledged in that window becomes visible again and its
//! receive count increases. When a visible message has already been received
//! `max_receive_count` times it is moved to the dead-letter queue instead of
//! being delivered again. Dead letters are kept for `dlq_retention_days`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use granule_common::GranuleResult;

pub use crate::memory_queue::MemoryQueue;
pub use crate::redis_queue::RedisWorkQueue;

/// Reason recorded when a message is dead-lettered for exhausting its receives.
pub const MAX_RECEIVES_EXCEEDED: &str = "max receive count exceeded";

/// Queue-assigned identifier of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A received message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: MessageId,
    pub body: String,
    /// Number of times this message has been received, including this one.
    pub receive_count: u32,
}

/// A message moved to the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: MessageId,
    pub body: String,
    pub receive_count: u32,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Point-in-time message counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    /// Messages waiting to be received (including ones whose visibility expired)
    pub visible: u64,
    /// Messages received but not yet acknowledged
    pub in_flight: u64,
    pub dead_lettered: u64,
}

/// Queue tuning shared by every backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Most messages returned by one `receive_batch`
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// How long `receive_batch` waits to fill a batch
    #[serde(default = "default_max_batch_window_secs")]
    pub max_batch_window_secs: u64,
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,
    #[serde(default = "default_dlq_retention_days")]
    pub dlq_retention_days: u32,
}

fn default_max_batch_size() -> usize {
    10
}

fn default_max_batch_window_secs() -> u64 {
    20
}

fn default_visibility_timeout_secs() -> u64 {
    900
}

fn default_max_receive_count() -> u32 {
    5
}

fn default_dlq_retention_days() -> u32 {
    14
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_batch_window_secs: default_max_batch_window_secs(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_receive_count: default_max_receive_count(),
            dlq_retention_days: default_dlq_retention_days(),
        }
    }
}

impl QueueConfig {
    pub fn max_batch_window(&self) -> Duration {
        Duration::from_secs(self.max_batch_window_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn dlq_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.dlq_retention_days) * 24 * 60 * 60)
    }
}

/// A durable FIFO-ish queue with visibility timeouts and a dead-letter queue.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue a message body and return its id.
    async fn send(&self, body: &str) -> GranuleResult<MessageId>;

    /// Receive up to `max_batch_size` messages, waiting at most
    /// `max_batch_window` for the batch to fill. May return an empty batch.
    async fn receive_batch(&self) -> GranuleResult<Vec<Delivery>>;

    /// Acknowledge processed messages so they are never delivered again.
    /// Unknown ids are ignored.
    async fn ack(&self, ids: &[MessageId]) -> GranuleResult<()>;

    /// Move an in-flight message straight to the dead-letter queue.
    async fn dead_letter(&self, id: &MessageId, reason: &str) -> GranuleResult<()>;

    /// Dead letters still within the retention window, oldest first.
    async fn dead_letters(&self) -> GranuleResult<Vec<DeadLetter>>;

    async fn depth(&self) -> GranuleResult<QueueDepth>;
}
