//! Per-item pipeline (transcode, build, load) and bounded fan-out over a batch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::builder::CatalogItemBuilder;
use crate::config::PipelineConfig;
use crate::error::{ErrorKind, ItemError, Result};
use crate::event::IngestEvent;
use crate::loader::{CatalogLoader, LoadOutcome};
use crate::transcode::Transcoder;

/// Lifecycle of one item from discovery to catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Discovered,
    Queued,
    Dispatched,
    Transcoded,
    Built,
    Loaded,
    Failed(ErrorKind),
    DeadLettered,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Illegal item state transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: ItemState,
    pub to: ItemState,
}

impl ItemState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Loaded | ItemState::DeadLettered)
    }

    /// Move to `next`, rejecting transitions the pipeline never makes.
    pub fn advance(self, next: ItemState) -> std::result::Result<ItemState, IllegalTransition> {
        use ItemState::*;
        let legal = match (self, next) {
            (Discovered, Queued)
            | (Queued, Dispatched)
            | (Dispatched, Transcoded)
            | (Transcoded, Built)
            | (Built, Loaded) => true,
            // Exhausted receives are dead-lettered at receive time.
            (Queued, DeadLettered) => true,
            (Failed(_), Queued) | (Failed(_), DeadLettered) => true,
            (Failed(_), Failed(_)) => false,
            (from, Failed(_)) => !from.is_terminal(),
            _ => false,
        };
        if legal {
            Ok(next)
        } else {
            Err(IllegalTransition { from: self, to: next })
        }
    }
}

/// Result of a successful item pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemReport {
    pub record_id: String,
    pub output_uri: String,
    pub outcome: LoadOutcome,
}

/// Runs one event to completion.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    async fn process(&self, event: &IngestEvent) -> Result<ItemReport>;
}

pub struct ItemPipeline {
    transcoder: Arc<dyn Transcoder>,
    builder: Arc<CatalogItemBuilder>,
    loader: Arc<CatalogLoader>,
}

impl ItemPipeline {
    pub fn new(transcoder: Arc<dyn Transcoder>, builder: Arc<CatalogItemBuilder>, loader: Arc<CatalogLoader>) -> Self {
        Self {
            transcoder,
            builder,
            loader,
        }
    }
}

#[async_trait]
impl ItemProcessor for ItemPipeline {
    #[instrument(skip(self, event), fields(collection = event.collection(), source = event.object_key()))]
    async fn process(&self, event: &IngestEvent) -> Result<ItemReport> {
        let mut state = ItemState::Dispatched;
        match self.run_stages(event, &mut state).await {
            Ok(report) => {
                debug!(id = %report.record_id, outcome = ?report.outcome, ?state, "Item complete");
                Ok(report)
            }
            Err(e) => {
                let failed = state.advance(ItemState::Failed(e.kind()))?;
                debug!(reached = ?state, state = ?failed, error = %e, "Item failed");
                Err(e)
            }
        }
    }
}

impl ItemPipeline {
    /// Run transcode, build and load, advancing `state` after each stage so a
    /// failure reports how far the item got.
    async fn run_stages(&self, event: &IngestEvent, state: &mut ItemState) -> Result<ItemReport> {
        let output_uri = self
            .transcoder
            .transcode(event.collection(), event.object_key())
            .await?;
        *state = state.advance(ItemState::Transcoded)?;

        let record = self.builder.build(event, &output_uri).await?;
        *state = state.advance(ItemState::Built)?;

        let outcome = self.loader.load(&record).await?;
        *state = state.advance(ItemState::Loaded)?;

        Ok(ItemReport {
            record_id: record.id,
            output_uri,
            outcome,
        })
    }
}

/// Runs item pipelines with bounded parallelism and a per-item time budget.
pub struct Coordinator {
    processor: Arc<dyn ItemProcessor>,
    concurrency_limit: usize,
    item_timeout: Duration,
}

impl Coordinator {
    pub fn new(processor: Arc<dyn ItemProcessor>, config: &PipelineConfig) -> Self {
        Self {
            processor,
            concurrency_limit: config.concurrency_limit.max(1),
            item_timeout: config.item_timeout(),
        }
    }

    /// Run every item; results come back in completion order, tagged by key.
    pub async fn run_all<K: Send>(&self, items: Vec<(K, IngestEvent)>) -> Vec<(K, Result<ItemReport>)> {
        stream::iter(items)
            .map(|(key, event)| async move {
                let result = match tokio::time::timeout(self.item_timeout, self.processor.process(&event)).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(source = event.object_key(), timeout = ?self.item_timeout, "Item timed out");
                        Err(ItemError::Timeout(self.item_timeout))
                    }
                };
                (key, result)
            })
            .buffer_unordered(self.concurrency_limit)
            .collect()
            .await
    }
}
