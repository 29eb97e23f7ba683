//! Queue consumer: receive a batch, dispatch it, settle each message.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, instrument, warn};

use granule_common::GranuleResult;
use storage::WorkQueue;

use crate::dispatch::{BatchDispatcher, BatchOutcome};
use crate::error::ErrorKind;

/// Pause after a queue error before polling again.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// What happened to one received batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub batch_size: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Non-retryable failures moved to the dead-letter queue.
    pub dead_lettered: usize,
    /// Retryable failures left for redelivery.
    pub retry_pending: usize,
    pub failures_by_kind: BTreeMap<ErrorKind, usize>,
    pub completed_at: DateTime<Utc>,
}

impl BatchSummary {
    fn empty() -> Self {
        Self {
            batch_size: 0,
            succeeded: 0,
            failed: 0,
            dead_lettered: 0,
            retry_pending: 0,
            failures_by_kind: BTreeMap::new(),
            completed_at: Utc::now(),
        }
    }
}

pub struct Worker {
    queue: Arc<dyn WorkQueue>,
    dispatcher: BatchDispatcher,
}

impl Worker {
    pub fn new(queue: Arc<dyn WorkQueue>, dispatcher: BatchDispatcher) -> Self {
        Self { queue, dispatcher }
    }

    /// Process one batch. Successes are acknowledged, non-retryable failures
    /// are dead-lettered, and retryable failures are left to reappear after
    /// the visibility timeout.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> GranuleResult<BatchSummary> {
        let deliveries = self.queue.receive_batch().await?;
        if deliveries.is_empty() {
            return Ok(BatchSummary::empty());
        }

        let outcome = self.dispatcher.process_batch(&deliveries).await;
        let summary = self.settle(deliveries.len(), &outcome).await?;

        info!(
            batch_size = summary.batch_size,
            succeeded = summary.succeeded,
            failed = summary.failed,
            dead_lettered = summary.dead_lettered,
            "Batch settled"
        );
        Ok(summary)
    }

    /// Dead-letter terminal failures, then acknowledge successes. A failed ack
    /// is returned only after every terminal failure has been moved.
    async fn settle(&self, batch_size: usize, outcome: &BatchOutcome) -> GranuleResult<BatchSummary> {
        let mut summary = BatchSummary {
            batch_size,
            failed: outcome.failed_count(),
            ..BatchSummary::empty()
        };

        for (id, kind) in &outcome.failed {
            counter!("ingest_items_failed_total", "kind" => kind.as_str()).increment(1);
            *summary.failures_by_kind.entry(*kind).or_default() += 1;

            if kind.is_retryable() {
                summary.retry_pending += 1;
                continue;
            }

            let reason = outcome
                .reasons
                .get(id)
                .map(|r| format!("{}: {}", kind, r))
                .unwrap_or_else(|| kind.to_string());
            // A failed dead-letter leaves the message in flight; it returns
            // after the visibility timeout and is retried.
            match self.queue.dead_letter(id, &reason).await {
                Ok(()) => {
                    summary.dead_lettered += 1;
                    counter!("ingest_items_dead_lettered_total").increment(1);
                }
                Err(e) => warn!(message_id = %id, error = %e, "Failed to dead-letter message"),
            }
        }

        let acked: Vec<_> = outcome.succeeded.iter().cloned().collect();
        self.queue.ack(&acked).await?;
        counter!("ingest_items_succeeded_total").increment(acked.len() as u64);
        summary.succeeded = acked.len();

        Ok(summary)
    }

    /// Process batches until `shutdown` fires. `on_batch` sees every non-empty batch.
    pub async fn run<F>(&self, mut shutdown: broadcast::Receiver<()>, on_batch: F)
    where
        F: Fn(&BatchSummary) + Send + Sync,
    {
        info!("Worker started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutting down worker");
                    break;
                }
                result = self.run_once() => match result {
                    Ok(summary) if summary.batch_size > 0 => on_batch(&summary),
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "Batch failed");
                        tokio::time::sleep(ERROR_BACKOFF).await;
                    }
                }
            }
        }
    }
}
