//! Batch dispatch: parse, validate and run every delivery of a batch.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use storage::{Delivery, MessageId};

use crate::coordinator::Coordinator;
use crate::error::{BuildError, ErrorKind};
use crate::event::{IngestEvent, IngestMessage};

/// Per-message results of one batch. Never an error as a whole.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub succeeded: BTreeSet<MessageId>,
    pub failed: BTreeMap<MessageId, ErrorKind>,
    /// Error text for each failed message.
    pub reasons: BTreeMap<MessageId, String>,
}

impl BatchOutcome {
    pub fn succeeded_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn retryable_count(&self) -> usize {
        self.failed.values().filter(|k| k.is_retryable()).count()
    }

    pub fn terminal_count(&self) -> usize {
        self.failed_count() - self.retryable_count()
    }

    fn fail(&mut self, id: MessageId, kind: ErrorKind, reason: String) {
        self.reasons.insert(id.clone(), reason);
        self.failed.insert(id, kind);
    }
}

fn parse_delivery(delivery: &Delivery) -> Result<IngestEvent, BuildError> {
    IngestEvent::try_from(IngestMessage::from_json(&delivery.body)?)
}

pub struct BatchDispatcher {
    coordinator: Arc<Coordinator>,
}

impl BatchDispatcher {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    /// Run every delivery independently and record each result by message id.
    #[instrument(skip(self, deliveries), fields(batch_size = deliveries.len()))]
    pub async fn process_batch(&self, deliveries: &[Delivery]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut runnable = Vec::with_capacity(deliveries.len());

        for delivery in deliveries {
            match parse_delivery(delivery) {
                Ok(event) => runnable.push((delivery.id.clone(), event)),
                Err(e) => {
                    warn!(message_id = %delivery.id, error = %e, "Rejected message");
                    outcome.fail(delivery.id.clone(), e.kind(), e.to_string());
                }
            }
        }

        for (id, result) in self.coordinator.run_all(runnable).await {
            match result {
                Ok(_) => {
                    outcome.succeeded.insert(id);
                }
                Err(e) => {
                    warn!(message_id = %id, kind = %e.kind(), error = %e, "Item failed");
                    outcome.fail(id, e.kind(), e.to_string());
                }
            }
        }

        info!(
            succeeded = outcome.succeeded_count(),
            failed = outcome.failed_count(),
            retryable = outcome.retryable_count(),
            "Batch processed"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts() {
        let mut outcome = BatchOutcome::default();
        outcome.succeeded.insert(MessageId::new("1"));
        outcome.fail(MessageId::new("2"), ErrorKind::TranscodeError, "boom".into());
        outcome.fail(MessageId::new("3"), ErrorKind::AmbiguousEventShape, "both".into());

        assert_eq!(outcome.succeeded_count(), 1);
        assert_eq!(outcome.failed_count(), 2);
        assert_eq!(outcome.retryable_count(), 1);
        assert_eq!(outcome.terminal_count(), 1);
        assert_eq!(outcome.reasons[&MessageId::new("3")], "both");
    }

    #[test]
    fn test_parse_delivery_kinds() {
        let delivery = |body: &str| Delivery {
            id: MessageId::new("1"),
            body: body.to_string(),
            receive_count: 1,
        };
        let kind = |body: &str| parse_delivery(&delivery(body)).unwrap_err().kind();

        assert_eq!(kind("not json"), ErrorKind::MalformedMessage);
        assert_eq!(
            kind(r#"{"collection": "C", "object_key": "s3://b/a.tif"}"#),
            ErrorKind::AmbiguousEventShape
        );
        assert_eq!(
            kind(r#"{"collection": "C", "object_key": "s3://b/a.tif", "granule_id": "G1",
                     "filename_pattern": {"regex": "(a)", "target_group": 1}}"#),
            ErrorKind::AmbiguousEventShape
        );
    }
}
