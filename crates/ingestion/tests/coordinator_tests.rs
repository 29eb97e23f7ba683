//! Bounded parallelism and per-item timeouts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use ingestion::event::PatternEvent;
use ingestion::{
    Coordinator, ErrorKind, FilenamePattern, IngestEvent, ItemError, ItemProcessor, ItemReport,
    LoadOutcome, PipelineConfig,
};

/// Sleeps for a per-key duration and tracks how many calls overlap.
struct SlowProcessor {
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    completed: AtomicUsize,
}

impl SlowProcessor {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ItemProcessor for SlowProcessor {
    async fn process(&self, event: &IngestEvent) -> ingestion::Result<ItemReport> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(ItemReport {
            record_id: event.object_key().to_string(),
            output_uri: event.object_key().to_string(),
            outcome: LoadOutcome::Inserted,
        })
    }
}

fn event(i: usize) -> IngestEvent {
    IngestEvent::Pattern(PatternEvent {
        collection: "OMSO2PCA".into(),
        object_key: format!("s3://b/OMSO2PCA_LUT_SCD_{}.tif", 2000 + i),
        pattern: FilenamePattern::new(r"_(\d{4})\.tif$", 1),
        start_datetime: None,
        end_datetime: None,
        single_datetime: None,
        datetime_range: None,
        properties: Default::default(),
        assets: Default::default(),
    })
}

#[tokio::test(start_paused = true)]
async fn test_never_more_than_limit_in_flight() {
    let processor = Arc::new(SlowProcessor::new(Duration::from_secs(1)));
    let coordinator = Coordinator::new(
        processor.clone(),
        &PipelineConfig {
            concurrency_limit: 3,
            item_timeout_secs: 60,
        },
    );

    let items: Vec<_> = (0..20).map(|i| (i, event(i))).collect();
    let results = coordinator.run_all(items).await;

    assert_eq!(results.len(), 20);
    assert!(results.iter().all(|(_, r)| r.is_ok()));
    assert_eq!(processor.completed.load(Ordering::SeqCst), 20);
    assert_eq!(processor.peak.load(Ordering::SeqCst), 3);

    let mut keys: Vec<_> = results.iter().map(|(k, _)| *k).collect();
    keys.sort_unstable();
    assert_eq!(keys, (0..20).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn test_item_timeout_is_retryable() {
    let processor = Arc::new(SlowProcessor::new(Duration::from_secs(10)));
    let coordinator = Coordinator::new(
        processor.clone(),
        &PipelineConfig {
            concurrency_limit: 2,
            item_timeout_secs: 2,
        },
    );

    let results = coordinator.run_all(vec![("a", event(1)), ("b", event(2))]).await;
    for (_, result) in &results {
        let err = result.as_ref().unwrap_err();
        assert!(matches!(err, ItemError::Timeout(d) if *d == Duration::from_secs(2)));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.kind().is_retryable());
    }
    assert_eq!(processor.completed.load(Ordering::SeqCst), 0);
}
