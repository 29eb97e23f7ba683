//! End-to-end worker behaviour over the in-memory queue and catalog.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{TimeZone, Utc};

use granule_common::TimeRange;
use ingestion::{
    DiscoveryRequest, DiscoveryRunner, ErrorKind, FilenamePattern, IngestMessage, LinkSelector,
    ListingSource, MessageTemplate, PipelineConfig, StaticCredentialProvider, StorageDiscoverer, Worker,
};
use storage::{
    CatalogStore, Delivery, MessageId, ObjectStorageConfig, StorageCredentials, WorkQueue,
    MAX_RECEIVES_EXCEEDED,
};
use test_utils::fixtures::{
    ambiguous_message, granule_message, pattern_message, CMR_COLLECTION, PATTERN_COLLECTION, YEAR_REGEX,
};

use common::{
    fast_queue, granule, wait_for_visibility, AckFailingQueue, FixedConnector, Harness, SOURCE_BUCKET,
};

fn year_template() -> MessageTemplate {
    MessageTemplate {
        filename_pattern: Some(FilenamePattern::new(YEAR_REGEX, 3)),
        datetime_range: Some(granule_common::DatetimeInterval::Year),
        ..Default::default()
    }
}

fn request(collection: &str) -> DiscoveryRequest {
    DiscoveryRequest {
        collection: collection.to_string(),
        time_range: TimeRange::new(
            Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap(),
        )
        .unwrap(),
        link_selector: LinkSelector::default(),
    }
}

// ============================================================================
// Discovery to catalog
// ============================================================================

#[tokio::test]
async fn test_three_files_with_one_transcode_failure_then_redelivery() {
    let harness = Harness::new(fast_queue(5), Vec::new()).await;
    for year in [2005, 2006, 2007] {
        harness.put_source(&format!("lut/OMSO2PCA_LUT_SCD_{}.tif", year)).await;
    }
    harness.put_source("lut/README.txt").await;

    let connector = Arc::new(FixedConnector::new(harness.source.clone()));
    let credentials = StorageCredentials {
        access_key_id: "AKIATEST".into(),
        secret_access_key: "secret".into(),
        session_token: Some("token".into()),
    };
    let discoverer = StorageDiscoverer::new(ListingSource {
        store: ObjectStorageConfig {
            bucket: SOURCE_BUCKET.into(),
            ..Default::default()
        },
        prefix: "lut".into(),
        filename_regex: Some(r"\.tif$".into()),
        restrict_to_time_range: false,
    })
    .unwrap()
    .with_credentials(Arc::new(StaticCredentialProvider::new(credentials)))
    .with_connector(connector.clone());

    let runner = DiscoveryRunner::new(harness.queue.clone(), year_template());
    let report = runner.run(&discoverer, &request(PATTERN_COLLECTION)).await;
    assert_eq!(report.discovered, 3);
    assert_eq!(report.submitted, 3);
    assert!(report.failures.is_empty());

    // Credentials were obtained before the store was opened.
    let seen = connector.seen_credentials.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].as_ref().unwrap().access_key_id, "AKIATEST");

    harness.transcoder.fail_on("OMSO2PCA_LUT_SCD_2006.tif");
    let worker = harness.worker();

    let first = worker.run_once().await.unwrap();
    assert_eq!(first.batch_size, 3);
    assert_eq!(first.succeeded, 2);
    assert_eq!(first.failed, 1);
    assert_eq!(first.retry_pending, 1);
    assert_eq!(first.dead_lettered, 0);
    assert_eq!(first.failures_by_kind.get(&ErrorKind::TranscodeError), Some(&1));
    assert_eq!(harness.catalog.count_items(PATTERN_COLLECTION).await.unwrap(), 2);

    let depth = harness.queue.depth().await.unwrap();
    assert_eq!(depth.in_flight, 1);
    assert_eq!(depth.visible, 0);

    harness.transcoder.recover("OMSO2PCA_LUT_SCD_2006.tif");
    wait_for_visibility().await;

    let redelivered = harness.queue.receive_batch().await.unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].receive_count, 2);
    let outcome = harness.dispatcher(&PipelineConfig::default()).process_batch(&redelivered).await;
    assert_eq!(outcome.succeeded_count(), 1);
    harness.queue.ack(&[redelivered[0].id.clone()]).await.unwrap();

    assert_eq!(harness.catalog.count_items(PATTERN_COLLECTION).await.unwrap(), 3);
    let item = harness
        .stored(PATTERN_COLLECTION, "OMSO2PCA_LUT_SCD_2006")
        .await
        .expect("redelivered item loaded");
    assert_eq!(item["properties"]["start_datetime"], "2006-01-01T00:00:00Z");
    assert_eq!(item["properties"]["end_datetime"], "2006-12-31T23:59:59Z");
    assert!(item["properties"]["datetime"].is_null());
}

#[tokio::test]
async fn test_catalog_linked_record_carries_granule_metadata() {
    let href = "https://data.example/OMI-Aura_L3-OMDOAO3e_2004m1001_v003.he5";
    let harness = Harness::new(
        fast_queue(5),
        vec![granule("G1-GES_DISC", href, "2004-10-01T00:00:00.000Z")],
    )
    .await;

    harness.queue.send(&granule_message(href, "G1-GES_DISC")).await.unwrap();
    let summary = harness.worker().run_once().await.unwrap();
    assert_eq!(summary.succeeded, 1, "{:?}", summary);

    let item = harness
        .stored(CMR_COLLECTION, "OMI-Aura_L3-OMDOAO3e_2004m1001_v003")
        .await
        .unwrap();
    assert_eq!(item["stac_version"], "1.0.0");
    assert_eq!(item["properties"]["datetime"], "2004-10-01T00:00:00Z");
    assert_eq!(
        item["properties"]["dataset_id"],
        "OMI/Aura Ozone (O3) DOAS Total Column L3 1-day 0.25deg x 0.25deg V3"
    );
    assert_eq!(item["properties"]["proj:epsg"], 4326);
    assert_eq!(item["bbox"], serde_json::json!([-180.0, -90.0, 180.0, 90.0]));

    let assets = item["assets"].as_object().unwrap();
    let source = &assets["Download OMI-Aura_L3-OMDOAO3e_2004m1001_v003.he5"];
    assert_eq!(source["type"], "application/x-hdf5");
    assert_eq!(source["roles"][0], "data");
    let cog = &assets["cog"];
    assert_eq!(cog["type"], "image/tiff; application=geotiff");
    assert_eq!(cog["raster:bands"][0]["data_type"], "float32");
    assert_eq!(cog["raster:bands"][0]["nodata"], -9999.0);
    // The metadata link is not a source format.
    assert_eq!(assets.len(), 2);
}

// ============================================================================
// Failure isolation
// ============================================================================

#[tokio::test]
async fn test_batch_isolation_and_terminal_failures() {
    let harness = Harness::new(fast_queue(5), Vec::new()).await;
    let good_a = harness.put_source("OMSO2PCA_LUT_SCD_2005.tif").await;
    let good_b = harness.put_source("OMSO2PCA_LUT_SCD_2008.tif").await;
    let no_year = harness.put_source("OMSO2PCA_LUT_SCD.tif").await;

    harness.queue.send(&pattern_message(&good_a)).await.unwrap();
    let bad_id = harness.queue.send(&pattern_message(&no_year)).await.unwrap();
    harness.queue.send(&pattern_message(&good_b)).await.unwrap();

    let summary = harness.worker().run_once().await.unwrap();
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.dead_lettered, 1);
    assert_eq!(summary.failures_by_kind.get(&ErrorKind::DatetimeParseError), Some(&1));

    let dead = harness.queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, bad_id);
    assert!(dead[0].reason.starts_with("datetime_parse_error"));

    // Nothing is left to redeliver.
    wait_for_visibility().await;
    assert!(harness.queue.receive_batch().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_inverted_override_range_is_dead_lettered_on_first_receive() {
    let harness = Harness::new(fast_queue(5), Vec::new()).await;
    let uri = harness.put_source("OMSO2PCA_LUT_SCD_2005.tif").await;
    let message = IngestMessage {
        collection: PATTERN_COLLECTION.into(),
        object_key: uri,
        filename_pattern: Some(FilenamePattern::new(YEAR_REGEX, 3)),
        start_datetime: Some("2006-01-01T00:00:00Z".into()),
        end_datetime: Some("2005-01-01T00:00:00Z".into()),
        ..Default::default()
    };
    let id = harness.queue.send(&message.to_json().unwrap()).await.unwrap();

    let summary = harness.worker().run_once().await.unwrap();
    assert_eq!(summary.dead_lettered, 1);
    assert_eq!(summary.retry_pending, 0);
    assert_eq!(summary.failures_by_kind.get(&ErrorKind::DatetimeParseError), Some(&1));

    let dead = harness.queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, id);
    assert_eq!(dead[0].receive_count, 1);
    assert_eq!(harness.catalog.count_items(PATTERN_COLLECTION).await.unwrap(), 0);
}

#[tokio::test]
async fn test_failed_ack_still_dead_letters_terminal_failures() {
    let harness = Harness::new(fast_queue(5), Vec::new()).await;
    let good = harness.put_source("OMSO2PCA_LUT_SCD_2005.tif").await;
    let no_year = harness.put_source("OMSO2PCA_LUT_SCD.tif").await;
    harness.queue.send(&pattern_message(&good)).await.unwrap();
    let bad_id = harness.queue.send(&pattern_message(&no_year)).await.unwrap();

    let queue = Arc::new(AckFailingQueue {
        inner: harness.queue.clone(),
    });
    let worker = Worker::new(queue, harness.dispatcher(&PipelineConfig::default()));
    assert!(worker.run_once().await.is_err());

    let dead = harness.queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, bad_id);

    // Only the unacknowledged success comes back.
    wait_for_visibility().await;
    let redelivered = harness.queue.receive_batch().await.unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].receive_count, 2);
}

#[tokio::test]
async fn test_ambiguous_message_makes_no_external_calls() {
    let harness = Harness::new(fast_queue(5), Vec::new()).await;
    harness
        .queue
        .send(&ambiguous_message("s3://granule-sources/OMSO2PCA_LUT_SCD_2005.tif"))
        .await
        .unwrap();
    harness.queue.send("{not json").await.unwrap();

    let summary = harness.worker().run_once().await.unwrap();
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.dead_lettered, 2);
    assert_eq!(summary.failures_by_kind.get(&ErrorKind::AmbiguousEventShape), Some(&1));
    assert_eq!(summary.failures_by_kind.get(&ErrorKind::MalformedMessage), Some(&1));

    assert_eq!(harness.transcoder.calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.cmr.lookup_calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.catalog.count_items(PATTERN_COLLECTION).await.unwrap(), 0);
}

#[tokio::test]
async fn test_unknown_granule_is_retried() {
    let harness = Harness::new(fast_queue(5), Vec::new()).await;
    harness
        .queue
        .send(&granule_message("https://data.example/missing.he5", "G404-GES_DISC"))
        .await
        .unwrap();

    let summary = harness.worker().run_once().await.unwrap();
    assert_eq!(summary.retry_pending, 1);
    assert_eq!(summary.failures_by_kind.get(&ErrorKind::BuildError), Some(&1));
    assert_eq!(harness.cmr.lookup_calls.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Delivery guarantees
// ============================================================================

#[tokio::test]
async fn test_dead_letter_after_max_receives() {
    let harness = Harness::new(fast_queue(2), Vec::new()).await;
    let uri = harness.put_source("OMSO2PCA_LUT_SCD_2005.tif").await;
    harness.transcoder.fail_on("OMSO2PCA_LUT_SCD_2005.tif");
    let id = harness.queue.send(&pattern_message(&uri)).await.unwrap();
    let worker = harness.worker();

    for attempt in 1..=2 {
        let summary = worker.run_once().await.unwrap();
        assert_eq!(summary.retry_pending, 1, "attempt {}", attempt);
        wait_for_visibility().await;
    }

    // The third receive finds the message exhausted.
    let summary = worker.run_once().await.unwrap();
    assert_eq!(summary.batch_size, 0);
    assert_eq!(harness.transcoder.calls.load(Ordering::SeqCst), 2);

    let dead = harness.queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, id);
    assert_eq!(dead[0].receive_count, 2);
    assert_eq!(dead[0].reason, MAX_RECEIVES_EXCEEDED);

    harness.transcoder.recover("OMSO2PCA_LUT_SCD_2005.tif");
    wait_for_visibility().await;
    assert!(harness.queue.receive_batch().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_delivery_loads_once() {
    let harness = Harness::new(fast_queue(5), Vec::new()).await;
    let uri = harness.put_source("OMSO2PCA_LUT_SCD_2005.tif").await;
    let delivery = Delivery {
        id: MessageId::new("dup-1"),
        body: pattern_message(&uri),
        receive_count: 1,
    };
    let dispatcher = harness.dispatcher(&PipelineConfig::default());

    let first = dispatcher.process_batch(&[delivery.clone()]).await;
    let second = dispatcher.process_batch(&[delivery]).await;
    assert_eq!(first.succeeded_count(), 1);
    assert_eq!(second.succeeded_count(), 1);
    assert_eq!(harness.catalog.count_items(PATTERN_COLLECTION).await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_duplicate_delivery_loads_once() {
    let harness = Harness::new(fast_queue(5), Vec::new()).await;
    let uri = harness.put_source("OMSO2PCA_LUT_SCD_2005.tif").await;
    let delivery = Delivery {
        id: MessageId::new("dup-1"),
        body: pattern_message(&uri),
        receive_count: 1,
    };
    let first_worker = harness.dispatcher(&PipelineConfig::default());
    let second_worker = harness.dispatcher(&PipelineConfig::default());

    let (first, second) = tokio::join!(
        first_worker.process_batch(std::slice::from_ref(&delivery)),
        second_worker.process_batch(std::slice::from_ref(&delivery)),
    );
    assert_eq!(first.succeeded_count(), 1);
    assert_eq!(second.succeeded_count(), 1);
    assert!(first.failed.is_empty() && second.failed.is_empty());
    assert_eq!(harness.catalog.count_items(PATTERN_COLLECTION).await.unwrap(), 1);
}
