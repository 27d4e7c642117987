//! Coordinator behaviour: batching, resume, interruption and failures

use crate::common::{ids, product_url, Behavior, Harness, ScriptedExtractor, RETAILER};
use async_trait::async_trait;
use catalog_harvest::crawler::{Enumerator, RunOptions};
use catalog_harvest::extractor::{
    DiscoveredItem, ExtractError, Extractor, FailureKind, FetchContext, ScrapeOutcome,
    ScrapedProduct,
};
use catalog_harvest::manifest::{latest_manifest, ManifestReader, ManifestWriter};
use catalog_harvest::output::snapshot_path;
use catalog_harvest::state::{FetchMode, ProductStatus};
use catalog_harvest::storage::{self, ProductFields, RunStatus, Storage};
use catalog_harvest::HarvestError;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::json;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn count(h: &Harness, status: Option<ProductStatus>) -> u64 {
    storage::lock(&h.storage)
        .unwrap()
        .count_products(RETAILER, status)
        .unwrap()
}

#[tokio::test]
async fn test_enumerating_twice_yields_same_ids() {
    let h = Harness::new(100, 4);
    let extractor = ScriptedExtractor::new(ids(0..40));

    let mut id_sets = Vec::new();
    for _ in 0..2 {
        let writer = ManifestWriter::create(&h.manifest_dir(), RETAILER).unwrap();
        let summary = Enumerator::new(Arc::clone(&h.storage))
            .run(&extractor, "https://shop.test/sitemap.xml", writer)
            .await
            .unwrap();

        let mut reader = ManifestReader::open(&summary.manifest_path.unwrap()).unwrap();
        let urls: HashSet<String> = reader
            .next_batch(1000)
            .unwrap()
            .into_iter()
            .map(|entry| entry.url)
            .collect();
        id_sets.push(urls);
    }

    assert_eq!(id_sets[0].len(), 40);
    assert_eq!(id_sets[0], id_sets[1]);

    let counts = storage::lock(&h.storage)
        .unwrap()
        .get_enumeration_counts(RETAILER)
        .unwrap();
    assert_eq!(counts.len(), 2);
    assert!(counts.iter().all(|c| c.count == 40 && c.method == "scripted"));
}

#[tokio::test]
async fn test_end_to_end_success_and_not_found() {
    let h = Harness::new(100, 2);
    let extractor = Arc::new(
        ScriptedExtractor::new(ids(1..4)).with_override("3", Behavior::NotFound),
    );
    let manifest = h.write_manifest(ids(1..4));

    let report = h
        .coordinator(extractor.clone())
        .run(&manifest, RETAILER, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.totals.total_attempted, 3);
    assert_eq!(report.totals.total_success, 2);
    assert_eq!(report.totals.total_failed, 0);

    assert_eq!(count(&h, Some(ProductStatus::Success)), 2);
    assert_eq!(count(&h, Some(ProductStatus::NotFound)), 1);

    let db = storage::lock(&h.storage).unwrap();
    let run = db.get_scrape_run(report.run_id).unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.completed_at.is_some());
    assert_eq!(run.total_attempted, 3);
    assert_eq!(run.total_success, 2);
    assert_eq!(run.total_failed, 0);
    assert_eq!(run.config_hash, "test-hash");

    let product = db.get_product(RETAILER, "1").unwrap().unwrap();
    assert_eq!(product.product_url, product_url("1"));
    assert_eq!(product.title(), Some("Product 1"));
}

#[tokio::test]
async fn test_resume_twice_is_idempotent() {
    let h = Harness::new(100, 4);
    let extractor = Arc::new(ScriptedExtractor::new(ids(0..10)));
    let manifest = h.write_manifest(ids(0..10));
    let coordinator = h.coordinator(extractor.clone());

    let first = coordinator
        .run(&manifest, RETAILER, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(first.dispatched, 10);
    assert_eq!(count(&h, None), 10);

    for _ in 0..2 {
        let again = coordinator
            .run(&manifest, RETAILER, RunOptions::default())
            .await
            .unwrap();
        assert_eq!(again.dispatched, 0);
        assert_eq!(again.skipped_completed, 10);
        assert_eq!(again.status, RunStatus::Completed);
    }

    assert_eq!(extractor.total_calls(), 10);
    assert_eq!(count(&h, None), 10);

    // Every invocation leaves its own run row
    let runs = storage::lock(&h.storage)
        .unwrap()
        .get_scrape_runs(RETAILER)
        .unwrap();
    assert_eq!(runs.len(), 3);
}

#[tokio::test]
async fn test_no_resume_scrapes_again() {
    let h = Harness::new(100, 4);
    let extractor = Arc::new(ScriptedExtractor::new(ids(0..5)));
    let manifest = h.write_manifest(ids(0..5));
    let coordinator = h.coordinator(extractor.clone());

    coordinator
        .run(&manifest, RETAILER, RunOptions::default())
        .await
        .unwrap();
    let report = coordinator
        .run(
            &manifest,
            RETAILER,
            RunOptions {
                resume: false,
                ..RunOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(report.dispatched, 5);
    assert_eq!(extractor.calls("3"), 2);
    assert_eq!(count(&h, None), 5);
}

#[tokio::test]
async fn test_interrupt_then_resume_completes_remainder() {
    let h = Harness::new(10_000, 1);
    let manifest = h.write_manifest(ids(0..50));

    let first_extractor =
        Arc::new(ScriptedExtractor::new(ids(0..50)).interrupt_after(20, h.monitor.clone()));
    let report = h
        .coordinator(first_extractor.clone())
        .run(&manifest, RETAILER, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Interrupted);
    assert_eq!(report.dispatched, 20);
    assert_eq!(count(&h, Some(ProductStatus::Success)), 20);

    // A restarted process gets a fresh shutdown flag
    let restarted = Harness {
        dir: h.dir,
        config: h.config,
        storage: h.storage,
        monitor: Default::default(),
    };
    let second_extractor = Arc::new(ScriptedExtractor::new(ids(0..50)));
    let report = restarted
        .coordinator(second_extractor.clone())
        .run(&manifest, RETAILER, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.dispatched, 30);
    assert_eq!(report.skipped_completed, 20);
    assert_eq!(second_extractor.total_calls(), 30);
    for id in ids(0..20) {
        assert_eq!(second_extractor.calls(&id), 0);
    }
    assert_eq!(count(&restarted, Some(ProductStatus::Success)), 50);

    let runs = storage::lock(&restarted.storage)
        .unwrap()
        .get_scrape_runs(RETAILER)
        .unwrap();
    assert_eq!(runs[0].status, RunStatus::Completed);
    assert_eq!(runs[1].status, RunStatus::Interrupted);
    assert_eq!(runs[1].total_attempted, 20);
}

#[tokio::test]
async fn test_batches_partition_large_manifest() {
    let h = Harness::new(10_000, 50);
    let manifest = h.write_manifest(ids(0..25_000));
    let extractor = Arc::new(ScriptedExtractor::new(Vec::new()));

    let report = h
        .coordinator(extractor.clone())
        .run(&manifest, RETAILER, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.batch_sizes, vec![10_000, 10_000, 5_000]);
    assert_eq!(report.dispatched, 25_000);

    let counts = extractor.call_counts();
    assert_eq!(counts.len(), 25_000);
    assert!(counts.values().all(|&n| n == 1));
    assert_eq!(count(&h, None), 25_000);
}

#[tokio::test]
async fn test_skip_resume_and_max_items_compose() {
    let h = Harness::new(100, 2);
    let manifest = h.write_manifest(ids(0..20));
    let coordinator_extractor = Arc::new(ScriptedExtractor::new(Vec::new()));
    let coordinator = h.coordinator(coordinator_extractor.clone());

    // Products 5..8 are already complete
    coordinator
        .run(
            &manifest,
            RETAILER,
            RunOptions {
                skip: 5,
                max_items: Some(3),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(count(&h, None), 3);
    assert_eq!(coordinator_extractor.calls("5"), 1);
    assert_eq!(coordinator_extractor.calls("4"), 0);

    // Skip 5 rows, pass over 5..8 as complete, then take the next 4
    let report = coordinator
        .run(
            &manifest,
            RETAILER,
            RunOptions {
                skip: 5,
                max_items: Some(4),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(report.skipped_completed, 3);
    assert_eq!(report.dispatched, 4);
    for id in ["8", "9", "10", "11"] {
        assert_eq!(coordinator_extractor.calls(id), 1);
    }
    assert_eq!(coordinator_extractor.calls("12"), 0);
}

#[tokio::test]
async fn test_failures_are_logged_not_fatal() {
    let h = Harness::new(100, 1);
    let manifest = h.write_manifest(ids(0..6));
    let extractor = Arc::new(
        ScriptedExtractor::new(Vec::new())
            .with_override("1", Behavior::Fail(FailureKind::Blocked))
            .with_override("2", Behavior::Fail(FailureKind::Transient))
            .with_override("3", Behavior::Partial),
    );

    let report = h
        .coordinator(extractor.clone())
        .run(&manifest, RETAILER, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.totals.total_attempted, 6);
    assert_eq!(report.totals.total_success, 4);
    assert_eq!(report.totals.total_failed, 2);
    assert!((report.totals.block_rate_percent - 100.0 / 6.0).abs() < 0.01);

    // Blocks are not retried inline; transient failures are
    assert_eq!(extractor.calls("1"), 1);
    assert_eq!(extractor.calls("2"), 2);

    let db = storage::lock(&h.storage).unwrap();
    let summary = db.get_error_summary(RETAILER).unwrap();
    assert!(summary.contains(&("blocked".to_string(), 1)));
    assert!(summary.contains(&("transient".to_string(), 1)));
    assert_eq!(db.count_errors(RETAILER, Some(report.run_id)).unwrap(), 2);

    // The partial record lacks the price
    assert_eq!(
        db.get_product(RETAILER, "3").unwrap().unwrap().status,
        ProductStatus::Partial
    );
    let incomplete = db.get_incomplete(RETAILER).unwrap();
    assert_eq!(incomplete.len(), 1);
    assert_eq!(incomplete[0].product_id, "3");
    assert!(incomplete[0].missing_fields.contains("price"));
}

#[tokio::test]
async fn test_rescrape_clears_incomplete_record() {
    let h = Harness::new(100, 1);
    let manifest = h.write_manifest(ids(0..2));

    let partial = Arc::new(ScriptedExtractor::new(Vec::new()).with_default(Behavior::Partial));
    h.coordinator(partial)
        .run(&manifest, RETAILER, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(
        storage::lock(&h.storage)
            .unwrap()
            .get_incomplete(RETAILER)
            .unwrap()
            .len(),
        2
    );

    // Partial rows are not `success`, so resume scrapes them again
    let full = Arc::new(ScriptedExtractor::new(Vec::new()));
    let report = h
        .coordinator(full)
        .run(&manifest, RETAILER, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(report.dispatched, 2);
    assert!(storage::lock(&h.storage)
        .unwrap()
        .get_incomplete(RETAILER)
        .unwrap()
        .is_empty());
    assert_eq!(count(&h, Some(ProductStatus::Success)), 2);
}

#[tokio::test]
async fn test_circuit_breaker_trips_and_finalizes() {
    let h = Harness::new(100, 1);
    let manifest = h.write_manifest(ids(0..30));
    let extractor = Arc::new(
        ScriptedExtractor::new(Vec::new()).with_default(Behavior::Fail(FailureKind::Parse)),
    );

    let result = h
        .coordinator(extractor.clone())
        .run(&manifest, RETAILER, RunOptions::default())
        .await;

    match result {
        Err(HarvestError::CircuitBreakerTripped {
            retailer,
            consecutive_failures,
            threshold,
        }) => {
            assert_eq!(retailer, RETAILER);
            assert_eq!(threshold, 8);
            assert!(consecutive_failures >= 8);
        }
        other => panic!("expected circuit breaker trip, got {:?}", other.map(|r| r.status)),
    }

    // Hard threshold of 8 consecutive failures stops dispatch
    assert_eq!(extractor.total_calls(), 8);

    let db = storage::lock(&h.storage).unwrap();
    let runs = db.get_scrape_runs(RETAILER).unwrap();
    assert_eq!(runs[0].status, RunStatus::CircuitBroken);
    assert_eq!(runs[0].total_failed, 8);
    assert_eq!(db.count_errors(RETAILER, None).unwrap(), 8);
}

#[tokio::test]
async fn test_latest_manifest_is_used_for_skip_enum() {
    let h = Harness::new(100, 1);
    assert_eq!(latest_manifest(&h.manifest_dir(), RETAILER).unwrap(), None);

    let path = h.write_manifest(ids(0..3));
    assert_eq!(
        latest_manifest(&h.manifest_dir(), RETAILER).unwrap(),
        Some(path)
    );
}

/// Records which manifest batch every in-flight scrape belongs to
struct BatchWatcher {
    batch_size: usize,
    in_flight: Mutex<Vec<usize>>,
    overlaps: AtomicU32,
    peak: AtomicUsize,
}

impl BatchWatcher {
    fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            in_flight: Mutex::new(Vec::new()),
            overlaps: AtomicU32::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Extractor for BatchWatcher {
    fn retailer(&self) -> &str {
        RETAILER
    }

    fn enumerate<'a>(&'a self, _root: &'a str) -> BoxStream<'a, Result<DiscoveredItem, ExtractError>> {
        stream::empty().boxed()
    }

    async fn scrape_one(&self, _url: &str, product_id: &str, _ctx: &FetchContext) -> ScrapeOutcome {
        let batch = product_id.parse::<usize>().unwrap() / self.batch_size;
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if in_flight.iter().any(|&other| other != batch) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            in_flight.push(batch);
            self.peak.fetch_max(in_flight.len(), Ordering::SeqCst);
        }

        tokio::time::sleep(Duration::from_millis(2)).await;

        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let at = in_flight.iter().position(|&b| b == batch).unwrap();
            in_flight.swap_remove(at);
        }

        let mut fields = ProductFields::new();
        fields.insert("title".to_string(), json!(product_id));
        fields.insert("price".to_string(), json!("1.00"));
        ScrapeOutcome::Found(ScrapedProduct {
            fields,
            partial: false,
        })
    }
}

#[tokio::test]
async fn test_batches_never_overlap() {
    let h = Harness::new(10, 4);
    let manifest = h.write_manifest(ids(0..35));
    let watcher = Arc::new(BatchWatcher::new(10));

    let report = h
        .coordinator(watcher.clone())
        .run(&manifest, RETAILER, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.batch_sizes, vec![10, 10, 10, 5]);
    assert_eq!(report.dispatched, 35);
    assert_eq!(watcher.overlaps.load(Ordering::SeqCst), 0);
    assert!(watcher.peak.load(Ordering::SeqCst) > 1);
}

#[tokio::test]
async fn test_proxy_auth_failures_count_as_blocks() {
    let h = Harness::new(100, 1);
    let manifest = h.write_manifest(ids(0..3));
    let extractor = Arc::new(
        ScriptedExtractor::new(Vec::new()).with_default(Behavior::Fail(FailureKind::ProxyAuth)),
    );

    let report = h
        .coordinator(extractor)
        .run(&manifest, RETAILER, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.progress.blocked, 3);
    assert_eq!(report.progress.failed, 0);
    assert_eq!(report.block_stats.block_count, 3);
    assert!((report.totals.block_rate_percent - 100.0).abs() < 1e-9);

    let summary = storage::lock(&h.storage)
        .unwrap()
        .get_error_summary(RETAILER)
        .unwrap();
    assert_eq!(summary, vec![("proxy_auth".to_string(), 3)]);
}

#[tokio::test]
async fn test_blocked_run_escalates_to_proxy() {
    let h = Harness::customized(100, 1, |config| {
        config.proxy.url = Some("http://127.0.0.1:9".to_string());
        config.proxy.threshold_count = 3;
    });
    let manifest = h.write_manifest(ids(0..10));
    let extractor = Arc::new(
        ScriptedExtractor::new(Vec::new()).with_default(Behavior::BlockedUnlessProxied),
    );

    let report = h
        .coordinator(extractor.clone())
        .run(&manifest, RETAILER, RunOptions::default())
        .await
        .unwrap();

    let modes = extractor.modes();
    assert_eq!(modes.first(), Some(&FetchMode::Direct));
    assert_eq!(modes.last(), Some(&FetchMode::Proxied));
    assert_eq!(
        modes.iter().filter(|m| **m == FetchMode::Proxied).count(),
        7
    );

    assert_eq!(report.progress.blocked, 3);
    assert_eq!(report.progress.success, 7);
    assert_eq!(report.block_stats.mode, FetchMode::Proxied);
    assert!(report.totals.proxy_used);

    let db = storage::lock(&h.storage).unwrap();
    assert!(db.get_scrape_run(report.run_id).unwrap().proxy_used);
}

#[tokio::test]
async fn test_snapshot_exported_during_run() {
    let h = Harness::customized(100, 2, |config| config.harvest.export_every = 3);
    let manifest = h.write_manifest(ids(0..10));
    let extractor = Arc::new(ScriptedExtractor::new(Vec::new()));

    let report = h
        .coordinator(extractor)
        .run(&manifest, RETAILER, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Completed);

    let snapshot = snapshot_path(&PathBuf::from(&h.config.output.export_dir), RETAILER);
    let content = std::fs::read_to_string(&snapshot).unwrap();
    let rows = content.lines().count();
    assert!((3..=10).contains(&rows), "snapshot held {} rows", rows);
}

#[tokio::test]
async fn test_rescrape_incomplete_dispatches_pending_only() {
    let h = Harness::new(100, 1);
    let manifest = h.write_manifest(ids(0..4));

    let first = Arc::new(
        ScriptedExtractor::new(Vec::new())
            .with_override("1", Behavior::Partial)
            .with_override("2", Behavior::Partial),
    );
    h.coordinator(first)
        .run(&manifest, RETAILER, RunOptions::default())
        .await
        .unwrap();

    // Only the lowest pending id fits under the limit
    let limited = Arc::new(ScriptedExtractor::new(Vec::new()));
    let report = h
        .coordinator(limited.clone())
        .rescrape_incomplete(RETAILER, Some(1))
        .await
        .unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(limited.calls("1"), 1);
    assert_eq!(limited.total_calls(), 1);

    // Product 2 is still incomplete after its second scrape
    let second = Arc::new(ScriptedExtractor::new(Vec::new()).with_override("2", Behavior::Partial));
    let report = h
        .coordinator(second.clone())
        .rescrape_incomplete(RETAILER, None)
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.dispatched, 1);
    assert_eq!(second.calls("2"), 1);
    assert_eq!(second.total_calls(), 1);

    {
        let db = storage::lock(&h.storage).unwrap();
        assert_eq!(
            db.get_product(RETAILER, "1").unwrap().unwrap().status,
            ProductStatus::Success
        );
        let incomplete = db.get_incomplete(RETAILER).unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].product_id, "2");
        assert!(incomplete[0].rescrape_attempted);
    }

    // An attempted entry is not dispatched again
    let third = Arc::new(ScriptedExtractor::new(Vec::new()));
    let report = h
        .coordinator(third.clone())
        .rescrape_incomplete(RETAILER, None)
        .await
        .unwrap();
    assert_eq!(report.dispatched, 0);
    assert_eq!(third.total_calls(), 0);
    assert_eq!(report.status, RunStatus::Completed);
}
