//! Full pipeline against a mock retailer site
//!
//! These tests use wiremock to serve a sitemap index and product pages, and
//! run enumeration, scraping and export through the built-in sitemap
//! extractor.

use crate::common::{Harness, RETAILER};
use catalog_harvest::crawler::{Enumerator, RunOptions};
use catalog_harvest::extractor::ExtractorRegistry;
use catalog_harvest::manifest::{ManifestReader, ManifestWriter};
use catalog_harvest::output::{export_snapshot, load_statistics};
use catalog_harvest::state::ProductStatus;
use catalog_harvest::storage::{self, RunStatus, Storage};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn product_page(name: &str, price: &str) -> String {
    format!(
        r#"<html><head><title>{name} | Shop</title>
        <script type="application/ld+json">
        {{"@context":"https://schema.org","@type":"Product","name":"{name}",
          "sku":"SKU-{name}","offers":{{"@type":"Offer","price":"{price}","priceCurrency":"USD"}}}}
        </script></head><body></body></html>"#
    )
}

async fn mount_site(server: &MockServer) {
    let base = server.uri();

    Mock::given(method("GET"))
        .and(path("/sitemap.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            "<?xml version=\"1.0\"?><sitemapindex>\
             <sitemap><loc>{base}/sitemap-products.xml</loc></sitemap>\
             </sitemapindex>"
        )))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/sitemap-products.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            "<?xml version=\"1.0\"?><urlset>\
             <url><loc>{base}/p/1</loc></url>\
             <url><loc>{base}/p/2</loc></url>\
             <url><loc>{base}/p/2</loc></url>\
             <url><loc>{base}/p/3</loc></url>\
             </urlset>"
        )))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/p/1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(product_page("Lamp", "19.99")))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/p/2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(product_page("Desk", "89.00")))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/p/3"))
        .respond_with(ResponseTemplate::new(404))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_full_harvest_against_mock_site() {
    let server = MockServer::start().await;
    mount_site(&server).await;

    let root = format!("{}/sitemap.xml", server.uri());
    let h = Harness::with_root(100, 2, &root);
    let registry = ExtractorRegistry::from_config(&h.config).unwrap();
    let extractor = registry.get(RETAILER).unwrap();

    // Enumerate: the duplicate /p/2 row is dropped
    let writer = ManifestWriter::create(&h.manifest_dir(), RETAILER).unwrap();
    let summary = Enumerator::new(Arc::clone(&h.storage))
        .run(extractor.as_ref(), &root, writer)
        .await
        .unwrap();
    assert_eq!(summary.unique, 3);
    assert_eq!(summary.duplicates, 1);
    let manifest = summary.manifest_path.unwrap();
    assert_eq!(ManifestReader::count_rows(&manifest).unwrap(), 3);

    // Scrape
    let coordinator = h.coordinator_with(registry);
    let report = coordinator
        .run(&manifest, RETAILER, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.totals.total_attempted, 3);
    assert_eq!(report.totals.total_success, 2);
    assert_eq!(report.totals.total_failed, 0);
    assert!(!report.totals.proxy_used);

    {
        let db = storage::lock(&h.storage).unwrap();
        assert_eq!(db.count_products(RETAILER, Some(ProductStatus::Success)).unwrap(), 2);
        assert_eq!(db.count_products(RETAILER, Some(ProductStatus::NotFound)).unwrap(), 1);

        let lamp = db.get_product(RETAILER, "1").unwrap().unwrap();
        assert_eq!(lamp.title(), Some("Lamp"));
        assert_eq!(lamp.fields["price"], "19.99");
        assert!(db.get_incomplete(RETAILER).unwrap().is_empty());

        let stats = load_statistics(&*db, RETAILER).unwrap();
        assert_eq!(stats.success, 2);
        assert_eq!(stats.not_found, 1);
        assert_eq!(stats.run_count, 1);
    }

    // Resuming makes no further product requests (checked by `expect(1)`)
    let again = coordinator
        .run(&manifest, RETAILER, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(again.skipped_completed, 2);
    assert_eq!(again.dispatched, 1);

    // Export
    let export = {
        let db = storage::lock(&h.storage).unwrap();
        export_snapshot(&*db, RETAILER, Path::new(&h.config.output.export_dir)).unwrap()
    };
    assert_eq!(export.rows, 3);
    let lines: Vec<Value> = std::fs::read_to_string(&export.path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 3);
    assert!(lines
        .iter()
        .any(|line| line["product_id"] == "2" && line["fields"]["title"] == "Desk"));
}

#[tokio::test]
async fn test_blocked_pages_are_recorded() {
    let server = MockServer::start().await;
    let base = server.uri();

    Mock::given(method("GET"))
        .and(path("/p/blocked"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let h = Harness::with_root(100, 1, &format!("{}/sitemap.xml", base));
    let mut writer = ManifestWriter::create(&h.manifest_dir(), RETAILER).unwrap();
    writer.append(&format!("{}/p/blocked", base)).unwrap();
    let manifest = writer.finish().unwrap();

    let registry = ExtractorRegistry::from_config(&h.config).unwrap();
    let report = h
        .coordinator_with(registry)
        .run(&manifest, RETAILER, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.progress.blocked, 1);
    assert_eq!(report.totals.total_failed, 1);
    assert!((report.totals.block_rate_percent - 100.0).abs() < f64::EPSILON);

    let db = storage::lock(&h.storage).unwrap();
    assert_eq!(db.count_products(RETAILER, None).unwrap(), 0);
    assert_eq!(
        db.get_error_summary(RETAILER).unwrap(),
        vec![("blocked".to_string(), 1)]
    );
}
