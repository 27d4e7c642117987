//! Shared fixtures for the integration tests

use async_trait::async_trait;
use catalog_harvest::config::{parse_config, Config};
use catalog_harvest::crawler::{InterruptReason, InterruptionMonitor, ScrapeCoordinator};
use catalog_harvest::extractor::{
    DiscoveredItem, ExtractError, Extractor, ExtractorRegistry, FailureKind, FetchContext,
    HttpClients, ScrapeFailure, ScrapeOutcome, ScrapedProduct,
};
use catalog_harvest::manifest::ManifestWriter;
use catalog_harvest::state::FetchMode;
use catalog_harvest::storage::{open_shared, ProductFields, SharedStorage};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const RETAILER: &str = "target";

/// Builds a test configuration rooted in `dir`
///
/// Rate limiting is disabled and drains are short so tests run quickly.
pub fn test_config(dir: &Path, batch_size: usize, concurrency: usize, root_url: &str) -> Config {
    let toml = format!(
        r#"
[harvest]
batch-size = {batch_size}
export-every = 1000000
progress-interval = 0
drain-timeout-secs = 5
request-timeout-secs = 5

[rate-limit]
min-delay-ms = 0
max-delay-ms = 0

[retry]
max-attempts = 2
base-delay-ms = 1
max-delay-ms = 5

[circuit-breaker]
soft-threshold = 5
hard-threshold = 8
backoff-base-ms = 1
backoff-max-ms = 5

[output]
database-path = "{db}"
export-dir = "{exports}"
manifest-dir = "{manifests}"

[[retailer]]
name = "{RETAILER}"
root-url = "{root_url}"
concurrency = {concurrency}
critical-fields = ["title", "price"]
"#,
        db = dir.join("harvest.db").display(),
        exports = dir.join("exports").display(),
        manifests = dir.join("manifests").display(),
    );
    parse_config(&toml, |_| None).unwrap()
}

/// A temporary workspace with a config, a database and a shutdown flag
pub struct Harness {
    pub dir: TempDir,
    pub config: Arc<Config>,
    pub storage: SharedStorage,
    pub monitor: InterruptionMonitor,
}

impl Harness {
    pub fn new(batch_size: usize, concurrency: usize) -> Self {
        Self::with_root(batch_size, concurrency, "https://shop.test/sitemap.xml")
    }

    pub fn with_root(batch_size: usize, concurrency: usize, root_url: &str) -> Self {
        Self::build(batch_size, concurrency, root_url, |_| {})
    }

    /// Like `new`, with `customize` applied to the configuration first
    pub fn customized<F>(batch_size: usize, concurrency: usize, customize: F) -> Self
    where
        F: FnOnce(&mut Config),
    {
        Self::build(batch_size, concurrency, "https://shop.test/sitemap.xml", customize)
    }

    fn build<F>(batch_size: usize, concurrency: usize, root_url: &str, customize: F) -> Self
    where
        F: FnOnce(&mut Config),
    {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path(), batch_size, concurrency, root_url);
        customize(&mut config);
        let config = Arc::new(config);
        let storage = open_shared(Path::new(&config.output.database_path)).unwrap();
        Self {
            dir,
            config,
            storage,
            monitor: InterruptionMonitor::new(),
        }
    }

    pub fn manifest_dir(&self) -> PathBuf {
        PathBuf::from(&self.config.output.manifest_dir)
    }

    /// A coordinator using `extractor` for the test retailer
    pub fn coordinator(&self, extractor: Arc<dyn Extractor>) -> ScrapeCoordinator {
        let mut registry = ExtractorRegistry::new();
        registry.insert(extractor);
        self.coordinator_with(registry)
    }

    pub fn coordinator_with(&self, registry: ExtractorRegistry) -> ScrapeCoordinator {
        ScrapeCoordinator::new(
            Arc::clone(&self.config),
            Arc::clone(&self.storage),
            Arc::new(registry),
            HttpClients::from_config(&self.config.harvest, &self.config.proxy).unwrap(),
            self.monitor.clone(),
            "test-hash".to_string(),
        )
    }

    /// Writes a completed manifest holding one product URL per id
    pub fn write_manifest<I>(&self, ids: I) -> PathBuf
    where
        I: IntoIterator<Item = String>,
    {
        let mut writer = ManifestWriter::create(&self.manifest_dir(), RETAILER).unwrap();
        for id in ids {
            writer.append(&product_url(&id)).unwrap();
        }
        writer.finish().unwrap()
    }
}

pub fn product_url(id: &str) -> String {
    format!("https://shop.test/p/{}", id)
}

pub fn ids(range: std::ops::Range<u32>) -> Vec<String> {
    range.map(|n| n.to_string()).collect()
}

/// What the scripted extractor answers for one product
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Found,
    Partial,
    NotFound,
    Fail(FailureKind),
    /// Blocked on direct requests, found through the proxy
    BlockedUnlessProxied,
}

/// In-memory extractor with scripted answers and call accounting
pub struct ScriptedExtractor {
    catalog: Vec<String>,
    default: Behavior,
    overrides: HashMap<String, Behavior>,
    calls: Mutex<HashMap<String, u32>>,
    modes: Mutex<Vec<FetchMode>>,
    scraped: AtomicU64,
    interrupt_after: Option<(u64, InterruptionMonitor)>,
}

impl ScriptedExtractor {
    pub fn new(catalog: Vec<String>) -> Self {
        Self {
            catalog,
            default: Behavior::Found,
            overrides: HashMap::new(),
            calls: Mutex::new(HashMap::new()),
            modes: Mutex::new(Vec::new()),
            scraped: AtomicU64::new(0),
            interrupt_after: None,
        }
    }

    pub fn with_default(mut self, behavior: Behavior) -> Self {
        self.default = behavior;
        self
    }

    pub fn with_override(mut self, id: &str, behavior: Behavior) -> Self {
        self.overrides.insert(id.to_string(), behavior);
        self
    }

    /// Triggers `monitor` while scraping the `n`th product
    pub fn interrupt_after(mut self, n: u64, monitor: InterruptionMonitor) -> Self {
        self.interrupt_after = Some((n, monitor));
        self
    }

    pub fn calls(&self, id: &str) -> u32 {
        self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn call_counts(&self) -> HashMap<String, u32> {
        self.calls.lock().unwrap().clone()
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }

    /// Fetch mode of every call, in call order
    pub fn modes(&self) -> Vec<FetchMode> {
        self.modes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    fn retailer(&self) -> &str {
        RETAILER
    }

    fn enumerate<'a>(&'a self, _root: &'a str) -> BoxStream<'a, Result<DiscoveredItem, ExtractError>> {
        stream::iter(self.catalog.iter().map(|id| {
            Ok(DiscoveredItem {
                url: product_url(id),
                product_id: id.clone(),
                method: "scripted".to_string(),
            })
        }))
        .boxed()
    }

    async fn scrape_one(&self, _url: &str, product_id: &str, ctx: &FetchContext) -> ScrapeOutcome {
        self.modes.lock().unwrap().push(ctx.mode);
        *self
            .calls
            .lock()
            .unwrap()
            .entry(product_id.to_string())
            .or_insert(0) += 1;

        let n = self.scraped.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((limit, monitor)) = &self.interrupt_after {
            if n == *limit {
                monitor.trigger(InterruptReason::Manual("test interruption".to_string()));
            }
        }

        let behavior = match self.overrides.get(product_id).copied().unwrap_or(self.default) {
            Behavior::BlockedUnlessProxied if ctx.mode.is_proxied() => Behavior::Found,
            Behavior::BlockedUnlessProxied => Behavior::Fail(FailureKind::Blocked),
            other => other,
        };

        match behavior {
            Behavior::Found | Behavior::Partial => {
                let mut fields = ProductFields::new();
                fields.insert("title".to_string(), json!(format!("Product {}", product_id)));
                if matches!(behavior, Behavior::Found) {
                    fields.insert("price".to_string(), json!("9.99"));
                }
                ScrapeOutcome::Found(ScrapedProduct {
                    fields,
                    partial: matches!(behavior, Behavior::Partial),
                })
            }
            Behavior::NotFound => ScrapeOutcome::NotFound,
            Behavior::Fail(kind) => ScrapeOutcome::Failed(ScrapeFailure::new(kind, "scripted failure")),
            Behavior::BlockedUnlessProxied => unreachable!("resolved against the fetch mode above"),
        }
    }
}
