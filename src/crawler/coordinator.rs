//! Scrape coordinator - main harvest orchestration logic
//!
//! This module runs one scrape pass over a manifest (or over the pending
//! incomplete products of a retailer), including:
//! - Reading the manifest in fixed-size batches that act as barriers
//! - Skipping products already scraped successfully (resume)
//! - Bounded concurrent dispatch through the retailer's extractor
//! - Circuit breaking, proxy escalation and per-domain rate limiting
//! - Persisting every outcome and finalizing the run row
//! - Periodic export snapshots written off the storage lock

use crate::config::{Config, RetailerConfig};
use crate::crawler::escalation::{BlockProxyManager, BlockStats};
use crate::crawler::rate_limiter::{domain_of, RateLimiter};
use crate::crawler::retry::{BreakerDecision, CircuitBreaker, RetryPolicy};
use crate::crawler::shutdown::InterruptionMonitor;
use crate::extractor::{
    Extractor, ExtractorRegistry, FailureKind, FetchContext, HttpClients, ScrapeFailure,
    ScrapeOutcome, ScrapedProduct,
};
use crate::manifest::ManifestReader;
use crate::output::{export_snapshot, ProgressEvent, ProgressSnapshot, ProgressTracker};
use crate::state::ProductStatus;
use crate::storage::{
    self, ErrorRecord, ProductFields, ProductRecord, RunStatus, RunTotals, SharedStorage,
    SqliteStorage, Storage,
};
use crate::HarvestError;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};

/// Sampling options for one scrape pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Skip products already stored with status `success`
    pub resume: bool,

    /// Dispatch at most this many items
    pub max_items: Option<u64>,

    /// Discard this many manifest rows before anything else
    pub skip: u64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            resume: true,
            max_items: None,
            skip: 0,
        }
    }
}

/// Summary of a finished scrape pass
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: i64,
    pub retailer: String,
    pub status: RunStatus,
    pub totals: RunTotals,
    pub progress: ProgressSnapshot,
    pub block_stats: BlockStats,

    /// Manifest rows read per batch
    pub batch_sizes: Vec<usize>,

    /// Rows skipped because the product was already complete
    pub skipped_completed: u64,

    /// Items handed to the extractor
    pub dispatched: u64,
}

/// Runs scrape passes over manifests
///
/// One coordinator serves every retailer of a process. Block/proxy state is
/// kept per retailer for the life of the coordinator, so escalation carries
/// over between passes.
pub struct ScrapeCoordinator {
    config: Arc<Config>,
    storage: SharedStorage,
    registry: Arc<ExtractorRegistry>,
    clients: HttpClients,
    rate_limiter: Arc<RateLimiter>,
    monitor: InterruptionMonitor,
    config_hash: String,
    managers: Mutex<HashMap<String, Arc<BlockProxyManager>>>,
}

impl ScrapeCoordinator {
    /// Creates a coordinator
    ///
    /// # Arguments
    ///
    /// * `config` - The loaded configuration
    /// * `storage` - Shared database handle
    /// * `registry` - Extractors by retailer
    /// * `clients` - Direct and proxied HTTP clients
    /// * `monitor` - Shutdown flag observed between items
    /// * `config_hash` - Recorded on every run row
    pub fn new(
        config: Arc<Config>,
        storage: SharedStorage,
        registry: Arc<ExtractorRegistry>,
        clients: HttpClients,
        monitor: InterruptionMonitor,
        config_hash: String,
    ) -> Self {
        let rate_limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
        Self {
            config,
            storage,
            registry,
            clients,
            rate_limiter,
            monitor,
            config_hash,
            managers: Mutex::new(HashMap::new()),
        }
    }

    /// The block/proxy manager of a retailer, created on first use
    pub fn block_manager(&self, retailer: &str) -> Arc<BlockProxyManager> {
        let mut managers = self.managers.lock().unwrap_or_else(|e| e.into_inner());
        managers
            .entry(retailer.to_string())
            .or_insert_with(|| Arc::new(BlockProxyManager::new(retailer, &self.config.proxy)))
            .clone()
    }

    /// Scrapes every product of a manifest
    ///
    /// # Arguments
    ///
    /// * `manifest` - A completed manifest file
    /// * `retailer` - The retailer the manifest belongs to
    /// * `options` - Resume and sampling options
    ///
    /// # Returns
    ///
    /// * `Ok(RunReport)` - The pass completed or was interrupted; the run row is finalized
    /// * `Err(HarvestError::CircuitBreakerTripped)` - Too many consecutive failures
    /// * `Err(HarvestError)` - The manifest or database failed
    pub async fn run(
        &self,
        manifest: &Path,
        retailer: &str,
        options: RunOptions,
    ) -> Result<RunReport, HarvestError> {
        let pass = self.begin(retailer)?;

        let completed: HashSet<String> = if options.resume {
            storage::lock(&self.storage)?.completed_product_ids(retailer)?
        } else {
            HashSet::new()
        };

        let planned = ManifestReader::count_rows(manifest)?.saturating_sub(options.skip);
        tracing::info!(
            "[{}] Starting run {} from {} ({} rows, {} already complete{})",
            retailer,
            pass.run_id,
            manifest.display(),
            planned,
            completed.len(),
            if options.resume { "" } else { ", resume disabled" }
        );

        let mut reader = ManifestReader::open(manifest)?;
        if options.skip > 0 {
            let skipped = reader.skip(options.skip)?;
            tracing::info!("[{}] Skipped the first {} manifest rows", retailer, skipped);
        }

        self.execute(
            pass,
            ItemSource::Manifest(reader),
            &completed,
            planned,
            options.max_items,
        )
        .await
    }

    /// Scrapes again the incomplete products not yet re-scraped
    ///
    /// Each dispatched product either has its incomplete entry cleared (every
    /// critical field is now present) or re-recorded as attempted, so a
    /// product is re-scraped at most once. Failed attempts leave the entry
    /// pending.
    ///
    /// # Arguments
    ///
    /// * `retailer` - The retailer whose incomplete products are re-scraped
    /// * `max_items` - Dispatch at most this many products
    ///
    /// # Returns
    ///
    /// * `Ok(RunReport)` - The pass completed or was interrupted; the run row is finalized
    /// * `Err(HarvestError)` - The database failed or the circuit breaker tripped
    pub async fn rescrape_incomplete(
        &self,
        retailer: &str,
        max_items: Option<u64>,
    ) -> Result<RunReport, HarvestError> {
        let pass = self.begin(retailer)?;

        let targets = storage::lock(&self.storage)?.pending_rescrapes(retailer)?;
        let total = targets.len() as u64;
        let planned = max_items.map_or(total, |max| max.min(total));
        tracing::info!(
            "[{}] Starting run {} re-scraping {} of {} incomplete products",
            retailer,
            pass.run_id,
            planned,
            total
        );

        let candidates: Vec<Candidate> = targets
            .into_iter()
            .map(|target| Candidate {
                url: target.product_url,
                product_id: Some(target.product_id),
            })
            .collect();

        self.execute(
            pass,
            ItemSource::Listed(candidates.into_iter()),
            &HashSet::new(),
            planned,
            max_items,
        )
        .await
    }

    /// Resolves the retailer and opens a run row
    fn begin(&self, retailer: &str) -> Result<Pass, HarvestError> {
        let profile = self
            .config
            .retailer(retailer)
            .ok_or_else(|| HarvestError::UnknownRetailer(retailer.to_string()))?
            .clone();
        let extractor = self.registry.get(retailer)?;
        let manager = self.block_manager(retailer);

        let run_id = {
            let mut db = storage::lock(&self.storage)?;
            db.create_scrape_run(retailer, manager.fetch_mode().is_proxied(), &self.config_hash)?
        };

        Ok(Pass {
            profile,
            extractor,
            manager,
            run_id,
        })
    }

    /// Dispatches `source` batch by batch and finalizes the run row
    async fn execute(
        &self,
        pass: Pass,
        mut source: ItemSource,
        completed: &HashSet<String>,
        planned: u64,
        max_items: Option<u64>,
    ) -> Result<RunReport, HarvestError> {
        let Pass {
            profile,
            extractor,
            manager,
            run_id,
        } = pass;
        let retailer = profile.name.as_str();

        let ctx = Arc::new(ItemContext::new(
            &self.config,
            &profile,
            run_id,
            extractor,
            Arc::clone(&manager),
            self.clients.clone(),
            Arc::clone(&self.rate_limiter),
            Arc::clone(&self.storage),
            self.monitor.clone(),
            planned,
        ));
        let semaphore = Arc::new(Semaphore::new(profile.concurrency.max(1)));

        let mut batch_sizes = Vec::new();
        let mut skipped_completed = 0u64;
        let mut dispatched = 0u64;
        let mut exhausted = false;
        let mut fatal: Option<HarvestError> = None;

        while !exhausted && !self.stopping(&ctx) {
            let batch = source.next_batch(self.config.harvest.batch_size)?;
            if batch.is_empty() {
                break;
            }
            batch_sizes.push(batch.len());
            tracing::debug!(
                "[{}] Batch {} with {} rows",
                retailer,
                batch_sizes.len(),
                batch.len()
            );

            let mut tasks: JoinSet<Result<(), HarvestError>> = JoinSet::new();
            for candidate in batch {
                if self.stopping(&ctx) {
                    break;
                }

                let Candidate { url, product_id } = candidate;
                let Some(product_id) = product_id.or_else(|| ctx.extractor.product_id(&url))
                else {
                    ctx.record_missing_id(&url)?;
                    continue;
                };
                if completed.contains(&product_id) {
                    skipped_completed += 1;
                    continue;
                }
                if max_items.is_some_and(|max| dispatched >= max) {
                    exhausted = true;
                    break;
                }

                let permit = tokio::select! {
                    permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    _ = self.monitor.triggered() => break,
                };
                if self.stopping(&ctx) {
                    break;
                }

                dispatched += 1;
                let ctx = Arc::clone(&ctx);
                tasks.spawn(async move {
                    let _permit = permit;
                    ctx.process(url, product_id).await
                });
            }

            self.settle(&mut tasks, &mut fatal).await;
            if fatal.is_some() {
                break;
            }
        }

        if let Some(export) = ctx.take_export() {
            if let Err(e) = export.await {
                tracing::warn!("[{}] Export task failed: {}", retailer, e);
            }
        }

        let progress = ctx.progress.snapshot();
        let block_stats = manager.stats();
        let totals = RunTotals {
            total_attempted: progress.completed,
            total_success: progress.success,
            total_failed: progress.total_failed(),
            block_rate_percent: progress.block_rate_percent,
            proxy_used: block_stats.mode.is_proxied(),
        };
        let status = if ctx.aborted.load(Ordering::SeqCst) {
            RunStatus::CircuitBroken
        } else if fatal.is_some() || self.monitor.is_triggered() {
            RunStatus::Interrupted
        } else {
            RunStatus::Completed
        };

        storage::lock(&self.storage)?.finalize_scrape_run(run_id, status, &totals)?;
        ctx.progress.log_progress(retailer, Some(planned));

        if let Some(e) = fatal {
            tracing::error!("[{}] Run {} stopped: {}", retailer, run_id, e);
            return Err(e);
        }

        match status {
            RunStatus::CircuitBroken => {
                let consecutive_failures = ctx.tripped_at.load(Ordering::SeqCst);
                tracing::error!(
                    "[{}] CIRCUIT BREAKER TRIPPED after {} consecutive failures; run {} aborted \
                     with {} of {} items settled",
                    retailer,
                    consecutive_failures,
                    run_id,
                    progress.completed,
                    planned
                );
                return Err(HarvestError::CircuitBreakerTripped {
                    retailer: retailer.to_string(),
                    consecutive_failures,
                    threshold: ctx.breaker.hard_threshold,
                });
            }
            RunStatus::Interrupted => tracing::warn!(
                "[{}] Run {} interrupted after {} items; rerun to resume",
                retailer,
                run_id,
                progress.completed
            ),
            _ => tracing::info!(
                "[{}] Run {} complete: {} attempted, {} succeeded, {} failed",
                retailer,
                run_id,
                totals.total_attempted,
                totals.total_success,
                totals.total_failed
            ),
        }

        Ok(RunReport {
            run_id,
            retailer: retailer.to_string(),
            status,
            totals,
            progress,
            block_stats,
            batch_sizes,
            skipped_completed,
            dispatched,
        })
    }

    fn stopping(&self, ctx: &ItemContext) -> bool {
        self.monitor.is_triggered() || ctx.aborted.load(Ordering::SeqCst)
    }

    /// Waits for every task of a batch
    ///
    /// Once interrupted, in-flight tasks get the drain timeout to finish and
    /// are aborted after that.
    async fn settle(
        &self,
        tasks: &mut JoinSet<Result<(), HarvestError>>,
        fatal: &mut Option<HarvestError>,
    ) {
        if !self.monitor.is_triggered() {
            tokio::select! {
                _ = drain(tasks, fatal) => return,
                _ = self.monitor.triggered() => {}
            }
        }

        let timeout = self.config.harvest.drain_timeout();
        tracing::info!(
            "Draining {} in-flight items (up to {:?})",
            tasks.len(),
            timeout
        );
        if tokio::time::timeout(timeout, drain(tasks, fatal)).await.is_err() {
            tracing::warn!("Abandoning {} items still in flight", tasks.len());
            tasks.abort_all();
            drain(tasks, fatal).await;
        }
    }
}

async fn drain(tasks: &mut JoinSet<Result<(), HarvestError>>, fatal: &mut Option<HarvestError>) {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("Failed to persist scrape result: {}", e);
                fatal.get_or_insert(e);
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => tracing::error!("Scrape task failed: {}", e),
        }
    }
}

/// The retailer state resolved when a run row is opened
struct Pass {
    profile: RetailerConfig,
    extractor: Arc<dyn Extractor>,
    manager: Arc<BlockProxyManager>,
    run_id: i64,
}

/// One item waiting for dispatch; manifest rows carry no product id yet
struct Candidate {
    url: String,
    product_id: Option<String>,
}

/// Where the items of a pass come from
enum ItemSource {
    Manifest(ManifestReader),
    Listed(std::vec::IntoIter<Candidate>),
}

impl ItemSource {
    fn next_batch(&mut self, size: usize) -> Result<Vec<Candidate>, HarvestError> {
        match self {
            Self::Manifest(reader) => Ok(reader
                .next_batch(size)?
                .into_iter()
                .map(|entry| Candidate {
                    url: entry.url,
                    product_id: None,
                })
                .collect()),
            Self::Listed(items) => Ok(items.by_ref().take(size.max(1)).collect()),
        }
    }
}

/// Everything a scrape task needs, shared by every task of one run
struct ItemContext {
    retailer: String,
    run_id: i64,
    extractor: Arc<dyn Extractor>,
    manager: Arc<BlockProxyManager>,
    clients: HttpClients,
    rate_limiter: Arc<RateLimiter>,
    storage: SharedStorage,
    monitor: InterruptionMonitor,
    progress: ProgressTracker,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    critical_fields: Vec<String>,
    database_path: PathBuf,
    export_dir: PathBuf,
    export_every: u64,
    export: Mutex<Option<JoinHandle<()>>>,
    progress_interval: u64,
    planned: u64,
    persisted: AtomicU64,
    aborted: AtomicBool,
    tripped_at: AtomicU32,
}

impl ItemContext {
    #[allow(clippy::too_many_arguments)]
    fn new(
        config: &Config,
        profile: &RetailerConfig,
        run_id: i64,
        extractor: Arc<dyn Extractor>,
        manager: Arc<BlockProxyManager>,
        clients: HttpClients,
        rate_limiter: Arc<RateLimiter>,
        storage: SharedStorage,
        monitor: InterruptionMonitor,
        planned: u64,
    ) -> Self {
        Self {
            retailer: profile.name.clone(),
            run_id,
            extractor,
            manager,
            clients,
            rate_limiter,
            storage,
            monitor,
            progress: ProgressTracker::new(),
            retry: RetryPolicy::from_config(&config.retry),
            breaker: CircuitBreaker::from_config(&config.circuit_breaker),
            critical_fields: profile.critical_fields.clone(),
            database_path: PathBuf::from(&config.output.database_path),
            export_dir: PathBuf::from(&config.output.export_dir),
            export_every: config.harvest.export_every,
            export: Mutex::new(None),
            progress_interval: config.harvest.progress_interval,
            planned,
            persisted: AtomicU64::new(0),
            aborted: AtomicBool::new(false),
            tripped_at: AtomicU32::new(0),
        }
    }

    /// Scrapes and persists one product
    async fn process(&self, url: String, product_id: String) -> Result<(), HarvestError> {
        if !self.pass_breaker().await {
            return Ok(());
        }

        self.manager.escalate_if_needed();

        let outcome = self.scrape_with_retry(&url, &product_id).await;
        self.persist(&url, &product_id, outcome)
    }

    /// Applies the circuit breaker; `false` means the item must not be attempted
    async fn pass_breaker(&self) -> bool {
        if self.aborted.load(Ordering::SeqCst) {
            return false;
        }

        let consecutive = self.manager.consecutive_failures();
        match self.breaker.check(consecutive) {
            BreakerDecision::Proceed => true,
            BreakerDecision::Backoff(delay) => {
                tracing::warn!(
                    "[{}] {} consecutive failures, backing off {:?}",
                    self.retailer,
                    consecutive,
                    delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.monitor.triggered() => return false,
                }
                !self.aborted.load(Ordering::SeqCst)
            }
            BreakerDecision::Trip => {
                if !self.aborted.swap(true, Ordering::SeqCst) {
                    self.tripped_at.store(consecutive, Ordering::SeqCst);
                }
                false
            }
        }
    }

    async fn scrape_with_retry(&self, url: &str, product_id: &str) -> ScrapeOutcome {
        let domain = domain_of(url);
        let mut attempt = 1;

        loop {
            let mode = self.manager.fetch_mode();
            self.rate_limiter.wait(&domain).await;

            let fetch = FetchContext {
                client: self.clients.for_mode(mode).clone(),
                mode,
                attempt,
            };
            let outcome = self.extractor.scrape_one(url, product_id, &fetch).await;

            match &outcome {
                ScrapeOutcome::Failed(failure) if self.retry.should_retry(failure.kind, attempt) => {
                    let delay = self.retry.delay_after(attempt);
                    tracing::debug!(
                        "[{}] Attempt {} for {} failed ({}: {}), retrying in {:?}",
                        self.retailer,
                        attempt,
                        product_id,
                        failure.kind,
                        failure.message,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                _ => return outcome,
            }
        }
    }

    fn persist(&self, url: &str, product_id: &str, outcome: ScrapeOutcome) -> Result<(), HarvestError> {
        let event = match outcome {
            ScrapeOutcome::Found(product) => {
                self.persist_found(url, product_id, product)?;
                self.manager.record(true, false);
                ProgressEvent::Success
            }
            ScrapeOutcome::NotFound => {
                self.upsert(url, product_id, ProductFields::new(), ProductStatus::NotFound)?;
                self.manager.record(true, false);
                ProgressEvent::NotFound
            }
            ScrapeOutcome::Failed(failure) => {
                self.persist_failure(url, &failure)?;
                self.manager.record(false, failure.kind.is_block());
                if failure.kind.is_block() {
                    ProgressEvent::Blocked
                } else {
                    ProgressEvent::Failed
                }
            }
        };

        self.settled(event);
        Ok(())
    }

    fn persist_found(
        &self,
        url: &str,
        product_id: &str,
        product: ScrapedProduct,
    ) -> Result<(), HarvestError> {
        let missing = missing_fields(&product.fields, &self.critical_fields);
        let status = if product.partial {
            ProductStatus::Partial
        } else {
            ProductStatus::Success
        };
        self.upsert(url, product_id, product.fields, status)?;

        {
            let mut db = storage::lock(&self.storage)?;
            if missing.is_empty() {
                db.clear_incomplete(&self.retailer, product_id)?;
            } else {
                tracing::debug!(
                    "[{}] {} is missing {:?}",
                    self.retailer,
                    product_id,
                    missing
                );
                db.upsert_incomplete(&self.retailer, product_id, &missing)?;
            }
        }

        let persisted = self.persisted.fetch_add(1, Ordering::SeqCst) + 1;
        if self.export_every > 0 && persisted % self.export_every == 0 {
            self.schedule_export();
        }
        Ok(())
    }

    /// Starts a snapshot export on a blocking thread with its own connection
    ///
    /// At most one export runs at a time; a snapshot due while the previous
    /// one is still writing is skipped.
    fn schedule_export(&self) {
        let mut export = self.export.lock().unwrap_or_else(|e| e.into_inner());
        if export.as_ref().is_some_and(|task| !task.is_finished()) {
            tracing::debug!(
                "[{}] Previous export still running, skipping this snapshot",
                self.retailer
            );
            return;
        }

        let retailer = self.retailer.clone();
        let database_path = self.database_path.clone();
        let export_dir = self.export_dir.clone();
        *export = Some(tokio::task::spawn_blocking(move || {
            let result = SqliteStorage::open_reader(&database_path)
                .and_then(|reader| export_snapshot(&reader, &retailer, &export_dir));
            if let Err(e) = result {
                tracing::warn!("[{}] Export snapshot failed: {}", retailer, e);
            }
        }));
    }

    /// The export task started last, if any
    fn take_export(&self) -> Option<JoinHandle<()>> {
        self.export.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn persist_failure(&self, url: &str, failure: &ScrapeFailure) -> Result<(), HarvestError> {
        tracing::debug!(
            "[{}] {} failed: {} ({})",
            self.retailer,
            url,
            failure.kind,
            failure.message
        );
        storage::lock(&self.storage)?.log_error(&ErrorRecord {
            retailer: self.retailer.clone(),
            url: url.to_string(),
            error_type: failure.kind.as_str().to_string(),
            message: failure.message.clone(),
            run_id: Some(self.run_id),
        })?;
        Ok(())
    }

    fn upsert(
        &self,
        url: &str,
        product_id: &str,
        fields: ProductFields,
        status: ProductStatus,
    ) -> Result<(), HarvestError> {
        storage::lock(&self.storage)?.upsert_product(&ProductRecord {
            retailer: self.retailer.clone(),
            product_id: product_id.to_string(),
            product_url: url.to_string(),
            fields,
            status,
            scrape_run_id: self.run_id,
            scraped_at: Utc::now().to_rfc3339(),
        })?;
        Ok(())
    }

    /// A manifest row whose URL yields no product id
    fn record_missing_id(&self, url: &str) -> Result<(), HarvestError> {
        tracing::warn!("[{}] No product id in {}", self.retailer, url);
        self.persist_failure(
            url,
            &ScrapeFailure::new(FailureKind::Parse, "no product id in URL"),
        )?;
        self.settled(ProgressEvent::Failed);
        Ok(())
    }

    fn settled(&self, event: ProgressEvent) {
        let completed = self.progress.record(event);
        if self.progress_interval > 0 && completed % self.progress_interval == 0 {
            self.progress.log_progress(&self.retailer, Some(self.planned));
        }
    }
}

/// Critical fields that are absent, null or blank
fn missing_fields(fields: &ProductFields, critical: &[String]) -> BTreeSet<String> {
    critical
        .iter()
        .filter(|name| match fields.get(name.as_str()) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(_) => false,
        })
        .cloned()
        .collect()
}
