//! Catalog-Harvest main entry point
//!
//! This is the command-line interface for the Catalog-Harvest product
//! catalog harvester.

use anyhow::Context;
use catalog_harvest::config::{load_config_with_hash, Config};
use catalog_harvest::crawler::{
    Enumerator, InterruptionMonitor, RunOptions, RunReport, ScrapeCoordinator,
};
use catalog_harvest::extractor::{ExtractorRegistry, HttpClients};
use catalog_harvest::manifest::{latest_manifest, ManifestWriter};
use catalog_harvest::output::{export_snapshot, load_all_statistics, print_statistics};
use catalog_harvest::storage::{self, SharedStorage};
use catalog_harvest::HarvestError;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Items enumerated per retailer in `--test` mode
const TEST_MODE_LIMIT: u64 = 100;

/// Catalog-Harvest: a resumable product catalog harvester
///
/// Catalog-Harvest enumerates retailer catalogs into manifests and scrapes
/// them in resumable batches, escalating to a proxy pool when blocked and
/// stopping cleanly on interruption.
#[derive(Parser, Debug)]
#[command(name = "catalog-harvest")]
#[command(version)]
#[command(about = "A resumable product catalog harvester", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Retailers to process, comma separated (default: all configured)
    #[arg(long, value_delimiter = ',')]
    retailers: Vec<String>,

    /// Limit enumeration to a small sample for validation
    #[arg(long)]
    test: bool,

    /// Only enumerate catalogs into manifests; skip scraping
    #[arg(long, conflicts_with = "skip_enum")]
    enumerate_only: bool,

    /// Scrape everything again, ignoring products already stored
    #[arg(long)]
    no_resume: bool,

    /// Maximum number of products to scrape per retailer
    #[arg(long, value_name = "N")]
    max_items: Option<u64>,

    /// Skip enumeration and scrape the latest manifest
    #[arg(long)]
    skip_enum: bool,

    /// Discard the first N manifest rows
    #[arg(long, value_name = "N", default_value_t = 0)]
    skip: u64,

    /// Re-scrape products stored without every critical field, instead of
    /// enumerating and scraping
    #[arg(long, conflicts_with_all = ["enumerate_only", "skip_enum", "no_resume"])]
    rescrape_incomplete: bool,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Show statistics from the database and exit
    #[arg(long, conflicts_with_all = ["enumerate_only", "skip_enum", "rescrape_incomplete"])]
    stats: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // A missing .env file is normal
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    let storage = storage::open_shared(Path::new(&config.output.database_path))
        .with_context(|| format!("failed to open {}", config.output.database_path))?;

    if cli.stats {
        handle_stats(&storage)?;
        return Ok(ExitCode::SUCCESS);
    }

    let retailers = select_retailers(&config, &cli.retailers)?;
    handle_harvest(cli, Arc::new(config), config_hash, storage, retailers).await
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("catalog_harvest=info,warn"),
            1 => EnvFilter::new("catalog_harvest=debug,info"),
            2 => EnvFilter::new("catalog_harvest=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Resolves `--retailers` against the configured profiles
fn select_retailers(config: &Config, requested: &[String]) -> anyhow::Result<Vec<String>> {
    if requested.is_empty() {
        return Ok(config.retailers.iter().map(|r| r.name.clone()).collect());
    }

    for name in requested {
        if config.retailer(name).is_none() {
            anyhow::bail!(HarvestError::UnknownRetailer(name.clone()));
        }
    }
    Ok(requested.to_vec())
}

/// Handles the --stats mode: shows statistics from the database
fn handle_stats(storage: &SharedStorage) -> anyhow::Result<()> {
    let db = storage::lock(storage)?;
    let all = load_all_statistics(&*db)?;

    if all.is_empty() {
        println!("No harvest data recorded yet");
    }
    for stats in &all {
        print_statistics(stats);
    }
    Ok(())
}

/// Enumerates and scrapes every selected retailer in turn
async fn handle_harvest(
    cli: Cli,
    config: Arc<Config>,
    config_hash: String,
    storage: SharedStorage,
    retailers: Vec<String>,
) -> anyhow::Result<ExitCode> {
    let monitor = InterruptionMonitor::new();
    monitor.spawn_signal_listener();

    let clients = HttpClients::from_config(&config.harvest, &config.proxy)
        .context("failed to build HTTP clients")?;
    if config.proxy.is_configured() {
        tracing::info!(
            "Proxy pool available at {} (start proxied: {})",
            config.proxy.redacted_url(),
            config.proxy.enabled
        );
    }

    if config.interruption.enabled {
        monitor.spawn_notice_poller(
            clients.direct.clone(),
            config.interruption.notice_url.clone(),
            Duration::from_secs(config.interruption.poll_interval_secs.max(1)),
        );
    }

    let registry = Arc::new(ExtractorRegistry::from_config(&config)?);
    let coordinator = ScrapeCoordinator::new(
        Arc::clone(&config),
        Arc::clone(&storage),
        Arc::clone(&registry),
        clients,
        monitor.clone(),
        config_hash,
    );

    let manifest_dir = PathBuf::from(&config.output.manifest_dir);
    let options = RunOptions {
        resume: !cli.no_resume,
        max_items: cli.max_items,
        skip: cli.skip,
    };
    let mut failed = false;
    let mut tripped = false;

    for retailer in &retailers {
        if monitor.is_triggered() {
            break;
        }

        let result = harvest_retailer(
            &cli,
            &config,
            &storage,
            &registry,
            &coordinator,
            &monitor,
            &manifest_dir,
            retailer,
            options.clone(),
        )
        .await;

        match result {
            Ok(()) => {}
            Err(e @ HarvestError::CircuitBreakerTripped { .. }) => {
                tracing::error!("{}", e);
                tracing::error!(
                    "The site is rejecting most requests. Check the error log with --stats, \
                     configure or enable a proxy pool (HARVEST_PROXY_URL, HARVEST_PROXY_ENABLED), \
                     or lower concurrency, then rerun to resume where the run stopped."
                );
                tripped = true;
            }
            Err(e) => {
                tracing::error!("[{}] Harvest failed: {}", retailer, e);
                failed = true;
            }
        }
    }

    // Runs at most once, whether we got here normally or after an interruption
    monitor
        .cleanup_once(async {
            registry.release_all().await;
            for retailer in &retailers {
                let result = storage::lock(&storage).and_then(|db| {
                    export_snapshot(&*db, retailer, Path::new(&config.output.export_dir))
                });
                if let Err(e) = result {
                    tracing::warn!("[{}] Final export failed: {}", retailer, e);
                }
            }
        })
        .await;

    if let Some(reason) = monitor.reason() {
        tracing::warn!(
            "Harvest interrupted ({}); progress is saved, rerun the same command to resume",
            reason
        );
        return Ok(ExitCode::SUCCESS);
    }

    if tripped || failed {
        return Ok(ExitCode::FAILURE);
    }

    tracing::info!("Harvest complete for {}", retailers.join(", "));
    Ok(ExitCode::SUCCESS)
}

/// Runs enumeration (unless skipped) and then scraping for one retailer
#[allow(clippy::too_many_arguments)]
async fn harvest_retailer(
    cli: &Cli,
    config: &Config,
    storage: &SharedStorage,
    registry: &ExtractorRegistry,
    coordinator: &ScrapeCoordinator,
    monitor: &InterruptionMonitor,
    manifest_dir: &Path,
    retailer: &str,
    options: RunOptions,
) -> Result<(), HarvestError> {
    if cli.rescrape_incomplete {
        let report = coordinator
            .rescrape_incomplete(retailer, cli.max_items)
            .await?;
        log_report(&report);
        return Ok(());
    }

    let extractor = registry.get(retailer)?;
    let previous = latest_manifest(manifest_dir, retailer)?;

    // An earlier manifest is reused when asked to, or when sampling a few items
    let reuse = cli.skip_enum || (cli.max_items.is_some() && previous.is_some());

    let manifest = if reuse {
        match previous {
            Some(path) => {
                tracing::info!("[{}] Using manifest {}", retailer, path.display());
                path
            }
            None => {
                tracing::error!(
                    "[{}] No manifest found in {}; run enumeration first",
                    retailer,
                    manifest_dir.display()
                );
                return Ok(());
            }
        }
    } else {
        let root = config
            .retailer(retailer)
            .map(|r| r.root_url.clone())
            .ok_or_else(|| HarvestError::UnknownRetailer(retailer.to_string()))?;
        let writer = ManifestWriter::create(manifest_dir, retailer)?;
        let summary = Enumerator::new(Arc::clone(storage))
            .with_limit(cli.test.then_some(TEST_MODE_LIMIT))
            .with_monitor(monitor.clone())
            .run(extractor.as_ref(), &root, writer)
            .await?;

        match summary.manifest_path {
            Some(path) if summary.unique > 0 => path,
            Some(_) => {
                tracing::warn!("[{}] No products found, skipping scrape", retailer);
                return Ok(());
            }
            None => return Ok(()),
        }
    };

    if cli.enumerate_only {
        return Ok(());
    }

    let report = coordinator.run(&manifest, retailer, options).await?;
    log_report(&report);
    Ok(())
}

/// One summary line per finished run
fn log_report(report: &RunReport) {
    let snap = &report.progress;
    tracing::info!(
        "[{}] Run {} {}: {} ok, {} failed, {} blocked, {} not found, {} skipped as complete \
         ({:.0}/min, proxy: {})",
        report.retailer,
        report.run_id,
        report.status.to_db_string(),
        snap.success,
        snap.failed,
        snap.blocked,
        snap.not_found,
        report.skipped_completed,
        snap.items_per_minute,
        if report.totals.proxy_used { "yes" } else { "no" }
    );
}
