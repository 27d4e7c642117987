//! Statistics generation from the harvest database
//!
//! This module provides functionality for extracting and displaying
//! per-retailer harvest statistics from the storage layer.

use crate::state::ProductStatus;
use crate::storage::{EnumerationCountRecord, ScrapeRunRecord, Storage};
use crate::HarvestError;

/// Harvest statistics for one retailer
#[derive(Debug, Clone)]
pub struct RetailerStatistics {
    pub retailer: String,

    /// Total number of stored products
    pub total_products: u64,

    pub success: u64,
    pub partial: u64,
    pub not_found: u64,

    /// Products missing one or more critical fields
    pub incomplete: u64,

    /// Total number of logged errors
    pub total_errors: u64,

    /// Error counts by type, largest first
    pub error_summary: Vec<(String, u64)>,

    /// The most recent scrape run, if any
    pub latest_run: Option<ScrapeRunRecord>,

    /// Number of scrape runs recorded
    pub run_count: usize,

    /// The most recent enumeration count per method
    pub enumeration: Vec<EnumerationCountRecord>,
}

impl RetailerStatistics {
    /// Percentage of stored products with full or partial data
    pub fn success_rate_percent(&self) -> f64 {
        if self.total_products == 0 {
            0.0
        } else {
            (self.success + self.partial) as f64 / self.total_products as f64 * 100.0
        }
    }
}

/// Loads statistics for one retailer
///
/// # Arguments
///
/// * `storage` - The storage backend to query
/// * `retailer` - The retailer to summarize
///
/// # Returns
///
/// * `Ok(RetailerStatistics)` - Successfully loaded statistics
/// * `Err(HarvestError)` - Failed to query statistics
pub fn load_statistics(
    storage: &dyn Storage,
    retailer: &str,
) -> Result<RetailerStatistics, HarvestError> {
    let total_products = storage.count_products(retailer, None)?;
    let success = storage.count_products(retailer, Some(ProductStatus::Success))?;
    let partial = storage.count_products(retailer, Some(ProductStatus::Partial))?;
    let not_found = storage.count_products(retailer, Some(ProductStatus::NotFound))?;
    let incomplete = storage.get_incomplete(retailer)?.len() as u64;

    let error_summary = storage.get_error_summary(retailer)?;
    let total_errors = error_summary.iter().map(|(_, count)| count).sum();

    let runs = storage.get_scrape_runs(retailer)?;
    let run_count = runs.len();
    let latest_run = runs.into_iter().next();

    // Counts arrive newest first; keep the first seen per method
    let mut enumeration: Vec<EnumerationCountRecord> = Vec::new();
    for record in storage.get_enumeration_counts(retailer)? {
        if !enumeration.iter().any(|e| e.method == record.method) {
            enumeration.push(record);
        }
    }

    Ok(RetailerStatistics {
        retailer: retailer.to_string(),
        total_products,
        success,
        partial,
        not_found,
        incomplete,
        total_errors,
        error_summary,
        latest_run,
        run_count,
        enumeration,
    })
}

/// Loads statistics for every retailer found in storage
pub fn load_all_statistics(storage: &dyn Storage) -> Result<Vec<RetailerStatistics>, HarvestError> {
    storage
        .list_retailers()?
        .iter()
        .map(|retailer| load_statistics(storage, retailer))
        .collect()
}

/// Prints statistics to stdout in a formatted manner
///
/// # Arguments
///
/// * `stats` - The statistics to display
pub fn print_statistics(stats: &RetailerStatistics) {
    println!("=== {} ===\n", stats.retailer);

    println!("Products:");
    println!("  Total stored: {}", stats.total_products);
    println!("  Success: {}", stats.success);
    println!("  Partial: {}", stats.partial);
    println!("  Not found: {}", stats.not_found);
    println!("  Missing critical fields: {}", stats.incomplete);
    println!();

    if !stats.enumeration.is_empty() {
        println!("Enumeration:");
        for record in &stats.enumeration {
            print!("  {}: {} ({})", record.method, record.count, record.timestamp);
            match &record.notes {
                Some(notes) => println!(" - {}", notes),
                None => println!(),
            }
        }
        println!();
    }

    if let Some(run) = &stats.latest_run {
        println!("Latest Run (#{} of {}):", run.id, stats.run_count);
        println!("  Status: {}", run.status.to_db_string());
        println!("  Started: {}", run.started_at);
        println!(
            "  Completed: {}",
            run.completed_at.as_deref().unwrap_or("(in progress)")
        );
        println!(
            "  Attempted: {}, succeeded: {}, failed: {}",
            run.total_attempted, run.total_success, run.total_failed
        );
        println!("  Block rate: {:.1}%", run.block_rate_percent);
        println!("  Proxy used: {}", if run.proxy_used { "yes" } else { "no" });
        println!();
    }

    if !stats.error_summary.is_empty() {
        println!("Error Summary ({} total):", stats.total_errors);
        for (error_type, count) in &stats.error_summary {
            println!("  {}: {}", error_type, count);
        }
        println!();
    }

    println!(
        "Success Rate: {:.1}% ({} / {} products with data)",
        stats.success_rate_percent(),
        stats.success + stats.partial,
        stats.total_products
    );
    println!();
}
