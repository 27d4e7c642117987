//! Catalog enumeration
//!
//! Drains an extractor's discovery stream into a new manifest. Every unique
//! product is written the moment it is discovered, so a pass interrupted
//! halfway still leaves its rows in the `.partial` file.

use crate::crawler::shutdown::InterruptionMonitor;
use crate::extractor::Extractor;
use crate::manifest::ManifestWriter;
use crate::storage::{self, SharedStorage, Storage};
use crate::HarvestError;
use futures::StreamExt;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

/// What one enumeration pass produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnumerationSummary {
    /// Final manifest path; `None` when the pass was interrupted
    pub manifest_path: Option<PathBuf>,

    /// Unique products written
    pub unique: u64,
    pub duplicates: u64,

    /// Failed sub-indexes that were skipped
    pub failures: u64,

    /// Unique products per discovery method
    pub by_method: BTreeMap<String, u64>,

    /// Stopped early at the item limit
    pub truncated: bool,
}

/// Runs enumeration passes and records their audit counts
pub struct Enumerator {
    storage: SharedStorage,
    limit: Option<u64>,
    monitor: Option<InterruptionMonitor>,
}

impl Enumerator {
    pub fn new(storage: SharedStorage) -> Self {
        Self {
            storage,
            limit: None,
            monitor: None,
        }
    }

    /// Stops after `limit` unique items
    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }

    /// Stops early once `monitor` is triggered
    pub fn with_monitor(mut self, monitor: InterruptionMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    fn interrupted(&self) -> bool {
        self.monitor.as_ref().is_some_and(|m| m.is_triggered())
    }

    /// Enumerates one retailer into `writer`
    ///
    /// # Arguments
    ///
    /// * `extractor` - The retailer's extractor
    /// * `root` - Catalog root handed to [`Extractor::enumerate`]
    /// * `writer` - A freshly created manifest; finished here unless interrupted
    ///
    /// # Returns
    ///
    /// * `Ok(EnumerationSummary)` - The pass ran to completion, the limit, or an interruption
    /// * `Err(HarvestError)` - The manifest or the database could not be written
    pub async fn run(
        &self,
        extractor: &dyn Extractor,
        root: &str,
        mut writer: ManifestWriter,
    ) -> Result<EnumerationSummary, HarvestError> {
        let retailer = extractor.retailer().to_string();
        tracing::info!("[{}] Enumerating catalog from {}", retailer, root);

        let mut seen: HashSet<String> = HashSet::new();
        let mut summary = EnumerationSummary::default();
        let mut stream = extractor.enumerate(root);

        while let Some(item) = stream.next().await {
            if self.interrupted() {
                break;
            }

            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    summary.failures += 1;
                    tracing::warn!("[{}] Skipping failed source: {}", retailer, e);
                    continue;
                }
            };

            if !seen.insert(item.product_id.clone()) {
                summary.duplicates += 1;
                continue;
            }

            writer.append(&item.url)?;
            summary.unique += 1;
            *summary.by_method.entry(item.method).or_insert(0) += 1;

            if summary.unique % 10_000 == 0 {
                tracing::info!("[{}] Enumerated {} products", retailer, summary.unique);
            }

            if self.limit.is_some_and(|limit| summary.unique >= limit) {
                summary.truncated = true;
                tracing::info!("[{}] Reached item limit of {}", retailer, summary.unique);
                break;
            }
        }
        drop(stream);

        if self.interrupted() {
            tracing::warn!(
                "[{}] Enumeration interrupted after {} products; manifest left partial",
                retailer,
                summary.unique
            );
            return Ok(summary);
        }

        let path = writer.finish()?;
        self.record_counts(&retailer, &summary)?;

        tracing::info!(
            "[{}] Enumeration complete: {} unique, {} duplicates, {} failed sources -> {}",
            retailer,
            summary.unique,
            summary.duplicates,
            summary.failures,
            path.display()
        );
        summary.manifest_path = Some(path);
        Ok(summary)
    }

    fn record_counts(&self, retailer: &str, summary: &EnumerationSummary) -> Result<(), HarvestError> {
        let mut notes = format!(
            "{} duplicates, {} failed sources",
            summary.duplicates, summary.failures
        );
        if summary.truncated {
            notes.push_str(", truncated at item limit");
        }

        let mut db = storage::lock(&self.storage)?;
        if summary.by_method.is_empty() {
            db.record_enumeration_count(retailer, "none", 0, Some(&notes))?;
        }
        for (method, count) in &summary.by_method {
            db.record_enumeration_count(retailer, method, *count, Some(&notes))?;
        }
        Ok(())
    }
}
