//! Storage traits and error types
//!
//! This module defines the trait interface for storage backends and
//! associated error types.

use crate::state::ProductStatus;
use crate::storage::{
    EnumerationCountRecord, ErrorRecord, IncompleteProductRecord, ProductRecord, RescrapeTarget,
    RunStatus, RunTotals, ScrapeRunRecord,
};
use std::collections::{BTreeSet, HashSet};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Run not found: {0}")]
    RunNotFound(i64),

    #[error("Run {0} was already finalized")]
    RunAlreadyFinalized(i64),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for storage backend implementations
///
/// Every write is keyed by `(retailer, product_id)` or is an append, so
/// concurrent writers commute.
pub trait Storage {
    // ===== Run Management =====

    /// Creates a new scrape run in the `running` state
    ///
    /// # Arguments
    ///
    /// * `retailer` - The retailer being scraped
    /// * `proxy_used` - Whether the run starts proxied
    /// * `config_hash` - Hash of the configuration file
    ///
    /// # Returns
    ///
    /// The ID of the newly created run
    fn create_scrape_run(
        &mut self,
        retailer: &str,
        proxy_used: bool,
        config_hash: &str,
    ) -> StorageResult<i64>;

    /// Writes the final counters and completion time of a run
    ///
    /// A run can only be finalized once; a second attempt fails with
    /// `StorageError::RunAlreadyFinalized`.
    fn finalize_scrape_run(
        &mut self,
        run_id: i64,
        status: RunStatus,
        totals: &RunTotals,
    ) -> StorageResult<()>;

    /// Gets a run by ID
    fn get_scrape_run(&self, run_id: i64) -> StorageResult<ScrapeRunRecord>;

    /// Gets every run for a retailer, newest first
    fn get_scrape_runs(&self, retailer: &str) -> StorageResult<Vec<ScrapeRunRecord>>;

    // ===== Product Management =====

    /// Inserts or replaces a product (last write wins)
    fn upsert_product(&mut self, product: &ProductRecord) -> StorageResult<()>;

    /// Gets a single product
    fn get_product(&self, retailer: &str, product_id: &str)
        -> StorageResult<Option<ProductRecord>>;

    /// Ids of every product already stored with status `success`
    ///
    /// This is the resume set: the coordinator never re-dispatches these.
    fn completed_product_ids(&self, retailer: &str) -> StorageResult<HashSet<String>>;

    /// Counts products for a retailer, optionally restricted to one status
    fn count_products(&self, retailer: &str, status: Option<ProductStatus>) -> StorageResult<u64>;

    /// Streams every product of a retailer through `visit`
    ///
    /// # Returns
    ///
    /// The number of rows visited
    fn for_each_product(
        &self,
        retailer: &str,
        visit: &mut dyn FnMut(ProductRecord) -> StorageResult<()>,
    ) -> StorageResult<u64>;

    // ===== Incomplete Records =====

    /// Records the critical fields a product is missing
    ///
    /// Re-recording an existing entry marks it as re-scrape attempted.
    fn upsert_incomplete(
        &mut self,
        retailer: &str,
        product_id: &str,
        missing_fields: &BTreeSet<String>,
    ) -> StorageResult<()>;

    /// Removes the incomplete entry for a product, returning whether one existed
    fn clear_incomplete(&mut self, retailer: &str, product_id: &str) -> StorageResult<bool>;

    /// Gets every incomplete entry for a retailer
    fn get_incomplete(&self, retailer: &str) -> StorageResult<Vec<IncompleteProductRecord>>;

    /// Incomplete products not yet re-scraped, with their stored URLs
    ///
    /// Entries without a product row are left out.
    fn pending_rescrapes(&self, retailer: &str) -> StorageResult<Vec<RescrapeTarget>>;

    // ===== Error Log =====

    /// Appends an error record
    fn log_error(&mut self, error: &ErrorRecord) -> StorageResult<()>;

    /// Counts errors for a retailer, optionally restricted to one run
    fn count_errors(&self, retailer: &str, run_id: Option<i64>) -> StorageResult<u64>;

    /// Error counts grouped by error type, largest first
    fn get_error_summary(&self, retailer: &str) -> StorageResult<Vec<(String, u64)>>;

    // ===== Enumeration Audit =====

    /// Records how many items an enumeration method produced
    fn record_enumeration_count(
        &mut self,
        retailer: &str,
        method: &str,
        count: u64,
        notes: Option<&str>,
    ) -> StorageResult<()>;

    /// Gets enumeration counts for a retailer, newest first
    fn get_enumeration_counts(&self, retailer: &str)
        -> StorageResult<Vec<EnumerationCountRecord>>;

    // ===== Statistics =====

    /// Retailers that appear in any run or product row
    fn list_retailers(&self) -> StorageResult<Vec<String>>;
}
