//! Storage module for persisting harvest data
//!
//! This module handles all database operations, including:
//! - SQLite database initialization and schema management
//! - Product upserts keyed by `(retailer, product_id)`
//! - Scrape run history (one row per coordinator invocation)
//! - The append-only error log and enumeration audit counts
//! - Incomplete-record tracking for critical fields

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteStorage;
pub use traits::{Storage, StorageError, StorageResult};

use crate::state::ProductStatus;
use crate::HarvestError;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Scraped field values keyed by field name
pub type ProductFields = serde_json::Map<String, serde_json::Value>;

/// Storage handle shared by concurrent scrape tasks
pub type SharedStorage = Arc<Mutex<SqliteStorage>>;

/// Opens the database at `path` and wraps it for sharing across tasks
pub fn open_shared(path: &Path) -> Result<SharedStorage, HarvestError> {
    Ok(Arc::new(Mutex::new(SqliteStorage::new(path)?)))
}

/// Locks a shared storage handle
///
/// A poisoned lock means a task panicked mid-write; the store itself stays
/// consistent because every write is a single statement.
pub fn lock(storage: &SharedStorage) -> Result<MutexGuard<'_, SqliteStorage>, HarvestError> {
    storage
        .lock()
        .map_err(|e| HarvestError::LockPoisoned(e.to_string()))
}

/// Represents a product in the database
#[derive(Debug, Clone)]
pub struct ProductRecord {
    pub retailer: String,
    pub product_id: String,
    pub product_url: String,
    pub fields: ProductFields,
    pub status: ProductStatus,
    pub scrape_run_id: i64,
    pub scraped_at: String,
}

impl ProductRecord {
    /// Convenience accessor for the title field
    pub fn title(&self) -> Option<&str> {
        self.fields.get("title").and_then(|v| v.as_str())
    }
}

/// Represents one scrape run
#[derive(Debug, Clone)]
pub struct ScrapeRunRecord {
    pub id: i64,
    pub retailer: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub status: RunStatus,
    pub total_attempted: u64,
    pub total_success: u64,
    pub total_failed: u64,
    pub block_rate_percent: f64,
    pub proxy_used: bool,
    pub config_hash: String,
}

/// Final counters written when a run is finalized
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunTotals {
    pub total_attempted: u64,
    pub total_success: u64,
    pub total_failed: u64,
    pub block_rate_percent: f64,
    pub proxy_used: bool,
}

/// Status of a scrape run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    CircuitBroken,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::CircuitBroken => "circuit_broken",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "circuit_broken" => Some(Self::CircuitBroken),
            _ => None,
        }
    }
}

/// Append-only audit entry for a failed item
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub retailer: String,
    pub url: String,
    pub error_type: String,
    pub message: String,
    pub run_id: Option<i64>,
}

/// A fetched product that is missing one or more critical fields
#[derive(Debug, Clone)]
pub struct IncompleteProductRecord {
    pub retailer: String,
    pub product_id: String,
    pub missing_fields: BTreeSet<String>,
    pub rescrape_attempted: bool,
    pub recorded_at: String,
}

/// An incomplete product queued for a second scrape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescrapeTarget {
    pub product_id: String,
    pub product_url: String,
}

/// How many items one enumeration method produced
#[derive(Debug, Clone)]
pub struct EnumerationCountRecord {
    pub retailer: String,
    pub method: String,
    pub count: u64,
    pub timestamp: String,
    pub notes: Option<String>,
}
