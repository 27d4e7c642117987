//! Output module for progress reporting, snapshots and statistics
//!
//! This module handles:
//! - Live progress counters for a running scrape
//! - JSONL export snapshots of stored products
//! - Per-retailer statistics read back from the database

pub mod export;
pub mod progress;
pub mod stats;

pub use export::{export_snapshot, snapshot_path, ExportSummary};
pub use progress::{ProgressEvent, ProgressSnapshot, ProgressTracker};
pub use stats::{load_all_statistics, load_statistics, print_statistics, RetailerStatistics};
