//! JSONL export snapshots
//!
//! A snapshot is the full product table of one retailer, one JSON object per
//! line. It is rewritten in place (via a temporary file and rename) so a
//! reader never sees a half-written snapshot.

use crate::storage::{ProductFields, ProductRecord, Storage, StorageError};
use crate::HarvestError;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// One exported product line
#[derive(Debug, Serialize)]
struct ExportRow<'a> {
    retailer: &'a str,
    product_id: &'a str,
    url: &'a str,
    status: &'a str,
    scrape_run_id: i64,
    scraped_at: &'a str,
    fields: &'a ProductFields,
}

impl<'a> From<&'a ProductRecord> for ExportRow<'a> {
    fn from(record: &'a ProductRecord) -> Self {
        Self {
            retailer: &record.retailer,
            product_id: &record.product_id,
            url: &record.product_url,
            status: record.status.to_db_string(),
            scrape_run_id: record.scrape_run_id,
            scraped_at: &record.scraped_at,
            fields: &record.fields,
        }
    }
}

/// Where a snapshot was written and how many products it holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub path: PathBuf,
    pub rows: u64,
}

/// Path of a retailer's snapshot file
pub fn snapshot_path(export_dir: &Path, retailer: &str) -> PathBuf {
    export_dir.join(format!("{}_snapshot.jsonl", retailer))
}

/// Writes a snapshot of every stored product of `retailer`
///
/// # Arguments
///
/// * `storage` - The storage backend to read from
/// * `retailer` - The retailer to export
/// * `export_dir` - Directory receiving the snapshot (created if missing)
///
/// # Returns
///
/// * `Ok(ExportSummary)` - The snapshot was written
/// * `Err(HarvestError)` - Reading or writing failed; any previous snapshot is left intact
pub fn export_snapshot(
    storage: &dyn Storage,
    retailer: &str,
    export_dir: &Path,
) -> Result<ExportSummary, HarvestError> {
    std::fs::create_dir_all(export_dir)?;

    let path = snapshot_path(export_dir, retailer);
    let tmp_path = path.with_extension("jsonl.tmp");

    let mut out = BufWriter::new(File::create(&tmp_path)?);
    let rows = storage.for_each_product(retailer, &mut |record| {
        serde_json::to_writer(&mut out, &ExportRow::from(&record))?;
        out.write_all(b"\n").map_err(StorageError::from)?;
        Ok(())
    })?;

    out.into_inner()
        .map_err(|e| HarvestError::Io(e.into_error()))?
        .sync_all()?;
    std::fs::rename(&tmp_path, &path)?;

    tracing::info!(
        "Exported {} {} products to {}",
        rows,
        retailer,
        path.display()
    );

    Ok(ExportSummary { path, rows })
}
