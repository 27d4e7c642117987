//! Manifest store
//!
//! A manifest is the durable checkpoint between enumeration and scraping:
//! one CSV file per enumeration pass, header `url,digest`, one row per unique
//! product URL. Each row carries the lowercase hex SHA-256 of its URL so a
//! reader can detect truncated or corrupted rows.
//!
//! Files are named `manifest_<retailer>_<YYYYmmdd_HHMMSS>.csv`. They are
//! written under a `.partial` name and renamed when the pass finishes, so a
//! file with the final name is always complete and never modified again.

mod reader;
mod writer;

pub use reader::ManifestReader;
pub use writer::ManifestWriter;

use chrono::NaiveDateTime;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Header columns of every manifest file
pub const MANIFEST_COLUMNS: [&str; 2] = ["url", "digest"];

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Errors raised while writing or reading manifests
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("IO error on manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error on manifest {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Manifest {0} has no `url,digest` header")]
    MissingHeader(PathBuf),

    #[error("URL cannot be written to a manifest: {0:?}")]
    InvalidUrl(String),

    #[error("No completed manifest for retailer '{retailer}' in {dir}")]
    NotFound { retailer: String, dir: PathBuf },
}

impl ManifestError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn csv(path: &Path, source: csv::Error) -> Self {
        Self::Csv {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One manifest row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub url: String,
    pub digest: String,
}

impl ManifestEntry {
    /// Builds an entry, computing the digest of `url`
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let digest = row_digest(&url);
        Self { url, digest }
    }

    /// Whether the stored digest matches the URL
    pub fn is_valid(&self) -> bool {
        row_digest(&self.url) == self.digest
    }
}

/// Computes the per-row digest of a URL
pub fn row_digest(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}

/// Builds the final file name of a manifest
pub fn manifest_file_name(retailer: &str, started: &NaiveDateTime) -> String {
    format!(
        "manifest_{}_{}.csv",
        retailer,
        started.format(TIMESTAMP_FORMAT)
    )
}

/// Finds the newest completed manifest for a retailer
///
/// Only files with the final name count; `.partial` files from an
/// interrupted pass are ignored.
///
/// # Arguments
///
/// * `dir` - The manifest directory
/// * `retailer` - The retailer name
///
/// # Returns
///
/// * `Ok(Some(path))` - The newest manifest
/// * `Ok(None)` - The directory holds no completed manifest for the retailer
/// * `Err(ManifestError)` - The directory could not be read
pub fn latest_manifest(dir: &Path, retailer: &str) -> Result<Option<PathBuf>, ManifestError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ManifestError::io(dir, e)),
    };

    let prefix = format!("manifest_{}_", retailer);
    let mut newest: Option<((NaiveDateTime, u32), PathBuf)> = None;

    for entry in entries {
        let entry = entry.map_err(|e| ManifestError::io(dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();

        let stamp = match name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(".csv"))
        {
            Some(stamp) => stamp,
            None => continue,
        };

        let Some(key) = stamp_order(stamp) else {
            continue;
        };
        if newest.as_ref().map_or(true, |(best, _)| key > *best) {
            newest = Some((key, entry.path()));
        }
    }

    Ok(newest.map(|(_, path)| path))
}

/// Orders a file name stamp by time, then by same-second suffix
///
/// `20240309_120000` sorts before `20240309_120000_1`, which sorts before
/// `20240309_120000_10`.
fn stamp_order(stamp: &str) -> Option<(NaiveDateTime, u32)> {
    let time = NaiveDateTime::parse_from_str(stamp.get(..15)?, TIMESTAMP_FORMAT).ok()?;
    let suffix = match &stamp[15..] {
        "" => 0,
        rest => rest.strip_prefix('_')?.parse().ok()?,
    };
    Some((time, suffix))
}
