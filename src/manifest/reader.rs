//! Sequential manifest reader

use super::{ManifestEntry, ManifestError, MANIFEST_COLUMNS};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Reads a manifest row by row, verifying each digest
///
/// Rows whose digest does not match their URL are logged and skipped; they
/// never reach the caller.
pub struct ManifestReader {
    path: PathBuf,
    rows: csv::Reader<File>,
    record: csv::StringRecord,
    rows_read: u64,
    rows_rejected: u64,
}

impl ManifestReader {
    /// Opens a manifest and checks its header
    pub fn open(path: &Path) -> Result<Self, ManifestError> {
        let file = File::open(path).map_err(|e| ManifestError::io(path, e))?;
        let mut rows = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(file);

        let header = rows.headers().map_err(|e| ManifestError::csv(path, e))?;
        if header.iter().ne(MANIFEST_COLUMNS) {
            return Err(ManifestError::MissingHeader(path.to_path_buf()));
        }

        Ok(Self {
            path: path.to_path_buf(),
            rows,
            record: csv::StringRecord::new(),
            rows_read: 0,
            rows_rejected: 0,
        })
    }

    /// Path of the manifest being read
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Valid rows returned so far (including skipped ones)
    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    /// Rows dropped for a malformed line or a digest mismatch
    pub fn rows_rejected(&self) -> u64 {
        self.rows_rejected
    }

    fn line(&self) -> u64 {
        self.record.position().map_or(0, |p| p.line())
    }

    fn reject(&mut self, reason: &str) {
        self.rows_rejected += 1;
        tracing::warn!(
            "{} on manifest line {} in {}",
            reason,
            self.line(),
            self.path.display()
        );
    }

    /// Reads the next valid row, or `None` at end of file
    pub fn next_entry(&mut self) -> Result<Option<ManifestEntry>, ManifestError> {
        loop {
            match self.rows.read_record(&mut self.record) {
                Ok(true) => {}
                Ok(false) => return Ok(None),
                Err(e) if matches!(e.kind(), csv::ErrorKind::Utf8 { .. }) => {
                    self.reject("Invalid UTF-8");
                    continue;
                }
                Err(e) => return Err(ManifestError::csv(&self.path, e)),
            }

            if self.record.len() != MANIFEST_COLUMNS.len() {
                self.reject("Malformed row");
                continue;
            }

            let entry = ManifestEntry {
                url: self.record[0].to_string(),
                digest: self.record[1].to_string(),
            };
            if !entry.is_valid() {
                self.reject("Digest mismatch");
                continue;
            }

            self.rows_read += 1;
            return Ok(Some(entry));
        }
    }

    /// Reads at most `n` valid rows
    ///
    /// An empty batch means the manifest is exhausted.
    pub fn next_batch(&mut self, n: usize) -> Result<Vec<ManifestEntry>, ManifestError> {
        let mut batch = Vec::with_capacity(n.min(16_384));
        while batch.len() < n {
            match self.next_entry()? {
                Some(entry) => batch.push(entry),
                None => break,
            }
        }
        Ok(batch)
    }

    /// Discards the next `n` valid rows, returning how many were discarded
    pub fn skip(&mut self, n: u64) -> Result<u64, ManifestError> {
        let mut skipped = 0;
        while skipped < n {
            if self.next_entry()?.is_none() {
                break;
            }
            skipped += 1;
        }
        Ok(skipped)
    }

    /// Counts the valid rows of a manifest without keeping them
    pub fn count_rows(path: &Path) -> Result<u64, ManifestError> {
        let mut reader = Self::open(path)?;
        while reader.next_entry()?.is_some() {}
        Ok(reader.rows_read)
    }
}
