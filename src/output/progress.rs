//! Live progress counters for a scrape run
//!
//! Counters are atomics so every scrape task can update them without a lock.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// How one item settled, as far as progress reporting is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Persisted with status `success` or `partial`
    Success,
    Failed,
    Blocked,
    NotFound,
}

/// Derived view of the counters at one instant
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub success: u64,
    pub failed: u64,
    pub blocked: u64,
    pub not_found: u64,

    /// Every settled item
    pub completed: u64,
    pub elapsed: Duration,
    pub items_per_minute: f64,

    /// Blocked items as a percentage of completed ones
    pub block_rate_percent: f64,
}

impl ProgressSnapshot {
    /// Failed and blocked items together
    pub fn total_failed(&self) -> u64 {
        self.failed + self.blocked
    }
}

/// Per-run progress tracker
pub struct ProgressTracker {
    success: AtomicU64,
    failed: AtomicU64,
    blocked: AtomicU64,
    not_found: AtomicU64,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            success: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            not_found: AtomicU64::new(0),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Records one settled item
    ///
    /// # Returns
    ///
    /// The number of items settled so far, including this one
    pub fn record(&self, event: ProgressEvent) -> u64 {
        let counter = match event {
            ProgressEvent::Success => &self.success,
            ProgressEvent::Failed => &self.failed,
            ProgressEvent::Blocked => &self.blocked,
            ProgressEvent::NotFound => &self.not_found,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.completed()
    }

    pub fn completed(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
            + self.failed.load(Ordering::Relaxed)
            + self.blocked.load(Ordering::Relaxed)
            + self.not_found.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    /// Wall-clock time the tracker was created
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let success = self.success.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let blocked = self.blocked.load(Ordering::Relaxed);
        let not_found = self.not_found.load(Ordering::Relaxed);
        let completed = success + failed + blocked + not_found;
        let elapsed = self.started.elapsed();

        let minutes = elapsed.as_secs_f64() / 60.0;
        let items_per_minute = if minutes > 0.0 {
            completed as f64 / minutes
        } else {
            0.0
        };
        let block_rate_percent = if completed > 0 {
            blocked as f64 / completed as f64 * 100.0
        } else {
            0.0
        };

        ProgressSnapshot {
            success,
            failed,
            blocked,
            not_found,
            completed,
            elapsed,
            items_per_minute,
            block_rate_percent,
        }
    }

    /// Logs a one-line progress report
    pub fn log_progress(&self, retailer: &str, total: Option<u64>) {
        let snap = self.snapshot();
        let position = match total {
            Some(total) if total > 0 => format!(
                "{}/{} ({:.1}%)",
                snap.completed,
                total,
                snap.completed as f64 / total as f64 * 100.0
            ),
            _ => snap.completed.to_string(),
        };

        tracing::info!(
            "[{}] Progress: {} | ok {} | failed {} | blocked {} | not found {} | {:.0}/min | block rate {:.1}%",
            retailer,
            position,
            snap.success,
            snap.failed,
            snap.blocked,
            snap.not_found,
            snap.items_per_minute,
            snap.block_rate_percent
        );
    }
}
