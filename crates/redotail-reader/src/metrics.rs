//! Reader observability metrics.
//!
//! Global `AtomicU64` counters recorded at the I/O and publication points of
//! every reader thread. Lock-free, shared by all sources in the process.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global reader metrics singleton.
pub static GLOBAL_READER_METRICS: ReaderMetrics = ReaderMetrics::new();

/// Atomic counters tracking redo log read activity.
pub struct ReaderMetrics {
    /// Total bytes handed back by the block I/O backends.
    pub bytes_read_total: AtomicU64,
    /// Total blocks published into read rings.
    pub blocks_published_total: AtomicU64,
    /// Checksum verification retries on block 1.
    pub crc_retries_total: AtomicU64,
    /// Log files that reached `FINISHED`.
    pub files_finished_total: AtomicU64,
    /// Online logs abandoned because they were overwritten.
    pub overwrites_total: AtomicU64,
}

impl ReaderMetrics {
    /// Create a zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes_read_total: AtomicU64::new(0),
            blocks_published_total: AtomicU64::new(0),
            crc_retries_total: AtomicU64::new(0),
            files_finished_total: AtomicU64::new(0),
            overwrites_total: AtomicU64::new(0),
        }
    }

    pub fn record_bytes_read(&self, bytes: u64) {
        self.bytes_read_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_blocks_published(&self, blocks: u64) {
        self.blocks_published_total
            .fetch_add(blocks, Ordering::Relaxed);
    }

    pub fn record_crc_retry(&self) {
        self.crc_retries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_file_finished(&self) {
        self.files_finished_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overwrite(&self) {
        self.overwrites_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy for logging and tests.
    #[must_use]
    pub fn snapshot(&self) -> ReaderMetricsSnapshot {
        ReaderMetricsSnapshot {
            bytes_read_total: self.bytes_read_total.load(Ordering::Relaxed),
            blocks_published_total: self.blocks_published_total.load(Ordering::Relaxed),
            crc_retries_total: self.crc_retries_total.load(Ordering::Relaxed),
            files_finished_total: self.files_finished_total.load(Ordering::Relaxed),
            overwrites_total: self.overwrites_total.load(Ordering::Relaxed),
        }
    }
}

impl Default for ReaderMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Frozen view of [`ReaderMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderMetricsSnapshot {
    pub bytes_read_total: u64,
    pub blocks_published_total: u64,
    pub crc_retries_total: u64,
    pub files_finished_total: u64,
    pub overwrites_total: u64,
}

impl fmt::Display for ReaderMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bytes_read={} blocks_published={} crc_retries={} files_finished={} overwrites={}",
            self.bytes_read_total,
            self.blocks_published_total,
            self.crc_retries_total,
            self.files_finished_total,
            self.overwrites_total
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = ReaderMetrics::new();
        metrics.record_bytes_read(512);
        metrics.record_bytes_read(512);
        metrics.record_blocks_published(2);
        metrics.record_file_finished();
        let snap = metrics.snapshot();
        assert_eq!(snap.bytes_read_total, 1024);
        assert_eq!(snap.blocks_published_total, 2);
        assert_eq!(snap.files_finished_total, 1);
        assert_eq!(snap.crc_retries_total, 0);
    }

    #[test]
    fn snapshot_displays_all_fields() {
        let metrics = ReaderMetrics::new();
        metrics.record_crc_retry();
        let line = metrics.snapshot().to_string();
        assert!(line.contains("crc_retries=1"));
        assert!(line.contains("bytes_read=0"));
    }
}
