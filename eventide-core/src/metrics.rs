//! # Metrics
//!
//! Counters for the index write, read and compaction paths.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Metrics collector
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    // Write path
    entries_appended: AtomicU64,
    blocks_written: AtomicU64,
    bytes_written: AtomicU64,
    segments_rolled: AtomicU64,

    // Read path
    lookups: AtomicU64,
    bloom_skips: AtomicU64,
    blocks_read: AtomicU64,

    // Maintenance
    compactions: AtomicU64,
    entries_compacted: AtomicU64,

    // Streams
    version_conflicts: AtomicU64,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_append(&self, count: u64) {
        self.inner.entries_appended.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_block_write(&self, bytes: u64) {
        self.inner.blocks_written.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_roll(&self) {
        self.inner.segments_rolled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lookup(&self) {
        self.inner.lookups.fetch_add(1, Ordering::Relaxed);
    }

    /// A segment was skipped because its bloom filter ruled the key out.
    pub fn record_bloom_skip(&self) {
        self.inner.bloom_skips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_block_read(&self) {
        self.inner.blocks_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compaction(&self, entries: u64) {
        self.inner.compactions.fetch_add(1, Ordering::Relaxed);
        self.inner.entries_compacted.fetch_add(entries, Ordering::Relaxed);
    }

    pub fn record_version_conflict(&self) {
        self.inner.version_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let i = &self.inner;
        MetricsSnapshot {
            entries_appended: i.entries_appended.load(Ordering::Relaxed),
            blocks_written: i.blocks_written.load(Ordering::Relaxed),
            bytes_written: i.bytes_written.load(Ordering::Relaxed),
            segments_rolled: i.segments_rolled.load(Ordering::Relaxed),
            lookups: i.lookups.load(Ordering::Relaxed),
            bloom_skips: i.bloom_skips.load(Ordering::Relaxed),
            blocks_read: i.blocks_read.load(Ordering::Relaxed),
            compactions: i.compactions.load(Ordering::Relaxed),
            entries_compacted: i.entries_compacted.load(Ordering::Relaxed),
            version_conflicts: i.version_conflicts.load(Ordering::Relaxed),
        }
    }
}

/// Metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub entries_appended: u64,
    pub blocks_written: u64,
    pub bytes_written: u64,
    pub segments_rolled: u64,
    pub lookups: u64,
    pub bloom_skips: u64,
    pub blocks_read: u64,
    pub compactions: u64,
    pub entries_compacted: u64,
    pub version_conflicts: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    name: String,
}

impl Timer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop timer and log duration
    pub fn stop(self) -> Duration {
        let duration = self.elapsed();
        tracing::debug!(
            name = %self.name,
            duration_ms = duration.as_millis() as u64,
            "Operation completed"
        );
        duration
    }
}
