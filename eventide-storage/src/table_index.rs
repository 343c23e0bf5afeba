//! In-memory front of the index.
//!
//! Event writers produce entries in arrival order, not key order, while a
//! segment only accepts ascending keys. [`TableIndex`] buffers entries in a
//! sorted [`MemIndex`] and writes it out to the [`IndexAppender`] as one
//! sorted run once it reaches the flush threshold.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use eventide_core::config::Config;
use eventide_core::error::Result;
use eventide_core::metrics::Metrics;
use eventide_core::{Direction, IndexEntry, Range};

use crate::appender::{AppenderConfig, IndexAppender};
use crate::combiner::{Combined, EntrySource, SegmentCombiner};

/// Sorted in-memory entries keyed by `(stream, version)`.
#[derive(Debug, Default, Clone)]
pub struct MemIndex {
    entries: BTreeMap<(u64, i32), i64>,
}

fn stream_keys(stream: u64) -> RangeInclusive<(u64, i32)> {
    (stream, i32::MIN)..=(stream, i32::MAX)
}

impl MemIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry; a later write of the same key replaces the earlier one.
    pub fn add(&mut self, entry: IndexEntry) {
        self.entries.insert(entry.key(), entry.position);
    }

    pub fn version(&self, stream: u64) -> Option<i32> {
        self.entries
            .range(stream_keys(stream))
            .next_back()
            .map(|((_, version), _)| *version)
    }

    pub fn get(&self, stream: u64, version: i32) -> Option<IndexEntry> {
        self.entries
            .get(&(stream, version))
            .map(|position| IndexEntry::new(stream, version, *position))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = IndexEntry> + '_ {
        self.entries
            .iter()
            .map(|(&(stream, version), &position)| IndexEntry::new(stream, version, position))
    }

    /// Copy of the entries in `range` (or all of them), ordered by `direction`.
    pub fn collect(&self, direction: Direction, range: Option<Range>) -> Vec<IndexEntry> {
        let mut out: Vec<_> = match range {
            Some(r) if r.is_empty() => Vec::new(),
            Some(r) => self
                .entries
                .range(r.start().key()..=r.last().key())
                .map(|(&(s, v), &p)| IndexEntry::new(s, v, p))
                .collect(),
            None => self.iter().collect(),
        };
        if direction == Direction::Backward {
            out.reverse();
        }
        out
    }
}

pub struct TableIndex {
    appender: Arc<IndexAppender>,
    active: RwLock<MemIndex>,
    /// MemIndex being written to the appender; still visible to readers.
    flushing: RwLock<Option<Arc<MemIndex>>>,
    flush_threshold: usize,
    flush_lock: Mutex<()>,
}

impl TableIndex {
    /// Opens the appender in `config.index.directory` and buffers up to
    /// `config.index.memindex_flush_threshold` entries in memory.
    pub fn open(config: &Config, metrics: Metrics) -> Result<Self> {
        let appender = IndexAppender::open(AppenderConfig::from(config), metrics)?;
        Self::new(Arc::new(appender), config.index.memindex_flush_threshold)
    }

    pub fn new(appender: Arc<IndexAppender>, flush_threshold: usize) -> Result<Self> {
        // Flushed runs must start in a fresh segment
        appender.roll()?;
        Ok(Self {
            appender,
            active: RwLock::new(MemIndex::new()),
            flushing: RwLock::new(None),
            flush_threshold: flush_threshold.max(1),
            flush_lock: Mutex::new(()),
        })
    }

    pub fn add(&self, entry: IndexEntry) -> Result<()> {
        let len = {
            let mut active = self.active.write();
            active.add(entry);
            active.len()
        };
        if len >= self.flush_threshold {
            self.flush()?;
        }
        Ok(())
    }

    /// Writes the buffered entries to a new segment and rolls it.
    pub fn flush(&self) -> Result<()> {
        let _flush = self.flush_lock.lock();
        let mem = {
            let mut active = self.active.write();
            if active.is_empty() {
                return Ok(());
            }
            let mem = Arc::new(std::mem::take(&mut *active));
            *self.flushing.write() = Some(Arc::clone(&mem));
            mem
        };

        let result = mem
            .iter()
            .try_for_each(|entry| self.appender.append(entry))
            .and_then(|_| self.appender.roll());

        match result {
            Ok(()) => {
                info!("Flushed {} in-memory index entries", mem.len());
                *self.flushing.write() = None;
                Ok(())
            }
            Err(e) => {
                // Keep the entries readable and retry them on the next flush;
                // the partially written segment is sealed so the retry starts clean
                let mut active = self.active.write();
                for entry in mem.iter() {
                    if active.get(entry.stream, entry.version).is_none() {
                        active.add(entry);
                    }
                }
                *self.flushing.write() = None;
                if let Err(roll_err) = self.appender.roll() {
                    warn!("Failed to seal segment after failed index flush: {}", roll_err);
                }
                Err(e)
            }
        }
    }

    pub fn version(&self, stream: u64) -> Result<i32> {
        if let Some(version) = self.active.read().version(stream) {
            return Ok(version);
        }
        if let Some(mem) = self.flushing.read().as_ref() {
            if let Some(version) = mem.version(stream) {
                return Ok(version);
            }
        }
        self.appender.version(stream)
    }

    pub fn get(&self, stream: u64, version: i32) -> Result<Option<IndexEntry>> {
        if let Some(entry) = self.active.read().get(stream, version) {
            return Ok(Some(entry));
        }
        if let Some(mem) = self.flushing.read().as_ref() {
            if let Some(entry) = mem.get(stream, version) {
                return Ok(Some(entry));
            }
        }
        self.appender.get(stream, version)
    }

    /// All entries in memory and on disk, in key order.
    pub fn iterator(&self, direction: Direction) -> Combined<EntrySource> {
        self.merged(direction, None)
    }

    pub fn iterator_range(&self, range: Range, direction: Direction) -> Combined<EntrySource> {
        self.merged(direction, Some(range))
    }

    fn merged(&self, direction: Direction, range: Option<Range>) -> Combined<EntrySource> {
        // Newest first so that in-memory entries shadow flushed ones
        let mut inputs: Vec<EntrySource> = Vec::with_capacity(3);
        let active = self.active.read().collect(direction, range);
        inputs.push(Box::new(active.into_iter().map(Ok)));
        if let Some(mem) = self.flushing.read().as_ref() {
            inputs.push(Box::new(mem.collect(direction, range).into_iter().map(Ok)));
        }
        let on_disk = match range {
            Some(r) => self.appender.iterator_range(r, direction),
            None => self.appender.iterator(direction),
        };
        inputs.push(Box::new(on_disk));
        SegmentCombiner::UniqueMerge.combine(inputs, direction)
    }

    pub fn in_memory(&self) -> usize {
        self.active.read().len()
    }

    pub fn appender(&self) -> &Arc<IndexAppender> {
        &self.appender
    }
}
