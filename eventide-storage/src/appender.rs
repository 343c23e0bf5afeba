//! # Index Appender
//!
//! Owns the segment set of the stream index.
//!
//! ```text
//!   oldest data ───────────────────────────────────────────▶ newest
//!   ┌───────────┐ ┌───────────┐ ┌─────────┐ ┌─────────┐ ┌──────────┐
//!   │ level 3   │ │ level 2   │ │ level 1 │ │ level 1 │ │ level 0  │
//!   │ read only │ │ read only │ │ rolled  │ │ rolled  │ │ writable │
//!   └───────────┘ └───────────┘ └─────────┘ └─────────┘ └──────────┘
//!                                                            ▲
//!   lookups walk right to left                        appends land here
//! ```
//!
//! Readers take an `Arc` snapshot of the list and never block writers;
//! rolls and compaction publish a new list atomically.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use eventide_core::config::{Config, NamingStrategy};
use eventide_core::error::{Error, Result, ResultExt};
use eventide_core::metrics::Metrics;
use eventide_core::{Direction, IndexEntry, Range, NO_VERSION};

use crate::combiner::{Combined, SegmentCombiner};
use crate::compaction::{CompactionConfig, CompactionJob, CompactionResult, Compactor};
use crate::manifest::{Manifest, ManifestEntry};
use crate::segment::{
    naming, IndexSegment, SegmentConfig, SegmentInfo, SegmentIterator, SegmentNamer, INDEX_PREFIX,
    SEGMENT_EXT,
};

/// Level of the writable segment.
pub const ACTIVE_LEVEL: u32 = 0;
/// Level a segment is given when it is rolled.
pub const ROLLED_LEVEL: u32 = 1;

#[derive(Debug, Clone)]
pub struct AppenderConfig {
    pub directory: PathBuf,
    pub segment: SegmentConfig,
    pub compaction: CompactionConfig,
    pub naming: NamingStrategy,
}

impl Default for AppenderConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./data/index"),
            segment: SegmentConfig::default(),
            compaction: CompactionConfig::default(),
            naming: NamingStrategy::Timestamp,
        }
    }
}

impl From<&Config> for AppenderConfig {
    fn from(config: &Config) -> Self {
        Self {
            directory: config.index.directory.clone(),
            segment: SegmentConfig::from(config),
            compaction: CompactionConfig::from(config),
            naming: config.index.naming,
        }
    }
}

type Segments = Arc<Vec<Arc<IndexSegment>>>;

/// Merged view over every segment of the index.
pub type IndexIterator = Combined<SegmentIterator>;

pub struct IndexAppender {
    dir: PathBuf,
    config: AppenderConfig,
    metrics: Metrics,
    namer: Arc<SegmentNamer>,
    /// Oldest data first; the last segment is the writable one.
    segments: RwLock<Segments>,
    /// Serializes appends, rolls and segment swaps.
    writer: Mutex<()>,
    manifest: Mutex<Manifest>,
    compactor: Compactor,
}

/// Oldest data first: higher levels before lower, then by creation stamp.
///
/// A compaction output carries the stamp of its newest input, so outputs
/// keep the order of their inputs whichever job finishes first.
fn sort_segments(segments: &mut [Arc<IndexSegment>]) {
    let position = |s: &IndexSegment| naming::parse_leveled(INDEX_PREFIX, s.name()).map(|(_, pos)| pos);
    segments.sort_by(|a, b| {
        b.level()
            .cmp(&a.level())
            .then_with(|| a.created().cmp(&b.created()))
            .then_with(|| position(a).cmp(&position(b)))
            .then_with(|| a.name().cmp(b.name()))
    });
}

fn manifest_entry(segment: &IndexSegment) -> ManifestEntry {
    ManifestEntry {
        name: segment.name().to_string(),
        level: segment.level(),
        created: segment.created(),
        entries: segment.entry_count(),
    }
}

impl IndexAppender {
    /// Opens the index in `config.directory`, creating it if needed.
    pub fn open(config: AppenderConfig, metrics: Metrics) -> Result<Self> {
        let dir = config.directory.clone();
        fs::create_dir_all(&dir)?;

        let mut manifest = Manifest::load_or_create(&dir)?;
        let mut segments = Vec::with_capacity(manifest.segments.len() + 1);
        for entry in &manifest.segments {
            let segment = IndexSegment::open(&dir, &entry.name, config.segment.clone(), metrics.clone())
                .with_context(|| format!("cannot open segment {}", entry.name))?;
            naming::observe_creation_stamp(segment.created());
            segments.push(Arc::new(segment));
        }

        for file in fs::read_dir(&dir)? {
            let path = file?.path();
            if path.extension().map_or(false, |ext| ext == SEGMENT_EXT) {
                let name = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
                if !manifest.contains(name) {
                    warn!("Ignoring segment {} not listed in the manifest", path.display());
                }
            }
        }

        let namer = Arc::new(SegmentNamer::new(INDEX_PREFIX, config.naming));
        sort_segments(&mut segments);

        // A crash can leave more than one writable segment behind
        let writable: Vec<_> = segments.iter().filter(|s| !s.is_read_only()).cloned().collect();
        for segment in writable.iter().take(writable.len().saturating_sub(1)) {
            warn!("Rolling stale writable segment {}", segment.name());
            segment.roll(ROLLED_LEVEL)?;
            manifest.upsert(manifest_entry(segment));
        }
        sort_segments(&mut segments);

        if segments.last().map_or(true, |s| s.is_read_only()) {
            let active = IndexSegment::create(&dir, &namer.next(), ACTIVE_LEVEL, config.segment.clone(), metrics.clone())?;
            manifest.upsert(manifest_entry(&active));
            segments.push(Arc::new(active));
        }
        manifest.save(&dir)?;

        let compactor = Compactor::new(
            dir.clone(),
            config.compaction.clone(),
            config.segment.clone(),
            Arc::clone(&namer),
            metrics.clone(),
            segments.iter().map(|s| s.name()),
        );

        info!("Opened index at {} with {} segments", dir.display(), segments.len());

        Ok(Self {
            dir,
            config,
            metrics,
            namer,
            segments: RwLock::new(Arc::new(segments)),
            writer: Mutex::new(()),
            manifest: Mutex::new(manifest),
            compactor,
        })
    }

    /// Current segment list, oldest data first.
    pub fn snapshot(&self) -> Segments {
        Arc::clone(&self.segments.read())
    }

    fn active(&self) -> Result<Arc<IndexSegment>> {
        self.segments
            .read()
            .last()
            .cloned()
            .ok_or_else(|| Error::Internal {
                message: "index has no writable segment".to_string(),
            })
    }

    /// Appends one entry to the writable segment, rolling it once full.
    ///
    /// Keys must not decrease within a segment.
    pub fn append(&self, entry: IndexEntry) -> Result<()> {
        let _writer = self.writer.lock();
        let active = self.active()?;
        active.append(entry)?;
        self.metrics.record_append(1);
        if active.is_full() {
            self.roll_locked()?;
        }
        Ok(())
    }

    /// Seals the writable segment and opens a fresh one.
    pub fn roll(&self) -> Result<()> {
        let _writer = self.writer.lock();
        self.roll_locked()
    }

    fn roll_locked(&self) -> Result<()> {
        let active = self.active()?;
        if active.is_empty() {
            debug!("Skipping roll of empty segment {}", active.name());
            return Ok(());
        }
        active.roll(ROLLED_LEVEL)?;

        let next = Arc::new(IndexSegment::create(
            &self.dir,
            &self.namer.next(),
            ACTIVE_LEVEL,
            self.config.segment.clone(),
            self.metrics.clone(),
        )?);
        {
            let mut manifest = self.manifest.lock();
            manifest.upsert(manifest_entry(&active));
            manifest.upsert(manifest_entry(&next));
            manifest.save(&self.dir)?;
        }

        let mut segments = self.snapshot().as_ref().clone();
        segments.push(next);
        sort_segments(&mut segments);
        *self.segments.write() = Arc::new(segments);

        self.metrics.record_roll();
        Ok(())
    }

    /// Makes everything appended so far durable.
    pub fn flush(&self) -> Result<()> {
        let _writer = self.writer.lock();
        let active = self.active()?;
        active.flush()?;
        let mut manifest = self.manifest.lock();
        manifest.upsert(manifest_entry(&active));
        manifest.save(&self.dir)
    }

    /// Highest version of `stream`, or [`NO_VERSION`] if it has none.
    pub fn version(&self, stream: u64) -> Result<i32> {
        self.metrics.record_lookup();
        for segment in self.snapshot().iter().rev() {
            if let Some(version) = segment.version(stream)? {
                return Ok(version);
            }
        }
        Ok(NO_VERSION)
    }

    /// Looks up one event slot, newest segment first.
    pub fn get(&self, stream: u64, version: i32) -> Result<Option<IndexEntry>> {
        self.metrics.record_lookup();
        for segment in self.snapshot().iter().rev() {
            if let Some(entry) = segment.get(stream, version)? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Every entry of the index in key order.
    ///
    /// Keys present in several segments are reported once, from the newest.
    pub fn iterator(&self, direction: Direction) -> IndexIterator {
        let inputs = self
            .snapshot()
            .iter()
            .rev()
            .map(|s| s.iterator(direction))
            .collect();
        SegmentCombiner::UniqueMerge.combine(inputs, direction)
    }

    pub fn iterator_range(&self, range: Range, direction: Direction) -> IndexIterator {
        let inputs = self
            .snapshot()
            .iter()
            .rev()
            .map(|s| s.iterator_range(range, direction))
            .collect();
        SegmentCombiner::UniqueMerge.combine(inputs, direction)
    }

    /// Runs compaction until no level has enough segments. Returns the
    /// number of merges performed.
    pub fn compact(&self) -> Result<usize> {
        let mut merges = 0;
        while let Some(job) = self.compactor.pick_compaction(&self.snapshot()) {
            let result = self.compactor.execute(&job)?;
            self.swap(&job, result)?;
            merges += 1;
        }
        Ok(merges)
    }

    /// Runs [`IndexAppender::compact`] on a background thread.
    pub fn spawn_compaction(self: &Arc<Self>) -> Result<JoinHandle<Result<usize>>> {
        let appender = Arc::clone(self);
        std::thread::Builder::new()
            .name("eventide-compaction".to_string())
            .spawn(move || {
                let result = appender.compact();
                if let Err(e) = &result {
                    error!("Background compaction failed: {}", e);
                }
                result
            })
            .map_err(Error::from)
    }

    /// Replaces the job's inputs with the compaction output.
    fn swap(&self, job: &CompactionJob, result: CompactionResult) -> Result<()> {
        let _writer = self.writer.lock();
        {
            let mut manifest = self.manifest.lock();
            manifest.remove_segments(&result.input_names);
            manifest.upsert(manifest_entry(&result.output));
            if let Err(e) = manifest.save(&self.dir) {
                // Put the inputs back and drop the output
                for input in &job.inputs {
                    manifest.upsert(manifest_entry(input));
                }
                manifest.remove_segments(&[result.output.name().to_string()]);
                result.output.mark_for_deletion();
                self.compactor.abandon(job);
                return Err(e);
            }
        }

        let mut segments: Vec<_> = self
            .snapshot()
            .iter()
            .filter(|s| !result.input_names.iter().any(|n| n == s.name()))
            .cloned()
            .collect();
        segments.push(Arc::clone(&result.output));
        sort_segments(&mut segments);
        *self.segments.write() = Arc::new(segments);

        self.compactor.cleanup_inputs(job);
        debug!(
            "Swapped {:?} for {} at level {}",
            result.input_names,
            result.output.name(),
            result.level
        );
        Ok(())
    }

    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.snapshot().iter().map(|s| s.info()).collect()
    }

    pub fn segment_count(&self) -> usize {
        self.snapshot().len()
    }

    pub fn entry_count(&self) -> u64 {
        self.snapshot().iter().map(|s| s.entry_count()).sum()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn directory(&self) -> &PathBuf {
        &self.dir
    }
}
