//! # Compaction
//!
//! Merges the oldest rolled segments of a level into a single segment one
//! level up. Inputs are read only; the caller swaps the output in and only
//! then hands the job back to [`Compactor::cleanup_inputs`], so a failed
//! compaction never touches its inputs.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use eventide_core::config::Config;
use eventide_core::error::{Error, Result};
use eventide_core::metrics::{Metrics, Timer};
use eventide_core::Direction;

use crate::combiner::{EntrySource, SegmentCombiner};
use crate::segment::{naming, IndexSegment, SegmentConfig, SegmentNamer};

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    pub enabled: bool,
    /// Segments on one level that trigger a merge.
    pub threshold: usize,
    /// Highest level a compaction may produce.
    pub max_levels: u32,
    pub combiner: SegmentCombiner,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 4,
            max_levels: 7,
            combiner: SegmentCombiner::UniqueMerge,
        }
    }
}

impl From<&Config> for CompactionConfig {
    fn from(config: &Config) -> Self {
        Self {
            enabled: config.compaction.enabled,
            threshold: config.compaction.threshold,
            max_levels: config.compaction.max_levels,
            combiner: config.compaction.strategy.into(),
        }
    }
}

/// Segments selected for one merge, oldest first.
#[derive(Debug, Clone)]
pub struct CompactionJob {
    pub level: u32,
    pub inputs: Vec<Arc<IndexSegment>>,
}

impl CompactionJob {
    pub fn input_names(&self) -> Vec<String> {
        self.inputs.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn total_entries(&self) -> u64 {
        self.inputs.iter().map(|s| s.entry_count()).sum()
    }
}

#[derive(Debug)]
pub struct CompactionResult {
    pub level: u32,
    pub output: Arc<IndexSegment>,
    pub input_names: Vec<String>,
    pub entries_read: u64,
    pub entries_written: u64,
}

pub struct Compactor {
    dir: PathBuf,
    config: CompactionConfig,
    segment_config: SegmentConfig,
    namer: Arc<SegmentNamer>,
    metrics: Metrics,
    /// Names of segments owned by a running job.
    compacting: Mutex<HashSet<String>>,
    next_pos: AtomicU64,
}

impl Compactor {
    /// `existing` are the names already in use, so leveled output names never collide.
    pub fn new<'a>(
        dir: PathBuf,
        config: CompactionConfig,
        segment_config: SegmentConfig,
        namer: Arc<SegmentNamer>,
        metrics: Metrics,
        existing: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let next_pos = existing
            .into_iter()
            .filter_map(|name| naming::parse_leveled(namer.prefix(), name))
            .map(|(_, pos)| pos + 1)
            .max()
            .unwrap_or(0);
        Self {
            dir,
            config,
            segment_config,
            namer,
            metrics,
            compacting: Mutex::new(HashSet::new()),
            next_pos: AtomicU64::new(next_pos),
        }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Picks the oldest `threshold` idle read-only segments of `level`.
    ///
    /// `segments` must be ordered oldest data first.
    pub fn pick(&self, level: u32, segments: &[Arc<IndexSegment>]) -> Option<CompactionJob> {
        if !self.config.enabled || level >= self.config.max_levels {
            return None;
        }
        let mut compacting = self.compacting.lock();
        let inputs: Vec<_> = segments
            .iter()
            .filter(|s| s.is_read_only() && s.level() == level && !compacting.contains(s.name()))
            .take(self.config.threshold)
            .cloned()
            .collect();
        if inputs.len() < self.config.threshold {
            return None;
        }
        compacting.extend(inputs.iter().map(|s| s.name().to_string()));
        Some(CompactionJob { level, inputs })
    }

    /// Picks a job on the lowest level that has one.
    pub fn pick_compaction(&self, segments: &[Arc<IndexSegment>]) -> Option<CompactionJob> {
        let mut levels: Vec<u32> = segments.iter().map(|s| s.level()).collect();
        levels.sort_unstable();
        levels.dedup();
        levels.into_iter().find_map(|level| self.pick(level, segments))
    }

    /// Writes the merged output segment. Inputs are left untouched.
    pub fn execute(&self, job: &CompactionJob) -> Result<CompactionResult> {
        let timer = Timer::new("compaction");
        let target = job.level + 1;
        let name = self.namer.leveled(target, self.next_pos.fetch_add(1, Ordering::Relaxed));
        let entries_read = job.total_entries();
        // The output takes the place of its inputs among segments of its level
        let created = job
            .inputs
            .iter()
            .map(|s| s.created())
            .max()
            .unwrap_or_else(naming::creation_stamp);

        info!(
            "Compacting {} segments of level {} ({} entries) into {}",
            job.inputs.len(),
            job.level,
            entries_read,
            name
        );

        let output = IndexSegment::create_sized(
            &self.dir,
            &name,
            target,
            entries_read,
            created,
            self.segment_config.clone(),
            self.metrics.clone(),
        )
        .map_err(|e| self.failed(job, e))?;
        let output = Arc::new(output);

        match self.merge_into(job, &output) {
            Ok(entries_written) => {
                self.metrics.record_compaction(entries_written);
                info!(
                    "Compacted {:?} into {}: {} entries read, {} written in {:?}",
                    job.input_names(),
                    name,
                    entries_read,
                    entries_written,
                    timer.stop()
                );
                Ok(CompactionResult {
                    level: target,
                    output,
                    input_names: job.input_names(),
                    entries_read,
                    entries_written,
                })
            }
            Err(e) => {
                output.mark_for_deletion();
                Err(self.failed(job, e))
            }
        }
    }

    fn merge_into(&self, job: &CompactionJob, output: &Arc<IndexSegment>) -> Result<u64> {
        let mut inputs: Vec<EntrySource> = job
            .inputs
            .iter()
            .map(|s| Box::new(s.iterator(Direction::Forward)) as EntrySource)
            .collect();
        // Merges resolve equal keys in favor of the first input: newest first
        if self.config.combiner != SegmentCombiner::Concatenate {
            inputs.reverse();
        }

        let mut written = 0u64;
        for entry in self.config.combiner.combine(inputs, Direction::Forward) {
            output.append(entry?)?;
            written += 1;
        }
        output.roll(output.level())?;

        // Re-read the sealed file before it may replace anything
        let reopened = IndexSegment::open(&self.dir, output.name(), self.segment_config.clone(), self.metrics.clone())?;
        if reopened.entry_count() != written || !reopened.is_read_only() {
            return Err(Error::corrupt(format!(
                "compaction output {} holds {} entries, expected {}",
                output.name(),
                reopened.entry_count(),
                written
            )));
        }
        Ok(written)
    }

    fn failed(&self, job: &CompactionJob, e: Error) -> Error {
        self.release(job);
        warn!("Compaction of level {} failed: {}", job.level, e);
        Error::Compaction {
            reason: format!("level {}: {}", job.level, e),
        }
    }

    fn release(&self, job: &CompactionJob) {
        let mut compacting = self.compacting.lock();
        for s in &job.inputs {
            compacting.remove(s.name());
        }
    }

    /// Called once the output has replaced the inputs. Input files are
    /// removed when the last reader lets go of them.
    pub fn cleanup_inputs(&self, job: &CompactionJob) {
        for segment in &job.inputs {
            segment.mark_for_deletion();
        }
        self.release(job);
    }

    /// Gives the inputs back without deleting anything.
    pub fn abandon(&self, job: &CompactionJob) {
        self.release(job);
    }
}
