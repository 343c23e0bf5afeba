//! Segment file names.
//!
//! Fresh segments are named by the configured [`NamingStrategy`]; segments
//! produced by compaction use the leveled form `<prefix>-<level:06>_<pos>`.

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

use eventide_core::config::NamingStrategy;

pub const INDEX_PREFIX: &str = "index";

#[derive(Debug)]
pub struct SegmentNamer {
    prefix: String,
    strategy: NamingStrategy,
    last_timestamp: AtomicU64,
}

impl SegmentNamer {
    pub fn new(prefix: impl Into<String>, strategy: NamingStrategy) -> Self {
        Self {
            prefix: prefix.into(),
            strategy,
            last_timestamp: AtomicU64::new(0),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Name for a newly created segment.
    pub fn next(&self) -> String {
        let suffix = match self.strategy {
            NamingStrategy::Timestamp => self.unique_timestamp().to_string(),
            NamingStrategy::ShortUuid => Uuid::new_v4().simple().to_string()[..8].to_string(),
            NamingStrategy::Uuid => Uuid::new_v4().to_string(),
        };
        format!("{}-{}", self.prefix, suffix)
    }

    /// Name for the `pos`-th segment written at `level`.
    pub fn leveled(&self, level: u32, pos: u64) -> String {
        leveled_name(&self.prefix, level, pos)
    }

    /// Millisecond timestamp, bumped past the previous one when two segments
    /// are created within the same millisecond.
    fn unique_timestamp(&self) -> u64 {
        bump_past(&self.last_timestamp, now_millis())
    }
}

/// Last creation stamp handed out by this process.
static LAST_CREATED: AtomicU64 = AtomicU64::new(0);

fn bump_past(last: &AtomicU64, now: u64) -> u64 {
    let mut prev = last.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match last.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

/// Creation stamp for a fresh segment, strictly greater than every stamp
/// handed out or observed before. Segments on one level are ordered by it.
pub fn creation_stamp() -> u64 {
    bump_past(&LAST_CREATED, now_millis())
}

/// Records a stamp read back from disk so later stamps sort after it.
pub fn observe_creation_stamp(created: u64) {
    LAST_CREATED.fetch_max(created, Ordering::AcqRel);
}

pub fn leveled_name(prefix: &str, level: u32, pos: u64) -> String {
    format!("{}-{:06}_{}", prefix, level, pos)
}

/// Parses `(level, pos)` back out of a leveled name.
pub fn parse_leveled(prefix: &str, name: &str) -> Option<(u32, u64)> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('-')?;
    let (level, pos) = rest.split_once('_')?;
    if level.len() != 6 {
        return None;
    }
    Some((level.parse().ok()?, pos.parse().ok()?))
}

pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
