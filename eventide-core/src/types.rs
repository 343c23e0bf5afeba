//! # Core Types
//!
//! Fixed-shape records shared by the index engine.
//!
//! ## Binary layout
//!
//! ```text
//! IndexEntry (20 bytes, little-endian)
//! ┌──────────────┬──────────────┬──────────────────┐
//! │ stream: u64  │ version: i32 │ position: i64    │
//! └──────────────┴──────────────┴──────────────────┘
//!
//! Midpoint (28 bytes)
//! ┌──────────────────────────────┬──────────────────┐
//! │ key: IndexEntry (20 bytes)   │ block_pos: i64   │
//! └──────────────────────────────┴──────────────────┘
//! ```

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Version reported for a stream that has no events.
pub const NO_VERSION: i32 = -1;

/// Version assigned to the first event of a stream.
pub const START_VERSION: i32 = 0;

/// Serialized size of an [`IndexEntry`].
pub const ENTRY_SIZE: usize = 8 + 4 + 8;

/// Serialized size of a [`Midpoint`].
pub const MIDPOINT_SIZE: usize = ENTRY_SIZE + 8;

/// Maps `(stream hash, version)` to the byte offset of the event in the log.
///
/// Identity is `(stream, version)`; `position` is payload. Sorting also
/// considers position so that `Ord` agrees with `Eq`, but every search and
/// dedup path in the engine compares [`IndexEntry::key`] only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexEntry {
    pub stream: u64,
    pub version: i32,
    pub position: i64,
}

impl IndexEntry {
    pub const fn new(stream: u64, version: i32, position: i64) -> Self {
        Self { stream, version, position }
    }

    /// Probe entry used for lookups where only the key matters.
    pub const fn probe(stream: u64, version: i32) -> Self {
        Self { stream, version, position: 0 }
    }

    #[inline]
    pub fn key(&self) -> (u64, i32) {
        (self.stream, self.version)
    }

    /// True when both entries refer to the same event slot.
    #[inline]
    pub fn same_key(&self, other: &IndexEntry) -> bool {
        self.key() == other.key()
    }

    #[inline]
    pub fn cmp_key(&self, other: &IndexEntry) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl PartialOrd for IndexEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_key(other)
            .then_with(|| self.position.cmp(&other.position))
    }
}

impl fmt::Display for IndexEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{stream: {}, version: {}, position: {}}}",
            self.stream, self.version, self.position
        )
    }
}

/// First key of a packed block and the file offset where that block starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Midpoint {
    pub key: IndexEntry,
    pub block_position: i64,
}

impl Midpoint {
    pub const fn new(key: IndexEntry, block_position: i64) -> Self {
        Self { key, block_position }
    }

    #[inline]
    pub fn key(&self) -> (u64, i32) {
        self.key.key()
    }
}

impl PartialOrd for Midpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Midpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.block_position.cmp(&other.block_position))
    }
}

/// Iteration order over `(stream, version)` keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    /// Orders two entries so that the one to be emitted first compares `Less`.
    #[inline]
    pub fn order(&self, a: &IndexEntry, b: &IndexEntry) -> Ordering {
        match self {
            Direction::Forward => a.cmp_key(b),
            Direction::Backward => b.cmp_key(a),
        }
    }
}

/// Half-open version range `[start_version, end_version)` of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub stream: u64,
    pub start_version: i32,
    pub end_version: i32,
}

impl Range {
    pub fn of(stream: u64, start_version: i32, end_version: i32) -> Self {
        Self { stream, start_version, end_version }
    }

    /// Every version of `stream`.
    pub fn all_of(stream: u64) -> Self {
        Self::of(stream, START_VERSION, i32::MAX)
    }

    pub fn start(&self) -> IndexEntry {
        IndexEntry::probe(self.stream, self.start_version)
    }

    /// Last key inside the range (inclusive).
    pub fn last(&self) -> IndexEntry {
        IndexEntry::probe(self.stream, self.end_version.saturating_sub(1))
    }

    pub fn is_empty(&self) -> bool {
        self.end_version <= self.start_version
    }

    #[inline]
    pub fn contains(&self, entry: &IndexEntry) -> bool {
        entry.stream == self.stream
            && entry.version >= self.start_version
            && entry.version < self.end_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_ordering_is_by_stream_then_version() {
        let mut entries = vec![
            IndexEntry::new(2, 0, 5),
            IndexEntry::new(1, 3, 9),
            IndexEntry::new(1, 1, 100),
        ];
        entries.sort();
        assert_eq!(
            entries.iter().map(|e| e.key()).collect::<Vec<_>>(),
            vec![(1, 1), (1, 3), (2, 0)]
        );
    }

    #[test]
    fn test_position_is_not_identity() {
        let a = IndexEntry::new(9, 4, 10);
        let b = IndexEntry::new(9, 4, 20);
        assert!(a.same_key(&b));
        assert_eq!(a.cmp_key(&b), Ordering::Equal);
        assert_ne!(a, b);
    }

    #[test]
    fn test_backward_direction_reverses() {
        let a = IndexEntry::probe(1, 1);
        let b = IndexEntry::probe(1, 2);
        assert_eq!(Direction::Forward.order(&a, &b), Ordering::Less);
        assert_eq!(Direction::Backward.order(&a, &b), Ordering::Greater);
    }

    #[test]
    fn test_range_bounds() {
        let range = Range::of(5, 2, 4);
        assert!(!range.contains(&IndexEntry::probe(5, 1)));
        assert!(range.contains(&IndexEntry::probe(5, 2)));
        assert!(range.contains(&IndexEntry::probe(5, 3)));
        assert!(!range.contains(&IndexEntry::probe(5, 4)));
        assert!(!range.contains(&IndexEntry::probe(6, 3)));
        assert_eq!(range.last().version, 3);
        assert!(Range::of(5, 3, 3).is_empty());
    }
}
