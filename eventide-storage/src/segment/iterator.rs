//! Lazy iteration over the entries of one segment.

use std::collections::VecDeque;
use std::sync::Arc;

use eventide_core::error::Result;
use eventide_core::{Direction, IndexEntry, Range};

use crate::segment::IndexSegment;

enum Chunk {
    Block(usize),
    /// Entries not yet packed when the iterator was created.
    Pending(Vec<IndexEntry>),
}

/// Iterator over a segment, one decoded block at a time.
///
/// The set of blocks is fixed when the iterator is created; entries
/// appended afterwards are not observed. Holding the iterator keeps the
/// segment alive even if compaction has merged it away.
pub struct SegmentIterator {
    segment: Arc<IndexSegment>,
    direction: Direction,
    range: Option<Range>,
    chunks: VecDeque<Chunk>,
    current: std::vec::IntoIter<IndexEntry>,
    done: bool,
}

impl SegmentIterator {
    pub(crate) fn new(segment: Arc<IndexSegment>, direction: Direction, range: Option<Range>) -> Self {
        let (block_count, pending) = segment.snapshot();
        let empty_range = range.map_or(false, |r| r.is_empty());

        let mut chunks = VecDeque::new();
        if block_count > 0 {
            let blocks: Box<dyn Iterator<Item = usize>> = match (direction, &range) {
                (Direction::Forward, Some(r)) => Box::new(segment.block_for(&r.start())..block_count),
                (Direction::Forward, None) => Box::new(0..block_count),
                (Direction::Backward, Some(r)) => {
                    // Last block whose first key is within the range
                    let upper = IndexEntry::probe(r.stream, r.end_version);
                    let end = (segment.block_for(&upper) + 1).min(block_count);
                    Box::new((0..end).rev())
                }
                (Direction::Backward, None) => Box::new((0..block_count).rev()),
            };
            chunks.extend(blocks.map(Chunk::Block));
        }
        if !pending.is_empty() {
            match direction {
                Direction::Forward => chunks.push_back(Chunk::Pending(pending)),
                Direction::Backward => chunks.push_front(Chunk::Pending(pending)),
            }
        }

        Self {
            segment,
            direction,
            range,
            chunks,
            current: Vec::new().into_iter(),
            done: empty_range,
        }
    }

    fn load_next_chunk(&mut self) -> Result<bool> {
        let Some(chunk) = self.chunks.pop_front() else {
            return Ok(false);
        };
        let mut entries = match chunk {
            Chunk::Pending(entries) => entries,
            Chunk::Block(idx) => match self.segment.read_block(idx)? {
                Some(block) => block.into_entries(),
                None => Vec::new(),
            },
        };
        if self.direction == Direction::Backward {
            entries.reverse();
        }
        self.current = entries.into_iter();
        Ok(true)
    }

    /// Whether `entry` is before the range start in iteration order.
    fn before_range(&self, entry: &IndexEntry) -> bool {
        let Some(range) = &self.range else {
            return false;
        };
        match self.direction {
            Direction::Forward => entry.key() < range.start().key(),
            Direction::Backward => entry.key() > range.last().key(),
        }
    }

    fn past_range(&self, entry: &IndexEntry) -> bool {
        let Some(range) = &self.range else {
            return false;
        };
        match self.direction {
            Direction::Forward => entry.key() > range.last().key(),
            Direction::Backward => entry.key() < range.start().key(),
        }
    }
}

impl Iterator for SegmentIterator {
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            if let Some(entry) = self.current.next() {
                if self.before_range(&entry) {
                    continue;
                }
                if self.past_range(&entry) {
                    self.done = true;
                    return None;
                }
                return Some(Ok(entry));
            }
            match self.load_next_chunk() {
                Ok(true) => {}
                Ok(false) => self.done = true,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}
