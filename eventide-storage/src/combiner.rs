//! # Segment Combiners
//!
//! Fold N sorted entry sources into one sorted stream.
//!
//! - [`SegmentCombiner::Concatenate`] drains each input in turn.
//! - [`SegmentCombiner::NonUniqueMerge`] k-way merges and keeps duplicates.
//! - [`SegmentCombiner::UniqueMerge`] k-way merges and drops a key equal to
//!   the one just emitted.
//!
//! When several inputs hold the same key, the input with the lowest index
//! is emitted first, so a unique merge keeps the entry from the first input.
//! Compaction relies on this: it passes segments newest first so that the
//! latest write of a key survives.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use eventide_core::config::CombinerStrategy;
use eventide_core::error::{Error, Result};
use eventide_core::{Direction, IndexEntry};

/// Boxed entry source, the input type used across the storage crate.
pub type EntrySource = Box<dyn Iterator<Item = Result<IndexEntry>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentCombiner {
    Concatenate,
    UniqueMerge,
    NonUniqueMerge,
}

impl From<CombinerStrategy> for SegmentCombiner {
    fn from(strategy: CombinerStrategy) -> Self {
        match strategy {
            CombinerStrategy::Concatenate => SegmentCombiner::Concatenate,
            CombinerStrategy::UniqueMerge => SegmentCombiner::UniqueMerge,
            CombinerStrategy::NonUniqueMerge => SegmentCombiner::NonUniqueMerge,
        }
    }
}

impl SegmentCombiner {
    /// Combines `inputs`, each already sorted in `direction`.
    pub fn combine<I>(self, inputs: Vec<I>, direction: Direction) -> Combined<I>
    where
        I: Iterator<Item = Result<IndexEntry>>,
    {
        match self {
            SegmentCombiner::Concatenate => Combined::Concat { inputs, current: 0 },
            SegmentCombiner::UniqueMerge => Combined::Merge(MergeIter::new(inputs, direction, true)),
            SegmentCombiner::NonUniqueMerge => Combined::Merge(MergeIter::new(inputs, direction, false)),
        }
    }
}

pub enum Combined<I> {
    Concat { inputs: Vec<I>, current: usize },
    Merge(MergeIter<I>),
}

impl<I> Iterator for Combined<I>
where
    I: Iterator<Item = Result<IndexEntry>>,
{
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Combined::Concat { inputs, current } => {
                while let Some(input) = inputs.get_mut(*current) {
                    match input.next() {
                        Some(item) => return Some(item),
                        None => *current += 1,
                    }
                }
                None
            }
            Combined::Merge(merge) => merge.next(),
        }
    }
}

/// Head of one input inside the merge heap.
struct Head {
    entry: IndexEntry,
    rank: usize,
    direction: Direction,
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    // BinaryHeap pops the greatest: the entry due first, then the lowest rank
    fn cmp(&self, other: &Self) -> Ordering {
        self.direction
            .order(&other.entry, &self.entry)
            .then_with(|| other.rank.cmp(&self.rank))
    }
}

pub struct MergeIter<I> {
    inputs: Vec<I>,
    heap: BinaryHeap<Head>,
    direction: Direction,
    unique: bool,
    last: Option<IndexEntry>,
    error: Option<Error>,
    done: bool,
}

impl<I> MergeIter<I>
where
    I: Iterator<Item = Result<IndexEntry>>,
{
    fn new(inputs: Vec<I>, direction: Direction, unique: bool) -> Self {
        let mut merge = Self {
            heap: BinaryHeap::with_capacity(inputs.len()),
            inputs,
            direction,
            unique,
            last: None,
            error: None,
            done: false,
        };
        for rank in 0..merge.inputs.len() {
            if let Err(e) = merge.advance(rank, None) {
                merge.error = Some(e);
                break;
            }
        }
        merge
    }

    /// Pulls the next entry of input `rank` onto the heap.
    fn advance(&mut self, rank: usize, previous: Option<&IndexEntry>) -> Result<()> {
        match self.inputs[rank].next() {
            Some(Ok(entry)) => {
                if let Some(prev) = previous {
                    if self.direction.order(&entry, prev) == Ordering::Less {
                        return Err(Error::protocol(format!(
                            "merge input {} is not sorted: {} after {}",
                            rank, entry, prev
                        )));
                    }
                }
                self.heap.push(Head {
                    entry,
                    rank,
                    direction: self.direction,
                });
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
        }
    }
}

impl<I> Iterator for MergeIter<I>
where
    I: Iterator<Item = Result<IndexEntry>>,
{
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(e) = self.error.take() {
            self.done = true;
            return Some(Err(e));
        }
        while let Some(head) = self.heap.pop() {
            if let Err(e) = self.advance(head.rank, Some(&head.entry)) {
                self.done = true;
                return Some(Err(e));
            }
            if self.unique {
                if let Some(last) = &self.last {
                    if last.same_key(&head.entry) {
                        continue;
                    }
                }
            }
            self.last = Some(head.entry);
            return Some(Ok(head.entry));
        }
        self.done = true;
        None
    }
}
