//! # Eventide Storage
//!
//! Segmented, append-only index that maps `(stream, version)` to the
//! position of an event in the event log.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Write Path                             │
//! │                                                             │
//! │  Streams ──> version check ──> TableIndex (MemIndex)        │
//! │                                     │                       │
//! │                                     ▼ threshold reached     │
//! │                IndexAppender ──> active segment ──> roll    │
//! │                                     │                       │
//! │                                     ▼                       │
//! │                   blocks + midpoints + bloom filter         │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Read Path                              │
//! │                                                             │
//! │  Lookup ──> MemIndex ──> segments (newest first)            │
//! │                              │                              │
//! │                              ▼                              │
//! │              Bloom filter ──> midpoints ──> one block       │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Compaction                             │
//! │                                                             │
//! │  N rolled segments of level L ──> SegmentCombiner           │
//! │                                       │                     │
//! │                                       ▼                     │
//! │              one segment of level L+1, swapped in via the   │
//! │              manifest; inputs deleted on last release       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod appender;
pub mod buffer_pool;
pub mod combiner;
pub mod compaction;
pub mod manifest;
pub mod segment;
pub mod streams;
pub mod table_index;

pub use appender::{AppenderConfig, IndexAppender, IndexIterator};
pub use buffer_pool::{BufferPool, PooledBuffer};
pub use combiner::{Combined, EntrySource, MergeIter, SegmentCombiner};
pub use compaction::{CompactionConfig, CompactionJob, CompactionResult, Compactor};
pub use manifest::{Manifest, ManifestEntry};
pub use segment::{BloomFilter, IndexBlock, IndexSegment, Midpoints, SegmentConfig, SegmentIterator};
pub use streams::{Permission, StreamMetadata, StreamState, Streams};
pub use table_index::{MemIndex, TableIndex};
