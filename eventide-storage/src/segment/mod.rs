//! Index segments: append-only files of packed index blocks.
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Segment File (<name>.idx)                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │ Header (40 bytes)                                   │    │
//! │  │ [magic][format][level][created][state][entries]     │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! │                                                             │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Blocks                           │    │
//! │  │  ┌──────────────────────────────────────────────┐   │    │
//! │  │  │ [payload_len][raw_len][codec][crc32]         │   │    │
//! │  │  │ payload = codec(                             │   │    │
//! │  │  │   [stream][run][(version, position) × run]   │   │    │
//! │  │  │   ...                                        │   │    │
//! │  │  │ )                                            │   │    │
//! │  │  └──────────────────────────────────────────────┘   │    │
//! │  │  Block 2...                                         │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!
//!   <name>.mdp   midpoints: first key + offset of every block
//!   <name>.ftr   bloom filter over the stream hashes in the segment

mod block;
mod bloom;
mod compression;
mod index_segment;
mod iterator;
mod midpoints;
pub mod naming;
mod types;

pub use block::{IndexBlock, PackedBlock};
pub use bloom::BloomFilter;
pub use compression::{BlockCodec, CompressionType};
pub use index_segment::{segment_path, IndexSegment};
pub use iterator::SegmentIterator;
pub use midpoints::Midpoints;
pub use naming::{SegmentNamer, INDEX_PREFIX};
pub use types::{
    SegmentConfig, SegmentHeader, SegmentInfo, SegmentState, BLOCK_HEADER_SIZE, BLOOM_EXT,
    HEADER_SIZE, MIDPOINTS_EXT, SEGMENT_EXT, SEGMENT_FORMAT_VERSION, SEGMENT_MAGIC,
};
