//! Segment types and configuration

use std::path::PathBuf;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use eventide_core::config::Config;
use eventide_core::error::{Error, Result};

use crate::buffer_pool::{BufferPool, DEFAULT_POOL_SIZE};
use crate::segment::compression::{BlockCodec, CompressionType};

pub const SEGMENT_MAGIC: &[u8; 8] = b"EVTIDX01";
pub const SEGMENT_FORMAT_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 40;
/// `[payload_len: u32][raw_len: u32][codec: u8][crc32: u32]`
pub const BLOCK_HEADER_SIZE: usize = 4 + 4 + 1 + 4;

pub const SEGMENT_EXT: &str = "idx";
pub const MIDPOINTS_EXT: &str = "mdp";
pub const BLOOM_EXT: &str = "ftr";

pub const DEFAULT_BLOCK_SIZE: usize = 4096;
pub const DEFAULT_SEGMENT_SIZE: u64 = 32 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct SegmentConfig {
    pub block_size: usize,
    pub max_segment_size: u64,
    pub compression: CompressionType,
    pub compression_level: i32,
    pub bloom_false_positive_rate: f64,
    pub bloom_expected_entries: u64,
    pub bloom_seed: u64,
    /// Scratch buffers for framing blocks, shared by every segment of an index.
    pub buffers: BufferPool,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_segment_size: DEFAULT_SEGMENT_SIZE,
            compression: CompressionType::Snappy,
            compression_level: 3,
            bloom_false_positive_rate: 0.01,
            bloom_expected_entries: 100_000,
            bloom_seed: 0,
            buffers: BufferPool::new(DEFAULT_POOL_SIZE, DEFAULT_BLOCK_SIZE + BLOCK_HEADER_SIZE),
        }
    }
}

impl SegmentConfig {
    pub fn codec(&self) -> BlockCodec {
        BlockCodec::new(self.compression, self.compression_level)
    }
}

impl From<&Config> for SegmentConfig {
    fn from(config: &Config) -> Self {
        let index = &config.index;
        Self {
            block_size: index.block_size,
            max_segment_size: index.segment_size,
            compression: index.compression.algorithm.into(),
            compression_level: index.compression.level,
            bloom_false_positive_rate: index.bloom.false_positive_rate,
            bloom_expected_entries: index.bloom.expected_entries,
            bloom_seed: index.bloom.seed,
            buffers: BufferPool::new(index.buffer_pool_size, index.block_size + BLOCK_HEADER_SIZE),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SegmentState {
    Writable = 0,
    ReadOnly = 1,
}

impl TryFrom<u8> for SegmentState {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SegmentState::Writable),
            1 => Ok(SegmentState::ReadOnly),
            _ => Err(Error::corrupt(format!("Invalid segment state: {}", value))),
        }
    }
}

/// Fixed header at offset 0 of every segment file.
///
/// ```text
/// [magic: 8][format: u32][level: u32][created_ms: u64][state: u8][entries: u64][reserved: 7]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub level: u32,
    pub created: u64,
    pub state: SegmentState,
    pub entries: u64,
}

impl SegmentHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_slice(SEGMENT_MAGIC);
        buf.put_u32_le(SEGMENT_FORMAT_VERSION);
        buf.put_u32_le(self.level);
        buf.put_u64_le(self.created);
        buf.put_u8(self.state as u8);
        buf.put_u64_le(self.entries);
        buf.resize(HEADER_SIZE, 0);

        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::corrupt("Segment file too small"));
        }
        if &data[..8] != SEGMENT_MAGIC {
            return Err(Error::corrupt("Invalid segment magic number"));
        }
        data.advance(8);
        let version = data.get_u32_le();
        if version != SEGMENT_FORMAT_VERSION {
            return Err(Error::corrupt(format!("Unsupported segment version: {}", version)));
        }
        let level = data.get_u32_le();
        let created = data.get_u64_le();
        let state = SegmentState::try_from(data.get_u8())?;
        let entries = data.get_u64_le();
        Ok(Self {
            level,
            created,
            state,
            entries,
        })
    }
}

/// Summary of a segment, as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub name: String,
    pub path: PathBuf,
    pub level: u32,
    pub created: u64,
    pub entries: u64,
    pub file_size: u64,
    pub state: SegmentState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encoding() {
        let header = SegmentHeader {
            level: 3,
            created: 1_700_000_000_000,
            state: SegmentState::ReadOnly,
            entries: 12345,
        };
        let bytes = header.encode();
        assert_eq!(&bytes[..8], SEGMENT_MAGIC);
        assert_eq!(SegmentHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_garbage() {
        assert!(SegmentHeader::decode(&[0u8; 10]).is_err());
        assert!(SegmentHeader::decode(&[0u8; HEADER_SIZE]).is_err());

        let mut bytes = SegmentHeader {
            level: 0,
            created: 0,
            state: SegmentState::Writable,
            entries: 0,
        }
        .encode();
        bytes[24] = 9;
        assert!(matches!(SegmentHeader::decode(&bytes), Err(Error::CorruptData { .. })));
    }
}
