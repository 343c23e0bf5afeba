//! Index block: the packing unit inside a segment.
//!
//! Entries are accumulated in key order and, once the block is full, packed
//! into runs that share a stream hash:
//!
//! ```text
//! [stream: u64][run: u32][(version: i32, position: i64) × run] ...
//! ```
//!
//! The packed bytes are then passed through the segment's [`Codec`] as a
//! whole. A block that has been packed, or one decoded from disk, is
//! read-only.

use bytes::{Buf, BufMut, BytesMut};

use eventide_core::error::{Error, Result};
use eventide_core::{Codec, IndexEntry, ENTRY_SIZE};

const RUN_HEADER_SIZE: usize = 8 + 4;
const RUN_ITEM_SIZE: usize = 4 + 8;

/// Output of [`IndexBlock::pack`].
#[derive(Debug, Clone, Default)]
pub struct PackedBlock {
    /// Length of the run-length encoded form before compression.
    pub raw_len: usize,
    pub data: Vec<u8>,
}

impl PackedBlock {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct IndexBlock {
    entries: Vec<IndexEntry>,
    max_size: usize,
    read_only: bool,
}

impl IndexBlock {
    /// New writable block that reports full at `max_size` bytes of entries.
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Vec::with_capacity(max_size / ENTRY_SIZE + 1),
            max_size,
            read_only: false,
        }
    }

    /// Appends an entry. Returns `true` once the block should be packed.
    pub fn add(&mut self, entry: IndexEntry) -> Result<bool> {
        if self.read_only {
            return Err(Error::protocol("block is read only"));
        }
        self.entries.push(entry);
        Ok(self.is_full())
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() * ENTRY_SIZE >= self.max_size
    }

    /// Encodes and compresses the block, after which it no longer accepts entries.
    pub fn pack(&mut self, codec: &dyn Codec) -> Result<PackedBlock> {
        self.read_only = true;
        if self.entries.is_empty() {
            return Ok(PackedBlock::default());
        }

        let raw = encode_runs(&self.entries);
        let data = codec.compress(&raw)?;
        Ok(PackedBlock {
            raw_len: raw.len(),
            data,
        })
    }

    /// Decodes a packed block into a read-only view.
    pub fn unpack(data: &[u8], codec: &dyn Codec, raw_len: usize) -> Result<Self> {
        let entries = if data.is_empty() {
            Vec::new()
        } else {
            let raw = codec.decompress(data, raw_len)?;
            decode_runs(&raw)?
        };
        Ok(Self {
            max_size: entries.len() * ENTRY_SIZE,
            entries,
            read_only: true,
        })
    }

    pub fn first(&self) -> Option<&IndexEntry> {
        self.entries.first()
    }

    pub fn last(&self) -> Option<&IndexEntry> {
        self.entries.last()
    }

    pub fn get(&self, idx: usize) -> Option<&IndexEntry> {
        self.entries.get(idx)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<IndexEntry> {
        self.entries
    }

    /// Index of the first entry whose key is not less than `probe`.
    pub fn lower_bound(&self, probe: &IndexEntry) -> usize {
        self.entries.partition_point(|e| e.key() < probe.key())
    }

    /// Exact key lookup.
    pub fn find(&self, stream: u64, version: i32) -> Option<IndexEntry> {
        self.entries
            .binary_search_by(|e| e.key().cmp(&(stream, version)))
            .ok()
            .map(|i| self.entries[i])
    }

    /// Highest version of `stream` held by this block.
    pub fn last_version_of(&self, stream: u64) -> Option<i32> {
        let end = self.entries.partition_point(|e| e.stream <= stream);
        match end.checked_sub(1).map(|i| &self.entries[i]) {
            Some(e) if e.stream == stream => Some(e.version),
            _ => None,
        }
    }
}

fn encode_runs(entries: &[IndexEntry]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(entries.len() * RUN_ITEM_SIZE + RUN_HEADER_SIZE);
    for run in entries.chunk_by(|a, b| a.stream == b.stream) {
        buf.put_u64_le(run[0].stream);
        buf.put_u32_le(run.len() as u32);
        for e in run {
            buf.put_i32_le(e.version);
            buf.put_i64_le(e.position);
        }
    }
    buf.to_vec()
}

fn decode_runs(mut raw: &[u8]) -> Result<Vec<IndexEntry>> {
    let mut entries = Vec::with_capacity(raw.len() / RUN_ITEM_SIZE);
    while raw.has_remaining() {
        if raw.remaining() < RUN_HEADER_SIZE {
            return Err(Error::corrupt(format!(
                "truncated run header: {} trailing bytes",
                raw.remaining()
            )));
        }
        let stream = raw.get_u64_le();
        let run = raw.get_u32_le() as usize;
        if run == 0 || raw.remaining() < run * RUN_ITEM_SIZE {
            return Err(Error::corrupt(format!(
                "run of {} entries for stream {} does not fit in {} bytes",
                run,
                stream,
                raw.remaining()
            )));
        }
        for _ in 0..run {
            let version = raw.get_i32_le();
            let position = raw.get_i64_le();
            entries.push(IndexEntry::new(stream, version, position));
        }
    }
    Ok(entries)
}
