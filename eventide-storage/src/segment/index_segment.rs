//! A single index segment file and its side files.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut};
use memmap2::{Mmap, MmapOptions};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use eventide_core::error::{Error, Result};
use eventide_core::metrics::Metrics;
use eventide_core::{Codec, Direction, IndexEntry, Midpoint, Range};

use crate::segment::{
    naming::creation_stamp, BlockCodec, BloomFilter, IndexBlock, Midpoints, SegmentConfig,
    SegmentHeader, SegmentInfo, SegmentIterator, SegmentState, BLOCK_HEADER_SIZE, BLOOM_EXT,
    HEADER_SIZE, MIDPOINTS_EXT, SEGMENT_EXT,
};

/// Segment of the stream index.
///
/// A segment starts writable: entries are appended in key order into an
/// in-memory [`IndexBlock`] which is packed and written whenever it fills.
/// [`IndexSegment::roll`] seals it; from then on it is memory mapped and
/// immutable. Segments are shared as `Arc<IndexSegment>`; one that has been
/// merged away is [marked for deletion](IndexSegment::mark_for_deletion)
/// and its files are removed when the last handle is dropped.
pub struct IndexSegment {
    name: String,
    dir: PathBuf,
    config: SegmentConfig,
    codec: BlockCodec,
    metrics: Metrics,
    inner: RwLock<SegmentInner>,
    marked_for_deletion: AtomicBool,
}

struct SegmentInner {
    header: SegmentHeader,
    storage: Storage,
    midpoints: Midpoints,
    bloom: BloomFilter,
    /// End of the last packed block.
    position: u64,
    entries: u64,
    last: Option<IndexEntry>,
}

enum Storage {
    Writable {
        writer: File,
        reader: Mutex<File>,
        block: IndexBlock,
    },
    ReadOnly {
        mmap: Mmap,
    },
}

/// Header in front of every packed block.
#[derive(Debug, Clone, Copy)]
struct BlockFrame {
    payload_len: usize,
    raw_len: usize,
    codec: u8,
    crc: u32,
}

impl BlockFrame {
    fn parse(mut data: &[u8]) -> Result<Self> {
        if data.len() < BLOCK_HEADER_SIZE {
            return Err(Error::corrupt("truncated block header"));
        }
        Ok(Self {
            payload_len: data.get_u32_le() as usize,
            raw_len: data.get_u32_le() as usize,
            codec: data.get_u8(),
            crc: data.get_u32_le(),
        })
    }

    fn decode(&self, payload: &[u8]) -> Result<IndexBlock> {
        if crc32fast::hash(payload) != self.crc {
            return Err(Error::corrupt("block checksum mismatch"));
        }
        let codec = BlockCodec::for_id(self.codec)?;
        IndexBlock::unpack(payload, &codec, self.raw_len)
    }
}

/// Decodes the block framed at `offset`, returning it and the offset after it.
fn read_frame(data: &[u8], offset: u64) -> Result<(IndexBlock, u64)> {
    let start = offset as usize;
    let header = data
        .get(start..start + BLOCK_HEADER_SIZE)
        .ok_or_else(|| Error::corrupt(format!("block header at {} past end of file", offset)))?;
    let frame = BlockFrame::parse(header)?;
    let body = start + BLOCK_HEADER_SIZE;
    let payload = data
        .get(body..body + frame.payload_len)
        .ok_or_else(|| Error::corrupt(format!("block payload at {} past end of file", offset)))?;
    let block = frame.decode(payload)?;
    Ok((block, (body + frame.payload_len) as u64))
}

/// Result of walking the blocks of a segment file.
struct Scan {
    /// Offset just past the last valid block.
    end: u64,
    error: Option<Error>,
    midpoints: Vec<Midpoint>,
    streams: Vec<u64>,
    last: Option<IndexEntry>,
}

fn scan_blocks(data: &[u8]) -> Scan {
    let mut scan = Scan {
        end: HEADER_SIZE as u64,
        error: None,
        midpoints: Vec::new(),
        streams: Vec::new(),
        last: None,
    };
    while (scan.end as usize) < data.len() {
        match read_frame(data, scan.end) {
            Ok((block, next)) => {
                if let Some(first) = block.first() {
                    scan.midpoints.push(Midpoint::new(*first, scan.end as i64));
                    scan.streams.extend(block.entries().iter().map(|e| e.stream));
                    scan.last = block.last().copied();
                }
                scan.end = next;
            }
            Err(e) => {
                scan.error = Some(e);
                break;
            }
        }
    }
    scan
}

fn write_header(file: &mut File, header: &SegmentHeader, resume_at: u64) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header.encode())?;
    file.seek(SeekFrom::Start(resume_at))?;
    Ok(())
}

fn map_file(path: &Path) -> Result<Mmap> {
    let file = File::open(path)?;
    // Read-only segments are never modified in place
    unsafe {
        MmapOptions::new().map(&file).map_err(|e| Error::Io {
            message: format!("Failed to mmap segment {}", path.display()),
            source: e,
        })
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

impl IndexSegment {
    /// Creates a writable segment with a bloom filter sized from the config,
    /// stamped as the newest segment so far.
    pub fn create(dir: &Path, name: &str, level: u32, config: SegmentConfig, metrics: Metrics) -> Result<Self> {
        let expected = config.bloom_expected_entries;
        Self::create_sized(dir, name, level, expected, creation_stamp(), config, metrics)
    }

    /// Creates a writable segment whose bloom filter is sized for `expected_entries`.
    ///
    /// `created` places the segment among others of its level; a compaction
    /// output carries the stamp of its newest input.
    pub fn create_sized(
        dir: &Path,
        name: &str,
        level: u32,
        expected_entries: u64,
        created: u64,
        config: SegmentConfig,
        metrics: Metrics,
    ) -> Result<Self> {
        let path = segment_path(dir, name);
        let mut writer = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| Error::Segment {
                message: format!("cannot create {}", path.display()),
                source: Some(Box::new(e)),
            })?;

        let header = SegmentHeader {
            level,
            created,
            state: SegmentState::Writable,
            entries: 0,
        };
        writer.write_all(&header.encode())?;
        let reader = File::open(&path)?;

        let bloom = BloomFilter::new(expected_entries, config.bloom_false_positive_rate, config.bloom_seed);
        info!("Created index segment {} at level {}", name, level);

        Ok(Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            codec: config.codec(),
            inner: RwLock::new(SegmentInner {
                header,
                storage: Storage::Writable {
                    writer,
                    reader: Mutex::new(reader),
                    block: IndexBlock::new(config.block_size),
                },
                midpoints: Midpoints::new(side_path(dir, name, MIDPOINTS_EXT)),
                bloom,
                position: HEADER_SIZE as u64,
                entries: 0,
                last: None,
            }),
            config,
            metrics,
            marked_for_deletion: AtomicBool::new(false),
        })
    }

    /// Opens an existing segment.
    ///
    /// Read-only segments are memory mapped; missing side files are rebuilt
    /// from the blocks. A writable segment left behind by a crash is scanned
    /// and truncated after its last intact block.
    pub fn open(dir: &Path, name: &str, config: SegmentConfig, metrics: Metrics) -> Result<Self> {
        let path = segment_path(dir, name);
        let mut raw_header = [0u8; HEADER_SIZE];
        File::open(&path)?
            .read_exact(&mut raw_header)
            .map_err(|e| Error::corrupt(format!("segment {} header: {}", name, e)))?;
        let header = SegmentHeader::decode(&raw_header)?;

        let inner = match header.state {
            SegmentState::ReadOnly => Self::open_read_only(dir, name, header, &config)?,
            SegmentState::Writable => {
                let data = fs::read(&path)?;
                Self::recover_writable(dir, name, header, &data, &config)?
            }
        };

        debug!(
            "Opened index segment {}: {:?}, {} entries, {} blocks",
            name,
            inner.header.state,
            inner.entries,
            inner.midpoints.len()
        );

        Ok(Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            codec: config.codec(),
            inner: RwLock::new(inner),
            config,
            metrics,
            marked_for_deletion: AtomicBool::new(false),
        })
    }

    fn open_read_only(dir: &Path, name: &str, header: SegmentHeader, config: &SegmentConfig) -> Result<SegmentInner> {
        let mmap = map_file(&segment_path(dir, name))?;
        let bloom_path = side_path(dir, name, BLOOM_EXT);

        let loaded = Midpoints::load(side_path(dir, name, MIDPOINTS_EXT))?;
        let have_bloom = bloom_path.exists();
        let scan = if loaded.is_none() || !have_bloom {
            let scan = scan_blocks(&mmap);
            if let Some(e) = &scan.error {
                return Err(Error::corrupt(format!("segment {}: {}", name, e)));
            }
            Some(scan)
        } else {
            None
        };

        let mut midpoints = match loaded {
            Some(m) => m,
            None => {
                let mut m = Midpoints::new(side_path(dir, name, MIDPOINTS_EXT));
                for mp in scan.as_ref().map(|s| s.midpoints.as_slice()).unwrap_or_default() {
                    m.add(*mp)?;
                }
                warn!("Rebuilt {} midpoints for segment {}", m.len(), name);
                m.write()?;
                m
            }
        };

        let bloom = if have_bloom {
            BloomFilter::open(&bloom_path, config.bloom_seed)?
        } else {
            let streams = scan.as_ref().map(|s| s.streams.as_slice()).unwrap_or_default();
            let mut bloom = BloomFilter::new(
                header.entries.max(streams.len() as u64),
                config.bloom_false_positive_rate,
                config.bloom_seed,
            );
            streams.iter().for_each(|s| bloom.add(*s));
            warn!("Rebuilt bloom filter for segment {}", name);
            bloom.write(&bloom_path)?;
            bloom
        };

        // The tail key lives in the last block
        let last = match midpoints.last() {
            Some(mp) => read_frame(&mmap, mp.block_position as u64)?.0.last().copied(),
            None => None,
        };
        if let Some(last) = last {
            midpoints.set_tail(last);
        }

        Ok(SegmentInner {
            header,
            position: mmap.len() as u64,
            storage: Storage::ReadOnly { mmap },
            midpoints,
            bloom,
            entries: header.entries,
            last,
        })
    }

    fn recover_writable(
        dir: &Path,
        name: &str,
        header: SegmentHeader,
        data: &[u8],
        config: &SegmentConfig,
    ) -> Result<SegmentInner> {
        let path = segment_path(dir, name);
        let scan = scan_blocks(data);

        let mut writer = OpenOptions::new().read(true).write(true).open(&path)?;
        if let Some(e) = &scan.error {
            warn!(
                "Truncating segment {} at {} of {} bytes: {}",
                name,
                scan.end,
                data.len(),
                e
            );
        }
        if scan.end < data.len() as u64 {
            writer.set_len(scan.end)?;
            writer.sync_all()?;
        }
        writer.seek(SeekFrom::Start(scan.end))?;

        let mut midpoints = Midpoints::new(side_path(dir, name, MIDPOINTS_EXT));
        for mp in &scan.midpoints {
            midpoints.add(*mp)?;
        }
        if let Some(last) = scan.last {
            midpoints.set_tail(last);
        }

        let expected = config.bloom_expected_entries.max(scan.streams.len() as u64);
        let mut bloom = BloomFilter::new(expected, config.bloom_false_positive_rate, config.bloom_seed);
        scan.streams.iter().for_each(|s| bloom.add(*s));

        Ok(SegmentInner {
            header,
            storage: Storage::Writable {
                writer,
                reader: Mutex::new(File::open(&path)?),
                block: IndexBlock::new(config.block_size),
            },
            midpoints,
            bloom,
            position: scan.end,
            entries: scan.streams.len() as u64,
            last: scan.last,
        })
    }

    /// Appends an entry. Keys must not decrease within a segment.
    pub fn append(&self, entry: IndexEntry) -> Result<()> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let Storage::Writable { block, .. } = &mut inner.storage else {
            return Err(Error::protocol(format!("segment {} is read only", self.name)));
        };
        if let Some(last) = &inner.last {
            if entry.cmp_key(last).is_lt() {
                return Err(Error::protocol(format!(
                    "entry {} appended after {} in segment {}",
                    entry, last, self.name
                )));
            }
        }

        let full = block.add(entry)?;
        inner.bloom.add(entry.stream);
        inner.midpoints.set_tail(entry);
        inner.last = Some(entry);
        inner.entries += 1;

        if full {
            self.write_block(inner)?;
        }
        Ok(())
    }

    /// Packs and writes the in-memory block. Returns false if it was empty.
    fn write_block(&self, inner: &mut SegmentInner) -> Result<bool> {
        let Storage::Writable { writer, block, .. } = &mut inner.storage else {
            return Err(Error::protocol(format!("segment {} is read only", self.name)));
        };
        let Some(&first) = block.first() else {
            return Ok(false);
        };

        let packed = block.pack(&self.codec)?;
        let mut frame = self.config.buffers.acquire();
        frame.reserve(BLOCK_HEADER_SIZE + packed.data.len());
        frame.put_u32_le(packed.data.len() as u32);
        frame.put_u32_le(packed.raw_len as u32);
        frame.put_u8(self.codec.id());
        frame.put_u32_le(crc32fast::hash(&packed.data));
        frame.put_slice(&packed.data);
        writer.write_all(&frame[..])?;

        let entries = block.entry_count();
        *block = IndexBlock::new(self.config.block_size);

        let offset = inner.position;
        inner.midpoints.add(Midpoint::new(first, offset as i64))?;
        inner.position += frame.len() as u64;
        self.metrics.record_block_write(frame.len() as u64);
        debug!(
            "Wrote block of {} entries ({} bytes) to {} at {}",
            entries,
            frame.len(),
            self.name,
            offset
        );
        Ok(true)
    }

    /// Writes any buffered entries and persists header and side files.
    pub fn flush(&self) -> Result<()> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        if !matches!(inner.storage, Storage::Writable { .. }) {
            return Ok(());
        }

        self.write_block(inner)?;
        let header = SegmentHeader {
            entries: inner.entries,
            ..inner.header
        };
        if let Storage::Writable { writer, .. } = &mut inner.storage {
            write_header(writer, &header, inner.position)?;
            writer.sync_data()?;
        }
        inner.header = header;
        inner.midpoints.write()?;
        inner.bloom.write(&self.bloom_path())?;
        Ok(())
    }

    /// Seals the segment at `level`. It becomes memory mapped and immutable.
    pub fn roll(&self, level: u32) -> Result<()> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        self.write_block(inner)?;
        let header = SegmentHeader {
            level,
            state: SegmentState::ReadOnly,
            entries: inner.entries,
            created: inner.header.created,
        };
        if let Storage::Writable { writer, .. } = &mut inner.storage {
            write_header(writer, &header, inner.position)?;
            writer.sync_all()?;
        }
        inner.midpoints.write()?;
        inner.bloom.write(&self.bloom_path())?;

        let mmap = map_file(&self.path())?;
        inner.storage = Storage::ReadOnly { mmap };
        inner.header = header;

        info!(
            "Rolled index segment {}: {} entries, {} blocks, {} bytes, level {}",
            self.name,
            inner.entries,
            inner.midpoints.len(),
            inner.position,
            level
        );
        Ok(())
    }

    /// Decodes the `idx`-th packed block.
    pub(crate) fn read_block(&self, idx: usize) -> Result<Option<IndexBlock>> {
        let inner = self.inner.read();
        self.load_block(&inner, idx)
    }

    fn load_block(&self, inner: &SegmentInner, idx: usize) -> Result<Option<IndexBlock>> {
        let Some(mp) = inner.midpoints.get(idx) else {
            return Ok(None);
        };
        let offset = mp.block_position as u64;
        let block = match &inner.storage {
            Storage::ReadOnly { mmap } => read_frame(mmap, offset)?.0,
            Storage::Writable { reader, .. } => {
                let mut file = reader.lock();
                let mut header = [0u8; BLOCK_HEADER_SIZE];
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut header)?;
                let frame = BlockFrame::parse(&header)?;
                let mut payload = vec![0u8; frame.payload_len];
                file.read_exact(&mut payload)?;
                frame.decode(&payload)?
            }
        };
        self.metrics.record_block_read();
        Ok(Some(block))
    }

    /// Highest version of `stream` stored in this segment.
    pub fn version(&self, stream: u64) -> Result<Option<i32>> {
        let inner = self.inner.read();
        if !inner.bloom.contains(stream) {
            self.metrics.record_bloom_skip();
            return Ok(None);
        }
        if let Storage::Writable { block, .. } = &inner.storage {
            if let Some(version) = block.last_version_of(stream) {
                return Ok(Some(version));
            }
        }
        if !inner.midpoints.may_contain_stream(stream) {
            return Ok(None);
        }
        let idx = inner.midpoints.get_midpoint_idx(&IndexEntry::probe(stream, i32::MAX));
        Ok(self.load_block(&inner, idx)?.and_then(|b| b.last_version_of(stream)))
    }

    /// Exact lookup of one event slot.
    pub fn get(&self, stream: u64, version: i32) -> Result<Option<IndexEntry>> {
        let inner = self.inner.read();
        if !inner.bloom.contains(stream) {
            self.metrics.record_bloom_skip();
            return Ok(None);
        }
        if let Storage::Writable { block, .. } = &inner.storage {
            if let Some(entry) = block.find(stream, version) {
                return Ok(Some(entry));
            }
        }
        let probe = IndexEntry::probe(stream, version);
        if !inner.midpoints.in_range(&probe) {
            return Ok(None);
        }
        let idx = inner.midpoints.get_midpoint_idx(&probe);
        Ok(self.load_block(&inner, idx)?.and_then(|b| b.find(stream, version)))
    }

    /// Lazily iterates every entry of the segment.
    pub fn iterator(self: &Arc<Self>, direction: Direction) -> SegmentIterator {
        SegmentIterator::new(Arc::clone(self), direction, None)
    }

    /// Lazily iterates the entries of one stream version range.
    pub fn iterator_range(self: &Arc<Self>, range: Range, direction: Direction) -> SegmentIterator {
        SegmentIterator::new(Arc::clone(self), direction, Some(range))
    }

    /// Number of packed blocks and a copy of the unpacked entries, taken atomically.
    pub(crate) fn snapshot(&self) -> (usize, Vec<IndexEntry>) {
        let inner = self.inner.read();
        let pending = match &inner.storage {
            Storage::Writable { block, .. } => block.entries().to_vec(),
            Storage::ReadOnly { .. } => Vec::new(),
        };
        (inner.midpoints.len(), pending)
    }

    /// First block that can hold `probe`.
    pub(crate) fn block_for(&self, probe: &IndexEntry) -> usize {
        self.inner.read().midpoints.get_midpoint_idx(probe)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> PathBuf {
        segment_path(&self.dir, &self.name)
    }

    fn bloom_path(&self) -> PathBuf {
        side_path(&self.dir, &self.name, BLOOM_EXT)
    }

    pub fn level(&self) -> u32 {
        self.inner.read().header.level
    }

    pub fn created(&self) -> u64 {
        self.inner.read().header.created
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.read().entries
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }

    pub fn block_count(&self) -> usize {
        self.inner.read().midpoints.len()
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.inner.read().storage, Storage::ReadOnly { .. })
    }

    /// Whether the packed size has reached the configured segment size.
    pub fn is_full(&self) -> bool {
        self.inner.read().position >= self.config.max_segment_size
    }

    pub fn info(&self) -> SegmentInfo {
        let inner = self.inner.read();
        SegmentInfo {
            name: self.name.clone(),
            path: self.path(),
            level: inner.header.level,
            created: inner.header.created,
            entries: inner.entries,
            file_size: inner.position,
            state: inner.header.state,
        }
    }

    /// Schedules file removal for when the last handle is dropped.
    pub fn mark_for_deletion(&self) {
        self.marked_for_deletion.store(true, Ordering::Release);
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.marked_for_deletion.load(Ordering::Acquire)
    }

    fn delete_files(&self) -> Result<()> {
        remove_if_exists(&self.path())?;
        self.inner.read().midpoints.delete()?;
        remove_if_exists(&self.bloom_path())?;
        info!("Deleted index segment {}", self.name);
        Ok(())
    }
}

impl Drop for IndexSegment {
    fn drop(&mut self) {
        if self.is_marked_for_deletion() {
            if let Err(e) = self.delete_files() {
                warn!("Failed to delete segment {}: {}", self.name, e);
            }
        }
    }
}

impl std::fmt::Debug for IndexSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexSegment")
            .field("name", &self.name)
            .field("level", &self.level())
            .field("entries", &self.entry_count())
            .field("read_only", &self.is_read_only())
            .finish()
    }
}

pub fn segment_path(dir: &Path, name: &str) -> PathBuf {
    side_path(dir, name, SEGMENT_EXT)
}

fn side_path(dir: &Path, name: &str, ext: &str) -> PathBuf {
    dir.join(format!("{}.{}", name, ext))
}
