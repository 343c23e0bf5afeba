//! Sparse index over a segment's blocks.
//!
//! One [`Midpoint`] per packed block: the block's first key and the file
//! offset of its header. Lookups binary search the midpoints to find the
//! single block that can contain a key, then read only that block.
//!
//! Side file layout (`<segment>.mdp`):
//!
//! ```text
//! [count: u32][Midpoint × count][crc32 of the midpoints: u32]
//! ```

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use tracing::debug;

use eventide_core::error::{Error, Result};
use eventide_core::{IndexEntry, Midpoint, Serializer, MIDPOINT_SIZE};

#[derive(Debug)]
pub struct Midpoints {
    path: PathBuf,
    items: Vec<Midpoint>,
    /// Last key stored in the segment, the upper end of [`Midpoints::in_range`].
    tail: Option<IndexEntry>,
    dirty: bool,
}

impl Midpoints {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            items: Vec::new(),
            tail: None,
            dirty: false,
        }
    }

    /// Loads the side file if it exists.
    pub fn load(path: impl Into<PathBuf>) -> Result<Option<Self>> {
        let path = path.into();
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let items = decode(&data).map_err(|e| {
            Error::corrupt(format!("midpoints {}: {}", path.display(), e))
        })?;
        debug!("Loaded {} midpoints from {}", items.len(), path.display());
        Ok(Some(Self {
            path,
            items,
            tail: None,
            dirty: false,
        }))
    }

    /// Registers the first key of a newly written block.
    pub fn add(&mut self, midpoint: Midpoint) -> Result<()> {
        if let Some(last) = self.items.last() {
            if midpoint.key.cmp_key(&last.key).is_lt() || midpoint.block_position <= last.block_position {
                return Err(Error::protocol(format!(
                    "midpoint {} at {} does not follow {} at {}",
                    midpoint.key, midpoint.block_position, last.key, last.block_position
                )));
            }
        }
        self.items.push(midpoint);
        self.dirty = true;
        Ok(())
    }

    pub fn set_tail(&mut self, last: IndexEntry) {
        self.tail = Some(last);
    }

    pub fn tail(&self) -> Option<&IndexEntry> {
        self.tail.as_ref()
    }

    /// Index of the greatest midpoint whose key is `<=` the probe.
    ///
    /// A probe below every midpoint returns 0. When several midpoints share
    /// the probe's key the earliest one is returned, since that block is the
    /// first that can hold it.
    pub fn get_midpoint_idx(&self, probe: &IndexEntry) -> usize {
        let p = self.items.partition_point(|m| m.key() < probe.key());
        match self.items.get(p) {
            Some(m) if m.key() == probe.key() => p,
            _ => p.saturating_sub(1),
        }
    }

    pub fn get_midpoint_for(&self, probe: &IndexEntry) -> Option<Midpoint> {
        if self.items.is_empty() {
            return None;
        }
        Some(self.items[self.get_midpoint_idx(probe)])
    }

    /// Whether `probe` lies between the first and last key of the segment.
    pub fn in_range(&self, probe: &IndexEntry) -> bool {
        let (Some(first), Some(tail)) = (self.items.first(), self.tail.as_ref()) else {
            return false;
        };
        first.key() <= probe.key() && probe.key() <= tail.key()
    }

    /// Whether any key of `stream` can be stored in this segment.
    pub fn may_contain_stream(&self, stream: u64) -> bool {
        match (self.items.first(), self.tail.as_ref()) {
            (Some(first), Some(tail)) => first.key.stream <= stream && stream <= tail.stream,
            _ => false,
        }
    }

    pub fn get(&self, idx: usize) -> Option<&Midpoint> {
        self.items.get(idx)
    }

    pub fn first(&self) -> Option<&Midpoint> {
        self.items.first()
    }

    pub fn last(&self) -> Option<&Midpoint> {
        self.items.last()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn iter(&self) -> impl Iterator<Item = &Midpoint> {
        self.items.iter()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persists the midpoints if they changed since the last write.
    pub fn write(&mut self) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        let tmp = self.path.with_extension("mdp.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&encode(&self.items))?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.dirty = false;
        debug!("Wrote {} midpoints to {}", self.items.len(), self.path.display());
        Ok(true)
    }

    pub fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

fn encode(items: &[Midpoint]) -> Vec<u8> {
    let mut body = BytesMut::with_capacity(items.len() * MIDPOINT_SIZE);
    for m in items {
        m.write_to(&mut body);
    }
    let mut buf = BytesMut::with_capacity(body.len() + 8);
    buf.put_u32_le(items.len() as u32);
    buf.put_slice(&body);
    buf.put_u32_le(crc32fast::hash(&body));
    buf.to_vec()
}

fn decode(mut data: &[u8]) -> Result<Vec<Midpoint>> {
    if data.len() < 8 {
        return Err(Error::corrupt("file too small"));
    }
    let count = data.get_u32_le() as usize;
    if data.len() != count * MIDPOINT_SIZE + 4 {
        return Err(Error::corrupt(format!(
            "{} midpoints need {} bytes, found {}",
            count,
            count * MIDPOINT_SIZE + 4,
            data.len()
        )));
    }
    let (mut body, mut footer) = data.split_at(count * MIDPOINT_SIZE);
    if crc32fast::hash(body) != footer.get_u32_le() {
        return Err(Error::corrupt("checksum mismatch"));
    }
    (0..count).map(|_| Midpoint::from_bytes(&mut body)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn build(dir: &TempDir, keys: &[u64]) -> Midpoints {
        let mut mps = Midpoints::new(dir.path().join("seg.mdp"));
        for (i, k) in keys.iter().enumerate() {
            mps.add(Midpoint::new(IndexEntry::new(*k, 1, 0), i as i64 * 100)).unwrap();
        }
        mps
    }

    #[test]
    fn test_midpoint_idx() {
        let dir = TempDir::new().unwrap();
        let mps = build(&dir, &[1, 10, 100]);
        assert_eq!(mps.get_midpoint_idx(&IndexEntry::new(2, 1, 0)), 0);
        assert_eq!(mps.get_midpoint_idx(&IndexEntry::new(1, 1, 0)), 0);
        assert_eq!(mps.get_midpoint_idx(&IndexEntry::new(100, 1, 0)), 2);
        assert_eq!(mps.get_midpoint_idx(&IndexEntry::new(50, 1, 0)), 1);
        assert_eq!(mps.get_midpoint_idx(&IndexEntry::new(0, 1, 0)), 0);
        assert_eq!(mps.get_midpoint_idx(&IndexEntry::new(u64::MAX, 1, 0)), 2);
    }

    #[test]
    fn test_equal_keys_resolve_to_earliest() {
        let dir = TempDir::new().unwrap();
        let mps = build(&dir, &[1, 5, 5, 5, 9]);
        assert_eq!(mps.get_midpoint_idx(&IndexEntry::new(5, 1, 0)), 1);
        assert_eq!(mps.get_midpoint_idx(&IndexEntry::new(6, 1, 0)), 3);
    }

    #[test]
    fn test_midpoint_for() {
        let dir = TempDir::new().unwrap();
        let mps = build(&dir, &[1, 10, 100]);
        assert_eq!(mps.get_midpoint_for(&IndexEntry::probe(20, 0)).unwrap().block_position, 100);
        assert!(Midpoints::new(dir.path().join("x")).get_midpoint_for(&IndexEntry::probe(1, 0)).is_none());
    }

    #[test]
    fn test_rejects_out_of_order() {
        let dir = TempDir::new().unwrap();
        let mut mps = build(&dir, &[10]);
        let err = mps.add(Midpoint::new(IndexEntry::new(5, 1, 0), 500)).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation { .. }));
    }

    #[test]
    fn test_in_range_uses_tail() {
        let dir = TempDir::new().unwrap();
        let mut mps = build(&dir, &[10, 20]);
        assert!(!mps.in_range(&IndexEntry::probe(15, 0)));
        mps.set_tail(IndexEntry::new(30, 4, 0));
        assert!(mps.in_range(&IndexEntry::probe(10, 1)));
        assert!(mps.in_range(&IndexEntry::probe(30, 4)));
        assert!(!mps.in_range(&IndexEntry::probe(30, 5)));
        assert!(!mps.in_range(&IndexEntry::probe(9, 0)));
        assert!(mps.may_contain_stream(30));
        assert!(!mps.may_contain_stream(31));
    }

    #[test]
    fn test_write_load_delete() {
        let dir = TempDir::new().unwrap();
        let mut mps = build(&dir, &[1, 10, 100]);
        assert!(mps.is_dirty());
        assert!(mps.write().unwrap());
        assert!(!mps.write().unwrap());

        let loaded = Midpoints::load(mps.path().to_path_buf()).unwrap().unwrap();
        assert_eq!(loaded.iter().collect::<Vec<_>>(), mps.iter().collect::<Vec<_>>());
        assert!(!loaded.is_dirty());

        mps.delete().unwrap();
        assert!(Midpoints::load(mps.path().to_path_buf()).unwrap().is_none());
        mps.delete().unwrap();
    }

    #[test]
    fn test_corrupt_side_file() {
        let dir = TempDir::new().unwrap();
        let mut mps = build(&dir, &[1, 2]);
        mps.write().unwrap();
        let mut data = fs::read(mps.path()).unwrap();
        data[6] ^= 0xff;
        fs::write(mps.path(), &data).unwrap();
        assert!(matches!(
            Midpoints::load(mps.path().to_path_buf()),
            Err(Error::CorruptData { .. })
        ));
    }
}
