//! Bloom filter over stream hashes, one per segment.
//!
//! Bits are derived by double hashing the two halves of a single seeded
//! xxh3 hash of the key. Persisted layout (`<segment>.ftr`):
//!
//! ```text
//! [bit_count: u64][hash_count: u32][byte_len: u32][bits]
//! ```

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use bytes::{Buf, BufMut, BytesMut};
use xxhash_rust::xxh3::xxh3_64_with_seed;

use eventide_core::error::{Error, Result};

const HEADER_SIZE: usize = 8 + 4 + 4;
const MIN_BITS: u64 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    bit_count: u64,
    hash_count: u32,
    seed: u64,
}

impl BloomFilter {
    /// Sizes the filter for `expected` keys at the target false-positive rate.
    pub fn new(expected: u64, false_positive_rate: f64, seed: u64) -> Self {
        let n = expected.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let m = (-n * false_positive_rate.ln() / (ln2 * ln2)).ceil() as u64;
        let bit_count = m.max(MIN_BITS);
        let hash_count = ((bit_count as f64 / n) * ln2).ceil().max(1.0) as u32;
        Self {
            bits: vec![0; bit_count.div_ceil(8) as usize],
            bit_count,
            hash_count,
            seed,
        }
    }

    /// Opens a persisted filter. `seed` must match the one it was built with.
    pub fn open(path: &Path, seed: u64) -> Result<Self> {
        let data = fs::read(path)?;
        Self::from_bytes(&data, seed).map_err(|e| {
            Error::corrupt(format!("bloom filter {}: {}", path.display(), e))
        })
    }

    pub fn from_bytes(mut data: &[u8], seed: u64) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::corrupt("bloom header truncated"));
        }
        let bit_count = data.get_u64_le();
        let hash_count = data.get_u32_le();
        let byte_len = data.get_u32_le() as usize;
        if bit_count == 0 || hash_count == 0 {
            return Err(Error::corrupt("bloom filter has no bits or hashes"));
        }
        if byte_len as u64 != bit_count.div_ceil(8) || data.len() != byte_len {
            return Err(Error::corrupt(format!(
                "bloom filter of {} bits cannot be stored in {} bytes ({} present)",
                bit_count,
                byte_len,
                data.len()
            )));
        }
        Ok(Self {
            bits: data.to_vec(),
            bit_count,
            hash_count,
            seed,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.bits.len());
        buf.put_u64_le(self.bit_count);
        buf.put_u32_le(self.hash_count);
        buf.put_u32_le(self.bits.len() as u32);
        buf.put_slice(&self.bits);
        buf.to_vec()
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_u64::<LittleEndian>(self.bit_count)?;
        writer.write_u32::<LittleEndian>(self.hash_count)?;
        writer.write_u32::<LittleEndian>(self.bits.len() as u32)?;
        writer.write_all(&self.bits)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }

    #[inline]
    pub fn add(&mut self, key: u64) {
        for bit in self.bit_positions(key) {
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    #[inline]
    pub fn contains(&self, key: u64) -> bool {
        self.bit_positions(key)
            .all(|bit| self.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0)
    }

    /// ORs another filter with identical geometry into this one.
    pub fn merge(&mut self, other: &BloomFilter) -> Result<()> {
        if self.bit_count != other.bit_count
            || self.hash_count != other.hash_count
            || self.seed != other.seed
        {
            return Err(Error::protocol(format!(
                "cannot merge bloom filter ({} bits, {} hashes) into ({} bits, {} hashes)",
                other.bit_count, other.hash_count, self.bit_count, self.hash_count
            )));
        }
        for (dst, src) in self.bits.iter_mut().zip(&other.bits) {
            *dst |= *src;
        }
        Ok(())
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn bits(&self) -> &[u8] {
        &self.bits
    }

    fn bit_positions(&self, key: u64) -> impl Iterator<Item = u64> {
        let h = xxh3_64_with_seed(&key.to_le_bytes(), self.seed);
        let h1 = h & 0xffff_ffff;
        let h2 = h >> 32;
        let m = self.bit_count;
        (0..self.hash_count as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % m)
    }
}
