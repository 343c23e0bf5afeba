//! Fixed-layout binary serialization for index records, plus the
//! compression capability used when packing blocks.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::types::{IndexEntry, Midpoint, ENTRY_SIZE, MIDPOINT_SIZE};

/// Binary form of a fixed-size stored record.
pub trait Serializer: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;

    fn write_to<B: BufMut>(&self, dst: &mut B);

    fn from_bytes<B: Buf>(src: &mut B) -> Result<Self>;

    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        self.write_to(&mut buf);
        buf.freeze()
    }
}

impl Serializer for IndexEntry {
    const SIZE: usize = ENTRY_SIZE;

    #[inline]
    fn write_to<B: BufMut>(&self, dst: &mut B) {
        dst.put_u64_le(self.stream);
        dst.put_i32_le(self.version);
        dst.put_i64_le(self.position);
    }

    #[inline]
    fn from_bytes<B: Buf>(src: &mut B) -> Result<Self> {
        if src.remaining() < Self::SIZE {
            return Err(Error::corrupt(format!(
                "index entry needs {} bytes, {} remaining",
                Self::SIZE,
                src.remaining()
            )));
        }
        Ok(IndexEntry {
            stream: src.get_u64_le(),
            version: src.get_i32_le(),
            position: src.get_i64_le(),
        })
    }
}

impl Serializer for Midpoint {
    const SIZE: usize = MIDPOINT_SIZE;

    fn write_to<B: BufMut>(&self, dst: &mut B) {
        self.key.write_to(dst);
        dst.put_i64_le(self.block_position);
    }

    fn from_bytes<B: Buf>(src: &mut B) -> Result<Self> {
        if src.remaining() < Self::SIZE {
            return Err(Error::corrupt(format!(
                "midpoint needs {} bytes, {} remaining",
                Self::SIZE,
                src.remaining()
            )));
        }
        let key = IndexEntry::from_bytes(src)?;
        Ok(Midpoint {
            key,
            block_position: src.get_i64_le(),
        })
    }
}

/// Abstract compress/decompress capability applied to packed blocks.
///
/// `decompress` receives the uncompressed length recorded next to the
/// payload and must fail with [`Error::Codec`] if the output differs.
pub trait Codec: Send + Sync {
    /// Identifier persisted in block headers.
    fn id(&self) -> u8;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>>;
}
