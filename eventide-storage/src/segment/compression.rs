use eventide_core::config::{CompressionAlgorithm, CompressionConfig};
use eventide_core::error::{Error, Result};
use eventide_core::Codec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    Zstd = 1,
    Snappy = 2,
}

impl TryFrom<u8> for CompressionType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Zstd),
            2 => Ok(CompressionType::Snappy),
            _ => Err(Error::corrupt(format!("Invalid compression type: {}", value))),
        }
    }
}

impl From<CompressionAlgorithm> for CompressionType {
    fn from(algorithm: CompressionAlgorithm) -> Self {
        match algorithm {
            CompressionAlgorithm::None => CompressionType::None,
            CompressionAlgorithm::Zstd => CompressionType::Zstd,
            CompressionAlgorithm::Snappy => CompressionType::Snappy,
        }
    }
}

/// A [`Codec`] backed by one of the built-in compression algorithms.
#[derive(Debug, Clone, Copy)]
pub struct BlockCodec {
    kind: CompressionType,
    level: i32,
}

impl BlockCodec {
    pub fn new(kind: CompressionType, level: i32) -> Self {
        Self { kind, level }
    }

    pub fn none() -> Self {
        Self::new(CompressionType::None, 0)
    }

    pub fn kind(&self) -> CompressionType {
        self.kind
    }

    /// Codec for a block header id; the level only matters when compressing.
    pub fn for_id(id: u8) -> Result<Self> {
        Ok(Self::new(CompressionType::try_from(id)?, 0))
    }
}

impl From<&CompressionConfig> for BlockCodec {
    fn from(config: &CompressionConfig) -> Self {
        Self::new(config.algorithm.into(), config.level)
    }
}

impl Codec for BlockCodec {
    fn id(&self) -> u8 {
        self.kind as u8
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self.kind {
            CompressionType::None => Ok(data.to_vec()),
            CompressionType::Zstd => zstd::encode_all(data, self.level).map_err(|e| Error::Codec {
                message: format!("Zstd compression failed: {}", e),
            }),
            CompressionType::Snappy => snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|e| Error::Codec {
                    message: format!("Snappy compression failed: {}", e),
                }),
        }
    }

    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        let raw = match self.kind {
            CompressionType::None => data.to_vec(),
            CompressionType::Zstd => zstd::decode_all(data).map_err(|e| Error::Codec {
                message: format!("Zstd decompression failed: {}", e),
            })?,
            CompressionType::Snappy => snap::raw::Decoder::new()
                .decompress_vec(data)
                .map_err(|e| Error::Codec {
                    message: format!("Snappy decompression failed: {}", e),
                })?,
        };
        if raw.len() != expected_len {
            return Err(Error::Codec {
                message: format!(
                    "{:?} block decoded to {} bytes, expected {}",
                    self.kind,
                    raw.len(),
                    expected_len
                ),
            });
        }
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_codecs_restore_input() {
        let data: Vec<u8> = (0..4096u32).flat_map(|i| (i % 17).to_le_bytes()).collect();
        for kind in [CompressionType::None, CompressionType::Zstd, CompressionType::Snappy] {
            let codec = BlockCodec::new(kind, 3);
            let packed = codec.compress(&data).unwrap();
            let restored = BlockCodec::for_id(codec.id()).unwrap().decompress(&packed, data.len()).unwrap();
            assert_eq!(restored, data, "{:?}", kind);
        }
    }

    #[test]
    fn test_length_mismatch_is_codec_error() {
        let codec = BlockCodec::new(CompressionType::Snappy, 0);
        let packed = codec.compress(b"hello world").unwrap();
        let err = codec.decompress(&packed, 3).unwrap_err();
        assert_eq!(err.error_code(), "CODEC_ERROR");
    }

    #[test]
    fn test_unknown_id() {
        assert!(BlockCodec::for_id(9).is_err());
    }
}
