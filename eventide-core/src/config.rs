//! # Configuration Management
//!
//! Handles all configuration for the Eventide index engine.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub index: IndexConfig,
    pub compaction: CompactionConfig,
    pub streams: StreamsConfig,
}

impl Config {
    /// Load configuration from a JSON file. Missing sections use defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| Error::Configuration {
            message: format!("cannot read {}: {}", path.display(), e),
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|e| Error::Configuration {
            message: format!("invalid config {}: {}", path.display(), e),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let index = &self.index;
        if index.block_size < crate::types::ENTRY_SIZE {
            return Err(config_error(format!(
                "block_size {} cannot hold a single entry",
                index.block_size
            )));
        }
        if index.segment_size < index.block_size as u64 {
            return Err(config_error("segment_size must be at least block_size"));
        }
        let fp = index.bloom.false_positive_rate;
        if !(fp > 0.0 && fp < 1.0) {
            return Err(config_error(format!(
                "bloom false_positive_rate must be in (0, 1), got {}",
                fp
            )));
        }
        if index.bloom.expected_entries == 0 {
            return Err(config_error("bloom expected_entries must be positive"));
        }
        if index.buffer_pool_size == 0 {
            return Err(config_error("buffer_pool_size must be positive"));
        }
        if self.compaction.threshold < 2 {
            return Err(config_error("compaction threshold must be at least 2"));
        }
        Ok(())
    }
}

fn config_error(message: impl Into<String>) -> Error {
    Error::Configuration { message: message.into() }
}

/// Index storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub directory: PathBuf,
    /// Uncompressed bytes of entries per block before it is packed.
    pub block_size: usize,
    /// Bytes of packed blocks per segment before it rolls.
    pub segment_size: u64,
    pub compression: CompressionConfig,
    pub bloom: BloomConfig,
    pub naming: NamingStrategy,
    pub buffer_pool_size: usize,
    /// Entries buffered in memory before they are written to the appender.
    pub memindex_flush_threshold: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./data/index"),
            block_size: 4096,
            segment_size: 32 * 1024 * 1024, // 32MB
            compression: CompressionConfig::default(),
            bloom: BloomConfig::default(),
            naming: NamingStrategy::Timestamp,
            buffer_pool_size: 16,
            memindex_flush_threshold: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub algorithm: CompressionAlgorithm,
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Snappy,
            level: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    None,
    Zstd,
    Snappy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BloomConfig {
    pub false_positive_rate: f64,
    pub expected_entries: u64,
    pub seed: u64,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            false_positive_rate: 0.01,
            expected_entries: 100_000,
            seed: 0,
        }
    }
}

/// How new segment files are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamingStrategy {
    Timestamp,
    ShortUuid,
    Uuid,
}

/// Compaction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub enabled: bool,
    /// Segments on one level that trigger a merge into the next.
    pub threshold: usize,
    pub max_levels: u32,
    pub strategy: CombinerStrategy,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 4,
            max_levels: 7,
            strategy: CombinerStrategy::UniqueMerge,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CombinerStrategy {
    Concatenate,
    UniqueMerge,
    NonUniqueMerge,
}

/// Stream registry configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamsConfig {
    pub high_hash_seed: u32,
    pub low_hash_seed: u32,
}
