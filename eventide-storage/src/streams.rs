//! # Streams Registry
//!
//! Stream metadata and current versions, keyed by stream hash.
//!
//! The expected-version check on append is the point where concurrent
//! writers to one stream are serialized. It runs under the shard lock of
//! the stream's map entry, so writers to different streams never contend.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use eventide_core::config::StreamsConfig;
use eventide_core::error::{Error, Result};
use eventide_core::metrics::Metrics;
use eventide_core::{StreamHasher, NO_VERSION};

use crate::segment::naming::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Permission {
    #[default]
    None,
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StreamState {
    #[default]
    Active,
    Locked,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub name: String,
    pub hash: u64,
    /// Creation time, ms since the epoch.
    pub created: u64,
    /// Maximum event age in seconds, if limited.
    pub max_age: Option<u64>,
    /// Maximum number of events kept, if limited.
    pub max_count: Option<u32>,
    /// Grants per principal id.
    pub permissions: HashMap<String, Permission>,
    pub metadata: HashMap<String, String>,
    pub state: StreamState,
}

impl StreamMetadata {
    pub fn new(name: impl Into<String>, hash: u64) -> Self {
        Self {
            name: name.into(),
            hash,
            created: now_millis(),
            max_age: None,
            max_count: None,
            permissions: HashMap::new(),
            metadata: HashMap::new(),
            state: StreamState::Active,
        }
    }

    pub fn permission(&self, principal: &str) -> Permission {
        self.permissions.get(principal).copied().unwrap_or_default()
    }

    /// Write access implies read access. Deleted streams grant nothing.
    pub fn has_read_permission(&self, principal: &str) -> bool {
        self.state != StreamState::Deleted
            && matches!(self.permission(principal), Permission::Read | Permission::Write)
    }

    pub fn has_write_permission(&self, principal: &str) -> bool {
        self.state == StreamState::Active && self.permission(principal) == Permission::Write
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn is_deleted(&self) -> bool {
        self.state == StreamState::Deleted
    }
}

/// Looks up the last indexed version of a stream the registry has not seen yet.
pub type VersionFetcher = Box<dyn Fn(u64) -> Result<i32> + Send + Sync>;

pub struct Streams {
    hasher: StreamHasher,
    streams: DashMap<u64, StreamMetadata>,
    versions: DashMap<u64, i32>,
    version_fetcher: Option<VersionFetcher>,
    metrics: Metrics,
}

impl Streams {
    pub fn new(config: &StreamsConfig, metrics: Metrics) -> Self {
        Self {
            hasher: StreamHasher::with_seeds(config.high_hash_seed, config.low_hash_seed),
            streams: DashMap::new(),
            versions: DashMap::new(),
            version_fetcher: None,
            metrics,
        }
    }

    /// Seeds unknown stream versions from `fetcher`, usually the index.
    pub fn with_version_fetcher(
        mut self,
        fetcher: impl Fn(u64) -> Result<i32> + Send + Sync + 'static,
    ) -> Self {
        self.version_fetcher = Some(Box::new(fetcher));
        self
    }

    pub fn hash_of(&self, name: &str) -> u64 {
        self.hasher.hash(name)
    }

    /// Registers a stream. Fails with [`Error::StreamExists`] if its hash is taken.
    pub fn create(&self, metadata: StreamMetadata) -> Result<StreamMetadata> {
        match self.streams.entry(metadata.hash) {
            Entry::Occupied(existing) => Err(Error::StreamExists {
                name: existing.get().name.clone(),
                hash: metadata.hash,
            }),
            Entry::Vacant(slot) => {
                info!("Created stream {} ({:#018x})", metadata.name, metadata.hash);
                Ok(slot.insert(metadata).clone())
            }
        }
    }

    /// Returns the stream named `name`, creating it first if needed.
    ///
    /// `on_create` runs only for a new stream, before it becomes visible.
    pub fn get_or_create(
        &self,
        name: &str,
        on_create: impl FnOnce(&mut StreamMetadata),
    ) -> StreamMetadata {
        let hash = self.hash_of(name);
        self.streams
            .entry(hash)
            .or_insert_with(|| {
                let mut metadata = StreamMetadata::new(name, hash);
                on_create(&mut metadata);
                debug!("Created stream {} on first use", name);
                metadata
            })
            .clone()
    }

    pub fn get(&self, hash: u64) -> Option<StreamMetadata> {
        self.streams.get(&hash).map(|m| m.value().clone())
    }

    /// Applies `f` to the stream's metadata and returns the new value.
    pub fn update(
        &self,
        hash: u64,
        f: impl FnOnce(&mut StreamMetadata),
    ) -> Option<StreamMetadata> {
        self.streams.get_mut(&hash).map(|mut m| {
            f(m.value_mut());
            m.value().clone()
        })
    }

    /// Marks the stream deleted. Its index entries are left in place.
    pub fn delete(&self, hash: u64) -> bool {
        match self.streams.get_mut(&hash) {
            Some(mut m) => {
                m.state = StreamState::Deleted;
                info!("Deleted stream {}", m.name);
                true
            }
            None => false,
        }
    }

    pub fn all(&self) -> Vec<StreamMetadata> {
        self.streams.iter().map(|m| m.value().clone()).collect()
    }

    /// Names of live streams matching `pattern`.
    ///
    /// A trailing `*` matches by prefix; anything else must match exactly.
    pub fn stream_matching(&self, pattern: &str) -> BTreeSet<String> {
        let matches = |name: &str| match pattern.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => name == pattern,
        };
        self.streams
            .iter()
            .filter(|m| !m.is_deleted() && matches(&m.name))
            .map(|m| m.name.clone())
            .collect()
    }

    fn fetch_version(&self, hash: u64) -> Result<i32> {
        match &self.version_fetcher {
            Some(fetch) => fetch(hash),
            None => Ok(NO_VERSION),
        }
    }

    /// Version to start from when the registry has no entry for `hash`.
    /// Fetched outside the shard lock.
    fn seed(&self, hash: u64) -> Result<i32> {
        if self.versions.contains_key(&hash) {
            Ok(NO_VERSION)
        } else {
            self.fetch_version(hash)
        }
    }

    /// Current version of the stream, or [`NO_VERSION`].
    pub fn version(&self, hash: u64) -> Result<i32> {
        match self.versions.get(&hash) {
            Some(v) => Ok(*v),
            None => self.fetch_version(hash),
        }
    }

    /// Bumps the version of `hash` if it is still `expected`.
    ///
    /// A stream with no events has version [`NO_VERSION`], so its first
    /// append expects `-1` and gets `0`.
    pub fn try_increment_version(&self, hash: u64, expected: i32) -> Result<i32> {
        let seed = self.seed(hash)?;
        let mut current = self.versions.entry(hash).or_insert(seed);
        let actual = *current;
        if actual != expected {
            drop(current);
            self.metrics.record_version_conflict();
            return Err(Error::VersionConflict {
                stream: hash,
                expected,
                actual,
            });
        }
        *current = actual + 1;
        Ok(actual + 1)
    }

    /// Bumps the version of `hash` without checking it.
    pub fn next_version(&self, hash: u64) -> Result<i32> {
        let seed = self.seed(hash)?;
        let mut current = self.versions.entry(hash).or_insert(seed);
        *current += 1;
        Ok(*current)
    }

    pub fn has_read_permission(&self, hash: u64, principal: &str) -> bool {
        self.streams
            .get(&hash)
            .map_or(false, |m| m.has_read_permission(principal))
    }

    pub fn has_write_permission(&self, hash: u64, principal: &str) -> bool {
        self.streams
            .get(&hash)
            .map_or(false, |m| m.has_write_permission(principal))
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl fmt::Debug for Streams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Streams")
            .field("streams", &self.streams.len())
            .field("versions", &self.versions.len())
            .field("version_fetcher", &self.version_fetcher.is_some())
            .finish()
    }
}
