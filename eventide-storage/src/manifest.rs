//! # Manifest - Segment Set Management
//!
//! The manifest records which segments make up the index and at which
//! level each one lives. It is rewritten on every roll and every
//! compaction swap; a segment file that is not listed is not part of the
//! index.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use eventide_core::error::{Error, Result};

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u64,
    pub segments: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub level: u32,
    pub created: u64,
    pub entries: u64,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE)
    }

    pub fn load_or_create(dir: &Path) -> Result<Self> {
        let path = Self::path(dir);
        match fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data).map_err(|e| {
                Error::corrupt(format!("manifest {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replaces the manifest on disk.
    pub fn save(&mut self, dir: &Path) -> Result<()> {
        self.version += 1;
        let path = Self::path(dir);
        let tmp = dir.join(format!("{}.tmp", MANIFEST_FILE));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&serde_json::to_vec_pretty(self)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        debug!("Saved manifest v{} with {} segments", self.version, self.segments.len());
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.segments.iter().any(|s| s.name == name)
    }

    /// Adds or updates the entry for `entry.name`.
    pub fn upsert(&mut self, entry: ManifestEntry) {
        match self.segments.iter_mut().find(|s| s.name == entry.name) {
            Some(existing) => *existing = entry,
            None => self.segments.push(entry),
        }
    }

    pub fn remove_segments(&mut self, names: &[String]) {
        self.segments.retain(|s| !names.contains(&s.name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(name: &str, level: u32) -> ManifestEntry {
        ManifestEntry {
            name: name.to_string(),
            level,
            created: 1,
            entries: 10,
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        assert_eq!(Manifest::load_or_create(dir.path()).unwrap(), Manifest::new());

        let mut manifest = Manifest::new();
        manifest.upsert(entry("index-1", 0));
        manifest.upsert(entry("index-2", 1));
        manifest.save(dir.path()).unwrap();

        let loaded = Manifest::load_or_create(dir.path()).unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.version, 1);
        assert!(!dir.path().join("manifest.json.tmp").exists());
    }

    #[test]
    fn test_upsert_and_remove() {
        let mut manifest = Manifest::new();
        manifest.upsert(entry("a", 0));
        manifest.upsert(entry("b", 1));
        manifest.upsert(entry("a", 1));
        assert_eq!(manifest.segments.len(), 2);
        assert_eq!(manifest.segments[0].level, 1);

        manifest.remove_segments(&["a".to_string()]);
        assert!(!manifest.contains("a"));
        assert!(manifest.contains("b"));
    }

    #[test]
    fn test_corrupt_manifest() {
        let dir = TempDir::new().unwrap();
        fs::write(Manifest::path(dir.path()), b"{ truncated").unwrap();
        assert!(matches!(
            Manifest::load_or_create(dir.path()),
            Err(Error::CorruptData { .. })
        ));
    }
}
