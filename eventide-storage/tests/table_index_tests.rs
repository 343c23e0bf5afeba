//! # Table Index Tests

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tempfile::TempDir;

use eventide_core::config::{Config, NamingStrategy};
use eventide_core::metrics::Metrics;
use eventide_core::{Direction, IndexEntry, Range, ENTRY_SIZE, NO_VERSION};
use eventide_storage::{AppenderConfig, CompactionConfig, IndexAppender, SegmentConfig, TableIndex};

fn appender(dir: &Path) -> Arc<IndexAppender> {
    let config = AppenderConfig {
        directory: dir.to_path_buf(),
        segment: SegmentConfig {
            block_size: 8 * ENTRY_SIZE,
            bloom_expected_entries: 1_000,
            ..SegmentConfig::default()
        },
        compaction: CompactionConfig::default(),
        naming: NamingStrategy::ShortUuid,
    };
    Arc::new(IndexAppender::open(config, Metrics::new()).unwrap())
}

#[test]
fn test_unsorted_adds_are_flushed_sorted() {
    let dir = TempDir::new().unwrap();
    let index = TableIndex::new(appender(dir.path()), 10).unwrap();

    let mut entries: Vec<_> = (0..25u64).map(|s| IndexEntry::new(s, 0, s as i64)).collect();
    entries.shuffle(&mut StdRng::seed_from_u64(3));
    for e in &entries {
        index.add(*e).unwrap();
    }

    // Two full flushes, five entries still in memory
    assert_eq!(index.in_memory(), 5);
    assert_eq!(index.appender().entry_count(), 20);

    let all: Vec<_> = index.iterator(Direction::Forward).map(|e| e.unwrap()).collect();
    assert_eq!(all.len(), 25);
    assert!(all.windows(2).all(|p| p[0] < p[1]));
}

#[test]
fn test_lookups_consult_memory_first() {
    let dir = TempDir::new().unwrap();
    let index = TableIndex::new(appender(dir.path()), 100).unwrap();

    for v in 0..3 {
        index.add(IndexEntry::new(9, v, v as i64)).unwrap();
    }
    index.flush().unwrap();
    index.add(IndexEntry::new(9, 3, 30)).unwrap();

    assert_eq!(index.version(9).unwrap(), 3);
    assert_eq!(index.get(9, 3).unwrap(), Some(IndexEntry::new(9, 3, 30)));
    assert_eq!(index.get(9, 1).unwrap(), Some(IndexEntry::new(9, 1, 1)));
    assert_eq!(index.version(10).unwrap(), NO_VERSION);
    assert_eq!(index.get(10, 0).unwrap(), None);
}

#[test]
fn test_flush_of_empty_memory_is_noop() {
    let dir = TempDir::new().unwrap();
    let index = TableIndex::new(appender(dir.path()), 10).unwrap();
    index.flush().unwrap();
    assert_eq!(index.appender().segment_count(), 1);
}

#[test]
fn test_range_spans_memory_and_segments() {
    let dir = TempDir::new().unwrap();
    let index = TableIndex::new(appender(dir.path()), 1_000).unwrap();

    for v in 0..5 {
        index.add(IndexEntry::new(4, v, v as i64)).unwrap();
    }
    index.flush().unwrap();
    for v in 5..10 {
        index.add(IndexEntry::new(4, v, v as i64)).unwrap();
    }
    index.add(IndexEntry::new(5, 0, 0)).unwrap();

    let versions: Vec<i32> = index
        .iterator_range(Range::of(4, 3, 8), Direction::Forward)
        .map(|e| e.unwrap().version)
        .collect();
    assert_eq!(versions, vec![3, 4, 5, 6, 7]);

    let versions: Vec<i32> = index
        .iterator_range(Range::all_of(4), Direction::Backward)
        .map(|e| e.unwrap().version)
        .collect();
    assert_eq!(versions, (0..10).rev().collect::<Vec<_>>());
}

#[test]
fn test_reopen_sees_flushed_entries() {
    let dir = TempDir::new().unwrap();
    {
        let index = TableIndex::new(appender(dir.path()), 50).unwrap();
        for s in (0..120u64).rev() {
            index.add(IndexEntry::new(s, 0, s as i64)).unwrap();
        }
        index.flush().unwrap();
    }

    let index = TableIndex::new(appender(dir.path()), 50).unwrap();
    assert_eq!(index.in_memory(), 0);
    assert_eq!(index.iterator(Direction::Forward).count(), 120);
    assert_eq!(index.get(77, 0).unwrap(), Some(IndexEntry::new(77, 0, 77)));
}

#[test]
fn test_matches_model_under_random_order() {
    let dir = TempDir::new().unwrap();
    let index = TableIndex::new(appender(dir.path()), 64).unwrap();
    let mut rng = StdRng::seed_from_u64(11);

    // Streams interleave at random; each stream's versions still arrive in order
    let mut arrivals: Vec<u64> = (0..30u64).flat_map(|s| std::iter::repeat(s).take(10)).collect();
    arrivals.shuffle(&mut rng);

    let mut next_version = [0i32; 30];
    let mut model = BTreeMap::new();
    for (i, s) in arrivals.into_iter().enumerate() {
        let v = next_version[s as usize];
        next_version[s as usize] += 1;
        index.add(IndexEntry::new(s, v, i as i64)).unwrap();
        model.insert((s, v), i as i64);
    }

    let all: Vec<_> = index.iterator(Direction::Forward).map(|e| e.unwrap()).collect();
    let expected: Vec<_> = model.iter().map(|(&(s, v), &p)| IndexEntry::new(s, v, p)).collect();
    assert_eq!(all, expected);
    for s in 0..30u64 {
        assert_eq!(index.version(s).unwrap(), 9);
    }
}

#[test]
fn test_open_uses_configured_flush_threshold() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.index.directory = dir.path().join("index");
    config.index.memindex_flush_threshold = 3;

    let index = TableIndex::open(&config, Metrics::new()).unwrap();
    for v in 0..2 {
        index.add(IndexEntry::new(1, v, v as i64)).unwrap();
    }
    assert_eq!(index.in_memory(), 2);
    assert_eq!(index.appender().entry_count(), 0);

    index.add(IndexEntry::new(1, 2, 2)).unwrap();
    assert_eq!(index.in_memory(), 0);
    assert_eq!(index.appender().entry_count(), 3);
    assert!(dir.path().join("index").is_dir());
}

#[test]
fn test_failed_flush_keeps_entries_readable() {
    let dir = TempDir::new().unwrap();
    let index_dir = dir.path().join("index");
    let index = TableIndex::new(appender(&index_dir), 100).unwrap();

    for v in 0..3 {
        index.add(IndexEntry::new(6, v, v as i64 * 8)).unwrap();
    }
    // Side files and the manifest can no longer be written
    std::fs::remove_dir_all(&index_dir).unwrap();

    assert!(index.flush().is_err());
    assert_eq!(index.in_memory(), 3);
    assert_eq!(index.version(6).unwrap(), 2);
    assert_eq!(index.get(6, 1).unwrap(), Some(IndexEntry::new(6, 1, 8)));
}
