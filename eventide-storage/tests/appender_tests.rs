//! # Index Appender Tests
//!
//! This test suite verifies:
//! - Appends, rolls and lookups across many segments
//! - Forward, backward and range iteration
//! - Compaction and the segment swap
//! - Reopening from the manifest

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use eventide_core::config::NamingStrategy;
use eventide_core::error::Error;
use eventide_core::metrics::Metrics;
use eventide_core::{Direction, IndexEntry, Range, ENTRY_SIZE, NO_VERSION};
use eventide_storage::segment::{IndexSegment, SEGMENT_EXT};
use eventide_storage::{AppenderConfig, CompactionConfig, IndexAppender, SegmentCombiner, SegmentConfig};

/// Set RUST_LOG=debug to see segment lifecycle logs.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config(dir: &Path) -> AppenderConfig {
    AppenderConfig {
        directory: dir.to_path_buf(),
        segment: SegmentConfig {
            block_size: 4 * ENTRY_SIZE,
            bloom_expected_entries: 1_000,
            ..SegmentConfig::default()
        },
        compaction: CompactionConfig {
            threshold: 4,
            ..CompactionConfig::default()
        },
        naming: NamingStrategy::Timestamp,
    }
}

fn open(dir: &Path) -> IndexAppender {
    IndexAppender::open(config(dir), Metrics::new()).unwrap()
}

/// Appends `segments` rolled segments of `per_segment` consecutive streams each.
fn fill(appender: &IndexAppender, segments: u64, per_segment: u64) {
    for seg in 0..segments {
        for i in 0..per_segment {
            let stream = seg * per_segment + i;
            appender.append(IndexEntry::new(stream, 0, stream as i64 * 100)).unwrap();
        }
        appender.roll().unwrap();
    }
}

fn segment_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter(|f| {
            f.as_ref()
                .unwrap()
                .path()
                .extension()
                .map_or(false, |ext| ext == SEGMENT_EXT)
        })
        .count()
}

#[test]
fn test_iterate_across_rolled_segments() {
    let dir = TempDir::new().unwrap();
    let appender = open(dir.path());
    fill(&appender, 10, 10);

    // Ten rolled segments plus the empty active one
    assert_eq!(appender.segment_count(), 11);
    assert_eq!(appender.entry_count(), 100);

    let entries: Vec<_> = appender
        .iterator(Direction::Forward)
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(entries.len(), 100);
    assert_eq!(entries[0].stream, 0);
    for pair in entries.windows(2) {
        assert_eq!(pair[1].stream, pair[0].stream + 1);
    }
}

#[test]
fn test_backward_iteration() {
    let dir = TempDir::new().unwrap();
    let appender = open(dir.path());
    fill(&appender, 3, 5);
    appender.append(IndexEntry::new(100, 0, 0)).unwrap();

    let forward: Vec<_> = appender.iterator(Direction::Forward).map(|e| e.unwrap()).collect();
    let mut backward: Vec<_> = appender.iterator(Direction::Backward).map(|e| e.unwrap()).collect();
    assert_eq!(forward.len(), 16);
    backward.reverse();
    assert_eq!(forward, backward);
}

#[test]
fn test_version_lookup() {
    let dir = TempDir::new().unwrap();
    let appender = open(dir.path());

    for v in 0..3 {
        appender.append(IndexEntry::new(5, v, v as i64)).unwrap();
    }
    appender.roll().unwrap();
    for v in 3..5 {
        appender.append(IndexEntry::new(5, v, v as i64)).unwrap();
    }

    assert_eq!(appender.version(5).unwrap(), 4);
    assert_eq!(appender.version(6).unwrap(), NO_VERSION);
    assert_eq!(appender.version(u64::MAX).unwrap(), NO_VERSION);
}

#[test]
fn test_get_reaches_older_segments() {
    let dir = TempDir::new().unwrap();
    let appender = open(dir.path());
    fill(&appender, 4, 8);

    assert_eq!(appender.get(3, 0).unwrap(), Some(IndexEntry::new(3, 0, 300)));
    assert_eq!(appender.get(31, 0).unwrap(), Some(IndexEntry::new(31, 0, 3100)));
    assert_eq!(appender.get(31, 1).unwrap(), None);
    assert_eq!(appender.get(32, 0).unwrap(), None);
}

#[test]
fn test_range_iteration() {
    let dir = TempDir::new().unwrap();
    let appender = open(dir.path());

    for stream in 1..=3u64 {
        for v in 0..10 {
            appender.append(IndexEntry::new(stream, v, v as i64)).unwrap();
        }
        appender.roll().unwrap();
    }

    let versions: Vec<i32> = appender
        .iterator_range(Range::of(2, 3, 7), Direction::Forward)
        .map(|e| e.unwrap().version)
        .collect();
    assert_eq!(versions, vec![3, 4, 5, 6]);

    let versions: Vec<i32> = appender
        .iterator_range(Range::all_of(3), Direction::Backward)
        .map(|e| e.unwrap().version)
        .collect();
    assert_eq!(versions, (0..10).rev().collect::<Vec<_>>());

    assert_eq!(appender.iterator_range(Range::all_of(9), Direction::Forward).count(), 0);
}

#[test]
fn test_out_of_order_append_is_rejected() {
    let dir = TempDir::new().unwrap();
    let appender = open(dir.path());
    appender.append(IndexEntry::new(5, 1, 0)).unwrap();

    let err = appender.append(IndexEntry::new(5, 0, 0)).unwrap_err();
    assert!(matches!(err, Error::ProtocolViolation { .. }));
    assert!(!err.is_recoverable());

    // A new segment starts a new key order
    appender.roll().unwrap();
    appender.append(IndexEntry::new(1, 0, 0)).unwrap();
}

#[test]
fn test_roll_of_empty_segment_is_noop() {
    let dir = TempDir::new().unwrap();
    let appender = open(dir.path());
    appender.roll().unwrap();
    appender.roll().unwrap();
    assert_eq!(appender.segment_count(), 1);
    assert_eq!(appender.metrics().snapshot().segments_rolled, 0);
}

#[test]
fn test_segment_rolls_when_full() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path());
    config.segment.max_segment_size = 512;
    let appender = IndexAppender::open(config, Metrics::new()).unwrap();

    for stream in 0..200u64 {
        appender.append(IndexEntry::new(stream, 0, 0)).unwrap();
    }
    assert!(appender.segment_count() > 2);
    assert_eq!(appender.iterator(Direction::Forward).count(), 200);
}

#[test]
fn test_compaction_merges_levels() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let appender = open(dir.path());
    fill(&appender, 8, 10);
    assert_eq!(segment_files(dir.path()), 9);

    assert_eq!(appender.compact().unwrap(), 2);

    let segments = appender.segments();
    assert_eq!(segments.len(), 3);
    assert_eq!(segments.iter().filter(|s| s.level == 2).count(), 2);
    assert_eq!(segments.last().unwrap().level, 0);
    // Inputs are gone once nothing references them
    assert_eq!(segment_files(dir.path()), 3);

    let entries: Vec<_> = appender.iterator(Direction::Forward).map(|e| e.unwrap()).collect();
    assert_eq!(entries.len(), 80);
    assert!(entries.windows(2).all(|p| p[0] < p[1]));
    assert_eq!(appender.metrics().snapshot().compactions, 2);
}

#[test]
fn test_compaction_keeps_newest_duplicate() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path());
    config.compaction.threshold = 2;
    let appender = IndexAppender::open(config, Metrics::new()).unwrap();

    appender.append(IndexEntry::new(1, 0, 10)).unwrap();
    appender.append(IndexEntry::new(2, 0, 11)).unwrap();
    appender.roll().unwrap();
    appender.append(IndexEntry::new(1, 0, 20)).unwrap();
    appender.roll().unwrap();

    assert_eq!(appender.get(1, 0).unwrap().unwrap().position, 20);
    assert_eq!(appender.compact().unwrap(), 1);
    assert_eq!(appender.get(1, 0).unwrap().unwrap().position, 20);
    assert_eq!(appender.entry_count(), 2);
}

#[test]
fn test_non_unique_compaction_keeps_duplicates() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path());
    config.compaction.threshold = 2;
    config.compaction.combiner = SegmentCombiner::NonUniqueMerge;
    let appender = IndexAppender::open(config, Metrics::new()).unwrap();

    appender.append(IndexEntry::new(1, 0, 10)).unwrap();
    appender.roll().unwrap();
    appender.append(IndexEntry::new(1, 0, 20)).unwrap();
    appender.roll().unwrap();

    assert_eq!(appender.compact().unwrap(), 1);
    assert_eq!(appender.entry_count(), 2);
}

#[test]
fn test_compaction_disabled() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path());
    config.compaction.enabled = false;
    let appender = IndexAppender::open(config, Metrics::new()).unwrap();
    fill(&appender, 6, 2);
    assert_eq!(appender.compact().unwrap(), 0);
    assert_eq!(appender.segment_count(), 7);
}

#[test]
fn test_spawn_compaction() {
    let dir = TempDir::new().unwrap();
    let appender = Arc::new(open(dir.path()));
    fill(&appender, 4, 25);

    let handle = appender.spawn_compaction().unwrap();
    assert_eq!(handle.join().unwrap().unwrap(), 1);
    assert_eq!(appender.segment_count(), 2);
    assert_eq!(appender.iterator(Direction::Forward).count(), 100);
}

#[test]
fn test_reopen_from_manifest() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    {
        let appender = open(dir.path());
        fill(&appender, 3, 10);
        appender.append(IndexEntry::new(500, 0, 1)).unwrap();
        appender.append(IndexEntry::new(500, 1, 2)).unwrap();
        appender.flush().unwrap();
    }

    let appender = open(dir.path());
    assert_eq!(appender.segment_count(), 4);
    assert_eq!(appender.entry_count(), 32);
    assert_eq!(appender.version(500).unwrap(), 1);
    assert_eq!(appender.get(12, 0).unwrap(), Some(IndexEntry::new(12, 0, 1200)));

    // The recovered writable segment keeps taking appends
    appender.append(IndexEntry::new(500, 2, 3)).unwrap();
    assert_eq!(appender.version(500).unwrap(), 2);
}

#[test]
fn test_reopen_after_compaction() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    {
        let appender = open(dir.path());
        fill(&appender, 4, 5);
        assert_eq!(appender.compact().unwrap(), 1);
    }

    let appender = open(dir.path());
    assert_eq!(appender.entry_count(), 20);
    fill(&appender, 4, 5);
    // A second level-2 output must not collide with the first
    assert_eq!(appender.compact().unwrap(), 1);
    assert_eq!(appender.segments().iter().filter(|s| s.level == 2).count(), 2);
}

#[test]
fn test_missing_listed_segment_fails_open() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let lost = {
        let appender = open(dir.path());
        fill(&appender, 2, 5);
        appender.segments()[0].name.clone()
    };
    fs::remove_file(dir.path().join(format!("{}.{}", lost, SEGMENT_EXT))).unwrap();

    match IndexAppender::open(config(dir.path()), Metrics::new()) {
        Err(Error::Internal { message }) => {
            assert!(message.starts_with(&format!("cannot open segment {}: ", lost)), "{}", message);
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("open succeeded without {}", lost),
    }
}

#[test]
fn test_unlisted_segment_is_ignored() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    {
        let stray = IndexSegment::create(dir.path(), "stray", 1, SegmentConfig::default(), Metrics::new()).unwrap();
        stray.append(IndexEntry::new(42, 0, 0)).unwrap();
        stray.roll(1).unwrap();
    }

    let appender = open(dir.path());
    assert_eq!(appender.segment_count(), 1);
    assert_eq!(appender.version(42).unwrap(), NO_VERSION);
    assert!(dir.path().join(format!("stray.{}", SEGMENT_EXT)).exists());
}

#[test]
fn test_random_workload_matches_model() {
    let dir = TempDir::new().unwrap();
    let appender = open(dir.path());
    let mut rng = StdRng::seed_from_u64(7);
    let mut model = BTreeMap::new();
    let mut next_version = [0i32; 40];

    for _ in 0..6 {
        let mut streams: Vec<u64> = (0..20).map(|_| rng.gen_range(0..40u64)).collect();
        streams.sort_unstable();
        streams.dedup();
        for stream in streams {
            for _ in 0..rng.gen_range(1..4) {
                let version = next_version[stream as usize];
                next_version[stream as usize] += 1;
                let position = rng.gen_range(0..1_000_000i64);
                appender.append(IndexEntry::new(stream, version, position)).unwrap();
                model.insert((stream, version), position);
            }
        }
        appender.roll().unwrap();
    }
    appender.compact().unwrap();

    let entries: Vec<_> = appender.iterator(Direction::Forward).map(|e| e.unwrap()).collect();
    let expected: Vec<_> = model
        .iter()
        .map(|(&(s, v), &p)| IndexEntry::new(s, v, p))
        .collect();
    assert_eq!(entries, expected);

    for (stream, &next) in next_version.iter().enumerate() {
        assert_eq!(appender.version(stream as u64).unwrap(), next - 1);
    }
}
