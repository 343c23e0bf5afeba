//! Unit tests for eventide-core

use bytes::BytesMut;
use eventide_core::{
    config::Config, Direction, Error, IndexEntry, Midpoint, Range, Serializer, StreamHasher,
    ENTRY_SIZE, NO_VERSION,
};

mod entry_tests {
    use super::*;

    #[test]
    fn test_many_entries_share_one_buffer() {
        let entries: Vec<_> = (0..50u64)
            .map(|i| IndexEntry::new(i * 3, (i % 7) as i32, i as i64 * 100))
            .collect();

        let mut buf = BytesMut::new();
        for e in &entries {
            e.write_to(&mut buf);
        }
        assert_eq!(buf.len(), entries.len() * ENTRY_SIZE);

        let mut bytes = buf.freeze();
        for expected in &entries {
            assert_eq!(&IndexEntry::from_bytes(&mut bytes).unwrap(), expected);
        }
        assert!(IndexEntry::from_bytes(&mut bytes).is_err());
    }

    #[test]
    fn test_midpoint_order_follows_key() {
        let a = Midpoint::new(IndexEntry::new(1, 5, 0), 900);
        let b = Midpoint::new(IndexEntry::new(2, 0, 0), 10);
        assert!(a < b);
    }

    #[test]
    fn test_no_version_sentinel() {
        assert_eq!(NO_VERSION, -1);
        assert!(Range::all_of(1).contains(&IndexEntry::probe(1, 0)));
        assert!(!Range::all_of(1).contains(&IndexEntry::probe(1, NO_VERSION)));
    }

    #[test]
    fn test_direction_sorts() {
        let mut entries = vec![IndexEntry::probe(2, 0), IndexEntry::probe(1, 0), IndexEntry::probe(3, 0)];
        entries.sort_by(|a, b| Direction::Backward.order(a, b));
        assert_eq!(entries.iter().map(|e| e.stream).collect::<Vec<_>>(), vec![3, 2, 1]);
    }
}

mod hasher_tests {
    use super::*;

    #[test]
    fn test_distinct_names_rarely_collide() {
        let hasher = StreamHasher::default();
        let mut seen = std::collections::HashSet::new();
        for i in 0..10_000 {
            assert!(seen.insert(hasher.hash(&format!("stream-{}", i))));
        }
    }
}

mod config_tests {
    use super::*;

    #[test]
    fn test_invalid_file_reports_configuration_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Config::from_file(&path), Err(Error::Configuration { .. })));
    }
}

mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_entry_encoding_is_stable(stream: u64, version: i32, position: i64) {
            let entry = IndexEntry::new(stream, version, position);
            let mut bytes = entry.to_bytes();
            prop_assert_eq!(bytes.len(), ENTRY_SIZE);
            prop_assert_eq!(IndexEntry::from_bytes(&mut bytes).unwrap(), entry);
        }

        #[test]
        fn prop_ordering_matches_key_tuple(a: (u64, i32), b: (u64, i32)) {
            let ea = IndexEntry::probe(a.0, a.1);
            let eb = IndexEntry::probe(b.0, b.1);
            prop_assert_eq!(ea.cmp_key(&eb), a.cmp(&b));
        }
    }
}
