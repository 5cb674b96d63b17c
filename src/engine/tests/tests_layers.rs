//! Reads across the memtable, immutable memtable and table layers.
//!
//! A command must read the same whichever layer currently holds it, and a
//! newer layer always shadows an older one.

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::engine::Engine;
    use crate::engine::tests::helpers::*;

    #[test]
    fn basic_overwrite_and_remove() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();

        engine.set("a", "1").unwrap();
        engine.set("a", "2").unwrap();
        assert_eq!(engine.get("a").unwrap().as_deref(), Some("2"));

        engine.remove("a").unwrap();
        assert_eq!(engine.get("a").unwrap(), None);
        assert_eq!(engine.get("never").unwrap(), None);
    }

    #[test]
    fn switch_happens_above_threshold() {
        let tmp = TempDir::new().unwrap();
        let config = crate::engine::EngineConfig {
            store_threshold: 4,
            ..small_config()
        };
        let engine = Engine::open(tmp.path(), config.clone()).unwrap();

        for (k, v) in [("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")] {
            assert!(!engine.set(k, v).unwrap());
        }
        assert!(engine.set("e", "5").unwrap());

        let stats = engine.stats().unwrap();
        assert_eq!(stats.memtable_len, 0);
        assert_eq!(stats.immutable_len, 5);
        assert!(tmp.path().join(crate::engine::STAGING_WAL_FILENAME).exists());

        assert!(engine.flush_immutable().unwrap());
        assert!(!tmp.path().join(crate::engine::STAGING_WAL_FILENAME).exists());
        assert_eq!(engine.stats().unwrap().tables_per_level[0], 1);

        for (k, v) in [("a", "1"), ("b", "2"), ("c", "3"), ("d", "4"), ("e", "5")] {
            assert_eq!(engine.get(k).unwrap().as_deref(), Some(v));
        }

        engine.close().unwrap();
        drop(engine);

        let engine = Engine::open(tmp.path(), config).unwrap();
        for (k, v) in [("a", "1"), ("b", "2"), ("c", "3"), ("d", "4"), ("e", "5")] {
            assert_eq!(engine.get(k).unwrap().as_deref(), Some(v));
        }
    }

    #[test]
    fn same_answer_from_every_layer() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), small_config()).unwrap();

        // Nine writes cross the threshold of eight.
        for i in 0..9 {
            if i % 3 == 0 {
                engine.remove(key(i)).unwrap();
            } else {
                engine.set(key(i), format!("v{i}")).unwrap();
            }
        }
        let expected: Vec<Option<String>> = (0..9)
            .map(|i| (i % 3 != 0).then(|| format!("v{i}")))
            .collect();
        let read_all = |engine: &Engine| -> Vec<Option<String>> {
            (0..9).map(|i| engine.get(&key(i)).unwrap()).collect()
        };

        // Immutable memtable.
        assert!(engine.has_immutable().unwrap());
        assert_eq!(read_all(&engine), expected);

        // Level 0.
        flush_pending(&engine);
        assert_eq!(engine.stats().unwrap().tables_per_level[0], 1);
        assert_eq!(read_all(&engine), expected);
    }

    #[test]
    fn memtable_shadows_tables() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), small_config()).unwrap();

        engine.set("k", "table").unwrap();
        engine.set("gone", "table").unwrap();
        engine.flush().unwrap();
        assert_eq!(engine.stats().unwrap().tables_per_level[0], 1);

        engine.set("k", "mem").unwrap();
        engine.remove("gone").unwrap();
        assert_eq!(engine.get("k").unwrap().as_deref(), Some("mem"));
        assert_eq!(engine.get("gone").unwrap(), None);
    }

    #[test]
    fn newer_l0_shadows_older_before_and_after_compaction() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), small_config()).unwrap();

        engine.set("k", "1").unwrap();
        engine.flush().unwrap();
        engine.set("k", "2").unwrap();
        engine.flush().unwrap();

        let stats = engine.stats().unwrap();
        assert_eq!(stats.tables_per_level[0], 2);
        assert_eq!(engine.get("k").unwrap().as_deref(), Some("2"));

        assert!(engine.needs_compaction().unwrap());
        assert!(engine.compact_all().unwrap() >= 1);

        let stats = engine.stats().unwrap();
        assert_eq!(stats.tables_per_level[0], 0);
        assert_eq!(stats.tables_per_level[1], 1);
        assert_eq!(engine.get("k").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn flush_with_empty_memtable_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), small_config()).unwrap();

        engine.flush().unwrap();
        assert!(!engine.flush_immutable().unwrap());
        assert_eq!(engine.stats().unwrap().tables_per_level.iter().sum::<usize>(), 0);
    }
}
