//! Randomized checks against an in-memory model, with fixed seeds.
//!
//! - last write wins per key across close and reopen;
//! - dropping the engine at any point loses no acknowledged write;
//! - compaction never changes what a read returns.

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    use crate::engine::Engine;
    use crate::engine::tests::helpers::*;

    type Model = BTreeMap<String, Option<String>>;

    fn random_ops(engine: &Engine, model: &mut Model, rng: &mut StdRng, n: usize) {
        for i in 0..n {
            let k = key(rng.random_range(0..200));
            if rng.random_bool(0.25) {
                apply(engine, model, &k, None);
            } else {
                apply(engine, model, &k, Some(&format!("v{i}-{}", rng.random_range(0..1000))));
            }
        }
    }

    #[test]
    fn last_write_wins_across_reopen() {
        for seed in [1u64, 7, 42] {
            let tmp = TempDir::new().unwrap();
            let mut rng = StdRng::seed_from_u64(seed);
            let mut model = Model::new();

            for _ in 0..3 {
                let engine = Engine::open(tmp.path(), small_config()).unwrap();
                assert_matches_model(&engine, &model);
                random_ops(&engine, &mut model, &mut rng, 150);
                if rng.random_bool(0.5) {
                    engine.compact_all().unwrap();
                }
                engine.close().unwrap();
            }

            let engine = Engine::open(tmp.path(), small_config()).unwrap();
            assert_matches_model(&engine, &model);
        }
    }

    #[test]
    fn crash_at_any_prefix_keeps_acknowledged_writes() {
        let mut rng = StdRng::seed_from_u64(0xC0FFEE);
        for _ in 0..5 {
            let tmp = TempDir::new().unwrap();
            let mut model = Model::new();
            let prefix = rng.random_range(1..120);
            {
                let engine = Engine::open(tmp.path(), small_config()).unwrap();
                for i in 0..prefix {
                    let k = key(rng.random_range(0..50));
                    // Leave flushes pending now and then so the staging WAL
                    // is part of the crash state.
                    let needs_flush = if rng.random_bool(0.2) {
                        model.insert(k.clone(), None);
                        engine.remove(k.as_str()).unwrap()
                    } else {
                        model.insert(k.clone(), Some(format!("{i}")));
                        engine.set(k.as_str(), format!("{i}")).unwrap()
                    };
                    if needs_flush && rng.random_bool(0.5) {
                        flush_pending(&engine);
                    }
                }
                // Dropped without close.
            }

            let engine = Engine::open(tmp.path(), small_config()).unwrap();
            assert_matches_model(&engine, &model);
        }
    }

    #[test]
    fn compaction_preserves_reads() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), small_config()).unwrap();
        let mut rng = StdRng::seed_from_u64(99);
        let mut model = Model::new();

        random_ops(&engine, &mut model, &mut rng, 600);
        engine.flush().unwrap();
        let before: Vec<Option<String>> = (0..200).map(|i| engine.get(&key(i)).unwrap()).collect();

        engine.compact_all().unwrap();
        let after: Vec<Option<String>> = (0..200).map(|i| engine.get(&key(i)).unwrap()).collect();

        assert_eq!(before, after);
        assert_matches_model(&engine, &model);
        assert_levels_disjoint(&engine);
    }
}
