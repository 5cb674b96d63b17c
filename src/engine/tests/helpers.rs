use std::collections::BTreeMap;

use tracing_subscriber::EnvFilter;

use crate::engine::{Engine, EngineConfig};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Large threshold: everything stays in the memtable.
pub fn memtable_only_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        store_threshold: 100_000,
        ..EngineConfig::default()
    }
}

/// Switches every few writes and compacts eagerly across a short tree.
pub fn small_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        store_threshold: 8,
        part_size: 4,
        l0_trigger: 2,
        level1_budget_bytes: 4 * 1024,
        level_size_multiplier: 4,
        max_sstable_bytes: 2 * 1024,
        max_levels: 4,
        sync_writes: false,
    }
}

/// Flush whatever immutable memtable is pending, as a background worker would.
pub fn flush_pending(engine: &Engine) {
    while engine.has_immutable().unwrap() {
        engine.flush_immutable().unwrap();
    }
}

/// Apply a write to the engine and mirror it in `model`; flush when the
/// engine asks for it.
pub fn apply(engine: &Engine, model: &mut BTreeMap<String, Option<String>>, key: &str, value: Option<&str>) {
    let needs_flush = match value {
        Some(v) => engine.set(key, v).unwrap(),
        None => engine.remove(key).unwrap(),
    };
    model.insert(key.to_owned(), value.map(str::to_owned));
    if needs_flush {
        flush_pending(engine);
    }
}

/// Assert the engine agrees with `model` on every key.
pub fn assert_matches_model(engine: &Engine, model: &BTreeMap<String, Option<String>>) {
    for (key, expected) in model {
        assert_eq!(
            engine.get(key).unwrap().as_deref(),
            expected.as_deref(),
            "key {key}"
        );
    }
}

/// Check that no two tables at any level >= 1 overlap and that every
/// level >= 1 is sorted by smallest key.
pub fn assert_levels_disjoint(engine: &Engine) {
    let version = engine.version().unwrap();
    for (level, tables) in version.levels().iter().enumerate().skip(1) {
        for pair in tables.windows(2) {
            assert!(
                pair[0].largest_key() < pair[1].smallest_key(),
                "level {level}: tables {} and {} overlap",
                pair[0].file_number(),
                pair[1].file_number()
            );
        }
    }
}

pub fn key(i: usize) -> String {
    format!("key_{i:05}")
}
