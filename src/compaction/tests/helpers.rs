use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing_subscriber::EnvFilter;

use crate::command::Command;
use crate::sstable::{SSTable, builder::write_table};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Table at `level` holding `cmds`, which must already be sorted.
pub fn table_of(dir: &Path, file_number: u64, level: u32, cmds: &[Command]) -> Arc<SSTable> {
    Arc::new(write_table(dir, file_number, level, 4, cmds).unwrap())
}

/// Table at `level` setting every key in `keys` to `value`.
pub fn table(dir: &Path, file_number: u64, level: u32, keys: &[&str], value: &str) -> Arc<SSTable> {
    let cmds: Vec<_> = keys.iter().map(|k| Command::set(*k, value)).collect();
    table_of(dir, file_number, level, &cmds)
}

/// Table at `level` with `n` keys `{prefix}{i:04}` padded with long values.
pub fn wide_table(dir: &Path, file_number: u64, level: u32, prefix: &str, n: usize) -> Arc<SSTable> {
    let cmds: Vec<_> = (0..n)
        .map(|i| Command::set(format!("{prefix}{i:04}"), "v".repeat(200)))
        .collect();
    table_of(dir, file_number, level, &cmds)
}

/// File number allocator starting at `first`.
pub struct Allocator(AtomicU64);

impl Allocator {
    pub fn starting_at(first: u64) -> Self {
        Self(AtomicU64::new(first))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

pub fn scan(table: &SSTable) -> Vec<Command> {
    table.iter().collect::<Result<_, _>>().unwrap()
}
