use std::{path::Path, sync::Arc};

use tracing_subscriber::EnvFilter;

use crate::command::Command;
use crate::sstable::{SSTable, builder::write_table};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Table `file_number` at `level` holding `Set key=value` for every key.
pub fn table(dir: &Path, file_number: u64, level: u32, keys: &[&str], value: &str) -> Arc<SSTable> {
    let cmds: Vec<_> = keys.iter().map(|k| Command::set(*k, value)).collect();
    Arc::new(write_table(dir, file_number, level, 4, &cmds).unwrap())
}

pub fn file_numbers(tables: &[Arc<SSTable>]) -> Vec<u64> {
    tables.iter().map(|t| t.file_number()).collect()
}
