use std::path::Path;

use tracing_subscriber::EnvFilter;

use crate::command::Command;
use crate::sstable::{SSTable, builder::write_table};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// `n` sorted commands; every seventh key is a tombstone.
pub fn sorted_commands(n: usize) -> Vec<Command> {
    (0..n)
        .map(|i| {
            let key = format!("key_{i:05}");
            if i % 7 == 3 {
                Command::remove(key)
            } else {
                Command::set(key, format!("value_{i}"))
            }
        })
        .collect()
}

pub fn build(dir: &Path, file_number: u64, part_size: usize, cmds: &[Command]) -> SSTable {
    write_table(dir, file_number, 0, part_size, cmds).unwrap()
}
