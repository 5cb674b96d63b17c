use std::path::Path;

use tracing_subscriber::EnvFilter;

use crate::command::Command;
use crate::wal::{Wal, WalError, WalIter};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// `n` distinct `Set` commands `key_0000 = val_0000`, ...
pub fn sample_commands(n: usize) -> Vec<Command> {
    (0..n)
        .map(|i| Command::set(format!("key_{i:04}"), format!("val_{i:04}")))
        .collect()
}

/// Replay `path`, returning every decoded command and the first error.
pub fn replay(path: &Path) -> (Vec<Command>, Option<WalError>, WalIter) {
    let mut iter = WalIter::open(path).unwrap();
    let mut cmds = Vec::new();
    let mut first_err = None;
    for item in iter.by_ref() {
        match item {
            Ok(c) => cmds.push(c),
            Err(e) => {
                first_err = Some(e);
                break;
            }
        }
    }
    (cmds, first_err, iter)
}

/// Write `cmds` to a fresh log and return its final size.
pub fn write_log(path: &Path, cmds: &[Command]) -> u64 {
    let mut wal = Wal::open(path, false).unwrap();
    for c in cmds {
        wal.append(c).unwrap();
    }
    let len = wal.len();
    wal.close().unwrap();
    len
}
