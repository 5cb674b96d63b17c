//! # LSM Storage Engine
//!
//! This module implements the **synchronous**, **crash-safe** core of the
//! store. It owns the memtable pair, the write-ahead log and the level
//! manifest, and exposes the operations the background workers of
//! [`crate::Store`] call: flushing the immutable memtable and running one
//! compaction round.
//!
//! ## Design Overview
//!
//! Data lives in three layers, queried newest-first:
//!
//! 1. **Mutable memtable**, backed by the WAL file `wal`.
//! 2. **Immutable memtable** (at most one), backed by the staging WAL
//!    `walTmp` until its flush commits.
//! 3. **SSTables**, organised in levels by the [`Manifest`].
//!
//! A write appends to the WAL and then applies to the mutable memtable. Once
//! the memtable holds more than [`EngineConfig::store_threshold`] entries and
//! no immutable memtable is pending, it is *switched*: the WAL is renamed to
//! `walTmp`, a fresh `wal` is started and the memtable becomes immutable.
//! [`Engine::flush_immutable`] later writes it to a level-0 table.
//!
//! ## Concurrency Model
//!
//! One `RwLock` guards the memtables, the WAL handle and the current
//! [`Version`] pointer. Writes take the write lock; only the WAL append and
//! the switch do I/O under it. Reads take the read lock just long enough to
//! check the memtables and clone the version, then probe tables unlocked.
//!
//! Flushes are serialized by a flush mutex and compactions by a compaction
//! mutex. Every manifest install happens under the manifest mutex, which is
//! always taken before the state lock, and the new version is published
//! while it is still held so versions are never published out of order.
//!
//! ## Guarantees
//!
//! - **Durability:** every acknowledged write has reached the WAL file.
//! - **Crash recovery:** [`Engine::open`] flushes a leftover staging WAL to
//!   level 0, then replays the active WAL into the memtable, cutting off a
//!   torn final record.
//! - **Atomic flushes and compactions:** the manifest snapshot is the commit
//!   point; anything written before it is discarded on failure.

#[cfg(test)]
mod tests;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::command::Command;
use crate::compaction::{
    self, CompactionError, CompactionStrategy, OutputOptions, leveled::LeveledStrategy,
};
use crate::manifest::{Manifest, ManifestError, Recovered, Version};
use crate::memtable::{FrozenMemtable, Memtable};
use crate::sstable::{SSTableError, builder::write_table};
use crate::wal::{self, Wal, WalError, WalIter};

/// Name of the active write-ahead log inside the store directory.
pub const WAL_FILENAME: &str = "wal";

/// Name of the staging log holding the immutable memtable's commands.
pub const STAGING_WAL_FILENAME: &str = "walTmp";

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Error originating from the write-ahead log.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Error originating from the SSTable subsystem.
    #[error("SSTable error: {0}")]
    SSTable(#[from] SSTableError),

    /// Error originating from the level manifest.
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Error originating from a compaction run.
    #[error("Compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine has been closed and its WAL released.
    #[error("engine is not open")]
    NotOpen,

    /// Internal invariant violation (poisoned lock, unexpected state, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration for an [`Engine`] instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Memtable entry count above which the memtable is switched.
    pub store_threshold: usize,

    /// Commands per SSTable part.
    pub part_size: usize,

    /// Level-0 table count that makes level 0 eligible for compaction.
    pub l0_trigger: usize,

    /// Byte budget of level 1.
    pub level1_budget_bytes: u64,

    /// Budget growth factor from one level to the next.
    pub level_size_multiplier: u64,

    /// Size at which a compaction output table is cut.
    pub max_sstable_bytes: u64,

    /// Number of levels, including level 0.
    pub max_levels: usize,

    /// Fsync the WAL after every append.
    pub sync_writes: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_threshold: 1024,
            part_size: 16,
            l0_trigger: 4,
            level1_budget_bytes: 10 * 1024 * 1024,
            level_size_multiplier: 10,
            max_sstable_bytes: 2 * 1024 * 1024,
            max_levels: 7,
            sync_writes: false,
        }
    }
}

/// Snapshot of engine statistics returned by [`Engine::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    /// Live table count per level, level 0 first.
    pub tables_per_level: Vec<usize>,
    /// Total table file bytes per level.
    pub bytes_per_level: Vec<u64>,
    /// Entries in the mutable memtable.
    pub memtable_len: usize,
    /// Entries in the immutable memtable, 0 if none is pending.
    pub immutable_len: usize,
}

struct EngineState {
    /// Memtable accepting writes.
    mem: Memtable,

    /// Switched memtable waiting for its flush to commit.
    imm: Option<FrozenMemtable>,

    /// Log backing `mem`.
    wal: Wal,

    /// Level tree visible to readers.
    version: Arc<Version>,
}

/// The LSM engine behind a [`crate::Store`].
pub struct Engine {
    dir: PathBuf,
    config: EngineConfig,
    state: RwLock<EngineState>,
    manifest: Mutex<Manifest>,
    flush_lock: Mutex<()>,
    compaction_lock: Mutex<()>,
    strategy: Box<dyn CompactionStrategy>,
    next_file_number: AtomicU64,
    cancel: AtomicBool,
    closed: AtomicBool,
}

impl Engine {
    // --------------------------------------------------------------------------------------------
    // Lock helpers
    // --------------------------------------------------------------------------------------------

    fn read_state(&self) -> Result<RwLockReadGuard<'_, EngineState>, EngineError> {
        self.state
            .read()
            .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, EngineState>, EngineError> {
        self.state
            .write()
            .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
    }

    fn lock_manifest(&self) -> Result<MutexGuard<'_, Manifest>, EngineError> {
        self.manifest
            .lock()
            .map_err(|_| EngineError::Internal("manifest mutex poisoned".into()))
    }

    fn lock<'a>(mutex: &'a Mutex<()>, what: &str) -> Result<MutexGuard<'a, ()>, EngineError> {
        mutex
            .lock()
            .map_err(|_| EngineError::Internal(format!("{what} mutex poisoned")))
    }

    fn check_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::NotOpen);
        }
        Ok(())
    }

    fn allocate_file_number(&self) -> u64 {
        self.next_file_number.fetch_add(1, Ordering::SeqCst)
    }

    fn staging_path(&self) -> PathBuf {
        self.dir.join(STAGING_WAL_FILENAME)
    }

    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Opens (or creates) an engine rooted at `dir`.
    ///
    /// Recovery order: the manifest is loaded (or rebuilt from table
    /// footers), a leftover staging WAL is flushed to a level-0 table and
    /// deleted, and finally the active WAL is replayed into the memtable.
    pub fn open(dir: impl AsRef<Path>, config: EngineConfig) -> Result<Self, EngineError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        // 1. Level tree.
        let Recovered {
            mut manifest,
            next_file_number,
        } = Manifest::open(&dir, config.max_levels)?;
        let next_file_number = AtomicU64::new(next_file_number);

        // 2. Staging WAL left behind by an interrupted flush.
        if dir.join(STAGING_WAL_FILENAME).exists() {
            Self::recover_staging(&dir, &config, &mut manifest, &next_file_number)?;
        }

        // 3. Active WAL.
        let mut wal = Wal::open(dir.join(WAL_FILENAME), config.sync_writes)?;
        let mut mem = Memtable::new();
        let mut replay = wal.iter()?;
        let replayed = replay_into(&mut replay, &mut mem)?;
        if replay.is_truncated() {
            wal.truncate_to(replay.valid_len())?;
        }

        let version = manifest.snapshot();
        info!(
            dir = %dir.display(),
            replayed,
            tables = version.table_count(),
            next_file_number = next_file_number.load(Ordering::SeqCst),
            "engine opened"
        );

        let strategy = LeveledStrategy::new(
            config.l0_trigger,
            config.level1_budget_bytes,
            config.level_size_multiplier,
        );

        Ok(Self {
            dir,
            state: RwLock::new(EngineState {
                mem,
                imm: None,
                wal,
                version,
            }),
            manifest: Mutex::new(manifest),
            flush_lock: Mutex::new(()),
            compaction_lock: Mutex::new(()),
            strategy: Box::new(strategy),
            next_file_number,
            cancel: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            config,
        })
    }

    /// Make the commands of a leftover staging WAL durable as a level-0
    /// table, then delete the staging file.
    fn recover_staging(
        dir: &Path,
        config: &EngineConfig,
        manifest: &mut Manifest,
        next_file_number: &AtomicU64,
    ) -> Result<(), EngineError> {
        let staging = dir.join(STAGING_WAL_FILENAME);
        let mut staged = Memtable::new();
        let mut replay = WalIter::open(&staging)?;
        let replayed = replay_into(&mut replay, &mut staged)?;

        if !staged.is_empty() {
            let file_number = next_file_number.fetch_add(1, Ordering::SeqCst);
            let table = Arc::new(write_table(
                dir,
                file_number,
                0,
                config.part_size,
                staged.iter(),
            )?);
            let pending = Arc::clone(&table);
            if let Err(e) =
                manifest.install(vec![table], &[], next_file_number.load(Ordering::SeqCst))
            {
                pending.mark_obsolete();
                return Err(e.into());
            }
            info!(file_number, entries = staged.len(), "staging WAL flushed to level 0");
        } else {
            debug!(replayed, "staging WAL empty");
        }

        fs::remove_file(&staging)?;
        wal::sync_parent_dir(&staging)?;
        Ok(())
    }

    /// Release the WAL and refuse further operations.
    ///
    /// In-flight compactions are cancelled. The immutable memtable, if any,
    /// stays in its staging WAL and is flushed on the next open.
    pub fn close(&self) -> Result<(), EngineError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cancel();
        let mut state = self.write_state()?;
        state.wal.close()?;
        info!(dir = %self.dir.display(), "engine closed");
        Ok(())
    }

    /// Ask running and future compactions to stop at the next output
    /// boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    // --------------------------------------------------------------------------------------------
    // Write path
    // --------------------------------------------------------------------------------------------

    /// Set `key` to `value`.
    ///
    /// Returns `Ok(true)` if an immutable memtable is waiting to be flushed.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) -> Result<bool, EngineError> {
        self.write(Command::set(key, value))
    }

    /// Remove `key` by writing a tombstone.
    ///
    /// Returns `Ok(true)` if an immutable memtable is waiting to be flushed.
    pub fn remove(&self, key: impl Into<String>) -> Result<bool, EngineError> {
        self.write(Command::remove(key))
    }

    fn write(&self, cmd: Command) -> Result<bool, EngineError> {
        self.check_open()?;
        let mut state = self.write_state()?;
        trace!(key = cmd.key(), tombstone = cmd.is_tombstone(), "engine write");

        state.wal.append(&cmd)?;
        state.mem.apply(cmd);

        if state.mem.len() > self.config.store_threshold && state.imm.is_none() {
            self.switch(&mut state)?;
        }
        Ok(state.imm.is_some())
    }

    /// Turn the mutable memtable into the immutable one and move its WAL to
    /// staging. Caller holds the write lock and has checked `imm` is empty.
    fn switch(&self, state: &mut EngineState) -> Result<(), EngineError> {
        state.wal.rotate_to_staging(&self.staging_path())?;
        let mem = std::mem::take(&mut state.mem);
        debug!(entries = mem.len(), "memtable switched");
        state.imm = Some(mem.freeze());
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Read path
    // --------------------------------------------------------------------------------------------

    /// Look up `key`.
    ///
    /// Returns `Ok(None)` if the key was never written or its newest command
    /// is a tombstone.
    pub fn get(&self, key: &str) -> Result<Option<String>, EngineError> {
        self.check_open()?;
        let version = {
            let state = self.read_state()?;
            if let Some(cmd) = state.mem.get(key) {
                trace!(key, source = "memtable", "engine get hit");
                return Ok(cmd.value().map(str::to_owned));
            }
            if let Some(cmd) = state.imm.as_ref().and_then(|imm| imm.get(key)) {
                trace!(key, source = "immutable", "engine get hit");
                return Ok(cmd.value().map(str::to_owned));
            }
            Arc::clone(&state.version)
        };

        Ok(version
            .get(key)?
            .and_then(|cmd| cmd.value().map(str::to_owned)))
    }

    // --------------------------------------------------------------------------------------------
    // Flush
    // --------------------------------------------------------------------------------------------

    /// Write the immutable memtable to a level-0 table and commit it.
    ///
    /// Returns `Ok(false)` if there was nothing to flush. On error the
    /// immutable memtable and the staging WAL are left as they were, so the
    /// flush can be retried.
    pub fn flush_immutable(&self) -> Result<bool, EngineError> {
        self.check_open()?;
        let _flush = Self::lock(&self.flush_lock, "flush")?;

        let Some(imm) = self.read_state()?.imm.clone() else {
            return Ok(false);
        };

        let table = if imm.is_empty() {
            None
        } else {
            let file_number = self.allocate_file_number();
            debug!(file_number, entries = imm.len(), "flushing immutable memtable");
            Some(Arc::new(write_table(
                &self.dir,
                file_number,
                0,
                self.config.part_size,
                imm.iter(),
            )?))
        };

        let next_file_number = self.next_file_number.load(Ordering::SeqCst);
        let mut manifest = self.lock_manifest()?;
        let version = match table {
            Some(table) => {
                let pending = Arc::clone(&table);
                match manifest.install(vec![table], &[], next_file_number) {
                    Ok(version) => version,
                    Err(e) => {
                        pending.mark_obsolete();
                        return Err(e.into());
                    }
                }
            }
            None => manifest.snapshot(),
        };

        let staging = self.staging_path();
        match fs::remove_file(&staging) {
            Ok(()) => wal::sync_parent_dir(&staging)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %staging.display(), "staging WAL already gone");
            }
            Err(e) => return Err(e.into()),
        }

        let mut state = self.write_state()?;
        state.version = version;
        state.imm = None;
        info!(entries = imm.len(), "immutable memtable flushed");
        Ok(true)
    }

    /// Flush everything in memory: any pending immutable memtable first,
    /// then the mutable memtable after switching it.
    pub fn flush(&self) -> Result<(), EngineError> {
        self.flush_immutable()?;
        {
            let mut state = self.write_state()?;
            self.check_open()?;
            if !state.mem.is_empty() && state.imm.is_none() {
                self.switch(&mut state)?;
            }
        }
        self.flush_immutable()?;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Compaction
    // --------------------------------------------------------------------------------------------

    /// Run one compaction round if some level is over its trigger.
    ///
    /// Returns `Ok(true)` if a round was committed.
    pub fn compact_once(&self) -> Result<bool, EngineError> {
        self.check_open()?;
        let _compaction = Self::lock(&self.compaction_lock, "compaction")?;

        let version = Arc::clone(&self.read_state()?.version);
        let Some(task) = self.strategy.pick(&version) else {
            return Ok(false);
        };
        drop(version);

        let outputs = compaction::execute(
            &task,
            OutputOptions {
                dir: &self.dir,
                part_size: self.config.part_size,
                max_sstable_bytes: self.config.max_sstable_bytes,
            },
            &|| self.allocate_file_number(),
            &self.cancel,
        )?;

        let mut manifest = self.lock_manifest()?;
        let installed = manifest.install(
            outputs.clone(),
            &task.inputs,
            self.next_file_number.load(Ordering::SeqCst),
        );
        let version = match installed {
            Ok(version) => version,
            Err(e) => {
                compaction::discard(outputs);
                return Err(e.into());
            }
        };
        self.write_state()?.version = version;

        info!(
            level = task.level,
            output_level = task.output_level,
            inputs = task.inputs.len(),
            outputs = outputs.len(),
            "compaction committed"
        );
        Ok(true)
    }

    /// Run compaction rounds until no level is over its trigger.
    pub fn compact_all(&self) -> Result<usize, EngineError> {
        let mut rounds = 0;
        while self.compact_once()? {
            rounds += 1;
        }
        Ok(rounds)
    }

    /// Whether some level is over its compaction trigger.
    pub fn needs_compaction(&self) -> Result<bool, EngineError> {
        let version = Arc::clone(&self.read_state()?.version);
        Ok(self.strategy.needs_compaction(&version))
    }

    // --------------------------------------------------------------------------------------------
    // Introspection
    // --------------------------------------------------------------------------------------------

    /// Whether an immutable memtable is waiting to be flushed.
    pub fn has_immutable(&self) -> Result<bool, EngineError> {
        Ok(self.read_state()?.imm.is_some())
    }

    /// The level tree readers currently see.
    pub fn version(&self) -> Result<Arc<Version>, EngineError> {
        Ok(Arc::clone(&self.read_state()?.version))
    }

    /// File number the next table will get.
    pub fn next_file_number(&self) -> u64 {
        self.next_file_number.load(Ordering::SeqCst)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let state = self.read_state()?;
        let levels = state.version.levels();
        Ok(EngineStats {
            tables_per_level: levels.iter().map(Vec::len).collect(),
            bytes_per_level: (0..levels.len())
                .map(|l| state.version.level_bytes(l))
                .collect(),
            memtable_len: state.mem.len(),
            immutable_len: state.imm.as_ref().map_or(0, FrozenMemtable::len),
        })
    }
}

/// Apply every command of `replay` to `mem`, returning how many were read.
///
/// A torn final record ends the replay quietly; `replay` reports it.
fn replay_into(replay: &mut WalIter, mem: &mut Memtable) -> Result<usize, EngineError> {
    let mut count = 0;
    for cmd in replay {
        mem.apply(cmd?);
        count += 1;
    }
    Ok(count)
}
