//! # lsmkv
//!
//! An embeddable, persistent key-value store for string keys and values,
//! built on a **leveled Log-Structured Merge Tree (LSM-tree)**. Writes are
//! journaled to a write-ahead log, buffered in memory, flushed to immutable
//! sorted tables and merged down the level tree in the background.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lsmkv::{Store, StoreConfig};
//!
//! let store = Store::open("/tmp/my_store", StoreConfig::default()).unwrap();
//!
//! // Write
//! store.set("hello", "world").unwrap();
//!
//! // Read
//! assert_eq!(store.get("hello").unwrap(), Some("world".to_string()));
//!
//! // Remove
//! store.remove("hello").unwrap();
//! assert_eq!(store.get("hello").unwrap(), None);
//!
//! // Graceful shutdown
//! store.close().unwrap();
//! ```
//!
//! ## Features
//!
//! - **Write-ahead logging**: every mutation reaches the log before it is acknowledged.
//! - **Leveled compaction**: background threads merge tables level by level and
//!   drop tombstones once they reach the bottom.
//! - **Bloom filters**: fast negative lookups on every table.
//! - **CRC32 integrity**: all on-disk blocks and the manifest are checksummed.
//! - **Crash recovery**: the manifest, the staging log and the active log are
//!   replayed on open.
//!
//! ## Directory layout
//!
//! ```text
//! <dir>/wal          active write-ahead log
//! <dir>/walTmp       staging log of the memtable being flushed
//! <dir>/NNNNNN.sst   sorted tables
//! <dir>/MANIFEST     live table set and next file number
//! ```

pub mod command;
pub mod compaction;
pub mod encoding;
pub mod engine;
pub mod manifest;
pub mod memtable;
pub mod sstable;
pub mod wal;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use compaction::CompactionError;
use engine::{Engine, EngineConfig, EngineError};
use manifest::ManifestError;
use sstable::SSTableError;
use wal::WalError;

pub use engine::EngineStats as Stats;

/// Attempts a background flush or compaction gets before giving up.
const BACKGROUND_MAX_ATTEMPTS: u32 = 5;

/// Delay before the first background retry; doubles on every attempt.
const BACKGROUND_BASE_BACKOFF: Duration = Duration::from_millis(10);

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Store`] instance.
///
/// All fields have sensible defaults via [`StoreConfig::default()`].
/// The configuration is validated when passed to [`Store::open`].
///
/// # Example
///
/// ```rust
/// use lsmkv::StoreConfig;
///
/// // Use defaults (1024-entry memtable, 2 background threads)
/// let config = StoreConfig::default();
///
/// // Or customize
/// let config = StoreConfig {
///     store_threshold: 4096,
///     thread_pool_size: 4,
///     ..StoreConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Memtable entry count above which the memtable is switched and
    /// flushed in the background.
    ///
    /// Default: 1024. Must be ≥ 1.
    pub store_threshold: usize,

    /// Commands per SSTable part, the unit of the sparse index.
    ///
    /// Default: 16. Must be ≥ 1.
    pub part_size: usize,

    /// Number of level-0 tables that triggers a compaction into level 1.
    ///
    /// Default: 4. Must be ≥ 1.
    pub l0_trigger: usize,

    /// Byte budget of level 1.
    ///
    /// Default: 10 MiB. Must be ≥ 1.
    pub level1_budget_bytes: u64,

    /// Growth factor of the byte budget from one level to the next.
    ///
    /// Default: 10. Must be ≥ 2.
    pub level_size_multiplier: u64,

    /// Size at which a compaction output table is cut.
    ///
    /// Default: 2 MiB. Must be ≥ 1024.
    pub max_sstable_bytes: u64,

    /// Number of levels, level 0 included.
    ///
    /// Default: 7. Must be in `2..=16`.
    pub max_levels: usize,

    /// Fsync the write-ahead log after every write.
    ///
    /// Default: false (writes reach the OS before returning).
    pub sync_writes: bool,

    /// Number of background worker threads for flushing and compaction.
    ///
    /// Default: 2. Must be ≥ 1.
    pub thread_pool_size: usize,
}

impl Default for StoreConfig {
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
            thread_pool_size: 2,
        }
    }
}

impl StoreConfig {
    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.store_threshold < 1 {
            return Err(StoreError::InvalidConfig(
                "store_threshold must be >= 1".into(),
            ));
        }
        if self.part_size < 1 {
            return Err(StoreError::InvalidConfig("part_size must be >= 1".into()));
        }
        if self.l0_trigger < 1 {
            return Err(StoreError::InvalidConfig("l0_trigger must be >= 1".into()));
        }
        if self.level1_budget_bytes < 1 {
            return Err(StoreError::InvalidConfig(
                "level1_budget_bytes must be >= 1".into(),
            ));
        }
        if self.level_size_multiplier < 2 {
            return Err(StoreError::InvalidConfig(
                "level_size_multiplier must be >= 2".into(),
            ));
        }
        if self.max_sstable_bytes < 1024 {
            return Err(StoreError::InvalidConfig(
                "max_sstable_bytes must be >= 1024".into(),
            ));
        }
        if !(2..=16).contains(&self.max_levels) {
            return Err(StoreError::InvalidConfig(
                "max_levels must be in 2..=16".into(),
            ));
        }
        if self.thread_pool_size < 1 {
            return Err(StoreError::InvalidConfig(
                "thread_pool_size must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Converts to the internal engine configuration.
    fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            store_threshold: self.store_threshold,
            part_size: self.part_size,
            l0_trigger: self.l0_trigger,
            level1_budget_bytes: self.level1_budget_bytes,
            level_size_multiplier: self.level_size_multiplier,
            max_sstable_bytes: self.max_sstable_bytes,
            max_levels: self.max_levels,
            sync_writes: self.sync_writes,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Store`] operations.
///
/// Internal failures are grouped by kind; the original error is kept as the
/// source.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[source] EngineError),

    /// The write-ahead log holds a record that cannot be decoded.
    #[error("corrupt log: {0}")]
    CorruptLog(#[source] EngineError),

    /// A table or the manifest is damaged beyond recovery.
    #[error("corrupt table: {0}")]
    CorruptTable(#[source] EngineError),

    /// An internal ordering or state rule was broken.
    #[error("invariant violation: {0}")]
    InvariantViolation(#[source] EngineError),

    /// The engine has released its log and cannot serve requests.
    #[error("store is not open")]
    NotOpen,

    /// The store handle was used after [`Store::close`].
    #[error("store is already closed")]
    AlreadyClosed,

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorKind {
    Io,
    CorruptLog,
    CorruptTable,
    InvariantViolation,
    NotOpen,
}

fn sstable_kind(e: &SSTableError) -> ErrorKind {
    match e {
        SSTableError::Io(_) => ErrorKind::Io,
        SSTableError::InvariantViolation(_) => ErrorKind::InvariantViolation,
        _ => ErrorKind::CorruptTable,
    }
}

fn manifest_kind(e: &ManifestError) -> ErrorKind {
    match e {
        ManifestError::Io(_) => ErrorKind::Io,
        ManifestError::Table(t) => sstable_kind(t),
        ManifestError::Corrupt(_) | ManifestError::Unrecoverable(_) => ErrorKind::CorruptTable,
        ManifestError::Encoding(_)
        | ManifestError::Overlap { .. }
        | ManifestError::LevelOutOfRange { .. } => ErrorKind::InvariantViolation,
    }
}

fn classify(e: &EngineError) -> ErrorKind {
    match e {
        EngineError::Io(_) => ErrorKind::Io,
        EngineError::Wal(w) => match w {
            WalError::Io(_) => ErrorKind::Io,
            WalError::CorruptRecord { .. } => ErrorKind::CorruptLog,
            WalError::Closed => ErrorKind::NotOpen,
            WalError::Encode(_) | WalError::StagingExists(_) => ErrorKind::InvariantViolation,
        },
        EngineError::SSTable(t) => sstable_kind(t),
        EngineError::Manifest(m) => manifest_kind(m),
        EngineError::Compaction(c) => match c {
            CompactionError::SSTable(t) => sstable_kind(t),
            CompactionError::Manifest(m) => manifest_kind(m),
            CompactionError::Io(_) => ErrorKind::Io,
            CompactionError::Cancelled => ErrorKind::NotOpen,
        },
        EngineError::NotOpen => ErrorKind::NotOpen,
        EngineError::Internal(_) => ErrorKind::InvariantViolation,
    }
}

impl From<EngineError> for StoreError {
    fn from(e: EngineError) -> Self {
        match classify(&e) {
            ErrorKind::Io => StoreError::Io(e),
            ErrorKind::CorruptLog => StoreError::CorruptLog(e),
            ErrorKind::CorruptTable => StoreError::CorruptTable(e),
            ErrorKind::InvariantViolation => StoreError::InvariantViolation(e),
            ErrorKind::NotOpen => StoreError::NotOpen,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Background worker state
// ------------------------------------------------------------------------------------------------

type Task = Box<dyn FnOnce() + Send>;

/// Holds the thread pool sender and worker handles.
/// Taken (`Option::take`) on shutdown to ensure single cleanup.
struct BackgroundPool {
    sender: crossbeam::channel::Sender<Task>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl BackgroundPool {
    fn spawn(size: usize) -> Result<Self, StoreError> {
        let (sender, receiver) = crossbeam::channel::unbounded::<Task>();

        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let rx = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("lsmkv-bg-{id}"))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        task();
                    }
                })
                .map_err(|e| StoreError::Io(EngineError::Io(e)))?;
            workers.push(handle);
        }
        // Workers hold their own receiver clones; drop ours.
        drop(receiver);

        Ok(Self { sender, workers })
    }

    /// Drop the sender so workers drain the queue and exit, then join them.
    fn shutdown(self) {
        drop(self.sender);
        for worker in self.workers {
            if worker.join().is_err() {
                error!("background worker panicked");
            }
        }
    }
}

/// Shared between the handle and its background tasks.
struct Shared {
    engine: Engine,
    flush_scheduled: AtomicBool,
    compaction_scheduled: AtomicBool,
}

// ------------------------------------------------------------------------------------------------
// Store handle
// ------------------------------------------------------------------------------------------------

/// The main store handle.
///
/// Provides a thread-safe API for reading and writing string key-value
/// pairs with automatic background flushing and compaction.
///
/// # Thread safety
///
/// `Store` is `Send + Sync`; it can be shared across threads via
/// `Arc<Store>`. Writes are serialized internally.
///
/// # Background work
///
/// When the memtable fills up it is switched to immutable and a background
/// task is dispatched to:
///
/// 1. Flush the immutable memtable to a new level-0 table.
/// 2. Run leveled compaction rounds while some level is over its trigger.
///
/// Failed background steps are retried with exponential backoff. A flush
/// can also be forced with [`Store::flush`] and compaction with
/// [`Store::compact`].
///
/// # Shutdown
///
/// Call [`Store::close`] for a graceful shutdown. If the handle is dropped
/// without calling `close`, the destructor performs the same steps but
/// only logs errors.
pub struct Store {
    shared: Arc<Shared>,
    bg: Mutex<Option<BackgroundPool>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("dir", &self.shared.engine.dir())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Opens (or creates) a store in the given directory.
    ///
    /// On an existing directory the manifest, the staging log and the
    /// active log are replayed to recover the last durable state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfig`] if any configuration parameter
    /// is out of range, [`StoreError::CorruptLog`] if the log holds an
    /// undecodable record, and [`StoreError::CorruptTable`] if the level
    /// tree cannot be rebuilt.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;

        let engine = Engine::open(&path, config.to_engine_config())?;
        let pool = BackgroundPool::spawn(config.thread_pool_size)?;

        info!(
            path = %path.as_ref().display(),
            pool_size = config.thread_pool_size,
            "store opened"
        );

        let store = Self {
            shared: Arc::new(Shared {
                engine,
                flush_scheduled: AtomicBool::new(false),
                compaction_scheduled: AtomicBool::new(false),
            }),
            bg: Mutex::new(Some(pool)),
            closed: AtomicBool::new(false),
        };
        if store.shared.engine.needs_compaction()? {
            store.schedule_compaction();
        }
        Ok(store)
    }

    /// Gracefully shuts down the store.
    ///
    /// Cancels running compactions, waits for queued background tasks to
    /// finish and releases the write-ahead log. A memtable that has not been
    /// flushed yet stays in the log and is recovered on the next open.
    ///
    /// Subsequent operations on this handle return
    /// [`StoreError::AlreadyClosed`]. Calling `close` more than once is
    /// harmless.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shared.engine.cancel();
        self.shutdown_pool();
        self.shared.engine.close()?;

        info!("store closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Write operations
    // --------------------------------------------------------------------------------------------

    /// Sets `key` to `value`, replacing any previous value.
    ///
    /// The write reaches the write-ahead log before it is applied in
    /// memory. If the memtable crosses its threshold a background flush is
    /// scheduled.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) -> Result<(), StoreError> {
        self.check_open()?;
        if self.shared.engine.set(key, value)? {
            self.schedule_flush();
        }
        Ok(())
    }

    /// Removes `key` by writing a tombstone.
    ///
    /// Subsequent reads return `None` until a new value is set.
    pub fn remove(&self, key: impl Into<String>) -> Result<(), StoreError> {
        self.check_open()?;
        if self.shared.engine.remove(key)? {
            self.schedule_flush();
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Read operations
    // --------------------------------------------------------------------------------------------

    /// Retrieves the value of `key`.
    ///
    /// Returns `Ok(None)` if the key was never set or has been removed.
    pub fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_open()?;
        Ok(self.shared.engine.get(key)?)
    }

    /// Table counts, table bytes and memtable sizes at this moment.
    pub fn stats(&self) -> Result<Stats, StoreError> {
        self.check_open()?;
        Ok(self.shared.engine.stats()?)
    }

    // --------------------------------------------------------------------------------------------
    // Maintenance
    // --------------------------------------------------------------------------------------------

    /// Switches the memtable and flushes it synchronously, together with
    /// any immutable memtable still waiting for the background.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.check_open()?;
        self.shared.engine.flush()?;
        if self.shared.engine.needs_compaction()? {
            self.schedule_compaction();
        }
        Ok(())
    }

    /// Runs compaction rounds on the calling thread until no level is over
    /// its trigger. Returns the number of rounds committed.
    pub fn compact(&self) -> Result<usize, StoreError> {
        self.check_open()?;
        Ok(self.shared.engine.compact_all()?)
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    /// Returns `Err(StoreError::AlreadyClosed)` if the store has been closed.
    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::AlreadyClosed);
        }
        Ok(())
    }

    fn lock_bg(&self) -> MutexGuard<'_, Option<BackgroundPool>> {
        self.bg.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn submit(&self, task: Task) {
        let guard = self.lock_bg();
        if let Some(bg) = guard.as_ref() {
            if bg.sender.send(task).is_err() {
                warn!("background pool is gone, task dropped");
            }
        }
    }

    /// Dispatches a background task that flushes the immutable memtable and
    /// then compacts while needed. At most one such task is queued.
    fn schedule_flush(&self) {
        if self.shared.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        self.submit(Box::new(move || {
            loop {
                if run_with_retry("flush", || shared.engine.flush_immutable()).is_none() {
                    shared.flush_scheduled.store(false, Ordering::Release);
                    return;
                }
                shared.flush_scheduled.store(false, Ordering::Release);

                // A switch may have happened after the flush but before the
                // flag was cleared; nobody else would pick it up.
                let pending = match shared.engine.has_immutable() {
                    Ok(pending) => pending,
                    Err(e) => {
                        error!(error = %e, "background: cannot check for a pending flush");
                        false
                    }
                };
                if !pending || shared.flush_scheduled.swap(true, Ordering::AcqRel) {
                    break;
                }
            }
            compact_while_needed(&shared);
        }));
    }

    /// Dispatches a background compaction loop unless one is already queued.
    fn schedule_compaction(&self) {
        if self.shared.compaction_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        self.submit(Box::new(move || {
            shared.compaction_scheduled.store(false, Ordering::Release);
            compact_while_needed(&shared);
        }));
    }

    /// Drains the background task queue and joins all worker threads.
    fn shutdown_pool(&self) {
        let pool = self.lock_bg().take();
        if let Some(pool) = pool {
            pool.shutdown();
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shared.engine.cancel();
            self.shutdown_pool();
            if let Err(e) = self.shared.engine.close() {
                error!(error = %e, "close on drop failed");
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Background task bodies
// ------------------------------------------------------------------------------------------------

/// Run compaction rounds until no trigger fires or a round fails.
fn compact_while_needed(shared: &Shared) {
    loop {
        match run_with_retry("compaction", || shared.engine.compact_once()) {
            Some(true) => debug!("background: compaction round committed"),
            Some(false) | None => break,
        }
    }
}

/// Run `op`, retrying with exponential backoff.
///
/// Gives up (returning `None`) after [`BACKGROUND_MAX_ATTEMPTS`] failures,
/// immediately on an invariant violation, and once the engine is closing.
fn run_with_retry<T>(what: &str, mut op: impl FnMut() -> Result<T, EngineError>) -> Option<T> {
    let mut backoff = BACKGROUND_BASE_BACKOFF;
    for attempt in 1..=BACKGROUND_MAX_ATTEMPTS {
        let err = match op() {
            Ok(value) => return Some(value),
            Err(e) => e,
        };
        match classify(&err) {
            ErrorKind::NotOpen => {
                debug!(task = what, "background task stopped: store closing");
                return None;
            }
            ErrorKind::InvariantViolation => {
                error!(task = what, error = %err, "background task aborted");
                return None;
            }
            _ if attempt == BACKGROUND_MAX_ATTEMPTS => {
                error!(task = what, attempt, error = %err, "background task failed, giving up");
                return None;
            }
            _ => {
                warn!(
                    task = what,
                    attempt,
                    error = %err,
                    backoff_ms = backoff.as_millis() as u64,
                    "background task failed, retrying"
                );
                thread::sleep(backoff);
                backoff *= 2;
            }
        }
    }
    None
}
