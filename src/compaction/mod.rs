//! # Compaction Module
//!
//! Compaction moves data down the level tree. It merges a set of input
//! tables into new output tables one level deeper, keeps only the newest
//! command per key, and drops tombstones once nothing deeper could still
//! hold an older value for the key.
//!
//! ## Code organization
//!
//! Choosing *what* to compact is the job of a [`CompactionStrategy`];
//! [`leveled::LeveledStrategy`] is the strategy the engine ships with. The
//! strategy hands back a [`CompactionTask`], and [`execute`] carries it out:
//!
//! 1. k-way merge of all inputs through [`MergeIterator`], newest source
//!    first on equal keys,
//! 2. write outputs at `task.output_level`, cutting a new table whenever the
//!    current one reaches `max_sstable_bytes`,
//! 3. return the outputs for the caller to install into the manifest.
//!
//! Any failure, or a cancellation observed between output tables, deletes
//! every output written so far. The manifest is never touched here.

pub mod leveled;

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering as AtomicOrdering},
    },
};

use tracing::{debug, info, warn};

use crate::command::Command;
use crate::manifest::{ManifestError, Version};
use crate::sstable::{SSTable, SSTableError, SstBuilder};

// ------------------------------------------------------------------------------------------------
// Shared error type
// ------------------------------------------------------------------------------------------------

/// Unified error type for compaction.
#[derive(Debug, thiserror::Error)]
pub enum CompactionError {
    #[error("SSTable error: {0}")]
    SSTable(#[from] SSTableError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store is shutting down.
    #[error("compaction cancelled")]
    Cancelled,
}

// ------------------------------------------------------------------------------------------------
// CompactionStrategy trait
// ------------------------------------------------------------------------------------------------

/// One unit of compaction work.
#[derive(Debug, Clone)]
pub struct CompactionTask {
    /// Level the compaction was triggered for.
    pub level: usize,

    /// Level the outputs are written to.
    pub output_level: usize,

    /// Input tables, newest source first. On equal keys the earlier input
    /// wins.
    pub inputs: Vec<Arc<SSTable>>,

    /// Whether tombstones can be discarded: no live table is deeper than
    /// `output_level`.
    pub drop_tombstones: bool,
}

/// Decides when and what to compact.
pub trait CompactionStrategy: Send + Sync {
    /// Whether some level of `version` is over its trigger.
    fn needs_compaction(&self, version: &Version) -> bool;

    /// Select the next task, or `None` when nothing needs compacting.
    fn pick(&self, version: &Version) -> Option<CompactionTask>;
}

/// Output sizing and placement shared by every task.
#[derive(Debug, Clone, Copy)]
pub struct OutputOptions<'a> {
    pub dir: &'a Path,
    pub part_size: usize,
    pub max_sstable_bytes: u64,
}

// ------------------------------------------------------------------------------------------------
// MergeIterator: heap-based k-way merge over command streams
// ------------------------------------------------------------------------------------------------

type Source<'a> = Box<dyn Iterator<Item = Result<Command, SSTableError>> + 'a>;

/// Merges sorted command streams into one stream with unique keys.
///
/// Sources are ranked by position: for equal keys the command from the
/// lowest-ranked source is yielded and the rest are skipped. A source error
/// is yielded once and ends the merge.
pub struct MergeIterator<'a> {
    sources: Vec<Source<'a>>,
    heap: BinaryHeap<HeapEntry>,
    pending_error: Option<SSTableError>,
    failed: bool,
}

struct HeapEntry {
    cmd: Command,
    rank: usize,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap: reverse so smallest key / lowest rank pops first.
        self.cmd
            .key()
            .cmp(other.cmd.key())
            .then(self.rank.cmp(&other.rank))
            .reverse()
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl<'a> MergeIterator<'a> {
    pub fn new(sources: Vec<Source<'a>>) -> Self {
        let mut merge = Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            pending_error: None,
            failed: false,
        };
        for rank in 0..merge.sources.len() {
            merge.advance(rank);
        }
        merge
    }

    /// Merge the full contents of `tables`, first table ranked newest.
    pub fn over_tables(tables: &'a [Arc<SSTable>]) -> Self {
        Self::new(
            tables
                .iter()
                .map(|t| Box::new(t.iter()) as Source<'a>)
                .collect(),
        )
    }

    fn advance(&mut self, rank: usize) {
        match self.sources[rank].next() {
            Some(Ok(cmd)) => self.heap.push(HeapEntry { cmd, rank }),
            Some(Err(e)) => {
                if self.pending_error.is_none() {
                    self.pending_error = Some(e);
                }
            }
            None => {}
        }
    }
}

impl Iterator for MergeIterator<'_> {
    type Item = Result<Command, SSTableError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Some(e) = self.pending_error.take() {
            self.failed = true;
            return Some(Err(e));
        }

        let winner = self.heap.pop()?;
        self.advance(winner.rank);

        // Skip older versions of the same key.
        while self
            .heap
            .peek()
            .is_some_and(|top| top.cmd.key() == winner.cmd.key())
        {
            if let Some(shadowed) = self.heap.pop() {
                self.advance(shadowed.rank);
            }
        }

        if let Some(e) = self.pending_error.take() {
            self.failed = true;
            return Some(Err(e));
        }
        Some(Ok(winner.cmd))
    }
}

// ------------------------------------------------------------------------------------------------
// Execution
// ------------------------------------------------------------------------------------------------

/// Run `task`, returning the output tables.
///
/// `allocate` hands out fresh file numbers. `cancel` is polled before each
/// output table is started; once set, the run stops with
/// [`CompactionError::Cancelled`].
pub fn execute(
    task: &CompactionTask,
    opts: OutputOptions<'_>,
    allocate: &dyn Fn() -> u64,
    cancel: &AtomicBool,
) -> Result<Vec<Arc<SSTable>>, CompactionError> {
    let mut outputs = Vec::new();
    match write_outputs(task, opts, allocate, cancel, &mut outputs) {
        Ok(()) => {
            info!(
                level = task.level,
                output_level = task.output_level,
                inputs = task.inputs.len(),
                outputs = outputs.len(),
                "compaction merged"
            );
            Ok(outputs)
        }
        Err(e) => {
            warn!(
                level = task.level,
                written = outputs.len(),
                error = %e,
                "compaction aborted, discarding outputs"
            );
            discard(outputs);
            Err(e)
        }
    }
}

/// Delete output tables that will never be installed.
pub fn discard(outputs: Vec<Arc<SSTable>>) {
    for table in outputs {
        table.mark_obsolete();
    }
}

fn write_outputs(
    task: &CompactionTask,
    opts: OutputOptions<'_>,
    allocate: &dyn Fn() -> u64,
    cancel: &AtomicBool,
    outputs: &mut Vec<Arc<SSTable>>,
) -> Result<(), CompactionError> {
    let output_level = u32::try_from(task.output_level).map_err(|_| {
        SSTableError::InvariantViolation(format!("level {} out of range", task.output_level))
    })?;
    let mut builder: Option<SstBuilder> = None;
    let mut dropped = 0usize;

    for item in MergeIterator::over_tables(&task.inputs) {
        let cmd = item?;
        if task.drop_tombstones && cmd.is_tombstone() {
            dropped += 1;
            continue;
        }

        let mut current = match builder.take() {
            Some(b) => b,
            None => {
                if cancel.load(AtomicOrdering::Acquire) {
                    return Err(CompactionError::Cancelled);
                }
                SstBuilder::new(opts.dir, allocate(), output_level, opts.part_size)?
            }
        };
        current.add(&cmd)?;

        if current.estimated_size() >= opts.max_sstable_bytes {
            outputs.push(Arc::new(current.finish()?));
        } else {
            builder = Some(current);
        }
    }

    if let Some(last) = builder.take() {
        outputs.push(Arc::new(last.finish()?));
    }
    if dropped > 0 {
        debug!(dropped, output_level, "tombstones dropped at bottom level");
    }
    Ok(())
}
