//! Leveled compaction.
//!
//! Level 0 is compacted as a whole once it holds `l0_trigger` tables: every
//! L0 table plus the L1 tables intersecting their combined key range are
//! merged into L1. A deeper level `L` is compacted once its byte total
//! exceeds `level1_budget_bytes * level_size_multiplier^(L-1)`; one table is
//! chosen round-robin by a per-level key cursor and merged with the tables it
//! intersects at `L+1`. The deepest level is never compacted.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::manifest::Version;
use crate::sstable::SSTable;

use super::{CompactionStrategy, CompactionTask};

/// Shipped [`CompactionStrategy`].
#[derive(Debug)]
pub struct LeveledStrategy {
    l0_trigger: usize,
    level1_budget_bytes: u64,
    multiplier: u64,

    /// Largest key of the last table compacted out of each level.
    cursors: Mutex<Vec<Option<String>>>,
}

impl LeveledStrategy {
    pub fn new(l0_trigger: usize, level1_budget_bytes: u64, multiplier: u64) -> Self {
        Self {
            l0_trigger: l0_trigger.max(1),
            level1_budget_bytes: level1_budget_bytes.max(1),
            multiplier: multiplier.max(1),
            cursors: Mutex::new(Vec::new()),
        }
    }

    /// Byte budget of `level >= 1`, saturating at `u64::MAX`.
    pub fn level_budget(&self, level: usize) -> u64 {
        let mut budget = self.level1_budget_bytes;
        for _ in 1..level {
            budget = budget.saturating_mul(self.multiplier);
        }
        budget
    }

    /// The shallowest level over its trigger, if any.
    fn level_to_compact(&self, version: &Version) -> Option<usize> {
        let deepest = version.max_levels().checked_sub(1)?;
        if deepest == 0 {
            return None;
        }
        if version.tables_at(0).len() >= self.l0_trigger {
            return Some(0);
        }
        (1..deepest).find(|&level| version.level_bytes(level) > self.level_budget(level))
    }

    fn pick_level0(&self, version: &Version) -> Option<CompactionTask> {
        let l0 = version.tables_at(0);
        let smallest = l0.iter().map(|t| t.smallest_key()).min()?;
        let largest = l0.iter().map(|t| t.largest_key()).max()?;

        // L0 is already newest first; L1 tables come last and lose ties.
        let mut inputs: Vec<Arc<SSTable>> = l0.to_vec();
        inputs.extend(version.overlapping(1, smallest, largest));

        Some(CompactionTask {
            level: 0,
            output_level: 1,
            inputs,
            drop_tombstones: !version.has_tables_below(1),
        })
    }

    fn pick_sorted_level(&self, version: &Version, level: usize) -> Option<CompactionTask> {
        let tables = version.tables_at(level);
        if tables.is_empty() {
            return None;
        }

        let chosen = {
            let mut cursors = self.cursors.lock().unwrap_or_else(|p| p.into_inner());
            if cursors.len() < version.max_levels() {
                cursors.resize(version.max_levels(), None);
            }
            let start = match cursors[level].as_deref() {
                Some(cursor) => tables.partition_point(|t| t.smallest_key() <= cursor),
                None => 0,
            };
            let chosen = Arc::clone(&tables[start % tables.len()]);
            cursors[level] = Some(chosen.largest_key().to_owned());
            chosen
        };

        let output_level = level + 1;
        let mut inputs = vec![Arc::clone(&chosen)];
        inputs.extend(version.overlapping(
            output_level,
            chosen.smallest_key(),
            chosen.largest_key(),
        ));

        Some(CompactionTask {
            level,
            output_level,
            inputs,
            drop_tombstones: !version.has_tables_below(output_level),
        })
    }
}

impl CompactionStrategy for LeveledStrategy {
    fn needs_compaction(&self, version: &Version) -> bool {
        self.level_to_compact(version).is_some()
    }

    fn pick(&self, version: &Version) -> Option<CompactionTask> {
        let level = self.level_to_compact(version)?;
        let task = if level == 0 {
            self.pick_level0(version)
        } else {
            self.pick_sorted_level(version, level)
        }?;
        debug!(
            level = task.level,
            output_level = task.output_level,
            inputs = task.inputs.len(),
            drop_tombstones = task.drop_tombstones,
            "compaction picked"
        );
        Some(task)
    }
}
