//! Immutable snapshot of the level tree.
//!
//! A [`Version`] lists the live tables of every level. It is never mutated:
//! [`Version::install`] builds a successor, and readers keep using whichever
//! `Arc<Version>` they cloned for as long as they need it.
//!
//! Level 0 may contain overlapping tables and is kept sorted by file number,
//! newest first. Every deeper level holds non-overlapping tables sorted by
//! smallest key.

use std::sync::Arc;

use tracing::trace;

use crate::command::Command;
use crate::sstable::{SSTable, SSTableError};

use super::ManifestError;

#[derive(Debug, Clone)]
pub struct Version {
    levels: Vec<Vec<Arc<SSTable>>>,
}

impl Version {
    /// A version with `max_levels` empty levels.
    pub fn empty(max_levels: usize) -> Self {
        Self {
            levels: vec![Vec::new(); max_levels],
        }
    }

    /// Build a version from an unordered set of tables, placing each at the
    /// level recorded in its footer.
    pub fn from_tables(
        max_levels: usize,
        tables: Vec<Arc<SSTable>>,
    ) -> Result<Self, ManifestError> {
        Self::empty(max_levels).install(tables, &[])
    }

    pub fn max_levels(&self) -> usize {
        self.levels.len()
    }

    /// Tables of `level`, in read order.
    pub fn tables_at(&self, level: usize) -> &[Arc<SSTable>] {
        self.levels.get(level).map_or(&[], Vec::as_slice)
    }

    /// All levels, shallowest first.
    pub fn levels(&self) -> &[Vec<Arc<SSTable>>] {
        &self.levels
    }

    /// Total file bytes at `level`.
    pub fn level_bytes(&self, level: usize) -> u64 {
        self.tables_at(level).iter().map(|t| t.file_size()).sum()
    }

    pub fn table_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Every live table, shallowest level first.
    pub fn all_tables(&self) -> impl Iterator<Item = &Arc<SSTable>> {
        self.levels.iter().flatten()
    }

    /// Whether any table lives strictly below `level`.
    pub fn has_tables_below(&self, level: usize) -> bool {
        self.levels.iter().skip(level + 1).any(|l| !l.is_empty())
    }

    /// Tables at `level` whose key range intersects `[smallest, largest]`.
    pub fn overlapping(&self, level: usize, smallest: &str, largest: &str) -> Vec<Arc<SSTable>> {
        self.tables_at(level)
            .iter()
            .filter(|t| t.overlaps(smallest, largest))
            .cloned()
            .collect()
    }

    /// The one table at sorted `level >= 1` that may contain `key`.
    pub fn find_in_level(&self, level: usize, key: &str) -> Option<&Arc<SSTable>> {
        let tables = self.tables_at(level);
        let pos = tables.partition_point(|t| t.largest_key() < key);
        tables.get(pos).filter(|t| t.smallest_key() <= key)
    }

    /// Newest command for `key` across all tables.
    ///
    /// Level 0 is probed newest to oldest, then each deeper level probes at
    /// most one table. The first hit wins, tombstones included.
    pub fn get(&self, key: &str) -> Result<Option<Command>, SSTableError> {
        for table in self.tables_at(0) {
            if let Some(cmd) = table.query(key)? {
                trace!(key, level = 0, file_number = table.file_number(), "table hit");
                return Ok(Some(cmd));
            }
        }
        for level in 1..self.levels.len() {
            if let Some(table) = self.find_in_level(level, key) {
                if let Some(cmd) = table.query(key)? {
                    trace!(key, level, file_number = table.file_number(), "table hit");
                    return Ok(Some(cmd));
                }
            }
        }
        Ok(None)
    }

    /// Successor version with `removed` (by file number) taken out and
    /// `added` placed at the level in each table's footer.
    ///
    /// Fails if a table targets a level that does not exist or if the result
    /// would overlap at some level >= 1.
    pub fn install(
        &self,
        added: Vec<Arc<SSTable>>,
        removed: &[u64],
    ) -> Result<Self, ManifestError> {
        let mut levels = self.levels.clone();
        for level in &mut levels {
            level.retain(|t| !removed.contains(&t.file_number()));
        }
        for table in added {
            let level = table.level() as usize;
            let slot = levels.get_mut(level).ok_or(ManifestError::LevelOutOfRange {
                level,
                max_levels: self.levels.len(),
            })?;
            slot.push(table);
        }

        for (level, tables) in levels.iter_mut().enumerate() {
            if level == 0 {
                tables.sort_by(|a, b| b.file_number().cmp(&a.file_number()));
                continue;
            }
            tables.sort_by(|a, b| a.smallest_key().cmp(b.smallest_key()));
            for pair in tables.windows(2) {
                if pair[0].largest_key() >= pair[1].smallest_key() {
                    return Err(ManifestError::Overlap {
                        level,
                        left: pair[0].file_number(),
                        right: pair[1].file_number(),
                    });
                }
            }
        }
        Ok(Self { levels })
    }
}
