//! # Memtable Module
//!
//! The mutable, in-memory layer of the store. A [`Memtable`] keeps the most
//! recent [`Command`] for every key it has seen, in key order, so that it can
//! be streamed straight into an SSTable writer when it is flushed.
//!
//! Durability is not handled here: the engine appends each command to the
//! WAL before applying it to the memtable.
//!
//! When the engine switches memtables, the active one is frozen into a
//! [`FrozenMemtable`]. Frozen memtables are read-only and cheap to share
//! between the read path and the background flush.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{collections::BTreeMap, sync::Arc};

use tracing::trace;

use crate::command::Command;

// ------------------------------------------------------------------------------------------------
// Memtable Core
// ------------------------------------------------------------------------------------------------

/// Ordered map from key to its latest command.
///
/// The size of a memtable is its entry count; repeated writes to one key do
/// not grow it.
#[derive(Debug, Default)]
pub struct Memtable {
    tree: BTreeMap<String, Command>,
}

impl Memtable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `cmd`, replacing any earlier command for the same key.
    pub fn apply(&mut self, cmd: Command) {
        trace!(key = cmd.key(), tombstone = cmd.is_tombstone(), "memtable apply");
        self.tree.insert(cmd.key().to_owned(), cmd);
    }

    /// Latest command recorded for `key`.
    pub fn get(&self, key: &str) -> Option<&Command> {
        self.tree.get(key)
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Commands in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.tree.values()
    }

    /// Turn this memtable into an immutable, shareable snapshot.
    pub fn freeze(self) -> FrozenMemtable {
        FrozenMemtable {
            inner: Arc::new(self),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Frozen Memtable
// ------------------------------------------------------------------------------------------------

/// Read-only memtable awaiting flush.
///
/// Cloning is cheap; all clones share the same map.
#[derive(Debug, Clone)]
pub struct FrozenMemtable {
    inner: Arc<Memtable>,
}

impl FrozenMemtable {
    pub fn get(&self, key: &str) -> Option<&Command> {
        self.inner.get(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Commands in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.inner.iter()
    }
}
