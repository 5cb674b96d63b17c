//! # Level Manifest
//!
//! The manifest is the authority on which SSTables are live and at which
//! level. Its in-memory form is an immutable [`Version`]; every change goes
//! through [`Manifest::install`], which builds the successor version and
//! persists it before anyone can observe it.
//!
//! ## Durability
//!
//! After each install the live set is written as a checksummed snapshot to
//! `MANIFEST` (via `MANIFEST.tmp`, fsync and atomic rename). Writing that
//! file is the commit point of every flush and compaction.
//!
//! ```text
//! [LEN u32 LE][PAYLOAD][CRC32 LE]
//!
//! PAYLOAD = [MAGIC "LKVM"][VERSION u32][NEXT_FILE_NUMBER u64]
//!           [COUNT u32][(FILE_NUMBER u64, LEVEL u32)] × COUNT
//! ```
//!
//! ## Recovery
//!
//! [`Manifest::open`] removes leftover temp files, then loads the tables
//! listed in `MANIFEST` and deletes any other `.sst` file as an orphan of an
//! uncommitted flush or compaction. A listed table that turns out to be
//! corrupt is set aside as `NNNNNN.corrupt` and left out.
//!
//! When `MANIFEST` is missing or unreadable the level tree is rebuilt from
//! the footers of every `.sst` file in the directory. Overlapping tables at
//! some level >= 1 cannot be reconciled in that mode and fail the open.
//!
//! ## Thread safety
//!
//! `Manifest` is not internally synchronized; the engine keeps it behind a
//! mutex so that installs are serialized.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

mod version;

#[cfg(test)]
mod tests;

pub use version::Version;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::BTreeSet,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::sstable::{
    CORRUPT_EXT, SSTable, SSTableError, TABLE_EXT, TEMP_EXT, parse_file_number, table_file_name,
};
use crate::wal::sync_parent_dir;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

pub const MANIFEST_FILENAME: &str = "MANIFEST";
const MANIFEST_TMP_FILENAME: &str = "MANIFEST.tmp";
const MANIFEST_MAGIC: [u8; 4] = *b"LKVM";
const MANIFEST_VERSION: u32 = 1;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by manifest operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A table could not be opened.
    #[error("SSTable error: {0}")]
    Table(#[from] SSTableError),

    /// The `MANIFEST` file failed validation.
    #[error("Corrupt manifest: {0}")]
    Corrupt(String),

    /// Two tables at a sorted level have intersecting key ranges.
    #[error("Tables {left} and {right} overlap at level {level}")]
    Overlap { level: usize, left: u64, right: u64 },

    /// A table names a level beyond the configured depth.
    #[error("Level {level} out of range (max_levels = {max_levels})")]
    LevelOutOfRange { level: usize, max_levels: usize },

    /// On-disk state that cannot be turned back into a consistent level tree.
    #[error("Unrecoverable state: {0}")]
    Unrecoverable(String),
}

// ------------------------------------------------------------------------------------------------
// Snapshot record
// ------------------------------------------------------------------------------------------------

/// The persisted form of a version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ManifestSnapshot {
    pub(crate) next_file_number: u64,
    pub(crate) tables: Vec<TableEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TableEntry {
    pub(crate) file_number: u64,
    pub(crate) level: u32,
}

impl Encode for TableEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.file_number.encode_to(buf)?;
        self.level.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for TableEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (file_number, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (level, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { file_number, level }, off))
    }
}

impl Encode for ManifestSnapshot {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        MANIFEST_MAGIC.encode_to(buf)?;
        MANIFEST_VERSION.encode_to(buf)?;
        self.next_file_number.encode_to(buf)?;
        encoding::encode_vec(&self.tables, buf)?;
        Ok(())
    }
}

impl Decode for ManifestSnapshot {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (magic, n) = <[u8; 4]>::decode_from(&buf[off..])?;
        off += n;
        if magic != MANIFEST_MAGIC {
            return Err(EncodingError::InvalidTag {
                tag: u32::from_le_bytes(magic),
                type_name: "ManifestSnapshot",
            });
        }
        let (version, n) = u32::decode_from(&buf[off..])?;
        off += n;
        if version != MANIFEST_VERSION {
            return Err(EncodingError::InvalidTag {
                tag: version,
                type_name: "ManifestSnapshot version",
            });
        }
        let (next_file_number, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (tables, n) = encoding::decode_vec::<TableEntry>(&buf[off..])?;
        off += n;
        Ok((
            Self {
                next_file_number,
                tables,
            },
            off,
        ))
    }
}

impl ManifestSnapshot {
    fn of(version: &Version, next_file_number: u64) -> Self {
        let tables = version
            .all_tables()
            .map(|t| TableEntry {
                file_number: t.file_number(),
                level: t.level(),
            })
            .collect();
        Self {
            next_file_number,
            tables,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Manifest
// ------------------------------------------------------------------------------------------------

/// Result of opening a manifest directory.
pub struct Recovered {
    pub manifest: Manifest,

    /// Smallest file number not used by any file seen on disk.
    pub next_file_number: u64,
}

/// Persistent owner of the current [`Version`].
pub struct Manifest {
    dir: PathBuf,
    current: Arc<Version>,
}

impl Manifest {
    /// Load (or rebuild) the level tree stored in `dir`.
    pub fn open(dir: &Path, max_levels: usize) -> Result<Recovered, ManifestError> {
        let mut max_seen = 0u64;
        let mut table_files = BTreeSet::new();

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.file_name().and_then(|n| n.to_str()) == Some(MANIFEST_TMP_FILENAME) {
                remove_leftover(&path)?;
                continue;
            }
            if let Some(n) = parse_file_number(&path, TEMP_EXT) {
                max_seen = max_seen.max(n);
                remove_leftover(&path)?;
                continue;
            }
            for ext in [TABLE_EXT, CORRUPT_EXT] {
                if let Some(n) = parse_file_number(&path, ext) {
                    max_seen = max_seen.max(n);
                    if ext == TABLE_EXT {
                        table_files.insert(n);
                    }
                }
            }
        }

        let snapshot = match read_snapshot(&dir.join(MANIFEST_FILENAME)) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(dir = %dir.display(), error = %e, "MANIFEST unreadable, rebuilding from table footers");
                None
            }
        };

        let (version, persisted_next) = match snapshot {
            Some(snapshot) => {
                let version = Self::load_listed(dir, max_levels, &snapshot, &table_files)?;
                (version, snapshot.next_file_number)
            }
            None => (Self::reconstruct(dir, max_levels, &table_files)?, 0),
        };

        let next_file_number = persisted_next.max(max_seen + 1).max(1);
        let manifest = Self {
            dir: dir.to_path_buf(),
            current: Arc::new(version),
        };
        manifest.persist(&manifest.current, next_file_number)?;

        info!(
            dir = %dir.display(),
            tables = manifest.current.table_count(),
            next_file_number,
            "manifest opened"
        );

        Ok(Recovered {
            manifest,
            next_file_number,
        })
    }

    /// The current version.
    pub fn snapshot(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    /// Commit a change to the level tree.
    ///
    /// The successor version is persisted before it becomes current; on
    /// error nothing changes. Removed tables are marked obsolete and their
    /// files disappear once the last reader lets go of them.
    pub fn install(
        &mut self,
        added: Vec<Arc<SSTable>>,
        removed: &[Arc<SSTable>],
        next_file_number: u64,
    ) -> Result<Arc<Version>, ManifestError> {
        let removed_numbers: Vec<u64> = removed.iter().map(|t| t.file_number()).collect();
        let added_numbers: Vec<u64> = added.iter().map(|t| t.file_number()).collect();

        let next = Arc::new(self.current.install(added, &removed_numbers)?);
        self.persist(&next, next_file_number)?;

        for table in removed {
            table.mark_obsolete();
        }
        self.current = Arc::clone(&next);

        debug!(
            added = ?added_numbers,
            removed = ?removed_numbers,
            tables = next.table_count(),
            "manifest installed"
        );
        Ok(next)
    }

    /// Write `version` as the durable `MANIFEST`.
    fn persist(&self, version: &Version, next_file_number: u64) -> Result<(), ManifestError> {
        let payload = encoding::encode_to_vec(&ManifestSnapshot::of(version, next_file_number))?;
        let len = u32::try_from(payload.len())
            .map_err(|_| ManifestError::Corrupt("manifest exceeds 4 GiB".into()))?;
        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let checksum = hasher.finalize();

        let tmp_path = self.dir.join(MANIFEST_TMP_FILENAME);
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut bytes = Vec::with_capacity(payload.len() + 8);
            bytes.extend_from_slice(&len.to_le_bytes());
            bytes.extend_from_slice(&payload);
            bytes.extend_from_slice(&checksum.to_le_bytes());
            f.write_all(&bytes)?;
            f.sync_all()?;
        }

        // The rename is the commit point; a failed directory fsync after it
        // is only logged.
        let final_path = self.dir.join(MANIFEST_FILENAME);
        fs::rename(&tmp_path, &final_path)?;
        if let Err(e) = sync_parent_dir(&final_path) {
            error!(dir = %self.dir.display(), error = %e, "MANIFEST renamed but directory fsync failed");
        }
        Ok(())
    }

    /// Open every table the snapshot lists and drop everything else.
    fn load_listed(
        dir: &Path,
        max_levels: usize,
        snapshot: &ManifestSnapshot,
        on_disk: &BTreeSet<u64>,
    ) -> Result<Version, ManifestError> {
        let mut tables = Vec::with_capacity(snapshot.tables.len());
        let mut listed = BTreeSet::new();

        for entry in &snapshot.tables {
            listed.insert(entry.file_number);
            let path = dir.join(table_file_name(entry.file_number));
            match SSTable::open(&path) {
                Ok(table) if table.level() == entry.level => tables.push(Arc::new(table)),
                Ok(table) => {
                    error!(
                        file_number = entry.file_number,
                        manifest_level = entry.level,
                        footer_level = table.level(),
                        "table level disagrees with MANIFEST"
                    );
                    drop(table);
                    quarantine(&path)?;
                }
                Err(e) if e.is_corruption() => {
                    error!(file_number = entry.file_number, error = %e, "corrupt table excluded");
                    quarantine(&path)?;
                }
                Err(SSTableError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(ManifestError::Unrecoverable(format!(
                        "table {} listed in MANIFEST is missing",
                        entry.file_number
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }

        for &orphan in on_disk.difference(&listed) {
            let path = dir.join(table_file_name(orphan));
            warn!(path = %path.display(), "removing orphan SSTable");
            remove_leftover(&path)?;
        }

        Version::from_tables(max_levels, tables)
    }

    /// Rebuild the level tree from table footers alone.
    fn reconstruct(
        dir: &Path,
        max_levels: usize,
        on_disk: &BTreeSet<u64>,
    ) -> Result<Version, ManifestError> {
        let mut tables = Vec::with_capacity(on_disk.len());
        for &file_number in on_disk {
            let path = dir.join(table_file_name(file_number));
            match SSTable::open(&path) {
                Ok(table) => tables.push(Arc::new(table)),
                Err(e) if e.is_corruption() => {
                    error!(file_number, error = %e, "corrupt table excluded");
                    quarantine(&path)?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Version::from_tables(max_levels, tables).map_err(|e| match e {
            ManifestError::Overlap { .. } | ManifestError::LevelOutOfRange { .. } => {
                ManifestError::Unrecoverable(format!("cannot rebuild level tree: {e}"))
            }
            other => other,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// File helpers
// ------------------------------------------------------------------------------------------------

/// `Ok(None)` when there is no `MANIFEST`, an error when it exists but is bad.
fn read_snapshot(path: &Path) -> Result<Option<ManifestSnapshot>, ManifestError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut off = 0;
    let (len, n) = u32::decode_from(&bytes)?;
    off += n;
    let end = off + len as usize;
    if end + 4 != bytes.len() {
        return Err(ManifestError::Corrupt(format!(
            "length {len} does not match file size {}",
            bytes.len()
        )));
    }
    let payload = &bytes[off..end];
    let (stored, _) = u32::decode_from(&bytes[end..])?;
    let mut hasher = Crc32::new();
    hasher.update(payload);
    if hasher.finalize() != stored {
        return Err(ManifestError::Corrupt("checksum mismatch".into()));
    }

    let (snapshot, _) = ManifestSnapshot::decode_from(payload)?;
    Ok(Some(snapshot))
}

fn remove_leftover(path: &Path) -> Result<(), ManifestError> {
    debug!(path = %path.display(), "removing leftover file");
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Rename a bad table to `NNNNNN.corrupt` so it is neither loaded nor lost.
fn quarantine(path: &Path) -> Result<(), ManifestError> {
    let target = path.with_extension(CORRUPT_EXT);
    warn!(from = %path.display(), to = %target.display(), "quarantining table");
    fs::rename(path, &target)?;
    Ok(())
}
