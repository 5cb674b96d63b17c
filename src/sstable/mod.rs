//! Sorted String Table (SSTable) Module
//!
//! An SSTable is one immutable, sorted run of [`Command`]s on disk. The store
//! writes one per memtable flush and one or more per compaction. Each table
//! carries its own sparse index, bloom filter and metadata footer so that it
//! can be opened and queried without any outside state.
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER: MAGIC "LKVT" | VERSION u32 LE]
//! [PART_LEN u32 LE][PART_BYTES][PART_CRC32 LE]        × N
//! [BLOOM_LEN u32 LE][BLOOM_BYTES][BLOOM_CRC32 LE]
//! [INDEX_LEN u32 LE][INDEX_BYTES][INDEX_CRC32 LE]
//! [FOOTER_LEN u32 LE][FOOTER_BYTES][FOOTER_CRC32 LE]
//! [TRAILER: FOOTER_OFFSET u64 LE | MAGIC "LKVT" | VERSION u32 LE]
//! ```
//!
//! - **Part**: up to `part_size` encoded commands in strictly ascending key
//!   order, back to back.
//! - **Bloom**: serialized [`bloomfilter::Bloom`] over every key.
//! - **Index**: one [`IndexEntry`] per part, holding its first key and block handle.
//! - **Footer**: a [`TableFooter`] with file number, level, key range, entry count
//!   and the handles of the index and bloom blocks.
//! - **Trailer**: fixed 16 bytes at the end of the file, locating the footer.
//!
//! # Sub-modules
//!
//! - [`builder`]: [`SstBuilder`] writes a table from a sorted command stream.
//! - [`iterator`]: [`TableIter`] walks every command of a table in order.
//!
//! # Concurrency model
//!
//! Tables are immutable and memory-mapped, so readers share them through an
//! `Arc` without locking. A table removed from the level manifest is marked
//! obsolete and its file is deleted when the last `Arc` to it is dropped.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod builder;
pub mod iterator;

#[cfg(test)]
mod tests;

pub use builder::SstBuilder;
pub use iterator::TableIter;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fmt,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, error, trace};

use crate::command::Command;
use crate::encoding::{self, Decode, Encode, EncodingError};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

pub(crate) const SST_MAGIC: [u8; 4] = *b"LKVT";
pub(crate) const SST_VERSION: u32 = 1;
pub(crate) const SST_HEADER_SIZE: usize = 8;
pub(crate) const SST_TRAILER_SIZE: usize = 16;
pub(crate) const SST_BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;
pub(crate) const BLOCK_LEN_SIZE: usize = 4;
pub(crate) const BLOCK_CHECKSUM_SIZE: usize = 4;

/// Extension of a live table file.
pub const TABLE_EXT: &str = "sst";
/// Extension of a table that is still being written.
pub const TEMP_EXT: &str = "tmp";
/// Extension given to a table that failed validation on open.
pub const CORRUPT_EXT: &str = "corrupt";

/// `NNNNNN.sst` for file number `n`.
pub fn table_file_name(file_number: u64) -> String {
    format!("{file_number:06}.{TABLE_EXT}")
}

/// Parse the file number out of a `NNNNNN.<ext>` file name.
pub fn parse_file_number(path: &Path, ext: &str) -> Option<u64> {
    if path.extension()?.to_str()? != ext {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by SSTable operations (read, write, build).
#[derive(Debug, Error)]
pub enum SSTableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Decoding of a structure inside the file failed.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A block's stored CRC does not match its contents.
    #[error("Checksum mismatch in block at offset {0}")]
    ChecksumMismatch(u64),

    /// The file is structurally invalid.
    #[error("Corrupt table: {0}")]
    Corrupt(String),

    /// The writer was fed input that violates table ordering rules.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl SSTableError {
    /// Whether this error means the table bytes themselves are bad.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Encoding(_) | Self::ChecksumMismatch(_) | Self::Corrupt(_)
        )
    }
}

// ------------------------------------------------------------------------------------------------
// On-disk format structures
// ------------------------------------------------------------------------------------------------

/// Location of a framed block inside the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockHandle {
    /// Offset of the block's length prefix.
    pub(crate) offset: u64,

    /// Size of the block including length prefix and checksum.
    pub(crate) size: u64,
}

/// Sparse index entry: the first key of a part and where the part lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IndexEntry {
    pub(crate) first_key: String,
    pub(crate) handle: BlockHandle,
}

/// Table metadata stored in the footer block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TableFooter {
    pub file_number: u64,
    pub level: u32,
    pub smallest_key: String,
    pub largest_key: String,
    pub entry_count: u64,
    pub(crate) index: BlockHandle,
    pub(crate) bloom: BlockHandle,
}

impl Encode for BlockHandle {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.offset.encode_to(buf)?;
        self.size.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for BlockHandle {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (offset, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (size, n) = u64::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { offset, size }, off))
    }
}

impl Encode for IndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.first_key.encode_to(buf)?;
        self.handle.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for IndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (first_key, n) = String::decode_from(&buf[off..])?;
        off += n;
        let (handle, n) = BlockHandle::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { first_key, handle }, off))
    }
}

impl Encode for TableFooter {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.file_number.encode_to(buf)?;
        self.level.encode_to(buf)?;
        self.smallest_key.encode_to(buf)?;
        self.largest_key.encode_to(buf)?;
        self.entry_count.encode_to(buf)?;
        self.index.encode_to(buf)?;
        self.bloom.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for TableFooter {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (file_number, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (level, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (smallest_key, n) = String::decode_from(&buf[off..])?;
        off += n;
        let (largest_key, n) = String::decode_from(&buf[off..])?;
        off += n;
        let (entry_count, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (index, n) = BlockHandle::decode_from(&buf[off..])?;
        off += n;
        let (bloom, n) = BlockHandle::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                file_number,
                level,
                smallest_key,
                largest_key,
                entry_count,
                index,
                bloom,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// SSTable: immutable reader
// ------------------------------------------------------------------------------------------------

/// A memory-mapped, immutable sorted table.
pub struct SSTable {
    path: PathBuf,
    mmap: Mmap,
    footer: TableFooter,
    index: Vec<IndexEntry>,
    bloom: Bloom<str>,

    /// Set once the table has been dropped from the level manifest.
    obsolete: AtomicBool,
}

impl fmt::Debug for SSTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SSTable")
            .field("path", &self.path)
            .field("file_number", &self.footer.file_number)
            .field("level", &self.footer.level)
            .field("smallest_key", &self.footer.smallest_key)
            .field("largest_key", &self.footer.largest_key)
            .field("entry_count", &self.footer.entry_count)
            .finish()
    }
}

impl SSTable {
    /// Open a table file, validating its trailer, footer, index and bloom
    /// blocks.
    ///
    /// If the file name carries a file number it must agree with the footer.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SSTableError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;

        // SAFETY: table files are never modified after the atomic rename that
        // publishes them, and the map is read-only.
        let mmap = unsafe { Mmap::map(&file)? };
        let file_len = mmap.len();

        if file_len < SST_HEADER_SIZE + SST_TRAILER_SIZE {
            return Err(SSTableError::Corrupt(format!(
                "file too small ({file_len} bytes)"
            )));
        }

        let (magic, n) = <[u8; 4]>::decode_from(&mmap[..])?;
        let (version, _) = u32::decode_from(&mmap[n..])?;
        if magic != SST_MAGIC || version != SST_VERSION {
            return Err(SSTableError::Corrupt("header magic/version mismatch".into()));
        }

        let trailer_start = file_len - SST_TRAILER_SIZE;
        let mut off = trailer_start;
        let (footer_offset, n) = u64::decode_from(&mmap[off..])?;
        off += n;
        let (magic, n) = <[u8; 4]>::decode_from(&mmap[off..])?;
        off += n;
        let (version, _) = u32::decode_from(&mmap[off..])?;
        if magic != SST_MAGIC {
            return Err(SSTableError::Corrupt("trailer magic mismatch".into()));
        }
        if version != SST_VERSION {
            return Err(SSTableError::Corrupt(format!(
                "unsupported table version {version}"
            )));
        }
        if footer_offset < SST_HEADER_SIZE as u64 || footer_offset >= trailer_start as u64 {
            return Err(SSTableError::Corrupt(format!(
                "footer offset {footer_offset} out of range"
            )));
        }

        let footer_bytes = read_block_at(&mmap, footer_offset, trailer_start)?;
        let (footer, _) = encoding::decode_from_slice::<TableFooter>(footer_bytes)?;

        if let Some(named) = parse_file_number(&path, TABLE_EXT) {
            if named != footer.file_number {
                return Err(SSTableError::Corrupt(format!(
                    "file name says {named}, footer says {}",
                    footer.file_number
                )));
            }
        }

        let index_bytes = read_block(&mmap, &footer.index)?;
        let (index, _) = encoding::decode_vec::<IndexEntry>(index_bytes)?;
        if index.is_empty() || footer.entry_count == 0 {
            return Err(SSTableError::Corrupt("table has no parts".into()));
        }

        let bloom_bytes = read_block(&mmap, &footer.bloom)?;
        let bloom = Bloom::from_slice(bloom_bytes)
            .map_err(|e| SSTableError::Corrupt(format!("bloom filter: {e}")))?;

        debug!(
            path = %path.display(),
            file_number = footer.file_number,
            level = footer.level,
            entries = footer.entry_count,
            parts = index.len(),
            "SSTable opened"
        );

        Ok(Self {
            path,
            mmap,
            footer,
            index,
            bloom,
            obsolete: AtomicBool::new(false),
        })
    }

    /// Look up the command stored for `key`, if any.
    ///
    /// A `Some(Command::Remove)` result is a tombstone and must shadow older
    /// tables.
    pub fn query(&self, key: &str) -> Result<Option<Command>, SSTableError> {
        if key < self.footer.smallest_key.as_str() || key > self.footer.largest_key.as_str() {
            return Ok(None);
        }
        if !self.bloom.check(key) {
            trace!(file_number = self.footer.file_number, key, "bloom negative");
            return Ok(None);
        }

        // Last part whose first key <= key.
        let pos = self
            .index
            .partition_point(|e| e.first_key.as_str() <= key);
        if pos == 0 {
            return Ok(None);
        }
        let part = self.read_part(pos - 1)?;

        let mut off = 0;
        while off < part.len() {
            let (cmd, n) = Command::decode_from(&part[off..])?;
            off += n;
            match cmd.key().cmp(key) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => return Ok(Some(cmd)),
                std::cmp::Ordering::Greater => break,
            }
        }
        Ok(None)
    }

    /// Ordered iterator over every command in the table.
    pub fn iter(&self) -> TableIter<'_> {
        TableIter::new(self)
    }

    /// Whether the key range of this table intersects `[smallest, largest]`.
    pub fn overlaps(&self, smallest: &str, largest: &str) -> bool {
        self.smallest_key() <= largest && self.largest_key() >= smallest
    }

    pub fn smallest_key(&self) -> &str {
        &self.footer.smallest_key
    }

    pub fn largest_key(&self) -> &str {
        &self.footer.largest_key
    }

    pub fn level(&self) -> u32 {
        self.footer.level
    }

    pub fn file_number(&self) -> u64 {
        self.footer.file_number
    }

    pub fn entry_count(&self) -> u64 {
        self.footer.entry_count
    }

    /// On-disk size in bytes.
    pub fn file_size(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Request deletion of the backing file once the last handle is dropped.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }

    /// Release this handle.
    pub fn close(self) {
        drop(self);
    }

    pub(crate) fn part_count(&self) -> usize {
        self.index.len()
    }

    /// Checksum-verified bytes of part `i`.
    pub(crate) fn read_part(&self, i: usize) -> Result<&[u8], SSTableError> {
        let entry = self
            .index
            .get(i)
            .ok_or_else(|| SSTableError::Corrupt(format!("part {i} out of range")))?;
        read_block(&self.mmap, &entry.handle)
    }
}

impl Drop for SSTable {
    fn drop(&mut self) {
        if !self.is_obsolete() {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "obsolete SSTable removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => error!(
                path = %self.path.display(),
                error = %e,
                "failed to remove obsolete SSTable"
            ),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Block I/O helpers
// ------------------------------------------------------------------------------------------------

/// Read a block through its handle, checking the handle agrees with the frame.
fn read_block<'a>(mmap: &'a Mmap, handle: &BlockHandle) -> Result<&'a [u8], SSTableError> {
    let end = handle
        .offset
        .checked_add(handle.size)
        .filter(|&e| e <= mmap.len() as u64)
        .ok_or_else(|| SSTableError::Corrupt(format!("block {handle:?} out of range")))?;
    let data = read_block_at(mmap, handle.offset, end as usize)?;
    if (BLOCK_LEN_SIZE + data.len() + BLOCK_CHECKSUM_SIZE) as u64 != handle.size {
        return Err(SSTableError::Corrupt(format!(
            "block at {} has size mismatch",
            handle.offset
        )));
    }
    Ok(data)
}

/// Read `[len][data][crc]` starting at `offset`, not reading past `limit`.
fn read_block_at(mmap: &Mmap, offset: u64, limit: usize) -> Result<&[u8], SSTableError> {
    let start = usize::try_from(offset)
        .map_err(|_| SSTableError::Corrupt("block offset exceeds addressable range".into()))?;
    if start + BLOCK_LEN_SIZE > limit {
        return Err(SSTableError::Corrupt(format!("block at {offset} out of range")));
    }
    let (len, _) = u32::decode_from(&mmap[start..])?;
    let data_start = start + BLOCK_LEN_SIZE;
    let data_end = data_start + len as usize;
    if data_end + BLOCK_CHECKSUM_SIZE > limit {
        return Err(SSTableError::Corrupt(format!("block at {offset} out of range")));
    }

    let data = &mmap[data_start..data_end];
    let (stored, _) = u32::decode_from(&mmap[data_end..])?;
    let mut hasher = Crc32::new();
    hasher.update(data);
    if hasher.finalize() != stored {
        return Err(SSTableError::ChecksumMismatch(offset));
    }
    Ok(data)
}
