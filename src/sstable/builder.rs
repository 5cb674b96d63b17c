//! SSTable writer: builds a complete SSTable file from a sorted stream of
//! commands.
//!
//! [`SstBuilder`] is incremental: commands are pushed one at a time with
//! [`SstBuilder::add`], which lets compaction watch
//! [`SstBuilder::estimated_size`] and cut a new output table whenever the
//! current one is large enough. [`write_table`] wraps the common case of
//! writing a whole iterator at once.
//!
//! # Input Requirements
//!
//! Keys must be strictly ascending. A duplicate or out-of-order key, or a
//! table with no commands at all, is an
//! [`SSTableError::InvariantViolation`].
//!
//! # Atomicity
//!
//! 1. Write everything to `NNNNNN.tmp`.
//! 2. Flush and sync the file.
//! 3. Rename `NNNNNN.tmp` → `NNNNNN.sst` and sync the directory.
//!
//! A builder that is dropped before [`SstBuilder::finish`] succeeds removes
//! its temp file, so a failed write leaves nothing behind.

use std::{
    borrow::Borrow,
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    mem,
    path::{Path, PathBuf},
};

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use tracing::{debug, warn};

use crate::command::Command;
use crate::encoding::{self, Encode};
use crate::wal::sync_parent_dir;

use super::{
    BLOCK_CHECKSUM_SIZE, BLOCK_LEN_SIZE, BlockHandle, IndexEntry, SST_BLOOM_FALSE_POSITIVE_RATE,
    SST_MAGIC, SST_VERSION, SSTable, SSTableError, TEMP_EXT, TableFooter,
    table_file_name,
};

// ------------------------------------------------------------------------------------------------
// Block I/O helpers
// ------------------------------------------------------------------------------------------------

/// Counts bytes as they pass through so block offsets are known without
/// seeking.
struct CountingWriter<W: Write> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Write `[len u32 LE][data][crc32 LE]` and return the block's handle.
fn write_checksummed_block<W: Write>(
    writer: &mut CountingWriter<W>,
    data: &[u8],
) -> Result<BlockHandle, SSTableError> {
    let offset = writer.written;
    let len = u32::try_from(data.len())
        .map_err(|_| SSTableError::InvariantViolation("block exceeds 4 GiB".into()))?;

    let mut hasher = Crc32::new();
    hasher.update(data);
    let checksum = hasher.finalize();

    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(data)?;
    writer.write_all(&checksum.to_le_bytes())?;

    Ok(BlockHandle {
        offset,
        size: (BLOCK_LEN_SIZE + data.len() + BLOCK_CHECKSUM_SIZE) as u64,
    })
}

// ------------------------------------------------------------------------------------------------
// SstBuilder
// ------------------------------------------------------------------------------------------------

/// Streaming writer for one table file.
pub struct SstBuilder {
    writer: Option<CountingWriter<BufWriter<File>>>,
    tmp_path: PathBuf,
    final_path: PathBuf,

    file_number: u64,
    level: u32,
    part_size: usize,

    part: Vec<u8>,
    part_entries: usize,
    part_first_key: Option<String>,
    index: Vec<IndexEntry>,

    /// Every key, kept for sizing the bloom filter at the end.
    keys: Vec<String>,
    last_key: Option<String>,
    smallest_key: Option<String>,
}

impl SstBuilder {
    /// Start a new table `NNNNNN.sst` in `dir`.
    pub fn new(
        dir: &Path,
        file_number: u64,
        level: u32,
        part_size: usize,
    ) -> Result<Self, SSTableError> {
        if part_size == 0 {
            return Err(SSTableError::InvariantViolation("part_size must be >= 1".into()));
        }
        let final_path = dir.join(table_file_name(file_number));
        let tmp_path = final_path.with_extension(TEMP_EXT);

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut writer = CountingWriter {
            inner: BufWriter::new(file),
            written: 0,
        };
        let mut header = Vec::new();
        SST_MAGIC.encode_to(&mut header)?;
        SST_VERSION.encode_to(&mut header)?;
        writer.write_all(&header)?;

        Ok(Self {
            writer: Some(writer),
            tmp_path,
            final_path,
            file_number,
            level,
            part_size,
            part: Vec::new(),
            part_entries: 0,
            part_first_key: None,
            index: Vec::new(),
            keys: Vec::new(),
            last_key: None,
            smallest_key: None,
        })
    }

    /// Append the next command. Its key must be greater than every key
    /// added before.
    pub fn add(&mut self, cmd: &Command) -> Result<(), SSTableError> {
        let key = cmd.key();
        if let Some(last) = &self.last_key {
            if key <= last.as_str() {
                return Err(SSTableError::InvariantViolation(format!(
                    "key {key:?} does not follow {last:?}"
                )));
            }
        }

        if self.part_first_key.is_none() {
            self.part_first_key = Some(key.to_owned());
        }
        if self.smallest_key.is_none() {
            self.smallest_key = Some(key.to_owned());
        }
        cmd.encode_to(&mut self.part)?;
        self.part_entries += 1;
        self.keys.push(key.to_owned());
        self.last_key = Some(key.to_owned());

        if self.part_entries >= self.part_size {
            self.flush_part()?;
        }
        Ok(())
    }

    /// Number of commands added so far.
    pub fn entry_count(&self) -> usize {
        self.keys.len()
    }

    /// Bytes the table would occupy if finished now, excluding bloom and
    /// index blocks.
    pub fn estimated_size(&self) -> u64 {
        self.writer.as_ref().map_or(0, |w| w.written) + self.part.len() as u64
    }

    pub fn file_number(&self) -> u64 {
        self.file_number
    }

    /// Write the trailing blocks, sync, publish the file under its final
    /// name and open it.
    pub fn finish(mut self) -> Result<SSTable, SSTableError> {
        let (smallest_key, largest_key) = match (self.smallest_key.take(), self.last_key.take()) {
            (Some(s), Some(l)) => (s, l),
            _ => {
                return Err(SSTableError::InvariantViolation(
                    "refusing to write an empty table".into(),
                ));
            }
        };
        self.flush_part()?;

        let mut bloom: Bloom<str> =
            Bloom::new_for_fp_rate(self.keys.len(), SST_BLOOM_FALSE_POSITIVE_RATE)
                .map_err(|e| SSTableError::InvariantViolation(format!("bloom filter: {e}")))?;
        for key in &self.keys {
            bloom.set(key.as_str());
        }

        let index = mem::take(&mut self.index);
        let footer = TableFooter {
            file_number: self.file_number,
            level: self.level,
            smallest_key,
            largest_key,
            entry_count: self.keys.len() as u64,
            index: BlockHandle { offset: 0, size: 0 },
            bloom: BlockHandle { offset: 0, size: 0 },
        };
        {
            let writer = self
                .writer
                .as_mut()
                .ok_or_else(|| SSTableError::InvariantViolation("builder already finished".into()))?;
            let bloom_handle = write_checksummed_block(writer, bloom.as_slice())?;

            let mut index_bytes = Vec::new();
            encoding::encode_vec(&index, &mut index_bytes)?;
            let index_handle = write_checksummed_block(writer, &index_bytes)?;

            let footer = TableFooter {
                index: index_handle,
                bloom: bloom_handle,
                ..footer
            };
            let footer_handle =
                write_checksummed_block(writer, &encoding::encode_to_vec(&footer)?)?;

            let mut trailer = Vec::new();
            footer_handle.offset.encode_to(&mut trailer)?;
            SST_MAGIC.encode_to(&mut trailer)?;
            SST_VERSION.encode_to(&mut trailer)?;
            writer.write_all(&trailer)?;
            writer.flush()?;
        }

        if let Some(writer) = self.writer.take() {
            let file = writer
                .inner
                .into_inner()
                .map_err(|e| SSTableError::Io(e.into_error()))?;
            file.sync_all()?;
        }

        fs::rename(&self.tmp_path, &self.final_path)?;
        sync_parent_dir(&self.final_path)?;

        debug!(
            path = %self.final_path.display(),
            file_number = self.file_number,
            level = self.level,
            entries = self.keys.len(),
            parts = index.len(),
            "SSTable written"
        );

        SSTable::open(&self.final_path)
    }

    fn flush_part(&mut self) -> Result<(), SSTableError> {
        if self.part.is_empty() {
            return Ok(());
        }
        let data = mem::take(&mut self.part);
        let handle = write_checksummed_block(self.writer_mut()?, &data)?;
        let first_key = self
            .part_first_key
            .take()
            .ok_or_else(|| SSTableError::InvariantViolation("part without first key".into()))?;
        self.index.push(IndexEntry { first_key, handle });
        self.part_entries = 0;
        Ok(())
    }

    fn writer_mut(&mut self) -> Result<&mut CountingWriter<BufWriter<File>>, SSTableError> {
        self.writer
            .as_mut()
            .ok_or_else(|| SSTableError::InvariantViolation("builder already finished".into()))
    }
}

impl Drop for SstBuilder {
    fn drop(&mut self) {
        // The temp file only survives on the success path, where it has
        // already been renamed away.
        self.writer.take();
        if self.tmp_path.exists() {
            if let Err(e) = fs::remove_file(&self.tmp_path) {
                warn!(path = %self.tmp_path.display(), error = %e, "failed to remove temp SSTable");
            }
        }
    }
}

/// Write `commands` as a complete table `NNNNNN.sst` in `dir`.
pub fn write_table<I>(
    dir: &Path,
    file_number: u64,
    level: u32,
    part_size: usize,
    commands: I,
) -> Result<SSTable, SSTableError>
where
    I: IntoIterator,
    I::Item: Borrow<Command>,
{
    let mut builder = SstBuilder::new(dir, file_number, level, part_size)?;
    for cmd in commands {
        builder.add(cmd.borrow())?;
    }
    builder.finish()
}

