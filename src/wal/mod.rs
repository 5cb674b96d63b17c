//! Write-Ahead Log.
//!
//! Every `set` and `remove` is appended here before it touches the memtable,
//! so that a restart can rebuild the memtable by replaying the file. The log
//! is a flat sequence of frames with no header:
//!
//! # On-disk layout
//!
//! ```text
//! [REC_LEN u32 BE][COMMAND_BYTES]
//! [REC_LEN u32 BE][COMMAND_BYTES]
//! ...
//! ```
//!
//! `COMMAND_BYTES` is one encoded [`Command`]. Each frame is written with a
//! single `write_all`, so a crash can only leave a partial frame at the tail.
//! A failed append cuts the file back to the last intact frame before any
//! later frame is written.
//!
//! # Durability
//!
//! By default an append returns once the bytes are handed to the OS. With
//! `sync_writes` enabled every append is followed by `fsync`. Rotation to the
//! staging file always fsyncs first.
//!
//! # Replay
//!
//! [`WalIter`] yields commands in write order. A truncated final frame is
//! treated as an interrupted write: it is logged, iteration stops, and
//! [`WalIter::valid_len`] reports where the intact prefix ends so the caller
//! can cut the file back with [`Wal::truncate_to`]. A complete frame that
//! fails to decode is [`WalError::CorruptRecord`].

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufReader, Read, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::command::{self, Command, CommandError};

const LEN_SIZE: usize = std::mem::size_of::<u32>();

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A complete frame held bytes that are not a valid command.
    #[error("corrupt record at offset {offset}: {source}")]
    CorruptRecord {
        offset: u64,
        #[source]
        source: CommandError,
    },

    /// The command could not be serialized.
    #[error("command encoding failed: {0}")]
    Encode(CommandError),

    /// A previous rotation left a staging file behind.
    #[error("staging log already exists: {0}")]
    StagingExists(PathBuf),

    /// The log was closed or lost its file handle.
    #[error("WAL is closed")]
    Closed,
}

// ------------------------------------------------------------------------------------------------
// WAL Core
// ------------------------------------------------------------------------------------------------

/// Append-only command journal backed by a single file.
#[derive(Debug)]
pub struct Wal {
    /// `None` once the log has been closed.
    file: Option<File>,

    /// Location of the log on disk.
    path: PathBuf,

    /// Bytes of intact frames currently in the file.
    len: u64,

    /// Fsync after every append.
    sync_writes: bool,
}

impl Wal {
    /// Open or create the log at `path`, positioned for appending.
    pub fn open<P: AsRef<Path>>(path: P, sync_writes: bool) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let len = file.metadata()?.len();

        info!(path = %path.display(), len, sync_writes, "WAL opened");

        Ok(Self {
            file: Some(file),
            path,
            len,
            sync_writes,
        })
    }

    /// Append one command as a single frame.
    pub fn append(&mut self, cmd: &Command) -> Result<(), WalError> {
        let payload = command::encode(cmd).map_err(WalError::Encode)?;
        let payload_len = u32::try_from(payload.len()).map_err(|_| {
            WalError::Encode(CommandError::CorruptRecord(format!(
                "record of {} bytes exceeds frame limit",
                payload.len()
            )))
        })?;

        let mut frame = Vec::with_capacity(LEN_SIZE + payload.len());
        frame.extend_from_slice(&payload_len.to_be_bytes());
        frame.extend_from_slice(&payload);

        let sync_writes = self.sync_writes;
        let file = self.file_mut()?;
        let mut written = file.write_all(&frame);
        if written.is_ok() && sync_writes {
            written = file.sync_all();
        }
        if let Err(e) = written {
            return Err(self.discard_partial_frame(e));
        }
        self.len += frame.len() as u64;

        trace!(key = cmd.key(), bytes = frame.len(), "WAL append");
        Ok(())
    }

    /// Force appended frames to stable storage.
    pub fn sync(&self) -> Result<(), WalError> {
        self.file.as_ref().ok_or(WalError::Closed)?.sync_all()?;
        Ok(())
    }

    /// Replay the log from the beginning.
    pub fn iter(&self) -> Result<WalIter, WalError> {
        if self.file.is_none() {
            return Err(WalError::Closed);
        }
        WalIter::open(&self.path)
    }

    /// Cut the file back to `len` bytes, dropping a torn tail.
    pub fn truncate_to(&mut self, len: u64) -> Result<(), WalError> {
        let file = self.file_mut()?;
        file.set_len(len)?;
        file.sync_all()?;
        warn!(path = %self.path.display(), from = self.len, to = len, "WAL truncated");
        self.len = len;
        Ok(())
    }

    /// Move the current contents aside to `staging` and continue on a fresh
    /// empty file at the original path.
    ///
    /// Fails with [`WalError::StagingExists`] if `staging` is already present,
    /// leaving the current log untouched. If the fresh log cannot be created
    /// after the rename, this handle is closed.
    pub fn rotate_to_staging(&mut self, staging: &Path) -> Result<(), WalError> {
        if staging.exists() {
            return Err(WalError::StagingExists(staging.to_path_buf()));
        }
        self.sync()?;

        fs::rename(&self.path, staging)?;
        self.file = None;
        sync_parent_dir(&self.path)?;

        let fresh = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;
        self.file = Some(fresh);

        debug!(
            wal = %self.path.display(),
            staging = %staging.display(),
            staged_bytes = self.len,
            "WAL rotated to staging"
        );
        self.len = 0;
        Ok(())
    }

    /// Sync and release the file handle. Further use returns [`WalError::Closed`].
    pub fn close(&mut self) -> Result<(), WalError> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
            info!(path = %self.path.display(), "WAL closed");
        }
        Ok(())
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size in bytes of the intact frames written so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Cut the file back to the last intact frame after a failed append.
    ///
    /// Later frames must never follow a partial one. If the file cannot be
    /// cut back, the handle is closed and further appends return
    /// [`WalError::Closed`].
    fn discard_partial_frame(&mut self, cause: io::Error) -> WalError {
        let len = self.len;
        let restored = match self.file.as_ref() {
            Some(file) => file.set_len(len),
            None => Ok(()),
        };
        match restored {
            Ok(()) => warn!(
                path = %self.path.display(),
                len,
                error = %cause,
                "WAL append failed, partial frame discarded"
            ),
            Err(e) => {
                error!(
                    path = %self.path.display(),
                    error = %e,
                    "cannot discard partial WAL frame, closing log"
                );
                self.file = None;
            }
        }
        WalError::Io(cause)
    }

    fn file_mut(&mut self) -> Result<&mut File, WalError> {
        self.file.as_mut().ok_or(WalError::Closed)
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.sync_all() {
                error!(path = %self.path.display(), error = %e, "failed to sync WAL on drop");
            }
        }
    }
}

/// Fsync the directory holding `path` so a rename or unlink in it is durable.
pub(crate) fn sync_parent_dir(path: &Path) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    File::open(dir)?.sync_all()
}

// ------------------------------------------------------------------------------------------------
// WalIter
// ------------------------------------------------------------------------------------------------

/// Streaming replay over a log file.
///
/// Reads one frame at a time through its own read handle, so it never
/// interferes with an open [`Wal`] appending to the same path.
pub struct WalIter {
    reader: BufReader<File>,
    path: PathBuf,

    /// End of the last complete frame.
    offset: u64,

    /// Set when iteration stopped at a torn final frame.
    truncated: bool,

    done: bool,
}

impl WalIter {
    /// Open `path` for replay.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        debug!(path = %path.display(), "WAL replay started");
        Ok(Self {
            reader: BufReader::new(file),
            path,
            offset: 0,
            truncated: false,
            done: false,
        })
    }

    /// Byte length of the intact prefix read so far.
    pub fn valid_len(&self) -> u64 {
        self.offset
    }

    /// Whether replay ended at a partially written frame.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Fill `buf` completely, returning how many bytes were actually read.
    fn read_full(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    fn torn_tail(&mut self, have: usize, want: usize) {
        warn!(
            path = %self.path.display(),
            offset = self.offset,
            have,
            want,
            "truncated WAL record ignored"
        );
        self.truncated = true;
        self.done = true;
    }
}

impl Iterator for WalIter {
    type Item = Result<Command, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut len_bytes = [0u8; LEN_SIZE];
        let got = match self.read_full(&mut len_bytes) {
            Ok(n) => n,
            Err(e) => {
                self.done = true;
                return Some(Err(WalError::Io(e)));
            }
        };
        if got == 0 {
            trace!(path = %self.path.display(), "end of WAL reached");
            self.done = true;
            return None;
        }
        if got < LEN_SIZE {
            self.torn_tail(got, LEN_SIZE);
            return None;
        }

        let record_len = u32::from_be_bytes(len_bytes) as usize;
        let mut payload = Vec::new();
        // Read through `take` so a garbage length cannot force a huge allocation.
        match (&mut self.reader)
            .take(record_len as u64)
            .read_to_end(&mut payload)
        {
            Ok(_) => {}
            Err(e) => {
                self.done = true;
                return Some(Err(WalError::Io(e)));
            }
        }
        if payload.len() < record_len {
            self.torn_tail(LEN_SIZE + payload.len(), LEN_SIZE + record_len);
            return None;
        }

        match command::decode(&payload) {
            Ok(cmd) => {
                self.offset += (LEN_SIZE + record_len) as u64;
                Some(Ok(cmd))
            }
            Err(source) => {
                error!(path = %self.path.display(), offset = self.offset, "corrupt WAL record");
                self.done = true;
                Some(Err(WalError::CorruptRecord {
                    offset: self.offset,
                    source,
                }))
            }
        }
    }
}
