//! The unit of mutation: a `Set` or a `Remove` of one string key.
//!
//! Commands travel through every layer of the store. The WAL journals them,
//! the memtable holds the most recent one per key, and SSTable parts store
//! them in key order. All of these use the same self-delimiting byte form.
//!
//! # Wire format
//!
//! ```text
//! Set:    [u32 tag = 0][u32 key_len][key bytes][u32 value_len][value bytes]
//! Remove: [u32 tag = 1][u32 key_len][key bytes]
//! ```
//!
//! Integers are little-endian (see [`crate::encoding`]). A standalone
//! [`decode`] rejects trailing bytes; callers that walk a buffer of several
//! commands use [`Decode::decode_from`] directly and advance by the returned
//! byte count.


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use thiserror::Error;

use crate::encoding::{self, Decode, Encode, EncodingError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors produced by [`encode`] and [`decode`].
#[derive(Debug, Error)]
pub enum CommandError {
    /// The bytes do not form exactly one well-formed command.
    #[error("corrupt command record: {0}")]
    CorruptRecord(String),

    /// The command could not be serialized.
    #[error("encoding error: {0}")]
    Encoding(EncodingError),
}

// ------------------------------------------------------------------------------------------------
// Command
// ------------------------------------------------------------------------------------------------

const TAG_SET: u32 = 0;
const TAG_REMOVE: u32 = 1;

/// A single write against the store.
///
/// `Remove` is kept as a tombstone all the way down the level tree so that it
/// shadows older `Set`s of the same key in deeper tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Associate `value` with `key`.
    Set { key: String, value: String },
    /// Delete `key`.
    Remove { key: String },
}

impl Command {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn remove(key: impl Into<String>) -> Self {
        Self::Remove { key: key.into() }
    }

    /// The key this command applies to.
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. } | Self::Remove { key } => key,
        }
    }

    /// The value for a `Set`, `None` for a tombstone.
    pub fn value(&self) -> Option<&str> {
        match self {
            Self::Set { value, .. } => Some(value),
            Self::Remove { .. } => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Self::Remove { .. })
    }
}

impl Encode for Command {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            Self::Set { key, value } => {
                TAG_SET.encode_to(buf)?;
                key.encode_to(buf)?;
                value.encode_to(buf)?;
            }
            Self::Remove { key } => {
                TAG_REMOVE.encode_to(buf)?;
                key.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl Decode for Command {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (tag, n) = u32::decode_from(buf)?;
        off += n;
        match tag {
            TAG_SET => {
                let (key, n) = String::decode_from(&buf[off..])?;
                off += n;
                let (value, n) = String::decode_from(&buf[off..])?;
                off += n;
                Ok((Self::Set { key, value }, off))
            }
            TAG_REMOVE => {
                let (key, n) = String::decode_from(&buf[off..])?;
                off += n;
                Ok((Self::Remove { key }, off))
            }
            other => Err(EncodingError::InvalidTag {
                tag: other,
                type_name: "Command",
            }),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Codec entry points
// ------------------------------------------------------------------------------------------------

/// Serialize one command.
pub fn encode(cmd: &Command) -> Result<Vec<u8>, CommandError> {
    encoding::encode_to_vec(cmd).map_err(CommandError::Encoding)
}

/// Deserialize exactly one command from `bytes`.
///
/// Truncation, an unknown tag, invalid UTF-8 or leftover bytes all yield
/// [`CommandError::CorruptRecord`].
pub fn decode(bytes: &[u8]) -> Result<Command, CommandError> {
    let (cmd, consumed) = Command::decode_from(bytes)
        .map_err(|e| CommandError::CorruptRecord(e.to_string()))?;
    if consumed != bytes.len() {
        return Err(CommandError::CorruptRecord(format!(
            "{} trailing bytes after command",
            bytes.len() - consumed
        )));
    }
    Ok(cmd)
}
