//! Ordered scan over every command of one table.
//!
//! [`TableIter`] walks the parts of an [`SSTable`] in index order, decoding
//! one part at a time straight out of the memory map. Each part is CRC-checked
//! when it is first touched. Once an error has been yielded the iterator is
//! exhausted.

use crate::command::Command;
use crate::encoding::Decode;

use super::{SSTable, SSTableError};

/// Forward iterator yielding the commands of a table in key order.
pub struct TableIter<'a> {
    table: &'a SSTable,
    part_idx: usize,
    part: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> TableIter<'a> {
    pub(crate) fn new(table: &'a SSTable) -> Self {
        Self {
            table,
            part_idx: 0,
            part: &[],
            offset: 0,
            failed: false,
        }
    }

    fn fail(&mut self, err: SSTableError) -> Option<Result<Command, SSTableError>> {
        self.failed = true;
        Some(Err(err))
    }
}

impl Iterator for TableIter<'_> {
    type Item = Result<Command, SSTableError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        while self.offset >= self.part.len() {
            if self.part_idx >= self.table.part_count() {
                return None;
            }
            match self.table.read_part(self.part_idx) {
                Ok(bytes) => {
                    self.part = bytes;
                    self.offset = 0;
                    self.part_idx += 1;
                }
                Err(e) => return self.fail(e),
            }
        }

        match Command::decode_from(&self.part[self.offset..]) {
            Ok((cmd, n)) => {
                self.offset += n;
                Some(Ok(cmd))
            }
            Err(e) => self.fail(e.into()),
        }
    }
}
