//! Directory enumeration over an archive's index.
//!
//! A directory handle is an archive opened without an interior path; the
//! cursor walks the index one record at a time.  Positions are record
//! indices, so `seek_to(n)` followed by `tell()` always returns `n`.

use std::path::Path;

use crate::archive::ArchiveFile;
use crate::error::{PackError, Result};
use crate::record::ENTRY_SIZE;

/// One enumerated name.  Entries are always regular files (inode 0).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
}

pub struct ArchiveDir {
    pub(crate) file: ArchiveFile,
    pub(crate) index_start: u32,
    pub(crate) index_length: u32,
    pub(crate) file_length: u32,
}

impl ArchiveDir {
    pub fn open(backing_path: &Path) -> Result<Self> {
        let file = ArchiveFile::open(backing_path, None)?;
        // The open sequence leaves the cursor on the first index record.
        let index_start = file.ctx.cursor();
        let index_length = file.ctx.header.index_size;
        let file_length = file.ctx.file_length;
        Ok(Self {
            file,
            index_start,
            index_length,
            file_length,
        })
    }

    /// Read the next entry name, or `None` at end of stream.  An entry whose
    /// payload lies past the archive end also ends the stream: the archive
    /// has been stripped and everything from there on is absent.
    pub fn read_next(&mut self) -> Result<Option<DirEntry>> {
        let cursor = self.file.ctx.cursor();
        if cursor < self.index_start || cursor >= self.index_start + self.index_length {
            return Ok(None);
        }

        let entry = self.file.ctx.read_index_record()?;
        if entry.end() > self.file_length {
            return Ok(None);
        }

        Ok(Some(DirEntry {
            name: entry.path().to_owned(),
        }))
    }

    /// Current position as an entry index.
    pub fn tell(&self) -> u64 {
        let cursor = self.file.ctx.cursor();
        if cursor < self.index_start {
            return 0;
        }
        ((cursor - self.index_start) / ENTRY_SIZE as u32) as u64
    }

    /// Position on the n-th entry; `n` may equal the entry count, which
    /// parks the cursor at end of stream.
    pub fn seek_to(&mut self, n: u64) -> Result<()> {
        let byte_offset = n
            .checked_mul(ENTRY_SIZE as u64)
            .ok_or(PackError::InvalidArgument("directory position overflow"))?;
        if byte_offset > self.index_length as u64 {
            return Err(PackError::InvalidArgument("directory position out of range"));
        }
        self.file.ctx.seek_abs(self.index_start + byte_offset as u32)
    }

    pub fn rewind(&mut self) -> Result<()> {
        self.seek_to(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ArchiveBuilder;
    use std::io::Write;

    fn two_entry_archive() -> tempfile::NamedTempFile {
        let mut b = ArchiveBuilder::new();
        b.add_regular("a", b"AAAAAAAAAA").unwrap();
        b.add_regular("b", b"BBBBBBBBBB").unwrap();
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&b.build().unwrap()).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn enumerates_in_index_order() {
        let f = two_entry_archive();
        let mut dir = ArchiveDir::open(f.path()).unwrap();
        assert_eq!(dir.read_next().unwrap().unwrap().name, "a");
        assert_eq!(dir.read_next().unwrap().unwrap().name, "b");
        assert!(dir.read_next().unwrap().is_none());
    }

    #[test]
    fn tell_matches_seek() {
        let f = two_entry_archive();
        let mut dir = ArchiveDir::open(f.path()).unwrap();
        for n in 0..=2u64 {
            dir.seek_to(n).unwrap();
            assert_eq!(dir.tell(), n);
        }
        assert!(dir.seek_to(3).is_err());
    }

    #[test]
    fn stripped_archive_truncates_listing() {
        let f = two_entry_archive();
        let full = std::fs::read(f.path()).unwrap();
        // Drop the second entry's payload from the file tail.
        let truncated = &full[..full.len() - 10];
        let mut t = tempfile::NamedTempFile::new().unwrap();
        t.write_all(truncated).unwrap();
        t.flush().unwrap();

        let mut dir = ArchiveDir::open(t.path()).unwrap();
        assert_eq!(dir.read_next().unwrap().unwrap().name, "a");
        assert!(dir.read_next().unwrap().is_none());
    }
}
