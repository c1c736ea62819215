//! [`ArchiveFile`] — the primary embedding surface.
//!
//! One open interior entry (or a whole archive, for enumeration and meta
//! queries) with POSIX-shaped read/seek semantics and the query set that
//! the fd-level `ioctl` dispatches to.  Every query saves and restores the
//! cursor on all exit paths.
//!
//! ```no_run
//! use packfs::archive::ArchiveFile;
//! use packfs::context::Whence;
//!
//! let mut f = ArchiveFile::open("flash/data.pack".as_ref(), Some("boot/app.bin"))?;
//! let mut buf = [0u8; 256];
//! let n = f.read(&mut buf)?;
//! f.seek(0, Whence::Start)?;
//! # Ok::<(), packfs::PackError>(())
//! ```

use std::path::Path;

use crate::context::{Context, Whence};
use crate::error::{PackError, Result};
use crate::header::{HASH_SIZE, HEADER_SIZE};
use crate::record::{Entry, MetaRecord, ENTRY_SIZE};

/// What `stat`/`fstat` report.  Entries are always read-only regular files;
/// `size` is the logical byte count (net of the image-hash prefix for image
/// entries, decompressed for LZO entries).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u32,
    pub block_size: u32,
    pub blocks: u32,
}

pub struct ArchiveFile {
    pub(crate) ctx: Context,
}

impl ArchiveFile {
    /// Open `backing_path` and, when `interior` is given, position on that
    /// entry.  Fails with `NotFound` for absent paths and for entries that
    /// point past the archive end (stripped archive).
    pub fn open(backing_path: &Path, interior: Option<&str>) -> Result<Self> {
        Ok(Self {
            ctx: Context::open(backing_path, interior)?,
        })
    }

    pub fn header(&self) -> &crate::header::Header {
        &self.ctx.header
    }

    // ── Read ─────────────────────────────────────────────────────────────────

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ctx.check()?;
        let entry = self.current()?;
        if entry.is_lzo() {
            self.ctx.read_lzo(buf)
        } else {
            self.read_reg(entry, buf)
        }
    }

    fn read_reg(&mut self, entry: Entry, buf: &mut [u8]) -> Result<usize> {
        // Clamp to the entry payload; zero means EOF.
        let remaining = (entry.end() - self.ctx.cursor()) as usize;
        let length = buf.len().min(remaining);
        if length == 0 {
            return Ok(0);
        }
        self.ctx.read_chunk(&mut buf[..length])?;
        Ok(length)
    }

    // ── Seek ─────────────────────────────────────────────────────────────────

    /// Reposition within the entry; returns the new logical position.
    /// For image entries the 32-byte hash prefix is addressable — position 0
    /// is the entry start, not the first logical image byte.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<u32> {
        self.ctx.check()?;
        let entry = self.current()?;
        if entry.is_lzo() {
            self.ctx.seek_lzo(offset, whence)
        } else {
            self.seek_reg(entry, offset, whence)
        }
    }

    fn seek_reg(&mut self, entry: Entry, offset: i64, whence: Whence) -> Result<u32> {
        let pos = match whence {
            Whence::Start => offset,
            Whence::Cur => offset + (self.ctx.cursor() - entry.offset) as i64,
            Whence::End => offset + entry.length as i64,
        };
        if pos < 0 || pos > entry.length as i64 {
            return Err(PackError::Overflow);
        }
        let full = entry.offset + pos as u32;
        if self.ctx.cursor() != full {
            self.ctx.seek_abs(full)?;
        }
        Ok(pos as u32)
    }

    // ── Stat ─────────────────────────────────────────────────────────────────

    pub fn fstat(&self) -> Result<FileStat> {
        self.ctx.check()?;
        let entry = match self.ctx.entry {
            Some(e) => e,
            // Archive opened without an interior path (enumeration handle).
            None => {
                return Ok(FileStat {
                    size: 0,
                    block_size: 1,
                    blocks: 0,
                })
            }
        };

        if entry.is_lzo() {
            let lzo = self.ctx.lzo.as_ref().ok_or(PackError::Unsupported)?;
            let size = lzo.header.uncompressed_length;
            let blocksize = lzo.header.blocksize as u32;
            Ok(FileStat {
                size,
                block_size: blocksize,
                blocks: (size + blocksize - 1) / blocksize,
            })
        } else {
            let size = entry.length - if entry.is_img() { HASH_SIZE as u32 } else { 0 };
            Ok(FileStat {
                size,
                block_size: 1,
                blocks: size,
            })
        }
    }

    // ── Queries (the ioctl set) ──────────────────────────────────────────────

    /// Number of meta records in the meta section.
    pub fn meta_count(&mut self) -> Result<u32> {
        let meta_size = self.ctx.header.meta_size;
        self.with_saved_cursor(|ctx| {
            ctx.seek_abs(HEADER_SIZE as u32)?;
            ctx.count_meta(meta_size)
        })
    }

    /// Sequential walk to the i-th meta record, returning prefix,
    /// description, and value.
    pub fn meta_read(&mut self, index: u32) -> Result<(MetaRecord, Vec<u8>, Vec<u8>)> {
        let meta_size = self.ctx.header.meta_size;
        self.with_saved_cursor(|ctx| {
            ctx.seek_abs(HEADER_SIZE as u32)?;
            let mut remaining = meta_size;
            let mut at = 0u32;
            while remaining > 0 {
                let meta = ctx.read_meta_prefix()?;
                if meta.total_size() > remaining {
                    return Err(PackError::Truncated);
                }
                if at == index {
                    let (desc, value) = ctx.read_meta_sides(&meta)?;
                    return Ok((meta, desc, value));
                }
                ctx.skip_meta_sides(&meta)?;
                remaining -= meta.total_size();
                at += 1;
            }
            Err(PackError::InvalidArgument("meta index out of range"))
        })
    }

    /// First meta record whose key equals `key`; returns its walk index.
    pub fn meta_find(&mut self, key: &str) -> Result<Option<(u32, MetaRecord)>> {
        if key.len() >= crate::record::META_KEY_SIZE {
            return Err(PackError::InvalidArgument("meta key too long"));
        }
        let meta_size = self.ctx.header.meta_size;
        self.with_saved_cursor(|ctx| {
            ctx.seek_abs(HEADER_SIZE as u32)?;
            ctx.find_meta(meta_size, key)
        })
    }

    /// `index_size / ENTRY_SIZE`.
    pub fn index_count(&self) -> u32 {
        self.ctx.header.entry_count()
    }

    /// Read the i-th index record directly.
    pub fn index_read(&mut self, index: u32) -> Result<Entry> {
        if index >= self.index_count() {
            return Err(PackError::InvalidArgument("entry index out of range"));
        }
        let start = self.ctx.header.index_start() + index * ENTRY_SIZE as u32;
        self.with_saved_cursor(|ctx| {
            ctx.seek_abs(start)?;
            ctx.read_index_record()
        })
    }

    /// Linear scan of the index for `path`.
    pub fn index_find(&mut self, path: &str) -> Result<Option<Entry>> {
        if path.len() >= crate::record::ENTRY_PATH_SIZE {
            return Err(PackError::InvalidArgument("entry path too long"));
        }
        let start = self.ctx.header.index_start();
        let index_size = self.ctx.header.index_size;
        self.with_saved_cursor(|ctx| {
            ctx.seek_abs(start)?;
            ctx.find_entry(index_size, path)
        })
    }

    /// Copy of the current context entry.
    pub fn current_entry(&self) -> Result<Entry> {
        self.ctx.check()?;
        self.current()
    }

    // ── Internal ─────────────────────────────────────────────────────────────

    fn current(&self) -> Result<Entry> {
        self.ctx
            .entry
            .ok_or(PackError::InvalidArgument("no interior entry open"))
    }

    /// Run a query with the cursor saved on entry and restored on every exit
    /// path.  The original error wins over a restore failure.
    fn with_saved_cursor<T>(&mut self, f: impl FnOnce(&mut Context) -> Result<T>) -> Result<T> {
        self.ctx.check()?;
        let saved = self.ctx.cursor();
        let result = f(&mut self.ctx);
        let restore = self.ctx.seek_abs(saved);
        match result {
            Err(e) => Err(e),
            Ok(v) => restore.map(|_| v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ArchiveBuilder;
    use crate::record::MetaType;
    use std::io::Write;

    fn write_archive(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    fn sample() -> tempfile::NamedTempFile {
        let mut b = ArchiveBuilder::new();
        b.add_meta("project", MetaType::String, b"", b"widget").unwrap();
        b.add_regular("a.txt", b"AAAAAAAAAA").unwrap();
        b.add_regular("b.txt", b"BBBBBBBBBB").unwrap();
        write_archive(&b.build().unwrap())
    }

    #[test]
    fn read_to_eof() {
        let f = sample();
        let mut af = ArchiveFile::open(f.path(), Some("a.txt")).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(af.read(&mut buf).unwrap(), 10);
        assert_eq!(&buf[..10], b"AAAAAAAAAA");
        assert_eq!(af.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn seek_whence_semantics() {
        let f = sample();
        let mut af = ArchiveFile::open(f.path(), Some("b.txt")).unwrap();
        assert_eq!(af.seek(4, Whence::Start).unwrap(), 4);
        assert_eq!(af.seek(2, Whence::Cur).unwrap(), 6);
        assert_eq!(af.seek(-1, Whence::End).unwrap(), 9);
        assert!(matches!(af.seek(11, Whence::Start), Err(PackError::Overflow)));
        assert!(matches!(af.seek(-1, Whence::Start), Err(PackError::Overflow)));
    }

    #[test]
    fn queries_restore_cursor() {
        let f = sample();
        let mut af = ArchiveFile::open(f.path(), Some("a.txt")).unwrap();
        let mut first = [0u8; 4];
        af.read(&mut first).unwrap();

        assert_eq!(af.meta_count().unwrap(), 1);
        assert_eq!(af.index_count(), 2);
        let e = af.index_read(1).unwrap();
        assert_eq!(e.path(), "b.txt");
        let (idx, meta) = af.meta_find("project").unwrap().unwrap();
        assert_eq!(idx, 0);
        assert_eq!(meta.key(), "project");
        assert!(af.meta_find("absent").unwrap().is_none());

        // The cursor is unchanged: the next read continues where we left off.
        let mut rest = [0u8; 6];
        assert_eq!(af.read(&mut rest).unwrap(), 6);
        assert_eq!(&rest, b"AAAAAA");
    }

    #[test]
    fn current_entry_copy() {
        let f = sample();
        let af = ArchiveFile::open(f.path(), Some("a.txt")).unwrap();
        assert_eq!(af.current_entry().unwrap().path(), "a.txt");
    }
}
