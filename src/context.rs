//! Per-open-handle state and the primitives everything above it is built
//! from: positioned chunk reads, absolute/forward seeks, meta and index
//! scans, and the LZO block-replay loops.
//!
//! Errors are sticky: any failed backing operation latches the context and
//! every later call fails with `BadHandle` until the handle is closed.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use log::warn;

use crate::error::{PackError, Result};
use crate::header::{Header, HEADER_SIZE};
use crate::lzo::{LzoHeader, LzoState, LZO_BLOCK_LEN_SIZE, LZO_HEADER_SIZE};
use crate::record::{Entry, MetaRecord, ENTRY_PATH_SIZE, ENTRY_SIZE, META_PREFIX_SIZE};

/// Origin for [`crate::archive::ArchiveFile::seek`]; `Cur` is the logical
/// position within the entry and `End` its logical length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Cur,
    End,
}

pub struct Context {
    backing: File,
    cursor: u32,
    errored: bool,
    pub header: Header,
    pub file_length: u32,
    pub entry: Option<Entry>,
    pub lzo: Option<LzoState>,
}

impl Context {
    /// Open a backing archive, verify its header, skip the meta section,
    /// and optionally position on an interior entry.
    pub fn open(backing_path: &Path, interior: Option<&str>) -> Result<Self> {
        let meta = std::fs::metadata(backing_path)?;
        let file_length = meta.len() as u32;

        let mut backing = File::open(backing_path)?;
        let header = Header::read(&mut backing)?;
        header.check_version()?;

        let mut ctx = Self {
            backing,
            cursor: HEADER_SIZE as u32,
            errored: false,
            header,
            file_length,
            entry: None,
            lzo: None,
        };

        // Skip the meta section; the cursor lands on the first index record.
        ctx.seek_fwd(ctx.header.meta_size)?;

        if let Some(path) = interior {
            if path.len() >= ENTRY_PATH_SIZE {
                return Err(PackError::InvalidArgument("interior path too long"));
            }
            let index_size = ctx.header.index_size;
            let entry = ctx.find_entry(index_size, path)?.ok_or(PackError::NotFound)?;

            if entry.end() > ctx.file_length {
                // Entry lies past the file bounds: stripped archive.
                warn!("entry {} extends past archive end; archive is stripped", path);
                return Err(PackError::NotFound);
            }

            ctx.seek_abs(entry.offset)?;
            ctx.entry = Some(entry);
            ctx.prep_entry()?;
        }

        Ok(ctx)
    }

    // ── Error latch ──────────────────────────────────────────────────────────

    #[inline]
    pub fn check(&self) -> Result<()> {
        if self.errored {
            Err(PackError::BadHandle)
        } else {
            Ok(())
        }
    }

    #[inline]
    pub fn errored(&self) -> bool {
        self.errored
    }

    fn latch<T>(&mut self, r: Result<T>) -> Result<T> {
        if r.is_err() {
            self.errored = true;
        }
        r
    }

    // ── Positioned I/O primitives ────────────────────────────────────────────

    #[inline]
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    /// Read exactly `buf.len()` bytes at the cursor, advancing it.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<()> {
        self.check()?;
        let r = self.backing.read_exact(buf).map_err(PackError::from);
        self.latch(r)?;
        self.cursor += buf.len() as u32;
        Ok(())
    }

    pub fn seek_abs(&mut self, offset: u32) -> Result<()> {
        self.check()?;
        let r = self
            .backing
            .seek(SeekFrom::Start(offset as u64))
            .map(|_| ())
            .map_err(PackError::from);
        self.latch(r)?;
        self.cursor = offset;
        Ok(())
    }

    pub fn seek_fwd(&mut self, length: u32) -> Result<()> {
        self.seek_abs(self.cursor + length)
    }

    pub fn seek_entry(&mut self) -> Result<()> {
        let entry = self.entry.ok_or(PackError::InvalidArgument("no current entry"))?;
        self.seek_abs(entry.offset)
    }

    // ── Record reads ─────────────────────────────────────────────────────────

    pub fn read_meta_prefix(&mut self) -> Result<MetaRecord> {
        let mut buf = [0u8; META_PREFIX_SIZE];
        self.read_chunk(&mut buf)?;
        let r = MetaRecord::parse(&buf);
        self.latch(r)
    }

    /// Read the description and value bytes following a meta prefix.
    pub fn read_meta_sides(&mut self, meta: &MetaRecord) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut desc = vec![0u8; meta.desc_size as usize];
        self.read_chunk(&mut desc)?;
        let mut value = vec![0u8; meta.value_size as usize];
        self.read_chunk(&mut value)?;
        Ok((desc, value))
    }

    pub fn skip_meta_sides(&mut self, meta: &MetaRecord) -> Result<()> {
        self.seek_fwd(meta.sides_size())
    }

    pub fn read_index_record(&mut self) -> Result<Entry> {
        let mut buf = [0u8; ENTRY_SIZE];
        self.read_chunk(&mut buf)?;
        let r = Entry::parse(&buf);
        self.latch(r)
    }

    // ── Scans ────────────────────────────────────────────────────────────────

    /// Count meta records in a `meta_size`-byte region starting at the cursor.
    pub fn count_meta(&mut self, meta_size: u32) -> Result<u32> {
        let mut remaining = meta_size;
        let mut count = 0u32;
        while remaining > 0 {
            let meta = self.read_meta_prefix()?;
            if meta.total_size() > remaining {
                return self.latch(Err(PackError::Truncated));
            }
            self.skip_meta_sides(&meta)?;
            remaining -= meta.total_size();
            count += 1;
        }
        Ok(count)
    }

    /// Scan meta records from the cursor for a byte-equal key.
    /// First match wins; returns the record and its position in the walk.
    pub fn find_meta(&mut self, meta_size: u32, key: &str) -> Result<Option<(u32, MetaRecord)>> {
        let mut remaining = meta_size;
        let mut index = 0u32;
        while remaining > 0 {
            let meta = self.read_meta_prefix()?;
            if meta.total_size() > remaining {
                return self.latch(Err(PackError::Truncated));
            }
            if meta.key() == key {
                return Ok(Some((index, meta)));
            }
            self.skip_meta_sides(&meta)?;
            remaining -= meta.total_size();
            index += 1;
        }
        Ok(None)
    }

    /// Scan the index from the cursor for a byte-equal entry path.
    pub fn find_entry(&mut self, index_size: u32, path: &str) -> Result<Option<Entry>> {
        let mut entries = index_size / ENTRY_SIZE as u32;
        while entries > 0 {
            let entry = self.read_index_record()?;
            if entry.path() == path {
                return Ok(Some(entry));
            }
            entries -= 1;
        }
        Ok(None)
    }

    // ── Entry preparation ────────────────────────────────────────────────────

    /// Set up decoder state for the current entry.  The cursor must be at
    /// `entry.offset`.  For compressed image entries the 32-byte image-hash
    /// prefix precedes the LZO header and is skipped here; plain image
    /// entries keep the prefix readable (seek does not hide it).
    pub fn prep_entry(&mut self) -> Result<()> {
        let entry = match self.entry {
            Some(e) => e,
            None => return Ok(()),
        };
        if !entry.is_lzo() {
            return Ok(());
        }

        if entry.is_img() {
            self.seek_fwd(crate::header::HASH_SIZE as u32)?;
        }

        let mut buf = [0u8; LZO_HEADER_SIZE];
        self.read_chunk(&mut buf)?;
        let header = {
            let r = LzoHeader::parse(&buf);
            self.latch(r)?
        };
        self.lzo = Some(LzoState::new(header)?);
        if let Some(lzo) = self.lzo.as_mut() {
            lzo.prep();
        }
        Ok(())
    }

    // ── LZO block-replay loops ───────────────────────────────────────────────

    /// Read the next block's length field, its payload, and decompress.
    fn read_lzo_block(&mut self) -> Result<()> {
        let mut len_buf = [0u8; LZO_BLOCK_LEN_SIZE];
        self.read_chunk(&mut len_buf)?;
        let compressed_len = u16::from_le_bytes(len_buf);

        let mut lzo = self.lzo.take().ok_or(PackError::Unsupported)?;
        let r = (|| {
            lzo.begin_block(compressed_len)?;
            self.read_chunk(lzo.compressed_buf())?;
            lzo.decompress_block()
        })();
        self.lzo = Some(lzo);
        self.latch(r)
    }

    /// Skip one whole compressed block by its length field alone.
    fn skip_lzo_block(&mut self) -> Result<()> {
        let mut len_buf = [0u8; LZO_BLOCK_LEN_SIZE];
        self.read_chunk(&mut len_buf)?;
        let compressed_len = u16::from_le_bytes(len_buf);

        let mut lzo = self.lzo.take().ok_or(PackError::Unsupported)?;
        let r = (|| {
            lzo.begin_block(compressed_len)?;
            self.seek_fwd(compressed_len as u32)?;
            lzo.note_block_skipped();
            Ok(())
        })();
        self.lzo = Some(lzo);
        self.latch(r)
    }

    /// Copy decompressed bytes out of the entry, loading successive blocks
    /// until `buf` is full or the entry's logical end is reached.
    pub fn read_lzo(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check()?;
        let mut total = 0usize;
        while total < buf.len() {
            let (exhausted, at_eof) = {
                let lzo = self.lzo.as_ref().ok_or(PackError::Unsupported)?;
                (lzo.block_exhausted(), lzo.at_entry_eof())
            };
            if exhausted {
                if at_eof {
                    break;
                }
                self.read_lzo_block()?;
                continue;
            }
            if let Some(lzo) = self.lzo.as_mut() {
                let want = buf.len() - total;
                total += lzo.take_from_block(Some(&mut buf[total..]), want);
            }
        }
        Ok(total)
    }

    /// Seek within a compressed entry by block replay.
    ///
    /// Backward targets outside the decoded block restart from the entry
    /// start; forward motion skips whole blocks by length field alone and
    /// decompresses only the block containing the target.
    pub fn seek_lzo(&mut self, offset: i64, whence: Whence) -> Result<u32> {
        self.check()?;
        let lzo = self.lzo.as_ref().ok_or(PackError::Unsupported)?;
        let total = lzo.header.uncompressed_length as i64;

        let target = match whence {
            Whence::Start => offset,
            Whence::Cur => offset + lzo.position() as i64,
            Whence::End => offset + total,
        };
        if target < 0 || target > total {
            return Err(PackError::Overflow);
        }
        let target = target as u32;

        let mut position = lzo.position();
        if target == position {
            return Ok(target);
        }

        let block_start = position - lzo.unc_off() as u32;
        if target >= block_start && target < block_start + lzo.unc_len() as u32 {
            // Target lies inside the already-decoded block.
            position = block_start;
            if let Some(lzo) = self.lzo.as_mut() {
                lzo.rewind_block();
            }
        } else if target < position {
            // Behind us: rewind to the entry start and replay forward.
            self.seek_entry()?;
            self.prep_entry()?;
            position = 0;
        }

        while position < target {
            let bytes_left = target - position;
            let (block_remaining, blocksize) = {
                let lzo = self.lzo.as_ref().ok_or(PackError::Unsupported)?;
                (lzo.block_remaining(), lzo.header.blocksize)
            };

            if block_remaining > 0 {
                let n = bytes_left.min(block_remaining as u32);
                if let Some(lzo) = self.lzo.as_mut() {
                    lzo.skip_in_block(n as u16);
                }
                position += n;
            } else if bytes_left > blocksize as u32 {
                self.skip_lzo_block()?;
                position += blocksize as u32;
            } else {
                // Target lies within the next block: decode it and loop.
                self.read_lzo_block()?;
            }
        }

        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ArchiveBuilder;
    use std::io::Write;

    fn write_archive(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn open_positions_on_interior_entry() {
        let mut b = ArchiveBuilder::new();
        b.add_regular("readme.txt", b"hello").unwrap();
        let f = write_archive(&b.build().unwrap());

        let mut ctx = Context::open(f.path(), Some("readme.txt")).unwrap();
        let entry = ctx.entry.unwrap();
        assert_eq!(entry.path(), "readme.txt");
        assert_eq!(entry.length, 5);
        let mut buf = [0u8; 5];
        ctx.read_chunk(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn missing_interior_is_not_found() {
        let mut b = ArchiveBuilder::new();
        b.add_regular("a", b"A").unwrap();
        let f = write_archive(&b.build().unwrap());
        assert!(matches!(
            Context::open(f.path(), Some("nope")),
            Err(PackError::NotFound)
        ));
    }

    #[test]
    fn error_latch_is_sticky() {
        let mut b = ArchiveBuilder::new();
        b.add_regular("a", b"A").unwrap();
        let f = write_archive(&b.build().unwrap());

        let mut ctx = Context::open(f.path(), Some("a")).unwrap();
        // Force a short read past the archive end.
        ctx.seek_abs(ctx.file_length).unwrap();
        let mut buf = [0u8; 16];
        assert!(ctx.read_chunk(&mut buf).is_err());
        assert!(matches!(ctx.read_chunk(&mut buf), Err(PackError::BadHandle)));
        assert!(matches!(ctx.seek_abs(0), Err(PackError::BadHandle)));
    }

    #[test]
    fn count_and_find_meta() {
        let mut b = ArchiveBuilder::new();
        b.add_meta("project", crate::record::MetaType::String, b"", b"demo")
            .unwrap();
        b.add_meta("build", crate::record::MetaType::U32, b"number", &7u32.to_le_bytes())
            .unwrap();
        b.add_regular("a", b"A").unwrap();
        let f = write_archive(&b.build().unwrap());

        let mut ctx = Context::open(f.path(), None).unwrap();
        let meta_size = ctx.header.meta_size;
        ctx.seek_abs(HEADER_SIZE as u32).unwrap();
        assert_eq!(ctx.count_meta(meta_size).unwrap(), 2);

        ctx.seek_abs(HEADER_SIZE as u32).unwrap();
        let (idx, meta) = ctx.find_meta(meta_size, "build").unwrap().unwrap();
        assert_eq!(idx, 1);
        let (desc, value) = ctx.read_meta_sides(&meta).unwrap();
        assert_eq!(desc, b"number");
        assert_eq!(value, 7u32.to_le_bytes());
    }
}
