//! POSIX-shaped surface: composite paths, integer descriptors, and the
//! fixed-capacity handle table behind them.
//!
//! Composite path syntax is `container#interior/path`: the part before the
//! single `'#'` names an archive file under the configured prefix
//! directory; the part after it names an entry inside the archive.  An
//! absent or empty interior part denotes the archive itself (directory
//! enumeration, meta queries).
//!
//! Integer descriptors exist only here.  Embedders that can hold a typed
//! handle should use [`crate::archive::ArchiveFile`] directly.

use std::path::PathBuf;
use std::sync::Mutex;

use log::info;

use crate::archive::{ArchiveFile, FileStat};
use crate::context::Whence;
use crate::dir::{ArchiveDir, DirEntry};
use crate::error::{PackError, Result};
use crate::record::{Entry, MetaRecord};

pub const PATH_SEPARATOR: char = '#';
/// Maximum bytes of prefix + container path, NUL byte included.
pub const MAX_FULLPATH: usize = 96;
pub const DEFAULT_MAX_FILES: usize = 16;

// ── Composite path parsing ───────────────────────────────────────────────────

/// Split `full` at the single `'#'` separator.
///
/// The container part must fit a `root_cap`-byte NUL-terminated buffer;
/// an oversized container fails closed rather than truncating.  An empty
/// or absent interior part comes back as `None`.
pub fn parse_path(full: &str, root_cap: usize) -> Result<(&str, Option<&str>)> {
    let (root, interior) = match full.find(PATH_SEPARATOR) {
        Some(at) => (&full[..at], Some(&full[at + 1..])),
        None => (full, None),
    };
    if root.len() >= root_cap {
        return Err(PackError::InvalidArgument("container path too long"));
    }
    Ok((root, interior.filter(|s| !s.is_empty())))
}

// ── Handle table ─────────────────────────────────────────────────────────────

/// Fixed-capacity slot allocator.  Allocation scans for the first free
/// slot; each slot carries its own lock, so operations on independent
/// descriptors never contend.
pub struct HandleTable<T> {
    slots: Box<[Mutex<Option<T>>]>,
}

impl<T> HandleTable<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
        }
    }

    pub fn alloc(&self, value: T) -> Result<usize> {
        for (fd, slot) in self.slots.iter().enumerate() {
            let mut guard = lock(slot);
            if guard.is_none() {
                *guard = Some(value);
                return Ok(fd);
            }
        }
        Err(PackError::NoResource)
    }

    pub fn with<R>(&self, fd: usize, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let slot = self
            .slots
            .get(fd)
            .ok_or(PackError::InvalidArgument("descriptor out of range"))?;
        let mut guard = lock(slot);
        let value = guard
            .as_mut()
            .ok_or(PackError::InvalidArgument("stale descriptor"))?;
        f(value)
    }

    pub fn release(&self, fd: usize) -> Result<T> {
        let slot = self
            .slots
            .get(fd)
            .ok_or(PackError::InvalidArgument("descriptor out of range"))?;
        lock(slot)
            .take()
            .ok_or(PackError::InvalidArgument("stale descriptor"))
    }
}

fn lock<T>(slot: &Mutex<Option<T>>) -> std::sync::MutexGuard<'_, Option<T>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Surface types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    /// Any write intent fails with `Unsupported`; archives are immutable.
    pub write: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Exists,
    Read,
    Write,
    Execute,
}

#[derive(Debug, Clone, Copy)]
pub enum IoctlCmd<'a> {
    MetaCount,
    MetaRead(u32),
    MetaFind(&'a str),
    IndexCount,
    IndexRead(u32),
    IndexFind(&'a str),
    CurrentEntry,
}

#[derive(Debug)]
pub enum IoctlReply {
    Count(u32),
    Meta {
        record: MetaRecord,
        desc: Vec<u8>,
        value: Vec<u8>,
    },
    MetaIndex(Option<u32>),
    Entry(Entry),
    FoundEntry(Option<Entry>),
}

#[derive(Debug, Clone)]
pub struct PackFsConfig {
    /// Directory that container paths are resolved under.
    pub prefix_path: PathBuf,
    pub max_files: usize,
}

impl PackFsConfig {
    pub fn new(prefix_path: impl Into<PathBuf>) -> Self {
        Self {
            prefix_path: prefix_path.into(),
            max_files: DEFAULT_MAX_FILES,
        }
    }
}

// ── PackFs ───────────────────────────────────────────────────────────────────

pub struct PackFs {
    prefix: PathBuf,
    files: HandleTable<ArchiveFile>,
    dirs: HandleTable<ArchiveDir>,
}

impl PackFs {
    pub fn new(config: PackFsConfig) -> Result<Self> {
        if config.max_files == 0 {
            return Err(PackError::InvalidArgument("max_files must be nonzero"));
        }
        info!(
            "packfs mounted: prefix={}, max_files={}",
            config.prefix_path.display(),
            config.max_files
        );
        Ok(Self {
            prefix: config.prefix_path,
            files: HandleTable::new(config.max_files),
            dirs: HandleTable::new(config.max_files),
        })
    }

    /// Resolve a composite path to a backing file plus interior part.
    fn resolve<'a>(&self, path: &'a str) -> Result<(PathBuf, Option<&'a str>)> {
        let prefix_len = self.prefix.as_os_str().len();
        let cap = MAX_FULLPATH.saturating_sub(prefix_len + 1);
        let (root, interior) = parse_path(path, cap)?;
        if root.is_empty() {
            return Err(PackError::NotFound);
        }
        Ok((self.prefix.join(root), interior))
    }

    // ── File operations ──────────────────────────────────────────────────────

    pub fn open(&self, path: &str, flags: OpenFlags) -> Result<usize> {
        if flags.write {
            return Err(PackError::Unsupported);
        }
        let (backing, interior) = self.resolve(path)?;
        let file = ArchiveFile::open(&backing, interior)?;
        self.files.alloc(file)
    }

    pub fn close(&self, fd: usize) -> Result<()> {
        self.files.release(fd).map(|_| ())
    }

    pub fn read(&self, fd: usize, buf: &mut [u8]) -> Result<usize> {
        self.files.with(fd, |f| f.read(buf))
    }

    /// Archives are immutable; every write fails.
    pub fn write(&self, _fd: usize, _data: &[u8]) -> Result<usize> {
        Err(PackError::Unsupported)
    }

    pub fn lseek(&self, fd: usize, offset: i64, whence: Whence) -> Result<u32> {
        self.files.with(fd, |f| f.seek(offset, whence))
    }

    pub fn ioctl(&self, fd: usize, cmd: IoctlCmd<'_>) -> Result<IoctlReply> {
        self.files.with(fd, |f| match cmd {
            IoctlCmd::MetaCount => f.meta_count().map(IoctlReply::Count),
            IoctlCmd::MetaRead(i) => f.meta_read(i).map(|(record, desc, value)| {
                IoctlReply::Meta {
                    record,
                    desc,
                    value,
                }
            }),
            IoctlCmd::MetaFind(key) => f
                .meta_find(key)
                .map(|found| IoctlReply::MetaIndex(found.map(|(i, _)| i))),
            IoctlCmd::IndexCount => Ok(IoctlReply::Count(f.index_count())),
            IoctlCmd::IndexRead(i) => f.index_read(i).map(IoctlReply::Entry),
            IoctlCmd::IndexFind(path) => f.index_find(path).map(IoctlReply::FoundEntry),
            IoctlCmd::CurrentEntry => f.current_entry().map(IoctlReply::Entry),
        })
    }

    pub fn fstat(&self, fd: usize) -> Result<FileStat> {
        self.files.with(fd, |f| f.fstat())
    }

    pub fn stat(&self, path: &str) -> Result<FileStat> {
        let fd = self.open(path, OpenFlags::default())?;
        let result = self.fstat(fd);
        let _ = self.close(fd);
        result
    }

    pub fn access(&self, path: &str, mode: AccessMode) -> Result<()> {
        match mode {
            AccessMode::Exists | AccessMode::Read => {}
            AccessMode::Write | AccessMode::Execute => return Err(PackError::Unsupported),
        }
        self.stat(path).map(|_| ())
    }

    // ── Directory operations ─────────────────────────────────────────────────

    pub fn opendir(&self, path: &str) -> Result<usize> {
        let (backing, interior) = self.resolve(path)?;
        if interior.is_some() {
            // Entries are plain files; only the archive itself enumerates.
            return Err(PackError::NotFound);
        }
        let dir = ArchiveDir::open(&backing)?;
        self.dirs.alloc(dir)
    }

    pub fn readdir(&self, dd: usize) -> Result<Option<DirEntry>> {
        self.dirs.with(dd, |d| d.read_next())
    }

    pub fn telldir(&self, dd: usize) -> Result<u64> {
        self.dirs.with(dd, |d| Ok(d.tell()))
    }

    pub fn seekdir(&self, dd: usize, n: u64) -> Result<()> {
        self.dirs.with(dd, |d| d.seek_to(n))
    }

    pub fn closedir(&self, dd: usize) -> Result<()> {
        self.dirs.release(dd).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_path_routing() {
        assert_eq!(
            parse_path("arch#inner/file", 96).unwrap(),
            ("arch", Some("inner/file"))
        );
        assert_eq!(parse_path("arch", 96).unwrap(), ("arch", None));
        assert_eq!(parse_path("arch#", 96).unwrap(), ("arch", None));
        // Only the first separator splits.
        assert_eq!(
            parse_path("a#b#c", 96).unwrap(),
            ("a", Some("b#c"))
        );
    }

    #[test]
    fn oversized_root_fails_closed() {
        let long = "r".repeat(96);
        assert!(parse_path(&long, 96).is_err());
        let exact = "r".repeat(95);
        assert!(parse_path(&exact, 96).is_ok());
    }

    #[test]
    fn handle_table_allocates_first_free() {
        let table: HandleTable<u32> = HandleTable::new(2);
        let a = table.alloc(10).unwrap();
        let b = table.alloc(20).unwrap();
        assert_eq!((a, b), (0, 1));
        assert!(matches!(table.alloc(30), Err(PackError::NoResource)));

        table.release(a).unwrap();
        assert_eq!(table.alloc(40).unwrap(), 0);
        table.with(1, |v| {
            assert_eq!(*v, 20);
            Ok(())
        })
        .unwrap();
        assert!(table.with(5, |_| Ok(())).is_err());
    }
}
