//! ImageFS — the firmware-image archive layer.
//!
//! Reuses the pack format to store device firmware: one archive under a
//! prefix directory, named for the running application
//! (`image-<project>-v<version>.pack`).  Mounting verifies the archive's
//! body hash (and, optionally, every image hash) by streaming it once.
//! On top of the plain entry namespace, a virtual `/meta/` directory
//! exposes each meta record as a small read-only file holding its value
//! bytes, and directory enumeration yields meta keys before entry names.

pub mod dfu;

use std::fs;
use std::path::{Path, PathBuf};

use log::{error, info, warn};

use crate::archive::{ArchiveFile, FileStat};
use crate::context::Whence;
use crate::dir::{ArchiveDir, DirEntry};
use crate::error::{PackError, Result};
use crate::header::{HASH_SIZE, HEADER_SIZE};
use crate::process::{process_from_file, ProcessHandler, Section};
use crate::record::{Entry, MetaRecord};
use crate::vfs::{HandleTable, IoctlCmd, IoctlReply, OpenFlags, DEFAULT_MAX_FILES};

/// Virtual directory exposing meta records as files.
pub const META_DIR_PREFIX: &str = "/meta/";

/// Project name and version of an application image, as reported by the
/// OTA layer.  Drives the archive naming convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDesc {
    pub project_name: String,
    pub version: String,
}

// ── Naming policy ────────────────────────────────────────────────────────────

/// Archive naming convention.  The defaults produce
/// `image-<project>-v<version>.pack` with `image-scratchfile.pack` as the
/// staging name; hosts with their own conventions override.
pub trait ImageNaming {
    fn image_name(&self, project: &str, version: &str) -> String {
        format!("image-{project}-v{version}.pack")
    }

    fn is_image_name(&self, name: &str) -> bool {
        name.len() > 12 && name.starts_with("image-") && name.ends_with(".pack")
    }

    fn scratch_name(&self) -> String {
        "image-scratchfile.pack".to_owned()
    }
}

/// The stock `image-….pack` convention.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultNaming;

impl ImageNaming for DefaultNaming {}

// ── Mount-time verification ──────────────────────────────────────────────────

struct VerifySink {
    full: bool,
    valid: bool,
}

impl ProcessHandler for VerifySink {
    fn on_error(&mut self, file: &str, line: u32, section: Section, err: &PackError) {
        error!("verify error in section {section:?} ({file}:{line}): {err}");
        self.valid = false;
    }

    fn on_body_hash(
        &mut self,
        _reported: &[u8; HASH_SIZE],
        _computed: Option<&[u8; HASH_SIZE]>,
        matches: bool,
    ) -> bool {
        self.valid = self.valid && matches;
        matches
    }

    fn on_entry_start(&mut self, entry: &Entry, _file_size: u32) -> bool {
        // Only image payloads need a second look, and only in full mode.
        self.full && entry.is_img()
    }

    fn on_img_entry_end(
        &mut self,
        _entry: &Entry,
        _reported: &[u8; HASH_SIZE],
        _computed: Option<&[u8; HASH_SIZE]>,
        matches: bool,
    ) -> bool {
        self.valid = self.valid && matches;
        matches
    }

    fn wants_body_hash(&self) -> bool {
        true
    }

    fn wants_image_hash(&self) -> bool {
        self.full
    }
}

/// Stream an archive once and verify its body hash; with `full`, every
/// image entry's hash as well.
pub fn verify_archive(path: &Path, full: bool) -> Result<()> {
    let sink = process_from_file(path, VerifySink { full, valid: true })?;
    if !sink.valid {
        return Err(PackError::HashMismatch);
    }
    Ok(())
}

// ── Handles ──────────────────────────────────────────────────────────────────

/// An open imagefs object: either an interior entry or a `/meta/<key>`
/// record served from its value bytes.
pub enum ImageHandle {
    Entry(ArchiveFile),
    Meta {
        file: ArchiveFile,
        record: MetaRecord,
        value: Vec<u8>,
        offset: u32,
    },
}

/// Combined enumeration: meta keys first (as `/meta/<key>`), then index
/// entries.  Positions are linear over the whole sequence.
pub struct ImageDir {
    dir: ArchiveDir,
    meta_count: u32,
    metas_walked: u32,
}

impl ImageDir {
    fn open(image_path: &Path) -> Result<Self> {
        let mut dir = ArchiveDir::open(image_path)?;
        let meta_count = dir.file.meta_count()?;
        // Rewind past the header so enumeration starts on the meta records.
        dir.file.ctx.seek_abs(HEADER_SIZE as u32)?;
        Ok(Self {
            dir,
            meta_count,
            metas_walked: 0,
        })
    }

    pub fn read_next(&mut self) -> Result<Option<DirEntry>> {
        if self.metas_walked < self.meta_count {
            let meta = self.dir.file.ctx.read_meta_prefix()?;
            self.dir.file.ctx.skip_meta_sides(&meta)?;
            self.metas_walked += 1;
            return Ok(Some(DirEntry {
                name: format!("{}{}", META_DIR_PREFIX, meta.key()),
            }));
        }
        self.dir.read_next()
    }

    pub fn tell(&self) -> u64 {
        if self.metas_walked < self.meta_count {
            self.metas_walked as u64
        } else {
            self.meta_count as u64 + self.dir.tell()
        }
    }

    /// Meta records are variable-width, so positions inside the meta part
    /// rewind to the section start and walk forward.
    pub fn seek_to(&mut self, n: u64) -> Result<()> {
        let entries = (self.dir.index_length as usize / crate::record::ENTRY_SIZE) as u64;
        if n > self.meta_count as u64 + entries {
            return Err(PackError::InvalidArgument("directory position out of range"));
        }

        if n < self.meta_count as u64 {
            self.dir.file.ctx.seek_abs(HEADER_SIZE as u32)?;
            self.metas_walked = 0;
            for _ in 0..n {
                let meta = self.dir.file.ctx.read_meta_prefix()?;
                self.dir.file.ctx.skip_meta_sides(&meta)?;
                self.metas_walked += 1;
            }
            Ok(())
        } else {
            self.metas_walked = self.meta_count;
            self.dir.seek_to(n - self.meta_count as u64)
        }
    }
}

// ── ImageFs ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ImageFsConfig {
    /// Directory holding the image archive (and DFU scratch files).
    pub prefix_path: PathBuf,
    pub max_files: usize,
    /// Skip the mount-time streaming verification entirely.
    pub skip_verify: bool,
    /// Verify every image entry's hash as well as the body hash.
    pub full_verify: bool,
}

impl ImageFsConfig {
    pub fn new(prefix_path: impl Into<PathBuf>) -> Self {
        Self {
            prefix_path: prefix_path.into(),
            max_files: DEFAULT_MAX_FILES,
            skip_verify: false,
            full_verify: false,
        }
    }
}

pub struct ImageFs<N: ImageNaming> {
    prefix: PathBuf,
    naming: N,
    image_path: PathBuf,
    files: HandleTable<ImageHandle>,
    dirs: HandleTable<ImageDir>,
}

impl<N: ImageNaming> ImageFs<N> {
    /// Locate the running application's archive under the prefix, verify
    /// it (unless skipped), and mount.
    pub fn mount(config: ImageFsConfig, naming: N, app: &AppDesc) -> Result<Self> {
        if config.max_files == 0 {
            return Err(PackError::InvalidArgument("max_files must be nonzero"));
        }

        let image_name = naming.image_name(&app.project_name, &app.version);
        let image_path = config.prefix_path.join(&image_name);
        info!("imagefs using image file {}", image_path.display());

        if !config.skip_verify {
            verify_archive(&image_path, config.full_verify).map_err(|e| {
                error!(
                    "failed to verify pack file for imagefs: path={}",
                    image_path.display()
                );
                e
            })?;
        }

        Ok(Self {
            prefix: config.prefix_path,
            naming,
            image_path,
            files: HandleTable::new(config.max_files),
            dirs: HandleTable::new(config.max_files),
        })
    }

    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    pub fn naming(&self) -> &N {
        &self.naming
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    // ── File operations ──────────────────────────────────────────────────────

    pub fn open(&self, path: &str, flags: OpenFlags) -> Result<usize> {
        if flags.write {
            return Err(PackError::Unsupported);
        }
        if path.is_empty() {
            return Err(PackError::InvalidArgument("empty path"));
        }

        let handle = if let Some(key) = path.strip_prefix(META_DIR_PREFIX) {
            let mut file = ArchiveFile::open(&self.image_path, None)?;
            let (index, _) = file.meta_find(key)?.ok_or(PackError::NotFound)?;
            let (record, _desc, value) = file.meta_read(index)?;
            ImageHandle::Meta {
                file,
                record,
                value,
                offset: 0,
            }
        } else {
            let interior = path.strip_prefix('/').unwrap_or(path);
            ImageHandle::Entry(ArchiveFile::open(&self.image_path, Some(interior))?)
        };

        self.files.alloc(handle)
    }

    pub fn close(&self, fd: usize) -> Result<()> {
        self.files.release(fd).map(|_| ())
    }

    pub fn read(&self, fd: usize, buf: &mut [u8]) -> Result<usize> {
        self.files.with(fd, |h| match h {
            ImageHandle::Entry(f) => f.read(buf),
            ImageHandle::Meta { value, offset, .. } => {
                let remaining = value.len() - *offset as usize;
                let n = buf.len().min(remaining);
                buf[..n].copy_from_slice(&value[*offset as usize..*offset as usize + n]);
                *offset += n as u32;
                Ok(n)
            }
        })
    }

    pub fn lseek(&self, fd: usize, offset: i64, whence: Whence) -> Result<u32> {
        self.files.with(fd, |h| match h {
            ImageHandle::Entry(f) => f.seek(offset, whence),
            ImageHandle::Meta {
                value,
                offset: cur, ..
            } => {
                let len = value.len() as i64;
                let pos = match whence {
                    Whence::Start => offset,
                    Whence::Cur => offset + *cur as i64,
                    Whence::End => offset + len,
                };
                if pos < 0 || pos > len {
                    return Err(PackError::Overflow);
                }
                *cur = pos as u32;
                Ok(pos as u32)
            }
        })
    }

    pub fn ioctl(&self, fd: usize, cmd: IoctlCmd<'_>) -> Result<IoctlReply> {
        self.files.with(fd, |h| {
            let file = match h {
                ImageHandle::Entry(f) => f,
                ImageHandle::Meta { file, .. } => {
                    if matches!(cmd, IoctlCmd::CurrentEntry) {
                        // Entry queries need an entry-mode handle.
                        return Err(PackError::InvalidArgument(
                            "no entry open on a meta handle",
                        ));
                    }
                    file
                }
            };
            match cmd {
                IoctlCmd::MetaCount => file.meta_count().map(IoctlReply::Count),
                IoctlCmd::MetaRead(i) => file.meta_read(i).map(|(record, desc, value)| {
                    IoctlReply::Meta {
                        record,
                        desc,
                        value,
                    }
                }),
                IoctlCmd::MetaFind(key) => file
                    .meta_find(key)
                    .map(|found| IoctlReply::MetaIndex(found.map(|(i, _)| i))),
                IoctlCmd::IndexCount => Ok(IoctlReply::Count(file.index_count())),
                IoctlCmd::IndexRead(i) => file.index_read(i).map(IoctlReply::Entry),
                IoctlCmd::IndexFind(path) => file.index_find(path).map(IoctlReply::FoundEntry),
                IoctlCmd::CurrentEntry => file.current_entry().map(IoctlReply::Entry),
            }
        })
    }

    pub fn fstat(&self, fd: usize) -> Result<FileStat> {
        self.files.with(fd, |h| match h {
            ImageHandle::Entry(f) => f.fstat(),
            ImageHandle::Meta { value, .. } => Ok(FileStat {
                size: value.len() as u32,
                block_size: 1,
                blocks: value.len() as u32,
            }),
        })
    }

    pub fn stat(&self, path: &str) -> Result<FileStat> {
        let fd = self.open(path, OpenFlags::default())?;
        let result = self.fstat(fd);
        let _ = self.close(fd);
        result
    }

    pub fn access(&self, path: &str, mode: crate::vfs::AccessMode) -> Result<()> {
        match mode {
            crate::vfs::AccessMode::Exists | crate::vfs::AccessMode::Read => {}
            _ => return Err(PackError::Unsupported),
        }
        self.stat(path).map(|_| ())
    }

    // ── Directory operations ─────────────────────────────────────────────────

    pub fn opendir(&self) -> Result<usize> {
        let dir = ImageDir::open(&self.image_path)?;
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

    // ── Cleanup ──────────────────────────────────────────────────────────────

    /// Remove stale archives from the prefix directory.  The mounted image
    /// file is always kept; everything else is offered to `should_clean`.
    /// Returns the number of files removed.
    pub fn clean_fs(&self, should_clean: impl Fn(&str) -> bool) -> Result<usize> {
        let active = self
            .image_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut removed = 0usize;
        for dirent in fs::read_dir(&self.prefix)? {
            let dirent = dirent?;
            let name = dirent.file_name().to_string_lossy().into_owned();
            if name == active {
                continue;
            }
            if should_clean(&name) {
                let path = self.prefix.join(&name);
                warn!("cleaning unused file: {}", path.display());
                if let Err(e) = fs::remove_file(&path) {
                    warn!("unable to remove {}: {e}", path.display());
                } else {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ArchiveBuilder;
    use crate::record::MetaType;

    fn make_image_dir(app: &AppDesc) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let mut b = ArchiveBuilder::new();
        b.add_meta("project", MetaType::String, b"", app.project_name.as_bytes())
            .unwrap();
        b.add_meta("version", MetaType::String, b"", app.version.as_bytes())
            .unwrap();
        b.add_regular("config.json", b"{\"mode\":1}").unwrap();
        b.add_image("app.bin", &[0xE9u8; 1024]).unwrap();
        let name = DefaultNaming.image_name(&app.project_name, &app.version);
        std::fs::write(dir.path().join(name), b.build().unwrap()).unwrap();
        dir
    }

    fn demo_app() -> AppDesc {
        AppDesc {
            project_name: "widget".into(),
            version: "2.1".into(),
        }
    }

    #[test]
    fn mount_verifies_and_serves_entries() {
        let app = demo_app();
        let dir = make_image_dir(&app);
        let mut config = ImageFsConfig::new(dir.path());
        config.full_verify = true;
        let fs = ImageFs::mount(config, DefaultNaming, &app).unwrap();

        let fd = fs.open("config.json", OpenFlags::default()).unwrap();
        let mut buf = [0u8; 32];
        let n = fs.read(fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"{\"mode\":1}");
        fs.close(fd).unwrap();
    }

    #[test]
    fn meta_mode_serves_value_bytes() {
        let app = demo_app();
        let dir = make_image_dir(&app);
        let fs = ImageFs::mount(ImageFsConfig::new(dir.path()), DefaultNaming, &app).unwrap();

        let fd = fs.open("/meta/project", OpenFlags::default()).unwrap();
        assert_eq!(fs.fstat(fd).unwrap().size, 6);
        let mut buf = [0u8; 16];
        let n = fs.read(fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"widget");
        assert_eq!(fs.read(fd, &mut buf).unwrap(), 0);
        fs.close(fd).unwrap();

        assert!(matches!(
            fs.open("/meta/absent", OpenFlags::default()),
            Err(PackError::NotFound)
        ));
    }

    #[test]
    fn combined_dir_walks_meta_then_entries() {
        let app = demo_app();
        let dir = make_image_dir(&app);
        let fs = ImageFs::mount(ImageFsConfig::new(dir.path()), DefaultNaming, &app).unwrap();

        let dd = fs.opendir().unwrap();
        let names: Vec<String> = std::iter::from_fn(|| fs.readdir(dd).unwrap().map(|e| e.name))
            .collect();
        assert_eq!(
            names,
            vec!["/meta/project", "/meta/version", "config.json", "app.bin"]
        );

        for n in 0..=4u64 {
            fs.seekdir(dd, n).unwrap();
            assert_eq!(fs.telldir(dd).unwrap(), n);
        }
        fs.seekdir(dd, 1).unwrap();
        assert_eq!(fs.readdir(dd).unwrap().unwrap().name, "/meta/version");
        fs.closedir(dd).unwrap();
    }

    #[test]
    fn clean_fs_keeps_active_image() {
        let app = demo_app();
        let dir = make_image_dir(&app);
        std::fs::write(dir.path().join("image-old-v1.0.pack"), b"stale").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"keep me").unwrap();

        let fs = ImageFs::mount(ImageFsConfig::new(dir.path()), DefaultNaming, &app).unwrap();
        let naming = DefaultNaming;
        let removed = fs.clean_fs(|name| naming.is_image_name(name)).unwrap();
        assert_eq!(removed, 1);
        assert!(!dir.path().join("image-old-v1.0.pack").exists());
        assert!(dir.path().join("notes.txt").exists());
        assert!(fs.image_path().exists());
    }
}
