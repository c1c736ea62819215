//! Device firmware update driven by the streaming processor.
//!
//! Two modes share one sink:
//!
//! * **File DFU** — walk a DFU archive already on disk, flash the named
//!   image entry to the next update partition, then swap the boot target.
//! * **Stream DFU** — feed the archive as it arrives; the processor
//!   mirrors the bytes into a scratch file (optionally with the image
//!   section stripped) while flashing, and on success the scratch is
//!   renamed into the mountable `image-<project>-v<version>.pack` name
//!   before the boot swap.
//!
//! Invariants: at most one OTA handle per DFU, balanced by exactly one
//! `end` on every termination path; the scratch file is deleted on
//! cancel; the stored archive is renamed only after `end` succeeded and
//! the hashes verified.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use log::{error, info, warn};

use super::{AppDesc, ImageNaming};
use crate::error::{PackError, Result};
use crate::header::HASH_SIZE;
use crate::process::{Mirror, ProcessHandler, Processor, Section, Status};
use crate::record::{Entry, ENTRY_PATH_SIZE};

/// Default circular-buffer size for stream DFU.
pub const DFU_STREAM_BUFSIZE: usize = 512;

// ── OTA partition interface (host-provided) ──────────────────────────────────

/// The over-the-air update backend.  On real hardware this wraps the
/// platform's partition API; tests substitute a recorder.
pub trait Ota {
    type Partition: Copy;
    type Handle;

    fn next_update_partition(&mut self) -> Result<Self::Partition>;
    fn begin(&mut self, partition: Self::Partition, image_size: u32) -> Result<Self::Handle>;
    fn write(&mut self, handle: &mut Self::Handle, data: &[u8]) -> Result<()>;
    fn end(&mut self, handle: Self::Handle) -> Result<()>;
    fn set_boot(&mut self, partition: Self::Partition) -> Result<()>;
    /// Description of the application written to `partition` (drives the
    /// stored archive's name).
    fn partition_desc(&mut self, partition: Self::Partition) -> Result<AppDesc>;
}

// ── The shared DFU sink ──────────────────────────────────────────────────────

struct DfuSink<'a, O: Ota> {
    ota: &'a mut O,
    partition: O::Partition,
    handle: Option<O::Handle>,
    target: String,
    found: bool,
    failed: Option<PackError>,
    reached_eof: bool,
}

impl<'a, O: Ota> DfuSink<'a, O> {
    fn new(ota: &'a mut O, partition: O::Partition, target: &str) -> Self {
        Self {
            ota,
            partition,
            handle: None,
            target: target.to_owned(),
            found: false,
            failed: None,
            reached_eof: false,
        }
    }

    /// Balance `begin` with `end` if the session died mid-image.
    fn abort_if_open(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.ota.end(handle);
        }
    }

    fn record(&mut self, err: PackError) {
        if self.failed.is_none() {
            self.failed = Some(err);
        }
    }
}

impl<O: Ota> ProcessHandler for DfuSink<'_, O> {
    fn on_error(&mut self, file: &str, line: u32, section: Section, err: &PackError) {
        error!("critical error during DFU (section {section:?}, {file}:{line}): {err}");
    }

    fn on_body_hash(
        &mut self,
        _reported: &[u8; HASH_SIZE],
        _computed: Option<&[u8; HASH_SIZE]>,
        matches: bool,
    ) -> bool {
        if !matches {
            warn!("verification hash failure, corrupt DFU file?");
        }
        matches
    }

    fn on_entry_start(&mut self, entry: &Entry, file_size: u32) -> bool {
        if self.found || !entry.is_img() || entry.path() != self.target {
            return false;
        }
        self.found = true;

        match self.ota.begin(self.partition, file_size) {
            Ok(handle) => {
                self.handle = Some(handle);
                true
            }
            Err(e) => {
                self.record(e);
                false
            }
        }
    }

    fn on_entry_data(&mut self, _entry: &Entry, data: &[u8], _offset: u32) {
        if self.failed.is_some() {
            return;
        }
        if let Some(handle) = self.handle.as_mut() {
            if let Err(e) = self.ota.write(handle, data) {
                self.failed = Some(e);
            }
        }
    }

    fn on_img_entry_end(
        &mut self,
        _entry: &Entry,
        _reported: &[u8; HASH_SIZE],
        _computed: Option<&[u8; HASH_SIZE]>,
        matches: bool,
    ) -> bool {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.ota.end(handle) {
                self.record(e);
            }
        }
        if !matches {
            error!("verification hash failure, corrupt image in DFU file?");
            self.record(PackError::HashMismatch);
        }
        true
    }

    fn on_eof(&mut self) -> bool {
        self.reached_eof = true;
        true
    }

    fn wants_body_hash(&self) -> bool {
        true
    }

    fn wants_image_hash(&self) -> bool {
        true
    }
}

// ── Shared helpers ───────────────────────────────────────────────────────────

fn check_subpath(subpath: &str) -> Result<()> {
    if subpath.is_empty() || subpath.len() >= ENTRY_PATH_SIZE {
        return Err(PackError::InvalidArgument("image subpath length out of range"));
    }
    Ok(())
}

/// Move `from` onto `to`, replacing any existing file.
fn move_file(to: &Path, from: &Path) -> Result<()> {
    if to == from {
        return Ok(());
    }
    if to.exists() {
        warn!("file {} already exists, removing first", to.display());
        fs::remove_file(to)?;
    }
    fs::rename(from, to)?;
    Ok(())
}

fn status_error<H: ProcessHandler>(status: Status, proc: &mut Processor<H>) -> PackError {
    match status {
        Status::HashMismatch => PackError::HashMismatch,
        Status::UserBail => PackError::UserBail,
        Status::Fail => proc.take_last_error().unwrap_or(PackError::Truncated),
        _ => PackError::Truncated,
    }
}

// ── File DFU ─────────────────────────────────────────────────────────────────

/// Flash `image_subpath` out of the DFU archive at `archive_path`.
///
/// With `ensure_mountable`, the archive is renamed into the mountable
/// naming convention under `prefix` after a successful flash, so the next
/// boot finds it.  The boot partition is swapped last.
pub fn file_dfu<O: Ota, N: ImageNaming>(
    ota: &mut O,
    naming: &N,
    prefix: &Path,
    archive_path: &Path,
    image_subpath: &str,
    ensure_mountable: bool,
) -> Result<()> {
    check_subpath(image_subpath)?;

    if !archive_path.exists() {
        error!("DFU file {} does not exist", archive_path.display());
        return Err(PackError::NotFound);
    }

    info!("performing DFU with file {}", archive_path.display());
    let partition = ota.next_update_partition()?;

    let (err, found, failed) = {
        let sink = DfuSink::new(ota, partition, image_subpath);
        let mut proc = Processor::from_file(archive_path, Mirror::None, sink)?;
        let status = proc.process();
        let err = if status == Status::Eof {
            None
        } else {
            Some(status_error(status, &mut proc))
        };
        let sink = proc.handler_mut();
        sink.abort_if_open();
        let found = sink.found;
        let failed = sink.failed.take();
        (err, found, failed)
    };

    if let Some(e) = failed.or(err) {
        error!("failed DFU update: {e}");
        return Err(e);
    }
    if !found {
        error!("failed DFU update: firmware subpath {image_subpath} not found");
        return Err(PackError::NotFound);
    }

    let app = ota.partition_desc(partition)?;
    info!(
        "wrote app {} version {}",
        app.project_name, app.version
    );

    if ensure_mountable {
        let good = prefix.join(naming.image_name(&app.project_name, &app.version));
        move_file(&good, archive_path)?;
    }

    ota.set_boot(partition)?;
    info!("firmware DFU complete, OK to reboot");
    Ok(())
}

// ── Stream DFU ───────────────────────────────────────────────────────────────

/// An in-flight streaming DFU session.  Feed bytes with
/// [`StreamDfu::load_and_process`]; finish with [`StreamDfu::complete`]
/// or abandon with [`StreamDfu::cancel`].
pub struct StreamDfu<'a, O: Ota, N: ImageNaming> {
    proc: Processor<DfuSink<'a, O>>,
    naming: &'a N,
    prefix: PathBuf,
    scratch: PathBuf,
    partition: O::Partition,
}

impl<'a, O: Ota, N: ImageNaming> StreamDfu<'a, O, N> {
    /// Open the scratch file and set up the processor.  With `strip_image`
    /// the stored copy omits the image section, keeping only the mountable
    /// skeleton on disk.
    pub fn start(
        ota: &'a mut O,
        naming: &'a N,
        prefix: &Path,
        image_subpath: &str,
        strip_image: bool,
        buffer_size: usize,
    ) -> Result<Self> {
        check_subpath(image_subpath)?;

        let partition = ota.next_update_partition()?;
        let scratch = prefix.join(naming.scratch_name());

        if scratch.exists() {
            fs::remove_file(&scratch).map_err(|e| {
                error!("failed to initialize scratch file: {e}");
                PackError::Io(e)
            })?;
        }
        let file = File::create(&scratch)?;

        let sink = DfuSink::new(ota, partition, image_subpath);
        let proc = Processor::from_stream(
            buffer_size,
            Mirror::File { file, strip_image },
            sink,
        )?;

        info!("DFU stream started");
        Ok(Self {
            proc,
            naming,
            prefix: prefix.to_owned(),
            scratch,
            partition,
        })
    }

    pub fn load(&mut self, data: &[u8]) -> Result<usize> {
        self.proc.load(data)
    }

    pub fn process(&mut self) -> Status {
        self.proc.process()
    }

    pub fn load_and_process(&mut self, data: &[u8]) -> Status {
        self.proc.load_and_process(data)
    }

    pub fn load_eof_and_flush(&mut self) -> Status {
        self.proc.load_eof_and_flush()
    }

    /// Push EOF if needed, verify the session finished cleanly, rename the
    /// scratch copy into the mountable name, and swap the boot partition.
    pub fn complete(mut self) -> Result<()> {
        let mut failure: Option<PackError> = None;

        if !self.proc.is_closed() {
            let status = self.proc.load_eof_and_flush();
            if status != Status::Eof {
                error!("failed DFU update: could not flush stream");
                failure = Some(status_error(status, &mut self.proc));
            }
        }

        // Always settle the stored copy, success or not.
        let _ = self.proc.flush_mirror();

        let mut sink = self.proc.into_handler();
        sink.abort_if_open();
        let found = sink.found;
        let reached_eof = sink.reached_eof;
        if let Some(e) = sink.failed.take() {
            failure.get_or_insert(e);
        }
        let ota = sink.ota;

        if let Some(e) = failure {
            error!("failed DFU update: {e}");
            return Err(e);
        }
        if !reached_eof {
            error!("failed DFU update: stream not completely processed");
            return Err(PackError::Truncated);
        }
        if !found {
            error!("failed DFU update: firmware subpath not processed");
            return Err(PackError::NotFound);
        }

        let app = ota.partition_desc(self.partition)?;
        let good = self
            .prefix
            .join(self.naming.image_name(&app.project_name, &app.version));
        move_file(&good, &self.scratch).map_err(|e| {
            error!("failed DFU update: could not ensure mountable");
            e
        })?;

        ota.set_boot(self.partition)?;
        info!("firmware DFU complete, OK to reboot");
        Ok(())
    }

    /// Tear the session down: close any open OTA handle, close and delete
    /// the scratch file.
    pub fn cancel(self) -> Result<()> {
        // Dropping the processor closes the scratch file handle.
        let mut sink = self.proc.into_handler();
        sink.abort_if_open();

        if let Err(e) = fs::remove_file(&self.scratch) {
            error!(
                "unable to remove DFU scratch file {}: {e}",
                self.scratch.display()
            );
        }

        info!("firmware DFU canceled");
        Ok(())
    }
}
