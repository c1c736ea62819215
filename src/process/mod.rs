//! Streaming archive processor.
//!
//! A cooperative state machine that walks an archive exactly once, from a
//! file or a caller-fed byte stream, emitting typed callbacks at semantic
//! boundaries and folding SHA-256 digests over the bytes as they pass.
//! An optional mirror sink re-emits the consumed bytes (optionally with
//! the image section stripped), which is how the streaming DFU stores a
//! copy of the incoming archive while flashing it.
//!
//! Each tick computes a `(min, max)` read per the current state, pulls
//! bytes from the source, runs the state action (hashing, callbacks,
//! transitions), then mirrors the bytes.  A caller-fed source that cannot
//! satisfy `min` yet returns [`Status::Again`], and the machine resumes
//! byte-exactly on the next call.
//!
//! Callback order is fixed: header, each meta record in order, entries in
//! index order, then EOF.  The body hash covers the meta, index, and
//! regular-entry regions exactly as stored (compressed bytes for LZO
//! entries); each image hash covers that image's logical bytes
//! (decompressed for LZO entries).

pub mod stream;

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use log::error;
use sha2::{Digest, Sha256};

use crate::error::{PackError, Result};
use crate::header::{Header, HASH_SIZE, HEADER_SIZE};
use crate::lzo::{LzoHeader, LzoState, LZO_BLOCK_LEN_SIZE, LZO_HEADER_SIZE};
use crate::record::{Entry, MetaRecord, ENTRY_SIZE, META_PREFIX_SIZE};
use stream::StreamBuffer;

/// Per-tick scratch buffer; every fixed-width record fits inside.
pub const PROC_BUF_SIZE: usize = 512;

/// Smallest legal stream buffer: one entry record must fit.
pub const MIN_STREAM_SIZE: usize = ENTRY_SIZE;

// ── Public types ─────────────────────────────────────────────────────────────

/// Archive region the cursor currently lies in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Header,
    Meta,
    Index,
    RegEntry,
    ImgEntry,
}

/// Processor verdict.  `Ok` never escapes [`Processor::process`]; the
/// machine runs until it starves, finishes, or fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// Source lacks the bytes the current state needs (non-fatal).
    Again,
    /// Clean end of archive; `on_eof` has fired and the machine is closed.
    Eof,
    Fail,
    HashMismatch,
    UserBail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReadHeader,
    ReadMeta,
    ReadMetaSides,
    ReadIndex,
    ReadEntry,
    SkipEntry,
    ReadImgHash,
    ReadRegChunk,
    ReadLzoHeader,
    ReadLzoSize,
    ReadLzoChunk,
    Closed,
}

/// Consumer interface.  Default methods observe nothing and never abort;
/// implementors override what they care about.  Hash digests are only
/// maintained when the matching `wants_*` method returns true — the
/// answer is latched when the processor is created.
pub trait ProcessHandler {
    fn on_error(&mut self, _file: &str, _line: u32, _section: Section, _err: &PackError) {}

    fn on_header(&mut self, _header: &Header) {}

    fn on_meta(&mut self, _meta: &MetaRecord, _desc: &[u8], _value: &[u8]) {}

    /// Fires once per session when the cursor crosses the regular-body end.
    /// `computed` is `None` when body hashing is off.  Return false to stop.
    fn on_body_hash(
        &mut self,
        _reported: &[u8; HASH_SIZE],
        _computed: Option<&[u8; HASH_SIZE]>,
        _matches: bool,
    ) -> bool {
        true
    }

    /// First sight of an entry.  `file_size` is the logical payload size
    /// (net of the image-hash prefix, decompressed for LZO).  Return false
    /// to skip the entry's data without further callbacks.
    fn on_entry_start(&mut self, _entry: &Entry, _file_size: u32) -> bool {
        true
    }

    /// A run of logical entry bytes at logical offset `offset`.
    fn on_entry_data(&mut self, _entry: &Entry, _data: &[u8], _offset: u32) {}

    fn on_reg_entry_end(&mut self, _entry: &Entry) -> bool {
        true
    }

    /// End of an image entry.  `reported` is the 32-byte prefix stored in
    /// the payload; `computed` the streamed SHA-256 (when enabled).
    fn on_img_entry_end(
        &mut self,
        _entry: &Entry,
        _reported: &[u8; HASH_SIZE],
        _computed: Option<&[u8; HASH_SIZE]>,
        _matches: bool,
    ) -> bool {
        true
    }

    fn on_eof(&mut self) -> bool {
        true
    }

    fn wants_body_hash(&self) -> bool {
        false
    }

    fn wants_image_hash(&self) -> bool {
        false
    }
}

// ── I/O seams ────────────────────────────────────────────────────────────────

pub(crate) enum Pull {
    Data(usize),
    Again,
    Eof,
}

enum Source {
    File(File),
    Stream(StreamBuffer),
}

impl Source {
    /// Deliver between `min` and `max` bytes into `out`, or report why not.
    /// Delivering fewer than `min` with success is a protocol error.
    fn pull(&mut self, min: usize, max: usize, out: &mut [u8]) -> Result<Pull> {
        match self {
            Source::File(f) => {
                let mut got = 0usize;
                while got < max {
                    let n = f.read(&mut out[got..max])?;
                    if n == 0 {
                        break;
                    }
                    got += n;
                }
                if got == 0 {
                    Ok(Pull::Eof)
                } else if got < min {
                    Err(PackError::short_read())
                } else {
                    Ok(Pull::Data(got))
                }
            }
            Source::Stream(sb) => Ok(sb.read(min, max, out)),
        }
    }
}

/// Optional output sink mirroring every consumed byte.  With
/// `strip_image` set, bytes belonging to the image section are withheld,
/// producing an image-stripped copy of the archive.
pub enum Mirror {
    None,
    File { file: File, strip_image: bool },
}

impl Mirror {
    fn write(&mut self, section: Section, data: &[u8]) -> Result<()> {
        match self {
            Mirror::None => Ok(()),
            Mirror::File { file, strip_image } => {
                if *strip_image && section == Section::ImgEntry {
                    return Ok(());
                }
                file.write_all(data)?;
                Ok(())
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        if let Mirror::File { file, .. } = self {
            file.flush()?;
        }
        Ok(())
    }
}

enum Plan {
    Nothing,
    Buf { min: usize, max: usize },
    IndexTail,
    LzoFill,
}

enum MirrorSrc {
    Buf,
    Index(usize),
    Lzo(usize),
}

// ── Processor ────────────────────────────────────────────────────────────────

pub struct Processor<H: ProcessHandler> {
    handler: H,
    source: Source,
    mirror: Mirror,

    section: Section,
    state: State,
    cursor: u32,

    header: Option<Header>,
    entries: Vec<Entry>,
    on_entry: usize,
    entry: Option<Entry>,

    // Region boundaries, fixed once the header and index are in.
    meta_end: u32,
    body_start: u32,
    /// End of the regular body: offset of the first image entry, or the
    /// archive end when there is none.
    reg_end: u32,
    total_end: u32,
    pack_hash: [u8; HASH_SIZE],

    want_body_hash: bool,
    want_img_hash: bool,
    body_sha: Option<Sha256>,
    img_sha: Option<Sha256>,
    /// Reported hash of the current image entry (its 32-byte prefix).
    img_hash: [u8; HASH_SIZE],
    body_hash_done: bool,

    // Meta staging while sides stream in.
    meta: Option<MetaRecord>,
    meta_desc: Vec<u8>,
    meta_value: Vec<u8>,
    meta_got: u32,

    index_raw: Vec<u8>,
    index_got: usize,

    lzo: Option<LzoState>,
    last_error: Option<PackError>,
    /// Memoized outcome once the machine closes; re-driving returns it.
    terminal: Option<Status>,
    buf: Box<[u8; PROC_BUF_SIZE]>,
}

/// Abort the session: report through `on_error`, remember the error for
/// the result-level API, close, and return `Fail`.
macro_rules! fail {
    ($self:ident, $err:expr) => {{
        let err = $err;
        error!("processing failed in section {:?}: {}", $self.section, err);
        $self.handler.on_error(file!(), line!(), $self.section, &err);
        $self.last_error = Some(err);
        $self.state = State::Closed;
        $self.terminal = Some(Status::Fail);
        return Status::Fail;
    }};
}

impl<H: ProcessHandler> Processor<H> {
    fn new(source: Source, mirror: Mirror, handler: H) -> Self {
        let want_body_hash = handler.wants_body_hash();
        let want_img_hash = handler.wants_image_hash();
        Self {
            handler,
            source,
            mirror,
            section: Section::Header,
            state: State::ReadHeader,
            cursor: 0,
            header: None,
            entries: Vec::new(),
            on_entry: 0,
            entry: None,
            meta_end: 0,
            body_start: 0,
            reg_end: 0,
            total_end: 0,
            pack_hash: [0u8; HASH_SIZE],
            want_body_hash,
            want_img_hash,
            body_sha: None,
            img_sha: None,
            img_hash: [0u8; HASH_SIZE],
            body_hash_done: false,
            meta: None,
            meta_desc: Vec::new(),
            meta_value: Vec::new(),
            meta_got: 0,
            index_raw: Vec::new(),
            index_got: 0,
            lzo: None,
            last_error: None,
            terminal: None,
            buf: Box::new([0u8; PROC_BUF_SIZE]),
        }
    }

    /// Processor over an archive file on disk.
    pub fn from_file(path: &Path, mirror: Mirror, handler: H) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(Source::File(file), mirror, handler))
    }

    /// Processor over a caller-fed stream with a circular buffer of
    /// `buffer_size` bytes (at least [`MIN_STREAM_SIZE`]).
    pub fn from_stream(buffer_size: usize, mirror: Mirror, handler: H) -> Result<Self> {
        if buffer_size < MIN_STREAM_SIZE {
            return Err(PackError::InvalidArgument("stream buffer too small"));
        }
        Ok(Self::new(
            Source::Stream(StreamBuffer::new(buffer_size)),
            mirror,
            handler,
        ))
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }

    pub fn section(&self) -> Section {
        self.section
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    pub fn close(&mut self) {
        self.state = State::Closed;
    }

    pub fn take_last_error(&mut self) -> Option<PackError> {
        self.last_error.take()
    }

    /// Flush the mirror sink (the stored copy, for DFU completion).
    pub fn flush_mirror(&mut self) -> Result<()> {
        self.mirror.flush()
    }

    // ── Stream feeding ───────────────────────────────────────────────────────

    /// Feed bytes into the stream buffer; returns how many were accepted
    /// (zero when the buffer is full or EOF was already pushed).
    pub fn load(&mut self, data: &[u8]) -> Result<usize> {
        match &mut self.source {
            Source::Stream(sb) => Ok(sb.load(data)),
            Source::File(_) => Err(PackError::InvalidArgument("not a stream processor")),
        }
    }

    pub fn load_eof(&mut self) -> Result<()> {
        match &mut self.source {
            Source::Stream(sb) => {
                sb.set_eof();
                Ok(())
            }
            Source::File(_) => Err(PackError::InvalidArgument("not a stream processor")),
        }
    }

    /// Drive the machine until it starves or terminates.
    pub fn flush(&mut self) -> Status {
        let mut status = Status::Ok;
        while status == Status::Ok {
            status = self.process();
        }
        status
    }

    /// Feed `data`, interleaving processing so the buffer drains as it
    /// fills.  A full buffer that the machine still cannot progress on is
    /// a deadlock and fails.
    pub fn load_and_process(&mut self, data: &[u8]) -> Status {
        let mut status = Status::Ok;
        let mut offset = 0usize;
        while offset < data.len() && matches!(status, Status::Ok | Status::Again) {
            let accepted = match self.load(&data[offset..]) {
                Ok(n) => n,
                Err(_) => return Status::Fail,
            };
            if accepted == 0 && status == Status::Again {
                // Buffer full and the machine still starved.
                return Status::Fail;
            }
            offset += accepted;
            status = self.process();
        }
        if offset < data.len() {
            return Status::Fail;
        }
        status
    }

    pub fn load_eof_and_flush(&mut self) -> Status {
        if self.load_eof().is_err() {
            return Status::Fail;
        }
        let status = self.flush();
        if matches!(status, Status::Ok | Status::Again) {
            // EOF was pushed; anything short of a terminal status is a failure.
            return Status::Fail;
        }
        status
    }

    // ── The machine ──────────────────────────────────────────────────────────

    /// Run ticks until the source starves, the archive ends, or something
    /// fails.  Safe to call repeatedly: after `Again` it resumes
    /// byte-exactly; after a terminal status it returns that status again.
    pub fn process(&mut self) -> Status {
        if let Some(terminal) = self.terminal {
            return terminal;
        }
        let mut status = Status::Ok;

        while status == Status::Ok {
            // 1. Read plan for the current state.
            let plan = match self.read_plan() {
                Ok(p) => p,
                Err(e) => fail!(self, e),
            };

            // 2. Pull bytes.
            let (bytes, mirror_src) = match plan {
                Plan::Nothing => (0usize, MirrorSrc::Buf),
                Plan::Buf { min, max } => {
                    match self.source.pull(min, max, &mut self.buf[..max]) {
                        Ok(Pull::Data(n)) => (n, MirrorSrc::Buf),
                        Ok(Pull::Again) => return Status::Again,
                        Ok(Pull::Eof) => {
                            status = Status::Eof;
                            break;
                        }
                        Err(e) => fail!(self, e),
                    }
                }
                Plan::IndexTail => {
                    let start = self.index_got;
                    let max = self.index_raw.len() - start;
                    match self
                        .source
                        .pull(1, max, &mut self.index_raw[start..start + max])
                    {
                        Ok(Pull::Data(n)) => (n, MirrorSrc::Index(start)),
                        Ok(Pull::Again) => return Status::Again,
                        Ok(Pull::Eof) => {
                            status = Status::Eof;
                            break;
                        }
                        Err(e) => fail!(self, e),
                    }
                }
                Plan::LzoFill => {
                    let lzo = match self.lzo.as_mut() {
                        Some(l) => l,
                        None => fail!(self, PackError::InvalidArgument("no LZO state")),
                    };
                    let start = lzo.filled() as usize;
                    let max = lzo.compressed_len() as usize - start;
                    if max == 0 {
                        (0, MirrorSrc::Buf)
                    } else {
                        match self.source.pull(1, max, lzo.fill_buf()) {
                            Ok(Pull::Data(n)) => {
                                lzo.advance_fill(n);
                                (n, MirrorSrc::Lzo(start))
                            }
                            Ok(Pull::Again) => return Status::Again,
                            Ok(Pull::Eof) => {
                                status = Status::Eof;
                                break;
                            }
                            Err(e) => fail!(self, e),
                        }
                    }
                }
            };

            self.cursor += bytes as u32;

            // 3. State action.
            match self.step(bytes) {
                Ok(s) => status = s,
                Err(e) => fail!(self, e),
            }

            // 4. Mirror the consumed bytes; a mirror failure is fatal.
            if bytes > 0 {
                let section = self.section;
                let write_result = match mirror_src {
                    MirrorSrc::Buf => self.mirror.write(section, &self.buf[..bytes]),
                    MirrorSrc::Index(start) => self
                        .mirror
                        .write(section, &self.index_raw[start..start + bytes]),
                    MirrorSrc::Lzo(start) => {
                        let slice = match self.lzo.as_ref() {
                            Some(l) => l.compressed_slice(start, bytes),
                            None => &[][..],
                        };
                        self.mirror.write(section, slice)
                    }
                };
                if let Err(e) = write_result {
                    fail!(self, e);
                }
            }
        }

        // A source EOF is only legal between entries (or right before an
        // image-hash prefix — the stripped-archive boundary).
        if status == Status::Eof
            && self.state != State::ReadEntry
            && self.state != State::ReadImgHash
        {
            fail!(self, PackError::Truncated);
        }

        if status == Status::Eof {
            if !self.handler.on_eof() {
                status = Status::UserBail;
            }
            self.state = State::Closed;
            self.terminal = Some(status);
        }

        status
    }

    fn read_plan(&self) -> Result<Plan> {
        Ok(match self.state {
            State::ReadHeader => Plan::Buf {
                min: HEADER_SIZE,
                max: HEADER_SIZE,
            },
            State::ReadMeta => Plan::Buf {
                min: META_PREFIX_SIZE,
                max: META_PREFIX_SIZE,
            },
            State::ReadMetaSides => {
                let meta = self
                    .meta
                    .ok_or(PackError::InvalidArgument("no staged meta record"))?;
                let remaining = (meta.sides_size() - self.meta_got) as usize;
                Plan::Buf {
                    min: 1,
                    max: remaining.min(PROC_BUF_SIZE),
                }
            }
            State::ReadIndex => Plan::IndexTail,
            State::ReadEntry => Plan::Nothing,
            State::ReadImgHash => Plan::Buf {
                min: HASH_SIZE,
                max: HASH_SIZE,
            },
            State::SkipEntry | State::ReadRegChunk => {
                let entry = self
                    .entry
                    .ok_or(PackError::InvalidArgument("no current entry"))?;
                let remaining = (entry.end() - self.cursor) as usize;
                if remaining == 0 {
                    Plan::Nothing
                } else {
                    Plan::Buf {
                        min: 1,
                        max: remaining.min(PROC_BUF_SIZE),
                    }
                }
            }
            State::ReadLzoHeader => Plan::Buf {
                min: LZO_HEADER_SIZE,
                max: LZO_HEADER_SIZE,
            },
            State::ReadLzoSize => Plan::Buf {
                min: LZO_BLOCK_LEN_SIZE,
                max: LZO_BLOCK_LEN_SIZE,
            },
            State::ReadLzoChunk => Plan::LzoFill,
            State::Closed => {
                return Err(PackError::InvalidArgument("processor already closed"))
            }
        })
    }

    /// Run the action for the current state over the `bytes` just read.
    fn step(&mut self, bytes: usize) -> Result<Status> {
        match self.state {
            State::ReadHeader => self.step_header(),
            State::ReadMeta => self.step_meta_prefix(),
            State::ReadMetaSides => self.step_meta_sides(bytes),
            State::ReadIndex => self.step_index(bytes),
            State::ReadEntry => self.step_entry(),
            State::ReadImgHash => self.step_img_hash(),
            State::SkipEntry => self.step_skip(bytes),
            State::ReadRegChunk => self.step_reg_chunk(bytes),
            State::ReadLzoHeader => self.step_lzo_header(),
            State::ReadLzoSize => self.step_lzo_size(),
            State::ReadLzoChunk => self.step_lzo_chunk(bytes),
            State::Closed => Err(PackError::InvalidArgument("processor already closed")),
        }
    }

    // ── State actions ────────────────────────────────────────────────────────

    fn step_header(&mut self) -> Result<Status> {
        let raw: [u8; HEADER_SIZE] = self.buf[..HEADER_SIZE].try_into().unwrap();
        let header = Header::parse(&raw)?;
        header.check_version()?;

        self.entries = Vec::with_capacity(header.entry_count() as usize);
        self.index_raw = vec![0u8; header.index_size as usize];
        self.index_got = 0;
        self.meta_end = header.index_start();
        self.body_start = header.body_start();
        self.pack_hash = header.pack_hash;

        self.handler.on_header(&header);

        if self.want_body_hash {
            self.body_sha = Some(Sha256::new());
        }

        let empty_meta = header.meta_size == 0;
        self.header = Some(header);

        if empty_meta {
            self.section = Section::Index;
            self.state = State::ReadIndex;
        } else {
            self.section = Section::Meta;
            self.state = State::ReadMeta;
        }
        Ok(Status::Ok)
    }

    fn step_meta_prefix(&mut self) -> Result<Status> {
        let raw: [u8; META_PREFIX_SIZE] = self.buf[..META_PREFIX_SIZE].try_into().unwrap();
        let meta = MetaRecord::parse(&raw)?;

        let record_start = self.cursor - META_PREFIX_SIZE as u32;
        if record_start as u64 + meta.total_size() as u64 > self.meta_end as u64 {
            return Err(PackError::Truncated);
        }

        sha_update(&mut self.body_sha, &self.buf[..META_PREFIX_SIZE]);

        if meta.sides_size() == 0 {
            self.handler.on_meta(&meta, &[], &[]);
            self.after_meta_record();
        } else {
            self.meta = Some(meta);
            self.meta_desc = Vec::with_capacity(meta.desc_size as usize);
            self.meta_value = Vec::with_capacity(meta.value_size as usize);
            self.meta_got = 0;
            self.state = State::ReadMetaSides;
        }
        Ok(Status::Ok)
    }

    fn step_meta_sides(&mut self, bytes: usize) -> Result<Status> {
        let meta = self
            .meta
            .ok_or(PackError::InvalidArgument("no staged meta record"))?;
        sha_update(&mut self.body_sha, &self.buf[..bytes]);

        // Split the chunk between description and value bytes.
        let desc_size = meta.desc_size as usize;
        let mut taken = 0usize;
        if (self.meta_got as usize) < desc_size {
            let want = desc_size - self.meta_got as usize;
            taken = want.min(bytes);
            self.meta_desc.extend_from_slice(&self.buf[..taken]);
        }
        if taken < bytes {
            self.meta_value.extend_from_slice(&self.buf[taken..bytes]);
        }
        self.meta_got += bytes as u32;

        if self.meta_got == meta.sides_size() {
            let desc = std::mem::take(&mut self.meta_desc);
            let value = std::mem::take(&mut self.meta_value);
            self.handler.on_meta(&meta, &desc, &value);
            self.meta = None;
            self.after_meta_record();
        }
        Ok(Status::Ok)
    }

    fn after_meta_record(&mut self) {
        if self.cursor == self.meta_end {
            self.section = Section::Index;
            self.state = State::ReadIndex;
        } else {
            self.state = State::ReadMeta;
        }
    }

    fn step_index(&mut self, bytes: usize) -> Result<Status> {
        let start = self.index_got;
        self.index_got += bytes;
        sha_update(&mut self.body_sha, &self.index_raw[start..start + bytes]);

        if self.index_got == self.index_raw.len() {
            self.parse_index()?;
            self.section = Section::RegEntry;
            self.state = State::ReadEntry;
        }
        Ok(Status::Ok)
    }

    fn parse_index(&mut self) -> Result<()> {
        let mut expected_offset = self.body_start;
        for raw in self.index_raw.chunks_exact(ENTRY_SIZE) {
            let entry = Entry::parse(raw.try_into().unwrap())?;
            // Payloads sit back-to-back in index order; anything else is a
            // malformed archive the cursor math cannot follow.
            if entry.offset != expected_offset {
                return Err(PackError::Truncated);
            }
            expected_offset = entry.end();
            self.entries.push(entry);
        }

        self.total_end = expected_offset;
        self.reg_end = self
            .entries
            .iter()
            .find(|e| e.is_img())
            .map(|e| e.offset)
            .unwrap_or(self.total_end);
        Ok(())
    }

    fn step_entry(&mut self) -> Result<Status> {
        // Body-hash boundary: fires exactly once, when the cursor reaches
        // the end of the regular body.
        if !self.body_hash_done && self.cursor == self.reg_end {
            self.body_hash_done = true;
            let computed: Option<[u8; HASH_SIZE]> =
                self.body_sha.take().map(|sha| sha.finalize().into());
            let reported = self.pack_hash;
            let matches = computed.as_ref() == Some(&reported);
            if !self
                .handler
                .on_body_hash(&reported, computed.as_ref(), matches)
            {
                return Ok(if computed.is_some() && !matches {
                    Status::HashMismatch
                } else {
                    Status::UserBail
                });
            }
        }

        if self.cursor == self.total_end {
            return Ok(Status::Eof);
        }

        let entry = *self
            .entries
            .get(self.on_entry)
            .ok_or(PackError::Truncated)?;
        if entry.offset != self.cursor {
            return Err(PackError::Truncated);
        }
        if entry.is_img() && entry.length < HASH_SIZE as u32 {
            return Err(PackError::Truncated);
        }
        self.entry = Some(entry);

        self.section = if self.cursor >= self.reg_end {
            Section::ImgEntry
        } else {
            Section::RegEntry
        };

        if self.want_img_hash && self.section == Section::ImgEntry {
            self.img_sha = Some(Sha256::new());
        }

        self.state = if entry.is_img() {
            State::ReadImgHash
        } else if entry.is_lzo() {
            State::ReadLzoHeader
        } else {
            State::ReadRegChunk
        };
        Ok(Status::Ok)
    }

    fn step_img_hash(&mut self) -> Result<Status> {
        self.img_hash.copy_from_slice(&self.buf[..HASH_SIZE]);
        if self.section == Section::RegEntry {
            sha_update(&mut self.body_sha, &self.buf[..HASH_SIZE]);
        }

        let entry = self.current_entry()?;
        self.state = if entry.is_lzo() {
            State::ReadLzoHeader
        } else {
            State::ReadRegChunk
        };
        Ok(Status::Ok)
    }

    fn step_skip(&mut self, bytes: usize) -> Result<Status> {
        if self.section == Section::RegEntry {
            sha_update(&mut self.body_sha, &self.buf[..bytes]);
        }
        let entry = self.current_entry()?;
        if self.cursor == entry.end() {
            self.on_entry += 1;
            self.state = State::ReadEntry;
        }
        Ok(Status::Ok)
    }

    fn step_reg_chunk(&mut self, bytes: usize) -> Result<Status> {
        let entry = self.current_entry()?;
        if self.section == Section::RegEntry {
            sha_update(&mut self.body_sha, &self.buf[..bytes]);
        } else {
            sha_update(&mut self.img_sha, &self.buf[..bytes]);
        }

        let prefix = if entry.is_img() { HASH_SIZE as u32 } else { 0 };
        let start = entry.offset + prefix;
        let chunk_start = self.cursor - bytes as u32;

        if chunk_start == start {
            let file_size = entry.length - prefix;
            if !self.handler.on_entry_start(&entry, file_size) {
                self.state = State::SkipEntry;
                return Ok(Status::Ok);
            }
        }

        if bytes > 0 {
            self.handler
                .on_entry_data(&entry, &self.buf[..bytes], chunk_start - start);
        }

        if self.cursor == entry.end() {
            return Ok(self.finish_entry(entry));
        }
        Ok(Status::Ok)
    }

    fn step_lzo_header(&mut self) -> Result<Status> {
        if self.section == Section::RegEntry {
            sha_update(&mut self.body_sha, &self.buf[..LZO_HEADER_SIZE]);
        }

        let raw: [u8; LZO_HEADER_SIZE] = self.buf[..LZO_HEADER_SIZE].try_into().unwrap();
        let lzo_header = LzoHeader::parse(&raw)?;
        let entry = self.current_entry()?;

        if !self
            .handler
            .on_entry_start(&entry, lzo_header.uncompressed_length)
        {
            self.state = State::SkipEntry;
            return Ok(Status::Ok);
        }

        if lzo_header.uncompressed_length == 0 {
            // Empty compressed entry: no blocks follow.
            if self.cursor != entry.end() {
                return Err(PackError::Truncated);
            }
            return Ok(self.finish_entry(entry));
        }

        self.lzo = Some(LzoState::new(lzo_header)?);
        self.state = State::ReadLzoSize;
        Ok(Status::Ok)
    }

    fn step_lzo_size(&mut self) -> Result<Status> {
        if self.section == Section::RegEntry {
            sha_update(&mut self.body_sha, &self.buf[..LZO_BLOCK_LEN_SIZE]);
        }
        let compressed_len = u16::from_le_bytes(self.buf[..2].try_into().unwrap());
        self.lzo
            .as_mut()
            .ok_or(PackError::InvalidArgument("no LZO state"))?
            .begin_block(compressed_len)?;
        self.state = State::ReadLzoChunk;
        Ok(Status::Ok)
    }

    fn step_lzo_chunk(&mut self, bytes: usize) -> Result<Status> {
        let entry = self.current_entry()?;

        if self.section == Section::RegEntry && bytes > 0 {
            // Body hash covers the compressed bytes as stored.
            if let Some(lzo) = self.lzo.as_ref() {
                let end = lzo.filled() as usize;
                let slice = lzo.compressed_slice(end - bytes, bytes);
                if let Some(sha) = self.body_sha.as_mut() {
                    sha.update(slice);
                }
            }
        }

        let lzo = self
            .lzo
            .as_mut()
            .ok_or(PackError::InvalidArgument("no LZO state"))?;
        if !lzo.fill_complete() {
            return Ok(Status::Ok);
        }

        let block_offset = lzo.numblocks() * lzo.header.blocksize as u32;
        lzo.decompress_block()?;
        let logical_end = block_offset + lzo.unc_len() as u32;
        let uncompressed_total = lzo.header.uncompressed_length;

        if let Some(lzo) = self.lzo.as_ref() {
            self.handler
                .on_entry_data(&entry, lzo.decoded_block(), block_offset);
            if self.section == Section::ImgEntry {
                if let Some(sha) = self.img_sha.as_mut() {
                    sha.update(lzo.decoded_block());
                }
            }
        }

        if logical_end == uncompressed_total {
            if self.cursor != entry.end() {
                return Err(PackError::Truncated);
            }
            return Ok(self.finish_entry(entry));
        }
        self.state = State::ReadLzoSize;
        Ok(Status::Ok)
    }

    /// End-of-entry callbacks and advance.  Returns the status to continue
    /// with (terminal when a callback bails).
    fn finish_entry(&mut self, entry: Entry) -> Status {
        if self.section == Section::ImgEntry && entry.is_img() {
            let computed: Option<[u8; HASH_SIZE]> =
                self.img_sha.take().map(|sha| sha.finalize().into());
            let matches = computed.as_ref() == Some(&self.img_hash);
            let reported = self.img_hash;
            if !self
                .handler
                .on_img_entry_end(&entry, &reported, computed.as_ref(), matches)
            {
                return if computed.is_some() && !matches {
                    Status::HashMismatch
                } else {
                    Status::UserBail
                };
            }
        } else if !self.handler.on_reg_entry_end(&entry) {
            return Status::UserBail;
        }

        // The LZO buffers stay allocated; the next compressed entry's
        // header replaces them.
        self.on_entry += 1;
        self.state = State::ReadEntry;
        Status::Ok
    }

    fn current_entry(&self) -> Result<Entry> {
        self.entry
            .ok_or(PackError::InvalidArgument("no current entry"))
    }
}

fn sha_update(sha: &mut Option<Sha256>, data: &[u8]) {
    if let Some(sha) = sha {
        sha.update(data);
    }
}

/// Walk an archive file once, driving `handler`; returns the handler for
/// inspection on clean EOF.
pub fn process_from_file<H: ProcessHandler>(path: &Path, handler: H) -> Result<H> {
    let mut proc = Processor::from_file(path, Mirror::None, handler)?;
    match proc.process() {
        Status::Eof => Ok(proc.into_handler()),
        Status::HashMismatch => Err(PackError::HashMismatch),
        Status::UserBail => Err(PackError::UserBail),
        Status::Again | Status::Ok => Err(PackError::Truncated),
        Status::Fail => Err(proc
            .take_last_error()
            .unwrap_or(PackError::InvalidArgument("processing failed"))),
    }
}
