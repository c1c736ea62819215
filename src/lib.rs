//! # packfs — read-only packed-archive filesystem
//!
//! Format guarantees (frozen at version 1):
//! - All numeric fields are little-endian, structs packed; never negotiated
//! - The header carries a mandatory CRC32; corrupt headers abort opens
//! - Readers refuse any `version` byte other than their compiled-in value;
//!   reserved fields are written zero and never rejected
//! - The index is fixed-width records; entry payloads sit back-to-back in
//!   index order, every regular entry before every image entry
//! - The stored body hash covers the meta, index, and regular-entry bytes
//!   exactly as stored; each image entry carries a SHA-256 of its logical
//!   bytes as a 32-byte payload prefix
//! - Archives are immutable once written: every write path fails with
//!   `Unsupported`
//!
//! Composite paths address entries as `container#interior/path`.  The
//! streaming processor (`process`) walks an archive once — from a file or
//! a caller-fed stream — verifying hashes on the fly, and drives the
//! firmware-update flow in `imagefs`.

pub mod error;
pub mod header;
pub mod record;
pub mod lzo;
pub mod context;
pub mod archive;
pub mod dir;
pub mod vfs;
pub mod builder;
pub mod process;
pub mod imagefs;

// Flat re-exports for the most common types.
pub use archive::{ArchiveFile, FileStat};
pub use builder::ArchiveBuilder;
pub use context::Whence;
pub use dir::{ArchiveDir, DirEntry};
pub use error::{PackError, Result};
pub use header::{Header, FORMAT_VERSION, HASH_SIZE, HEADER_SIZE, MAGIC};
pub use imagefs::dfu::{file_dfu, Ota, StreamDfu, DFU_STREAM_BUFSIZE};
pub use imagefs::{verify_archive, AppDesc, DefaultNaming, ImageFs, ImageFsConfig, ImageNaming};
pub use lzo::{LzoHeader, MAX_LZO_BLOCK};
pub use process::{
    process_from_file, Mirror, ProcessHandler, Processor, Section, Status, MIN_STREAM_SIZE,
};
pub use record::{Entry, MetaRecord, MetaType, ENTRY_SIZE, PF_LZO, PT_IMG, PT_REG};
pub use vfs::{parse_path, IoctlCmd, IoctlReply, OpenFlags, PackFs, PackFsConfig, PATH_SEPARATOR};
