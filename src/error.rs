//! Crate-wide error taxonomy.
//!
//! Every layer reports through [`PackError`]; context-local failures latch
//! the handle (see `context.rs`) and surface as [`PackError::BadHandle`]
//! on the next operation.

use std::io;
use thiserror::Error;

use crate::header::FORMAT_VERSION;

pub type Result<T> = std::result::Result<T, PackError>;

#[derive(Error, Debug)]
pub enum PackError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Handle table full or an allocation failed.
    #[error("no free handle slot")]
    NoResource,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("bad magic number {found:#06x} — not a pack archive")]
    BadMagic { found: u16 },
    #[error("header CRC32 mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    BadCrc { stored: u32, computed: u32 },
    #[error("unsupported archive version {found} (this build reads v{FORMAT_VERSION})")]
    VersionMismatch { found: u8 },
    /// Interior path absent from the index, or the entry lies past the end
    /// of a stripped archive.
    #[error("entry not found")]
    NotFound,
    /// Operation on a context whose sticky error latch is set.
    #[error("operation on an errored handle")]
    BadHandle,
    #[error("operation not supported")]
    Unsupported,
    /// The stream ended outside a safe inter-entry boundary.
    #[error("archive truncated mid-record")]
    Truncated,
    #[error("hash mismatch")]
    HashMismatch,
    /// A user callback returned false for a non-hash reason.
    #[error("aborted by callback")]
    UserBail,
    /// Seek target outside entry bounds.
    #[error("seek target outside entry bounds")]
    Overflow,
}

impl PackError {
    /// Short-read helper: the backing source delivered fewer bytes than a
    /// fixed-width record requires.
    pub(crate) fn short_read() -> Self {
        PackError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "unexpected short read",
        ))
    }

    /// LZO decoder failures carry no dedicated kind; they surface as
    /// invalid-data I/O errors.
    pub(crate) fn lzo(msg: String) -> Self {
        PackError::Io(io::Error::new(io::ErrorKind::InvalidData, msg))
    }
}
