//! Archive header — format anchor at offset 0.
//!
//! # On-disk layout (112 bytes, all fields little-endian, packed)
//!
//! ```text
//! Offset  Size  Field
//!    0      2   magic        = 0x12FC  (LE u16)
//!    2      1   version      = 1
//!    3      1   reserved     written 0, never rejected
//!    4      4   meta_size    meta section bytes        (LE u32)
//!    8      4   index_size   index section bytes       (LE u32)
//!   12     32   pack_hash    SHA-256 of meta + index + regular-entry bytes
//!   44     32   index_hash   SHA-256 of the index section
//!   76      4   header_crc   CRC32 of bytes [0..76)    (LE u32)
//!   80     32   secure_hmac  host-policy HMAC; opaque to this crate
//! ```
//!
//! # Checks
//! [`Header::read`] validates the magic, that `index_size` is a positive
//! multiple of the entry record size, and the CRC32 — in that order.  The
//! version byte is checked separately at session open so the caller can
//! tell a foreign file from a newer archive.  The HMAC is carried, never
//! verified: HMAC policy belongs to the host.

use byteorder::{LittleEndian, ReadBytesExt};
use crc32fast::Hasher;
use std::io::{Cursor, Read, Write};

use crate::error::{PackError, Result};
use crate::record::ENTRY_SIZE;

pub const MAGIC: u16 = 0x12FC;
pub const FORMAT_VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 112;
pub const HASH_SIZE: usize = 32;

/// Byte count covered by `header_crc`: everything before the CRC and HMAC.
pub const HEADER_CRC_SPAN: usize = HEADER_SIZE - 4 - HASH_SIZE;

#[derive(Debug, Clone)]
pub struct Header {
    pub version: u8,
    pub reserved: u8,
    pub meta_size: u32,
    pub index_size: u32,
    /// Stored body hash: SHA-256 over the meta, index, and regular-entry
    /// regions as they appear on disk.
    pub pack_hash: [u8; HASH_SIZE],
    pub index_hash: [u8; HASH_SIZE],
    pub secure_hmac: [u8; HASH_SIZE],
    // header_crc is computed on write and verified on read — not stored as
    // a field, so a caller can never carry a stale value.
}

impl Header {
    pub fn new(meta_size: u32, index_size: u32) -> Self {
        Self {
            version: FORMAT_VERSION,
            reserved: 0,
            meta_size,
            index_size,
            pack_hash: [0u8; HASH_SIZE],
            index_hash: [0u8; HASH_SIZE],
            secure_hmac: [0u8; HASH_SIZE],
        }
    }

    /// Offset of the first index record: the meta section ends here.
    #[inline]
    pub fn index_start(&self) -> u32 {
        HEADER_SIZE as u32 + self.meta_size
    }

    /// Offset one past the last index record: the body starts here.
    #[inline]
    pub fn body_start(&self) -> u32 {
        self.index_start() + self.index_size
    }

    /// Number of entry records declared by the index.
    #[inline]
    pub fn entry_count(&self) -> u32 {
        self.index_size / ENTRY_SIZE as u32
    }

    /// Serialize to exactly [`HEADER_SIZE`] bytes with a freshly computed CRC.
    pub fn write<W: Write>(&self, mut w: W) -> Result<()> {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&MAGIC.to_le_bytes());
        buf[2] = self.version;
        buf[3] = self.reserved;
        buf[4..8].copy_from_slice(&self.meta_size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.index_size.to_le_bytes());
        buf[12..44].copy_from_slice(&self.pack_hash);
        buf[44..76].copy_from_slice(&self.index_hash);

        let mut h = Hasher::new();
        h.update(&buf[..HEADER_CRC_SPAN]);
        buf[76..80].copy_from_slice(&h.finalize().to_le_bytes());
        buf[80..112].copy_from_slice(&self.secure_hmac);

        w.write_all(&buf)?;
        Ok(())
    }

    /// Read and validate a header from `r`.
    pub fn read<R: Read>(mut r: R) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        r.read_exact(&mut buf)?;
        Self::parse(&buf)
    }

    /// Parse and validate a header from an in-memory buffer.
    pub fn parse(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let mut c = Cursor::new(&buf[..]);
        let magic = c.read_u16::<LittleEndian>()?;
        if magic != MAGIC {
            return Err(PackError::BadMagic { found: magic });
        }

        let version = c.read_u8()?;
        let reserved = c.read_u8()?;
        let meta_size = c.read_u32::<LittleEndian>()?;
        let index_size = c.read_u32::<LittleEndian>()?;

        // Sanity check the index extent before trusting any offsets.
        if index_size == 0 || index_size % ENTRY_SIZE as u32 != 0 {
            return Err(PackError::InvalidArgument(
                "index size is not a positive multiple of the entry record size",
            ));
        }

        let mut pack_hash = [0u8; HASH_SIZE];
        c.read_exact(&mut pack_hash)?;
        let mut index_hash = [0u8; HASH_SIZE];
        c.read_exact(&mut index_hash)?;
        let stored_crc = c.read_u32::<LittleEndian>()?;
        let mut secure_hmac = [0u8; HASH_SIZE];
        c.read_exact(&mut secure_hmac)?;

        let mut h = Hasher::new();
        h.update(&buf[..HEADER_CRC_SPAN]);
        let computed = h.finalize();
        if computed != stored_crc {
            return Err(PackError::BadCrc {
                stored: stored_crc,
                computed,
            });
        }

        Ok(Self {
            version,
            reserved,
            meta_size,
            index_size,
            pack_hash,
            index_hash,
            secure_hmac,
        })
    }

    /// Version gate applied at session open, after the structural checks.
    pub fn check_version(&self) -> Result<()> {
        if self.version != FORMAT_VERSION {
            return Err(PackError::VersionMismatch {
                found: self.version,
            });
        }
        Ok(())
    }
}
