//! Meta and index record codecs.
//!
//! # Meta record (73-byte prefix + variable sides, little-endian, packed)
//!
//! ```text
//! Offset  Size  Field
//!    0      2   flags
//!    2      1   mtype       see MetaType; unknown values map to Unknown
//!    3      2   desc_size   description bytes following the key
//!    5      4   value_size  value bytes following the description
//!    9     64   key         NUL-padded
//! ```
//!
//! # Entry record (169 bytes)
//!
//! ```text
//! Offset  Size  Field
//!    0      1   flags       REG=0x01  IMG=0x02  LZO=0x10
//!    1      4   offset      absolute archive offset of the payload
//!    5      4   length      payload length in archive bytes
//!    9     32   entry_hash  SHA-256 of the on-disk payload
//!   41    128   path        NUL-terminated
//! ```
//!
//! Keys and paths are matched byte-for-byte up to the first NUL.  Readers
//! never reject unknown meta types or reserved flag bits.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

use crate::error::{PackError, Result};
use crate::header::HASH_SIZE;

pub const META_PREFIX_SIZE: usize = 73;
pub const META_KEY_SIZE: usize = 64;
pub const ENTRY_SIZE: usize = 169;
pub const ENTRY_PATH_SIZE: usize = 128;

// Entry flag bits.
pub const PT_REG: u8 = 0x01;
pub const PT_IMG: u8 = 0x02;
pub const PF_LZO: u8 = 0x10;

// ── Meta type ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MetaType {
    Unknown = 0,
    Bool = 1,
    U8 = 2,
    I8 = 3,
    U16 = 4,
    I16 = 5,
    U32 = 6,
    I32 = 7,
    U64 = 8,
    I64 = 9,
    Double = 10,
    String = 11,
    Blob = 12,
    File = 13,
}

impl MetaType {
    /// Unknown discriminants decode to `Unknown` — never an error.
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => MetaType::Bool,
            2 => MetaType::U8,
            3 => MetaType::I8,
            4 => MetaType::U16,
            5 => MetaType::I16,
            6 => MetaType::U32,
            7 => MetaType::I32,
            8 => MetaType::U64,
            9 => MetaType::I64,
            10 => MetaType::Double,
            11 => MetaType::String,
            12 => MetaType::Blob,
            13 => MetaType::File,
            _ => MetaType::Unknown,
        }
    }
}

// ── Meta record ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct MetaRecord {
    pub flags: u16,
    pub mtype: MetaType,
    pub desc_size: u16,
    pub value_size: u32,
    pub key: [u8; META_KEY_SIZE],
}

impl MetaRecord {
    /// Key up to the first NUL; lossy for non-UTF-8 archives is not a
    /// concern the format allows, so invalid bytes fail the match instead.
    pub fn key(&self) -> &str {
        str_until_nul(&self.key)
    }

    /// Prefix plus both sides: the record's total extent in the meta section.
    #[inline]
    pub fn total_size(&self) -> u32 {
        META_PREFIX_SIZE as u32 + self.desc_size as u32 + self.value_size
    }

    #[inline]
    pub fn sides_size(&self) -> u32 {
        self.desc_size as u32 + self.value_size
    }

    pub fn parse(buf: &[u8; META_PREFIX_SIZE]) -> Result<Self> {
        let mut c = Cursor::new(&buf[..]);
        let flags = c.read_u16::<LittleEndian>()?;
        let mtype = MetaType::from_u8(c.read_u8()?);
        let desc_size = c.read_u16::<LittleEndian>()?;
        let value_size = c.read_u32::<LittleEndian>()?;
        if value_size
            .checked_add(META_PREFIX_SIZE as u32 + desc_size as u32)
            .is_none()
        {
            return Err(PackError::InvalidArgument("meta record extent overflows"));
        }
        let mut key = [0u8; META_KEY_SIZE];
        c.read_exact(&mut key)?;
        Ok(Self {
            flags,
            mtype,
            desc_size,
            value_size,
            key,
        })
    }

    pub fn read<R: Read>(mut r: R) -> Result<Self> {
        let mut buf = [0u8; META_PREFIX_SIZE];
        r.read_exact(&mut buf)?;
        Self::parse(&buf)
    }

    pub fn encode(&self) -> [u8; META_PREFIX_SIZE] {
        let mut buf = [0u8; META_PREFIX_SIZE];
        buf[0..2].copy_from_slice(&self.flags.to_le_bytes());
        buf[2] = self.mtype as u8;
        buf[3..5].copy_from_slice(&self.desc_size.to_le_bytes());
        buf[5..9].copy_from_slice(&self.value_size.to_le_bytes());
        buf[9..9 + META_KEY_SIZE].copy_from_slice(&self.key);
        buf
    }
}

// ── Entry record ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct Entry {
    pub flags: u8,
    pub offset: u32,
    pub length: u32,
    pub entry_hash: [u8; HASH_SIZE],
    pub path: [u8; ENTRY_PATH_SIZE],
}

impl Entry {
    #[inline]
    pub fn is_reg(&self) -> bool {
        self.flags & PT_REG != 0
    }
    #[inline]
    pub fn is_img(&self) -> bool {
        self.flags & PT_IMG != 0
    }
    #[inline]
    pub fn is_lzo(&self) -> bool {
        self.flags & PF_LZO != 0
    }

    pub fn path(&self) -> &str {
        str_until_nul(&self.path)
    }

    /// Offset one past the entry's payload.
    #[inline]
    pub fn end(&self) -> u32 {
        self.offset + self.length
    }

    pub fn parse(buf: &[u8; ENTRY_SIZE]) -> Result<Self> {
        let mut c = Cursor::new(&buf[..]);
        let flags = c.read_u8()?;
        let offset = c.read_u32::<LittleEndian>()?;
        let length = c.read_u32::<LittleEndian>()?;
        if offset.checked_add(length).is_none() {
            return Err(PackError::InvalidArgument("entry extent overflows"));
        }
        let mut entry_hash = [0u8; HASH_SIZE];
        c.read_exact(&mut entry_hash)?;
        let mut path = [0u8; ENTRY_PATH_SIZE];
        c.read_exact(&mut path)?;
        Ok(Self {
            flags,
            offset,
            length,
            entry_hash,
            path,
        })
    }

    pub fn read<R: Read>(mut r: R) -> Result<Self> {
        let mut buf = [0u8; ENTRY_SIZE];
        r.read_exact(&mut buf)?;
        Self::parse(&buf)
    }

    pub fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut buf = [0u8; ENTRY_SIZE];
        buf[0] = self.flags;
        buf[1..5].copy_from_slice(&self.offset.to_le_bytes());
        buf[5..9].copy_from_slice(&self.length.to_le_bytes());
        buf[9..41].copy_from_slice(&self.entry_hash);
        buf[41..41 + ENTRY_PATH_SIZE].copy_from_slice(&self.path);
        buf
    }
}

/// Copy `s` into a NUL-padded fixed buffer; fails closed on overflow.
pub fn fixed_str<const N: usize>(s: &str) -> Result<[u8; N]> {
    let bytes = s.as_bytes();
    if bytes.len() >= N {
        return Err(PackError::InvalidArgument("string too long for record field"));
    }
    let mut buf = [0u8; N];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(buf)
}

fn str_until_nul(buf: &[u8]) -> &str {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_roundtrip() {
        let m = MetaRecord {
            flags: 0x0003,
            mtype: MetaType::String,
            desc_size: 5,
            value_size: 9,
            key: fixed_str::<META_KEY_SIZE>("firmware.note").unwrap(),
        };
        let parsed = MetaRecord::parse(&m.encode()).unwrap();
        assert_eq!(parsed.flags, 0x0003);
        assert_eq!(parsed.mtype, MetaType::String);
        assert_eq!(parsed.key(), "firmware.note");
        assert_eq!(parsed.total_size(), 73 + 5 + 9);
    }

    #[test]
    fn entry_roundtrip() {
        let e = Entry {
            flags: PT_REG | PF_LZO,
            offset: 4096,
            length: 512,
            entry_hash: [7u8; 32],
            path: fixed_str::<ENTRY_PATH_SIZE>("boot/app.bin").unwrap(),
        };
        let parsed = Entry::parse(&e.encode()).unwrap();
        assert!(parsed.is_reg() && parsed.is_lzo() && !parsed.is_img());
        assert_eq!(parsed.path(), "boot/app.bin");
        assert_eq!(parsed.end(), 4608);
    }

    #[test]
    fn unknown_meta_type_is_tolerated() {
        assert_eq!(MetaType::from_u8(250), MetaType::Unknown);
    }

    #[test]
    fn over_length_path_fails_closed() {
        let long = "x".repeat(ENTRY_PATH_SIZE);
        assert!(fixed_str::<ENTRY_PATH_SIZE>(&long).is_err());
    }
}
