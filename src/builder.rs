//! [`ArchiveBuilder`] — create pack archives.
//!
//! Records accumulate in memory; [`ArchiveBuilder::build`] lays out
//! header / meta / index / body, compresses LZO entries block by block,
//! and computes every stored digest (per-entry, body, index) plus the
//! header CRC.  The mounted filesystem never writes — this is the tool
//! the CLI `pack` command and the test suite create fixtures with.
//!
//! Layout rule: all regular entries precede all image entries, so readers
//! can derive the regular-body boundary from the index alone.

use sha2::{Digest, Sha256};

use crate::error::{PackError, Result};
use crate::header::{Header, HASH_SIZE, HEADER_SIZE};
use crate::lzo::{compress_block, LzoHeader, MAX_LZO_BLOCK};
use crate::record::{
    fixed_str, Entry, MetaRecord, MetaType, ENTRY_PATH_SIZE, ENTRY_SIZE, META_KEY_SIZE,
    PF_LZO, PT_IMG, PT_REG,
};

struct PendingMeta {
    record: MetaRecord,
    desc: Vec<u8>,
    value: Vec<u8>,
}

struct PendingEntry {
    path: [u8; ENTRY_PATH_SIZE],
    flags: u8,
    data: Vec<u8>,
    blocksize: u16,
}

#[derive(Default)]
pub struct ArchiveBuilder {
    metas: Vec<PendingMeta>,
    entries: Vec<PendingEntry>,
    pack_hash_override: Option<[u8; HASH_SIZE]>,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_meta(
        &mut self,
        key: &str,
        mtype: MetaType,
        desc: &[u8],
        value: &[u8],
    ) -> Result<()> {
        if desc.len() > u16::MAX as usize {
            return Err(PackError::InvalidArgument("meta description too long"));
        }
        let record = MetaRecord {
            flags: 0,
            mtype,
            desc_size: desc.len() as u16,
            value_size: value.len() as u32,
            key: fixed_str::<META_KEY_SIZE>(key)?,
        };
        self.metas.push(PendingMeta {
            record,
            desc: desc.to_vec(),
            value: value.to_vec(),
        });
        Ok(())
    }

    pub fn add_regular(&mut self, path: &str, data: &[u8]) -> Result<()> {
        self.push_entry(path, PT_REG, data, 0)
    }

    pub fn add_regular_lzo(&mut self, path: &str, data: &[u8], blocksize: u16) -> Result<()> {
        self.push_entry(path, PT_REG | PF_LZO, data, blocksize)
    }

    /// `data` is the logical image; the stored payload gains a 32-byte
    /// SHA-256 prefix over it.
    pub fn add_image(&mut self, path: &str, data: &[u8]) -> Result<()> {
        self.push_entry(path, PT_IMG, data, 0)
    }

    pub fn add_image_lzo(&mut self, path: &str, data: &[u8], blocksize: u16) -> Result<()> {
        self.push_entry(path, PT_IMG | PF_LZO, data, blocksize)
    }

    /// Replace the computed body hash in the finished header.  The header
    /// CRC still covers the substituted value, so readers see a structurally
    /// valid archive whose body hash simply does not match — the corruption
    /// shape the streaming verifier exists to catch.
    pub fn override_pack_hash(&mut self, hash: [u8; HASH_SIZE]) {
        self.pack_hash_override = Some(hash);
    }

    fn push_entry(&mut self, path: &str, flags: u8, data: &[u8], blocksize: u16) -> Result<()> {
        if flags & PF_LZO != 0 && (blocksize == 0 || blocksize > MAX_LZO_BLOCK) {
            return Err(PackError::InvalidArgument("LZO blocksize out of range"));
        }
        if flags & PT_IMG == 0 && self.entries.iter().any(|e| e.flags & PT_IMG != 0) {
            return Err(PackError::InvalidArgument(
                "regular entries must precede image entries",
            ));
        }
        self.entries.push(PendingEntry {
            path: fixed_str::<ENTRY_PATH_SIZE>(path)?,
            flags,
            data: data.to_vec(),
            blocksize,
        });
        Ok(())
    }

    /// Serialize the archive.
    pub fn build(&self) -> Result<Vec<u8>> {
        if self.entries.is_empty() {
            // Readers require a nonempty index.
            return Err(PackError::InvalidArgument("archive needs at least one entry"));
        }

        // Meta section.
        let mut meta_bytes = Vec::new();
        for m in &self.metas {
            meta_bytes.extend_from_slice(&m.record.encode());
            meta_bytes.extend_from_slice(&m.desc);
            meta_bytes.extend_from_slice(&m.value);
        }

        // Body payloads, in index order.
        let mut payloads = Vec::with_capacity(self.entries.len());
        for e in &self.entries {
            payloads.push(encode_payload(e)?);
        }

        // Index records with final offsets.
        let body_start =
            HEADER_SIZE + meta_bytes.len() + self.entries.len() * ENTRY_SIZE;
        let mut index_bytes = Vec::with_capacity(self.entries.len() * ENTRY_SIZE);
        let mut offset = body_start as u32;
        for (e, payload) in self.entries.iter().zip(&payloads) {
            let entry = Entry {
                flags: e.flags,
                offset,
                length: payload.len() as u32,
                entry_hash: Sha256::digest(payload).into(),
                path: e.path,
            };
            index_bytes.extend_from_slice(&entry.encode());
            offset += payload.len() as u32;
        }

        // Body hash: meta + index + regular-entry payloads.
        let mut body_sha = Sha256::new();
        body_sha.update(&meta_bytes);
        body_sha.update(&index_bytes);
        for (e, payload) in self.entries.iter().zip(&payloads) {
            if e.flags & PT_IMG == 0 {
                body_sha.update(payload);
            }
        }

        let mut header = Header::new(meta_bytes.len() as u32, index_bytes.len() as u32);
        header.pack_hash = self
            .pack_hash_override
            .unwrap_or_else(|| body_sha.finalize().into());
        header.index_hash = Sha256::digest(&index_bytes).into();

        let mut out = Vec::with_capacity(body_start + payloads.iter().map(Vec::len).sum::<usize>());
        header.write(&mut out)?;
        out.extend_from_slice(&meta_bytes);
        out.extend_from_slice(&index_bytes);
        for payload in &payloads {
            out.extend_from_slice(payload);
        }
        Ok(out)
    }
}

fn encode_payload(e: &PendingEntry) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    if e.flags & PT_IMG != 0 {
        let img_hash: [u8; HASH_SIZE] = Sha256::digest(&e.data).into();
        payload.extend_from_slice(&img_hash);
    }
    if e.flags & PF_LZO != 0 {
        payload.extend_from_slice(&encode_lzo_stream(&e.data, e.blocksize)?);
    } else {
        payload.extend_from_slice(&e.data);
    }
    Ok(payload)
}

/// LzoHeader + per-block `u16 length` frames.  A block that does not shrink
/// is stored verbatim, marked by `compressed_length == block length`.
fn encode_lzo_stream(data: &[u8], blocksize: u16) -> Result<Vec<u8>> {
    let header = LzoHeader {
        uncompressed_length: data.len() as u32,
        blocksize,
    };
    header.check()?;

    let mut out = Vec::new();
    out.extend_from_slice(&header.encode());
    for chunk in data.chunks(blocksize as usize) {
        let compressed = compress_block(chunk)?;
        let stored: &[u8] = if compressed.len() < chunk.len() {
            &compressed
        } else {
            chunk
        };
        out.extend_from_slice(&(stored.len() as u16).to_le_bytes());
        out.extend_from_slice(stored);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_offsets_are_consistent() {
        let mut b = ArchiveBuilder::new();
        b.add_meta("k", MetaType::Bool, b"", &[1]).unwrap();
        b.add_regular("one", b"11111").unwrap();
        b.add_image("fw", b"image-bytes").unwrap();
        let bytes = b.build().unwrap();

        let header = Header::read(&bytes[..]).unwrap();
        assert_eq!(header.meta_size as usize, 73 + 1);
        assert_eq!(header.entry_count(), 2);

        let idx = header.index_start() as usize;
        let first = Entry::read(&bytes[idx..idx + ENTRY_SIZE]).unwrap();
        assert_eq!(first.path(), "one");
        assert_eq!(
            &bytes[first.offset as usize..first.end() as usize],
            b"11111"
        );

        let second = Entry::read(&bytes[idx + ENTRY_SIZE..idx + 2 * ENTRY_SIZE]).unwrap();
        assert!(second.is_img());
        // 32-byte image hash prefix + payload.
        assert_eq!(second.length as usize, 32 + b"image-bytes".len());
        let stored_hash = &bytes[second.offset as usize..second.offset as usize + 32];
        let expect: [u8; 32] = Sha256::digest(b"image-bytes").into();
        assert_eq!(stored_hash, expect);
    }

    #[test]
    fn rejects_regular_after_image() {
        let mut b = ArchiveBuilder::new();
        b.add_image("fw", b"x").unwrap();
        assert!(b.add_regular("late", b"y").is_err());
    }

    #[test]
    fn entry_hash_covers_stored_payload() {
        let mut b = ArchiveBuilder::new();
        b.add_regular_lzo("z", &[0u8; 4096], 512).unwrap();
        let bytes = b.build().unwrap();
        let header = Header::read(&bytes[..]).unwrap();
        let idx = header.index_start() as usize;
        let e = Entry::read(&bytes[idx..idx + ENTRY_SIZE]).unwrap();
        let payload = &bytes[e.offset as usize..e.end() as usize];
        let computed: [u8; 32] = Sha256::digest(payload).into();
        assert_eq!(computed, e.entry_hash);
        // Highly compressible input must actually shrink.
        assert!((e.length as usize) < 4096);
    }
}
