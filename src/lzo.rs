//! LZO block layer.
//!
//! A compressed payload is an [`LzoHeader`] followed by a block sequence,
//! each a LE u16 `compressed_length` then that many bytes.  A block whose
//! `compressed_length` equals its expected uncompressed length is stored
//! verbatim (the incompressible bypass); anything else is LZO1X data.
//!
//! [`LzoState`] is pure block state — no I/O.  The random-access read and
//! seek loops that drive it against a backing file live in `context.rs`;
//! the streaming processor drives it from its own read plan.

use std::io::Read;

use crate::error::{PackError, Result};

pub const MAX_LZO_BLOCK: u16 = 2048;
pub const LZO_HEADER_SIZE: usize = 6;
pub const LZO_BLOCK_LEN_SIZE: usize = 2;

// ── Header ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct LzoHeader {
    pub uncompressed_length: u32,
    pub blocksize: u16,
}

impl LzoHeader {
    pub fn parse(buf: &[u8; LZO_HEADER_SIZE]) -> Result<Self> {
        let header = Self {
            uncompressed_length: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            blocksize: u16::from_le_bytes(buf[4..6].try_into().unwrap()),
        };
        header.check()?;
        Ok(header)
    }

    pub fn read<R: Read>(mut r: R) -> Result<Self> {
        let mut buf = [0u8; LZO_HEADER_SIZE];
        r.read_exact(&mut buf)?;
        Self::parse(&buf)
    }

    pub fn encode(&self) -> [u8; LZO_HEADER_SIZE] {
        let mut buf = [0u8; LZO_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.uncompressed_length.to_le_bytes());
        buf[4..6].copy_from_slice(&self.blocksize.to_le_bytes());
        buf
    }

    pub fn check(&self) -> Result<()> {
        if self.blocksize == 0 || self.blocksize > MAX_LZO_BLOCK {
            return Err(PackError::InvalidArgument("LZO blocksize out of range"));
        }
        Ok(())
    }
}

// ── Block state ──────────────────────────────────────────────────────────────

/// Decoder state for one open compressed entry.  The compressed and
/// uncompressed buffers are paired allocations sized to `blocksize`.
pub struct LzoState {
    pub header: LzoHeader,
    numblocks: u32,
    compressed: Vec<u8>,
    uncompressed: Vec<u8>,
    compressed_len: u16,
    /// Streaming fill progress into the compressed buffer.
    filled: u16,
    unc_off: u16,
    unc_len: u16,
}

impl LzoState {
    pub fn new(header: LzoHeader) -> Result<Self> {
        header.check()?;
        Ok(Self {
            header,
            numblocks: 0,
            compressed: vec![0u8; header.blocksize as usize],
            uncompressed: vec![0u8; header.blocksize as usize],
            compressed_len: 0,
            filled: 0,
            unc_off: 0,
            unc_len: 0,
        })
    }

    /// Reset to the start of the entry (backing rewind is the caller's job).
    pub fn prep(&mut self) {
        self.numblocks = 0;
        self.compressed_len = 0;
        self.filled = 0;
        self.unc_off = 0;
        self.unc_len = 0;
    }

    /// The only externally observable position within a compressed entry.
    #[inline]
    pub fn position(&self) -> u32 {
        if self.numblocks == 0 {
            0
        } else {
            (self.numblocks - 1) * self.header.blocksize as u32 + self.unc_off as u32
        }
    }

    #[inline]
    pub fn at_entry_eof(&self) -> bool {
        self.position() == self.header.uncompressed_length
    }

    #[inline]
    pub fn block_exhausted(&self) -> bool {
        self.unc_off == self.unc_len
    }

    #[inline]
    pub fn block_remaining(&self) -> u16 {
        self.unc_len - self.unc_off
    }

    /// Uncompressed length the next block must decode to.
    #[inline]
    pub fn expected_block_len(&self) -> u16 {
        let consumed = self.numblocks * self.header.blocksize as u32;
        (self.header.uncompressed_length - consumed).min(self.header.blocksize as u32) as u16
    }

    /// Record the next block's compressed length, validating it against the
    /// declared blocksize.
    pub fn begin_block(&mut self, compressed_len: u16) -> Result<()> {
        if compressed_len > self.header.blocksize {
            return Err(PackError::InvalidArgument(
                "LZO block longer than declared blocksize",
            ));
        }
        self.compressed_len = compressed_len;
        self.filled = 0;
        Ok(())
    }

    #[inline]
    pub fn compressed_len(&self) -> u16 {
        self.compressed_len
    }

    /// Whole compressed buffer for the current block (single-shot fill).
    pub fn compressed_buf(&mut self) -> &mut [u8] {
        let len = self.compressed_len as usize;
        &mut self.compressed[..len]
    }

    /// Unfilled tail of the compressed buffer (streaming fill).
    pub fn fill_buf(&mut self) -> &mut [u8] {
        &mut self.compressed[self.filled as usize..self.compressed_len as usize]
    }

    pub fn advance_fill(&mut self, n: usize) {
        self.filled += n as u16;
    }

    #[inline]
    pub fn fill_complete(&self) -> bool {
        self.filled == self.compressed_len
    }

    #[inline]
    pub fn filled(&self) -> u16 {
        self.filled
    }

    /// Raw stored bytes of the current block (for mirroring and hashing
    /// the on-disk form).
    pub fn compressed_slice(&self, start: usize, len: usize) -> &[u8] {
        &self.compressed[start..start + len]
    }

    /// Decompress the current block into the uncompressed buffer.
    ///
    /// A block stored with `compressed_len == expected_block_len` is copied
    /// verbatim; otherwise LZO1X-safe decompression runs and the output
    /// length must equal the expected block length.
    pub fn decompress_block(&mut self) -> Result<()> {
        let expect = self.expected_block_len();
        self.numblocks += 1;
        self.unc_off = 0;
        self.unc_len = expect;

        let comp = &self.compressed[..self.compressed_len as usize];
        if self.compressed_len == expect {
            self.uncompressed[..expect as usize].copy_from_slice(comp);
            return Ok(());
        }

        let mut lzo = minilzo_rs::LZO::init().map_err(|e| PackError::lzo(e.to_string()))?;
        let out = lzo
            .decompress_safe(comp, expect as usize)
            .map_err(|e| PackError::lzo(e.to_string()))?;
        if out.len() != expect as usize {
            return Err(PackError::lzo(format!(
                "LZO block decoded to {} bytes, expected {}",
                out.len(),
                expect
            )));
        }
        self.uncompressed[..expect as usize].copy_from_slice(&out);
        Ok(())
    }

    /// Account for a block skipped by length field alone: the block counts
    /// as decoded and fully consumed without touching the buffers.
    pub fn note_block_skipped(&mut self) {
        let expect = self.expected_block_len();
        self.numblocks += 1;
        self.unc_off = expect;
        self.unc_len = expect;
    }

    /// Decoded bytes of the current block, from the read position.
    pub fn block_bytes(&self) -> &[u8] {
        &self.uncompressed[self.unc_off as usize..self.unc_len as usize]
    }

    /// Whole decoded current block (streaming callback payload).
    pub fn decoded_block(&self) -> &[u8] {
        &self.uncompressed[..self.unc_len as usize]
    }

    /// Consume up to `want` bytes from the current block, optionally copying
    /// them out.  Returns the byte count consumed.
    pub fn take_from_block(&mut self, out: Option<&mut [u8]>, want: usize) -> usize {
        let bytes = want.min(self.block_remaining() as usize);
        if let Some(out) = out {
            let start = self.unc_off as usize;
            out[..bytes].copy_from_slice(&self.uncompressed[start..start + bytes]);
        }
        self.unc_off += bytes as u16;
        bytes
    }

    /// Rewind the read position to the start of the already-decoded block.
    pub fn rewind_block(&mut self) {
        self.unc_off = 0;
    }

    /// Advance the read position within the already-decoded block.
    pub fn skip_in_block(&mut self, n: u16) {
        self.unc_off += n;
    }

    #[inline]
    pub fn unc_off(&self) -> u16 {
        self.unc_off
    }

    #[inline]
    pub fn unc_len(&self) -> u16 {
        self.unc_len
    }

    #[inline]
    pub fn numblocks(&self) -> u32 {
        self.numblocks
    }
}

/// Compress one block with LZO1X (builder-side).
pub fn compress_block(data: &[u8]) -> Result<Vec<u8>> {
    let mut lzo = minilzo_rs::LZO::init().map_err(|e| PackError::lzo(e.to_string()))?;
    lzo.compress(data).map_err(|e| PackError::lzo(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_rejects_oversized_blocksize() {
        let h = LzoHeader {
            uncompressed_length: 100,
            blocksize: MAX_LZO_BLOCK + 1,
        };
        assert!(h.check().is_err());
    }

    #[test]
    fn compress_then_decompress_block() {
        let data: Vec<u8> = b"ABCD".iter().copied().cycle().take(512).collect();
        let comp = compress_block(&data).unwrap();
        assert!(comp.len() < data.len());

        let mut st = LzoState::new(LzoHeader {
            uncompressed_length: 512,
            blocksize: 512,
        })
        .unwrap();
        st.begin_block(comp.len() as u16).unwrap();
        st.compressed_buf().copy_from_slice(&comp);
        st.decompress_block().unwrap();
        assert_eq!(st.decoded_block(), &data[..]);
        assert_eq!(st.position(), 0);

        let mut out = vec![0u8; 512];
        let n = st.take_from_block(Some(&mut out), 512);
        assert_eq!(n, 512);
        assert_eq!(out, data);
        assert!(st.at_entry_eof());
    }

    #[test]
    fn incompressible_block_bypass() {
        // compressed_len equal to the expected length means "stored verbatim".
        let data = [0xA5u8; 64];
        let mut st = LzoState::new(LzoHeader {
            uncompressed_length: 64,
            blocksize: 64,
        })
        .unwrap();
        st.begin_block(64).unwrap();
        st.compressed_buf().copy_from_slice(&data);
        st.decompress_block().unwrap();
        assert_eq!(st.decoded_block(), &data[..]);
    }

    #[test]
    fn short_final_block_expectation() {
        let st = LzoState::new(LzoHeader {
            uncompressed_length: 700,
            blocksize: 512,
        })
        .unwrap();
        assert_eq!(st.expected_block_len(), 512);
        let mut st = st;
        st.begin_block(512).unwrap();
        let raw = [1u8; 512];
        st.compressed_buf().copy_from_slice(&raw);
        st.decompress_block().unwrap();
        st.skip_in_block(512);
        assert_eq!(st.expected_block_len(), 188);
    }

    #[test]
    fn oversized_block_length_rejected() {
        let mut st = LzoState::new(LzoHeader {
            uncompressed_length: 100,
            blocksize: 64,
        })
        .unwrap();
        assert!(st.begin_block(65).is_err());
    }
}
