//! Circular buffer between a byte-pushing caller and the pull-driven
//! processor.
//!
//! The caller `load`s whatever arrives (network packets, UART chunks);
//! the processor `read`s between `min` and `max` bytes per tick.  When
//! fewer than `min` bytes are buffered the read reports `Again` and the
//! machine suspends, byte-exact, until more data lands.

use super::Pull;

pub struct StreamBuffer {
    buf: Vec<u8>,
    offset: usize,
    length: usize,
    eof: bool,
}

impl StreamBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0u8; size],
            offset: 0,
            length: 0,
            eof: false,
        }
    }

    #[inline]
    pub fn free(&self) -> usize {
        self.buf.len() - self.length
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    #[inline]
    pub fn eof(&self) -> bool {
        self.eof
    }

    /// Accept up to `free()` bytes, splitting across the wrap point.
    /// Returns bytes taken — zero when full or after EOF.
    pub fn load(&mut self, data: &[u8]) -> usize {
        let bytes = data.len().min(self.free());
        if self.eof || bytes == 0 {
            return 0;
        }

        let size = self.buf.len();
        let start = (self.offset + self.length) % size;
        let chunk1 = bytes.min(size - start);
        self.buf[start..start + chunk1].copy_from_slice(&data[..chunk1]);

        let chunk2 = bytes - chunk1;
        if chunk2 > 0 {
            self.buf[..chunk2].copy_from_slice(&data[chunk1..bytes]);
        }

        self.length += bytes;
        bytes
    }

    /// No more data will ever be loaded.
    pub fn set_eof(&mut self) {
        self.eof = true;
    }

    /// Processor-side read: `Eof` once drained after `set_eof`, `Again`
    /// while fewer than `min` bytes are buffered, else up to `max` bytes.
    pub(crate) fn read(&mut self, min: usize, max: usize, out: &mut [u8]) -> Pull {
        if self.length == 0 && self.eof {
            return Pull::Eof;
        }
        if self.length < min {
            return Pull::Again;
        }

        let size = self.buf.len();
        let bytes = self.length.min(max);
        let chunk1 = bytes.min(size - self.offset);
        out[..chunk1].copy_from_slice(&self.buf[self.offset..self.offset + chunk1]);

        let chunk2 = bytes - chunk1;
        if chunk2 > 0 {
            out[chunk1..bytes].copy_from_slice(&self.buf[..chunk2]);
        }

        self.offset = (self.offset + bytes) % size;
        self.length -= bytes;
        Pull::Data(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_around_load_and_read() {
        let mut sb = StreamBuffer::new(8);
        assert_eq!(sb.load(b"abcdef"), 6);

        let mut out = [0u8; 8];
        assert!(matches!(sb.read(1, 4, &mut out), Pull::Data(4)));
        assert_eq!(&out[..4], b"abcd");

        // Next load wraps across the end of the ring.
        assert_eq!(sb.load(b"ghijkl"), 6);
        assert_eq!(sb.free(), 0);
        assert_eq!(sb.load(b"m"), 0);

        assert!(matches!(sb.read(1, 8, &mut out), Pull::Data(8)));
        assert_eq!(&out[..8], b"efghijkl");
    }

    #[test]
    fn again_until_min_available() {
        let mut sb = StreamBuffer::new(16);
        sb.load(b"xy");
        let mut out = [0u8; 8];
        assert!(matches!(sb.read(4, 8, &mut out), Pull::Again));
        sb.load(b"zw");
        assert!(matches!(sb.read(4, 8, &mut out), Pull::Data(4)));
    }

    #[test]
    fn eof_after_drain() {
        let mut sb = StreamBuffer::new(16);
        sb.load(b"ab");
        sb.set_eof();
        assert_eq!(sb.load(b"cd"), 0);

        let mut out = [0u8; 4];
        assert!(matches!(sb.read(1, 4, &mut out), Pull::Data(2)));
        assert!(matches!(sb.read(1, 4, &mut out), Pull::Eof));
    }
}
