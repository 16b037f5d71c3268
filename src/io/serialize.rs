use crate::{error::MaviError, types::MaviResult};

/// Append-only byte buffer with big-endian primitive packing.
pub struct MaviWriter {
    buf: Vec<u8>,
}

impl MaviWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Length-prefixed byte string: `<len:4><bytes>`.
    pub fn write_sized(&mut self, v: &[u8]) {
        self.write_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a byte slice. Overruns surface as `CorruptPage` so a
/// truncated or damaged page never panics the reader.
pub struct MaviReader<'a> {
    buf: &'a [u8],
    pos: usize,
    // file offset the slice came from, for error context
    origin: u64,
}

impl<'a> MaviReader<'a> {
    pub fn new(buf: &'a [u8], origin: u64) -> Self {
        Self {
            buf,
            pos: 0,
            origin,
        }
    }

    fn take(&mut self, n: usize) -> MaviResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(MaviError::corrupt(
                self.origin,
                &format!(
                    "short read: need {} bytes at {}, have {}",
                    n,
                    self.pos,
                    self.buf.len()
                ),
            ));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn read_u32(&mut self) -> MaviResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> MaviResult<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> MaviResult<u64> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_be_bytes(a))
    }

    pub fn read_i64(&mut self) -> MaviResult<i64> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(i64::from_be_bytes(a))
    }

    pub fn read_bytes(&mut self, n: usize) -> MaviResult<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }

    /// Length-prefixed byte string written by `MaviWriter::write_sized`.
    pub fn read_sized(&mut self) -> MaviResult<Vec<u8>> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_round_trip() {
        let mut w = MaviWriter::new();
        w.write_u32(7);
        w.write_u64(u64::MAX);
        w.write_i32(-42);
        w.write_sized(b"hello");

        let buf = w.into_bytes();
        let mut r = MaviReader::new(&buf, 0);
        assert_eq!(r.read_u32().unwrap(), 7);
        assert_eq!(r.read_u64().unwrap(), u64::MAX);
        assert_eq!(r.read_i32().unwrap(), -42);
        assert_eq!(r.read_sized().unwrap(), b"hello");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn overrun_is_an_error() {
        let buf = vec![0u8; 3];
        let mut r = MaviReader::new(&buf, 128);
        match r.read_u32() {
            Err(crate::error::MaviError::CorruptPage { offset, .. }) => {
                assert_eq!(offset, 128)
            }
            other => panic!("expected CorruptPage, got {:?}", other.map(|_| ())),
        }
    }
}
