//! Little-endian byte sinks and sources for session state.

use crate::error::{Error, Result};
use std::io::Write;

/// Destination of serialized state
pub trait StateWriter {
    fn write_bytes(&mut self, data: &[u8]) -> Result<()>;

    /// Bytes written so far
    fn n_bytes(&self) -> usize;

    fn write_u32(&mut self, v: u32) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    fn write_i32(&mut self, v: i32) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    fn write_u64(&mut self, v: u64) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    fn write_i32s(&mut self, values: &[i32]) -> Result<()> {
        for &v in values {
            self.write_i32(v)?;
        }
        Ok(())
    }

    fn write_f32s(&mut self, values: &[f32]) -> Result<()> {
        for &v in values {
            self.write_bytes(&v.to_le_bytes())?;
        }
        Ok(())
    }

    /// `u32` length followed by the UTF-8 bytes
    fn write_string(&mut self, s: &str) -> Result<()> {
        self.write_u32(s.len() as u32)?;
        self.write_bytes(s.as_bytes())
    }
}

/// Source of serialized state
pub trait StateReader {
    /// The next `n` bytes
    fn read_bytes(&mut self, n: usize) -> Result<&[u8]>;

    /// Bytes consumed so far
    fn n_bytes(&self) -> usize;

    fn read_to(&mut self, dst: &mut [u8]) -> Result<()> {
        let src = self.read_bytes(dst.len())?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i32(&mut self) -> Result<i32> {
        let b = self.read_bytes(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let b = self.read_bytes(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }

    fn read_i32s(&mut self, n: usize) -> Result<Vec<i32>> {
        let b = self.read_bytes(n * 4)?;
        Ok(b.chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    fn read_f32s_to(&mut self, dst: &mut [f32]) -> Result<()> {
        let b = self.read_bytes(dst.len() * 4)?;
        for (v, c) in dst.iter_mut().zip(b.chunks_exact(4)) {
            *v = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
        }
        Ok(())
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let b = self.read_bytes(len)?;
        String::from_utf8(b.to_vec()).map_err(|e| Error::StateError {
            reason: format!("invalid UTF-8: {e}"),
        })
    }
}

/// Counts bytes without storing them
#[derive(Debug, Default)]
pub struct SizeCounter {
    n: usize,
}

impl StateWriter for SizeCounter {
    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.n += data.len();
        Ok(())
    }

    fn n_bytes(&self) -> usize {
        self.n
    }
}

/// Writes into a caller-provided buffer, failing once it is full
pub struct BufferWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> BufferWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }
}

impl StateWriter for BufferWriter<'_> {
    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        let end = self.pos + data.len();
        if end > self.buf.len() {
            return Err(Error::StateError {
                reason: format!("state buffer too small ({} bytes)", self.buf.len()),
            });
        }
        self.buf[self.pos..end].copy_from_slice(data);
        self.pos = end;
        Ok(())
    }

    fn n_bytes(&self) -> usize {
        self.pos
    }
}

/// Writes through any [`std::io::Write`]
pub struct IoWriter<W> {
    inner: W,
    n: usize,
}

impl<W: Write> IoWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, n: 0 }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> StateWriter for IoWriter<W> {
    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data)?;
        self.n += data.len();
        Ok(())
    }

    fn n_bytes(&self) -> usize {
        self.n
    }
}

/// Reads from a byte slice, such as a caller buffer or a mapped file
pub struct SliceReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes left unread
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

impl StateReader for SliceReader<'_> {
    fn read_bytes(&mut self, n: usize) -> Result<&[u8]> {
        if n > self.remaining() {
            return Err(Error::StateError {
                reason: format!(
                    "unexpectedly reached end of state data (need {n} bytes, {} left)",
                    self.remaining()
                ),
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn n_bytes(&self) -> usize {
        self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_writer_overflow() {
        let mut buf = [0u8; 6];
        let mut w = BufferWriter::new(&mut buf);
        w.write_u32(7).unwrap();
        assert!(w.write_u32(8).is_err());
        assert_eq!(w.n_bytes(), 4);
        assert_eq!(&buf[..4], &[7, 0, 0, 0]);
    }

    #[test]
    fn test_slice_reader_values_and_underflow() {
        let mut w = IoWriter::new(Vec::new());
        w.write_string("mamba").unwrap();
        w.write_i32(-3).unwrap();
        w.write_f32s(&[1.5]).unwrap();
        let bytes = w.into_inner();

        let mut r = SliceReader::new(&bytes);
        assert_eq!(r.read_string().unwrap(), "mamba");
        assert_eq!(r.read_i32().unwrap(), -3);
        let mut f = [0.0];
        r.read_f32s_to(&mut f).unwrap();
        assert_eq!(f, [1.5]);
        assert_eq!(r.remaining(), 0);
        assert!(r.read_u32().is_err());
    }

    #[test]
    fn test_size_counter() {
        let mut c = SizeCounter::default();
        c.write_string("ab").unwrap();
        c.write_u64(1).unwrap();
        assert_eq!(c.n_bytes(), 14);
    }
}
