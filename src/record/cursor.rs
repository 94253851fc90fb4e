//! Bounds-checked cursors over host-endian byte buffers.

use crate::error::{Error, Result};

pub fn align(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

/// Reads host-endian values from a slice, failing on any read past its end.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        ByteReader { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(Error::corrupt(format!(
                "read of {} bytes at offset {} exceeds buffer of {} bytes",
                len,
                self.pos,
                self.data.len()
            )));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.read_bytes(len).map(|_| ())
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_ne_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_ne_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_ne_bytes(self.read_array()?))
    }

    /// Read `count` u64 values; `count` comes from untrusted data.
    pub fn read_u64_vec(&mut self, count: u64) -> Result<Vec<u64>> {
        let len = usize::try_from(count)
            .ok()
            .and_then(|c| c.checked_mul(8))
            .filter(|&len| len <= self.remaining())
            .ok_or_else(|| {
                Error::corrupt(format!(
                    "array of {} u64 values at offset {} exceeds buffer",
                    count, self.pos
                ))
            })?;
        let bytes = self.read_bytes(len)?;
        Ok(bytes
            .chunks_exact(8)
            .map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                u64::from_ne_bytes(b)
            })
            .collect())
    }

    /// Read a NUL-terminated string stored in a field padded to `alignment`.
    pub fn read_padded_string(&mut self, alignment: usize) -> Result<String> {
        let rest = &self.data[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::corrupt(format!("unterminated string at offset {}", self.pos)))?;
        let s = String::from_utf8_lossy(&rest[..nul]).into_owned();
        self.skip(align(nul + 1, alignment))?;
        Ok(s)
    }
}

/// Appends host-endian values to a growable buffer.
#[derive(Debug, Default, Clone)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        ByteWriter {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    pub fn write_u64_slice(&mut self, values: &[u64]) {
        for &v in values {
            self.write_u64(v);
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Write `bytes` zero-padded to `len` bytes (truncating if longer).
    pub fn write_fixed(&mut self, bytes: &[u8], len: usize) {
        let n = bytes.len().min(len);
        self.buf.extend_from_slice(&bytes[..n]);
        self.buf.resize(self.buf.len() + (len - n), 0);
    }

    /// Write `s` plus a NUL terminator, zero-padded to `alignment`.
    pub fn write_padded_string(&mut self, s: &str, alignment: usize) {
        self.write_fixed(s.as_bytes(), padded_string_len(s, alignment));
    }

    pub fn set_u16_at(&mut self, offset: usize, v: u16) {
        self.buf[offset..offset + 2].copy_from_slice(&v.to_ne_bytes());
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

pub fn padded_string_len(s: &str, alignment: usize) -> usize {
    align(s.len() + 1, alignment)
}
