//! Explicit big-endian field codec.
//!
//! Every packed structure on the wire or in storage goes through these two
//! helpers. Nothing is ever reinterpreted from raw memory.

use crate::error::{CoreError, CoreResult};

/// Sequential big-endian reader over a borrowed byte slice.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Create a reader positioned at the start of `buf`
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// True when every byte has been consumed
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Borrow `len` bytes and advance
    pub fn bytes(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(CoreError::Truncated {
                needed: len,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// Read a fixed-size array
    pub fn array<const N: usize>(&mut self) -> CoreResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    /// Borrow everything that is left
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    pub fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> CoreResult<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> CoreResult<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    /// Fail unless the input has been fully consumed
    pub fn finish(&self) -> CoreResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(CoreError::InvalidArgument(format!(
                "{} trailing bytes",
                self.remaining()
            )))
        }
    }
}

/// Big-endian writer appending to an owned buffer.
#[derive(Debug, Default, Clone)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    /// Write `v` NUL-padded (or truncated) to exactly `width` bytes
    pub fn padded(&mut self, v: &[u8], width: usize) -> &mut Self {
        let take = v.len().min(width);
        self.buf.extend_from_slice(&v[..take]);
        self.buf.resize(self.buf.len() + (width - take), 0);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// Length of a u16 length-prefixed field, rejecting values that do not fit.
pub fn len_u16(len: usize, field: &'static str) -> CoreResult<u16> {
    u16::try_from(len).map_err(|_| CoreError::InvalidValue {
        field,
        value: len as u64,
    })
}

/// Trim trailing NUL padding from a fixed-width string field.
pub fn unpad(field: &[u8]) -> &[u8] {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..end]
}
