//! Wire format helpers
//!
//! Checked cursor over untrusted inbound bytes. Every read validates the
//! remaining length first, so truncated server data surfaces as
//! [`SecureError::Malformed`] instead of a panic. Outbound packets are built
//! directly with [`bytes::BytesMut`].

use crate::errors::{SecureError, SecureResult};

/// Checked read cursor over a byte slice
///
/// Field order and endianness follow the RDP basic connection sequence:
/// little-endian unless a field is explicitly big-endian (T.124 header
/// fields, channel option flags).
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Wrap a slice for checked reading
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Current cursor position
    pub fn position(&self) -> usize {
        self.pos
    }

    fn ensure(&self, n: usize, what: &str) -> SecureResult<()> {
        if self.remaining() < n {
            return Err(SecureError::malformed(format!(
                "truncated {} (need {} bytes, have {})",
                what,
                n,
                self.remaining()
            )));
        }
        Ok(())
    }

    /// Read a single byte
    pub fn u8(&mut self, what: &str) -> SecureResult<u8> {
        self.ensure(1, what)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    /// Read a little-endian u16
    pub fn u16_le(&mut self, what: &str) -> SecureResult<u16> {
        self.ensure(2, what)?;
        let v = u16::from_le_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    /// Read a little-endian u32
    pub fn u32_le(&mut self, what: &str) -> SecureResult<u32> {
        self.ensure(4, what)?;
        let v = u32::from_le_bytes([
            self.buf[self.pos],
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
            self.buf[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(v)
    }

    /// Take `n` bytes as a slice
    pub fn take(&mut self, n: usize, what: &str) -> SecureResult<&'a [u8]> {
        self.ensure(n, what)?;
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    /// Skip `n` bytes
    pub fn skip(&mut self, n: usize, what: &str) -> SecureResult<()> {
        self.ensure(n, what)?;
        self.pos += n;
        Ok(())
    }

    /// Move the cursor to an absolute position already known to be in bounds
    pub fn seek(&mut self, pos: usize, what: &str) -> SecureResult<()> {
        if pos > self.buf.len() {
            return Err(SecureError::malformed(format!(
                "{} extends past end of buffer",
                what
            )));
        }
        self.pos = pos;
        Ok(())
    }

    /// Require that exactly `end` bytes of the buffer have been consumed
    pub fn expect_consumed_to(&self, end: usize, what: &str) -> SecureResult<()> {
        if self.pos != end {
            return Err(SecureError::malformed(format!(
                "{} length mismatch: consumed {} of {} bytes",
                what, self.pos, end
            )));
        }
        Ok(())
    }
}
