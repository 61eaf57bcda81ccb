//! Little-endian primitive I/O over byte slices.

use crate::{Hash16, WireError};

/// Cursor over a borrowed byte slice with little-endian accessors.
#[derive(Clone, Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    /// Wraps `data`, positioned at the first byte.
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, at: 0 }
    }

    /// Bytes not yet consumed.
    #[inline]
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.data.len() - self.at
    }

    /// Returns true when the cursor is at the end of the input.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Current cursor position.
    #[inline]
    #[must_use]
    pub const fn position(&self) -> usize {
        self.at
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.at..self.at + n];
        self.at += n;
        Ok(slice)
    }

    /// Skips `n` bytes.
    pub fn skip(&mut self, n: usize) -> Result<(), WireError> {
        self.take(n).map(|_| ())
    }

    /// Reads a u8.
    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    /// Reads a little-endian u16.
    pub fn u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    /// Reads a little-endian u32.
    pub fn u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    /// Reads a little-endian u64.
    pub fn u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// Reads a 16-byte hash.
    pub fn hash(&mut self) -> Result<Hash16, WireError> {
        Ok(self.take(16)?.try_into().unwrap())
    }

    /// Reads `n` raw bytes.
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        self.take(n)
    }

    /// Reads everything left in the buffer.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.at..];
        self.at = self.data.len();
        slice
    }

    /// Reads a `u16 len`-prefixed string. Bytes are decoded lossily — peers
    /// send arbitrary legacy encodings and a bad nick must not kill the
    /// session.
    pub fn string16(&mut self) -> Result<String, WireError> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }
}

/// Growable little-endian output buffer.
#[derive(Clone, Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    /// Creates an empty writer.
    #[must_use]
    pub const fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Creates a writer with `cap` bytes preallocated.
    #[must_use]
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    /// Bytes written so far.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true when nothing has been written.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consumes the writer, returning the buffer.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Borrows the buffer.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Writes a u8.
    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    /// Writes a little-endian u16.
    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Writes a little-endian u32.
    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Writes a little-endian u64.
    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Writes a 16-byte hash.
    pub fn hash(&mut self, h: &Hash16) -> &mut Self {
        self.buf.extend_from_slice(h);
        self
    }

    /// Writes raw bytes.
    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(data);
        self
    }

    /// Writes a `u16 len`-prefixed string. Longer inputs are truncated at
    /// the u16 boundary.
    pub fn string16(&mut self, s: &str) -> &mut Self {
        let raw = s.as_bytes();
        let len = raw.len().min(u16::MAX as usize);
        self.u16(len as u16);
        self.buf.extend_from_slice(&raw[..len]);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_round_trip_little_endian() {
        let mut w = Writer::new();
        w.u8(0xab).u16(0x1234).u32(0xdeadbeef).u64(0x0102030405060708);
        let bytes = w.into_bytes();
        assert_eq!(&bytes[..3], &[0xab, 0x34, 0x12]);

        let mut r = Reader::new(&bytes);
        assert_eq!(r.u8().unwrap(), 0xab);
        assert_eq!(r.u16().unwrap(), 0x1234);
        assert_eq!(r.u32().unwrap(), 0xdeadbeef);
        assert_eq!(r.u64().unwrap(), 0x0102030405060708);
        assert!(r.is_empty());
    }

    #[test]
    fn string16_round_trips() {
        let mut w = Writer::new();
        w.string16("shareme.avi");
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.string16().unwrap(), "shareme.avi");
    }

    #[test]
    fn string16_decodes_invalid_utf8_lossily() {
        let mut r = Reader::new(&[2, 0, 0xff, 0xfe]);
        let s = r.string16().unwrap();
        assert_eq!(s.chars().count(), 2);
    }

    #[test]
    fn truncated_read_reports_lengths() {
        let mut r = Reader::new(&[1, 2]);
        let err = r.u32().unwrap_err();
        assert_eq!(
            err,
            crate::WireError::Truncated {
                needed: 4,
                remaining: 2
            }
        );
    }

    #[test]
    fn hash_round_trips() {
        let h: crate::Hash16 = *b"0123456789abcdef";
        let mut w = Writer::new();
        w.hash(&h);
        let bytes = w.into_bytes();
        assert_eq!(Reader::new(&bytes).hash().unwrap(), h);
    }

    #[test]
    fn rest_consumes_remainder() {
        let mut r = Reader::new(&[1, 2, 3, 4]);
        r.u8().unwrap();
        assert_eq!(r.rest(), &[2, 3, 4]);
        assert!(r.is_empty());
    }
}
