//! Big-endian field writer/reader shared by every binary message.
//!
//! Strings are fixed-width and NUL-padded; enums travel as `u32` codes.

use bytes::{Buf, BufMut, BytesMut};
use uuid::Uuid;

use crate::error::{MsgError, MsgResult};

pub(crate) struct Writer {
    buf: BytesMut,
}

impl Writer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub(crate) fn u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub(crate) fn u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub(crate) fn u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub(crate) fn i64(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    pub(crate) fn bool(&mut self, v: bool) {
        self.buf.put_u32(u32::from(v));
    }

    pub(crate) fn uuid(&mut self, v: &Uuid) {
        self.buf.put_slice(v.as_bytes());
    }

    pub(crate) fn zeros(&mut self, n: usize) {
        self.buf.put_bytes(0, n);
    }

    pub(crate) fn fixed_str(&mut self, field: &'static str, s: &str, width: usize) -> MsgResult<()> {
        // One byte is reserved for the terminating NUL.
        if s.len() >= width {
            return Err(MsgError::FieldTooLong {
                field,
                max: width - 1,
            });
        }
        self.buf.put_slice(s.as_bytes());
        self.buf.put_bytes(0, width - s.len());
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn set_u16_at(&mut self, offset: usize, v: u16) {
        self.buf[offset..offset + 2].copy_from_slice(&v.to_be_bytes());
    }

    pub(crate) fn set_slice_at(&mut self, offset: usize, v: &[u8]) {
        self.buf[offset..offset + v.len()].copy_from_slice(v);
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> MsgResult<()> {
        if self.buf.remaining() < n {
            return Err(MsgError::Truncated {
                need: n,
                have: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub(crate) fn u16(&mut self) -> MsgResult<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub(crate) fn u32(&mut self) -> MsgResult<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub(crate) fn u64(&mut self) -> MsgResult<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    pub(crate) fn i64(&mut self) -> MsgResult<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    pub(crate) fn bool(&mut self) -> MsgResult<bool> {
        Ok(self.u32()? != 0)
    }

    pub(crate) fn uuid(&mut self) -> MsgResult<Uuid> {
        self.need(16)?;
        let mut bytes = [0u8; 16];
        self.buf.copy_to_slice(&mut bytes);
        Ok(Uuid::from_bytes(bytes))
    }

    pub(crate) fn skip(&mut self, n: usize) -> MsgResult<()> {
        self.need(n)?;
        self.buf.advance(n);
        Ok(())
    }

    pub(crate) fn fixed_str(&mut self, width: usize) -> MsgResult<String> {
        self.need(width)?;
        let raw = &self.buf[..width];
        let end = raw.iter().position(|b| *b == 0).unwrap_or(width);
        let s = String::from_utf8_lossy(&raw[..end]).into_owned();
        self.buf.advance(width);
        Ok(s)
    }

    /// Decode a `u32` enum code with the enum's `from_code`.
    pub(crate) fn code<T>(&mut self, field: &'static str, from: fn(u32) -> Option<T>) -> MsgResult<T> {
        let value = self.u32()?;
        from(value).ok_or(MsgError::BadEnum { field, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_str_pads_and_trims() {
        let mut w = Writer::with_capacity(8);
        w.fixed_str("name", "abc", 8).unwrap();
        assert_eq!(w.as_slice(), b"abc\0\0\0\0\0");
        let bytes = w.into_vec();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.fixed_str(8).unwrap(), "abc");
    }

    #[test]
    fn fixed_str_rejects_overlong() {
        let mut w = Writer::with_capacity(4);
        let err = w.fixed_str("name", "abcd", 4).unwrap_err();
        assert_eq!(err, MsgError::FieldTooLong { field: "name", max: 3 });
    }

    #[test]
    fn reader_reports_truncation() {
        let mut r = Reader::new(&[0, 1, 2]);
        assert_eq!(r.u16().unwrap(), 1);
        assert!(matches!(r.u32(), Err(MsgError::Truncated { need: 4, have: 1 })));
    }
}
