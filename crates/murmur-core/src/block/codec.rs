//! Bounds-checked payload cursor and writer.
//!
//! Every read checks the remaining window before touching it and reports
//! the offset consumed so far, so a forged length prefix surfaces as a
//! `MalformedBlockPayload` instead of a panic or a silent truncation.

use bytes::{Buf, BufMut, BytesMut};

use crate::ids::ID_SIZE;
use crate::wire::ProtocolError;

/// Cursor over one block payload.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> u64 {
        self.pos as u64
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn need(&self, n: usize, field: &str) -> Result<(), ProtocolError> {
        if n > self.remaining() {
            return Err(ProtocolError::malformed(
                format!("{field}: need {n} bytes, {} left", self.remaining()),
                self.offset(),
            ));
        }
        Ok(())
    }

    pub fn take(&mut self, n: usize, field: &str) -> Result<&'a [u8], ProtocolError> {
        self.need(n, field)?;
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self, field: &str) -> Result<u8, ProtocolError> {
        let mut b = self.take(1, field)?;
        Ok(b.get_u8())
    }

    pub fn u16(&mut self, field: &str) -> Result<u16, ProtocolError> {
        let mut b = self.take(2, field)?;
        Ok(b.get_u16())
    }

    pub fn u32(&mut self, field: &str) -> Result<u32, ProtocolError> {
        let mut b = self.take(4, field)?;
        Ok(b.get_u32())
    }

    pub fn u64(&mut self, field: &str) -> Result<u64, ProtocolError> {
        let mut b = self.take(8, field)?;
        Ok(b.get_u64())
    }

    pub fn i64(&mut self, field: &str) -> Result<i64, ProtocolError> {
        let mut b = self.take(8, field)?;
        Ok(b.get_i64())
    }

    pub fn id(&mut self, field: &str) -> Result<[u8; ID_SIZE], ProtocolError> {
        let b = self.take(ID_SIZE, field)?;
        let mut out = [0u8; ID_SIZE];
        out.copy_from_slice(b);
        Ok(out)
    }

    /// Length-prefixed UTF-8 field with a 1-byte prefix.
    ///
    /// Required fields must satisfy `0 < len <= max`; optional fields may
    /// also be empty, which reads as `None`.
    pub fn string_u8(
        &mut self,
        field: &str,
        max: usize,
        required: bool,
    ) -> Result<Option<String>, ProtocolError> {
        let len = self.u8(field)? as usize;
        self.string_body(field, len, max, required)
    }

    /// Length-prefixed UTF-8 field with a 2-byte prefix. Always required.
    pub fn string_u16(&mut self, field: &str, max: usize) -> Result<String, ProtocolError> {
        let len = self.u16(field)? as usize;
        self.string_body(field, len, max, true)?
            .ok_or_else(|| ProtocolError::malformed(format!("{field}: empty"), self.offset()))
    }

    fn string_body(
        &mut self,
        field: &str,
        len: usize,
        max: usize,
        required: bool,
    ) -> Result<Option<String>, ProtocolError> {
        if len == 0 {
            if required {
                return Err(ProtocolError::malformed(
                    format!("{field}: length must be positive"),
                    self.offset(),
                ));
            }
            return Ok(None);
        }
        if len > max {
            return Err(ProtocolError::malformed(
                format!("{field}: length {len} exceeds maximum {max}"),
                self.offset(),
            ));
        }
        let at = self.offset();
        let raw = self.take(len, field)?;
        let text = std::str::from_utf8(raw)
            .map_err(|_| ProtocolError::malformed(format!("{field}: invalid UTF-8"), at))?;
        Ok(Some(text.to_string()))
    }

    /// Fail unless the whole window was consumed.
    pub fn finish(&self, block: &str) -> Result<(), ProtocolError> {
        if self.remaining() != 0 {
            return Err(ProtocolError::malformed(
                format!("{block}: {} trailing bytes", self.remaining()),
                self.offset(),
            ));
        }
        Ok(())
    }
}

/// Append a 1-byte length-prefixed string, enforcing the same bounds the
/// reader applies.
pub fn put_string_u8(
    out: &mut BytesMut,
    field: &str,
    value: Option<&str>,
    max: usize,
    required: bool,
) -> Result<(), ProtocolError> {
    let bytes = value.map(str::as_bytes).unwrap_or_default();
    check_len(field, bytes.len(), max.min(u8::MAX as usize), required, out.len())?;
    out.put_u8(bytes.len() as u8);
    out.put_slice(bytes);
    Ok(())
}

/// Append a 2-byte length-prefixed string. Always required.
pub fn put_string_u16(
    out: &mut BytesMut,
    field: &str,
    value: &str,
    max: usize,
) -> Result<(), ProtocolError> {
    let bytes = value.as_bytes();
    check_len(field, bytes.len(), max.min(u16::MAX as usize), true, out.len())?;
    out.put_u16(bytes.len() as u16);
    out.put_slice(bytes);
    Ok(())
}

fn check_len(
    field: &str,
    len: usize,
    max: usize,
    required: bool,
    offset: usize,
) -> Result<(), ProtocolError> {
    if required && len == 0 {
        return Err(ProtocolError::malformed(
            format!("{field}: length must be positive"),
            offset as u64,
        ));
    }
    if len > max {
        return Err(ProtocolError::malformed(
            format!("{field}: length {len} exceeds maximum {max}"),
            offset as u64,
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_big_endian_integers() {
        let bytes = [0x01, 0x02, 0x00, 0x00, 0x00, 0x03];
        let mut r = PayloadReader::new(&bytes);
        assert_eq!(r.u16("a").unwrap(), 0x0102);
        assert_eq!(r.u32("b").unwrap(), 3);
        assert!(r.finish("test").is_ok());
    }

    #[test]
    fn overrun_reports_offset() {
        let bytes = [0x00, 0x05, b'a', b'b'];
        let mut r = PayloadReader::new(&bytes);
        match r.string_u16("post", 100) {
            Err(ProtocolError::MalformedBlockPayload { offset, .. }) => assert_eq!(offset, 2),
            other => panic!("expected malformed payload, got {other:?}"),
        }
    }

    #[test]
    fn zero_length_required_field_rejected() {
        let bytes = [0x00];
        let mut r = PayloadReader::new(&bytes);
        assert!(r.string_u8("name", 255, true).is_err());
    }

    #[test]
    fn zero_length_optional_field_is_none() {
        let bytes = [0x00];
        let mut r = PayloadReader::new(&bytes);
        assert_eq!(r.string_u8("filename", 255, false).unwrap(), None);
    }

    #[test]
    fn prefix_over_max_rejected() {
        let bytes = [0x03, b'a', b'b', b'c'];
        let mut r = PayloadReader::new(&bytes);
        assert!(r.string_u8("tag", 2, true).is_err());
    }

    #[test]
    fn invalid_utf8_rejected() {
        let bytes = [0x02, 0xff, 0xfe];
        let mut r = PayloadReader::new(&bytes);
        assert!(r.string_u8("name", 255, true).is_err());
    }

    #[test]
    fn writer_refuses_to_truncate() {
        let mut out = BytesMut::new();
        let long = "x".repeat(256);
        assert!(put_string_u8(&mut out, "name", Some(&long), 255, true).is_err());
        assert!(out.is_empty());
        assert!(put_string_u16(&mut out, "post", "", 10).is_err());
    }

    #[test]
    fn trailing_bytes_rejected() {
        let bytes = [0x01, 0x02];
        let mut r = PayloadReader::new(&bytes);
        r.u8("a").unwrap();
        assert!(r.finish("test").is_err());
    }
}
