//! Typed cursors over message bodies.
//!
//! Strings and blobs are prefixed with an `i32` byte length, no terminator.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::FrameError;

/// Growable write cursor.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    pub fn put_i16(&mut self, v: i16) {
        self.buf.put_i16(v);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    pub fn put_str(&mut self, s: &str) {
        self.put_blob(s.as_bytes());
    }

    pub fn put_blob(&mut self, data: &[u8]) {
        self.buf.put_i32(data.len() as i32);
        self.buf.put_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Bounds-checked read cursor. Every getter fails with
/// [`FrameError::Truncated`] instead of panicking on short input.
#[derive(Debug, Clone)]
pub struct WireReader {
    buf: Bytes,
}

impl WireReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, field: &'static str, n: usize) -> Result<(), FrameError> {
        if self.buf.remaining() < n {
            return Err(FrameError::Truncated {
                field,
                need: n,
                have: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn get_u8(&mut self, field: &'static str) -> Result<u8, FrameError> {
        self.need(field, 1)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_bool(&mut self, field: &'static str) -> Result<bool, FrameError> {
        match self.get_u8(field)? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(FrameError::InvalidValue { field, value }),
        }
    }

    pub fn get_i16(&mut self, field: &'static str) -> Result<i16, FrameError> {
        self.need(field, 2)?;
        Ok(self.buf.get_i16())
    }

    pub fn get_i32(&mut self, field: &'static str) -> Result<i32, FrameError> {
        self.need(field, 4)?;
        Ok(self.buf.get_i32())
    }

    pub fn get_u32(&mut self, field: &'static str) -> Result<u32, FrameError> {
        self.need(field, 4)?;
        Ok(self.buf.get_u32())
    }

    pub fn get_i64(&mut self, field: &'static str) -> Result<i64, FrameError> {
        self.need(field, 8)?;
        Ok(self.buf.get_i64())
    }

    pub fn get_blob(&mut self, field: &'static str) -> Result<Bytes, FrameError> {
        let len = self.get_i32(field)?;
        if len < 0 {
            return Err(FrameError::NegativeLength { field, len });
        }
        let len = len as usize;
        self.need(field, len)?;
        Ok(self.buf.copy_to_bytes(len))
    }

    pub fn get_str(&mut self, field: &'static str) -> Result<String, FrameError> {
        let raw = self.get_blob(field)?;
        String::from_utf8(raw.to_vec()).map_err(|_| FrameError::InvalidUtf8(field))
    }

    /// Fails if anything is left after the last field.
    pub fn finish(self) -> Result<(), FrameError> {
        match self.buf.remaining() {
            0 => Ok(()),
            n => Err(FrameError::TrailingBytes(n)),
        }
    }
}
