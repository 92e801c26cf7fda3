//! Bounds-checked byte buffer codec.
//!
//! [`SafeBufferReader`] and [`SafeBufferWriter`] wrap a byte slice and a
//! cursor. Every primitive is encoded little-endian at the cursor, which then
//! advances. An access that would cross the end of the region fails with
//! [`StateError::OutOfBounds`] and leaves the cursor untouched.
//!
//! Strings are encoded as a `u16` byte length followed by the UTF-8 bytes.

use crate::error::{Result, StateError};

/// Size in bytes of the length prefix of an encoded string.
pub const STRING_LENGTH_PREFIX: usize = 2;

/// Returns the number of bytes [`SafeBufferWriter::put_string`] uses for `s`.
pub fn encoded_string_size(s: &str) -> usize {
    STRING_LENGTH_PREFIX + s.len()
}

fn out_of_bounds(position: usize, requested: usize, limit: usize) -> StateError {
    StateError::OutOfBounds {
        position,
        requested,
        limit,
    }
}

/// Read cursor over an immutable byte region.
#[derive(Debug, Clone)]
pub struct SafeBufferReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SafeBufferReader<'a> {
    /// Creates a reader positioned at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Returns the current cursor position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Returns the size of the region.
    pub fn limit(&self) -> usize {
        self.buf.len()
    }

    /// Returns the number of bytes left after the cursor.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Moves the cursor to an absolute position within the region.
    pub fn set_position(&mut self, pos: usize) -> Result<()> {
        if pos > self.buf.len() {
            return Err(out_of_bounds(pos, 0, self.buf.len()));
        }
        self.pos = pos;
        Ok(())
    }

    /// Advances the cursor by `n` bytes.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| out_of_bounds(self.pos, n, self.buf.len()))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Returns a reader over the next `len` bytes and advances past them.
    pub fn sub_reader(&mut self, len: usize) -> Result<SafeBufferReader<'a>> {
        self.take(len).map(SafeBufferReader::new)
    }

    /// Reads a `u8`.
    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    /// Reads an `i8`.
    pub fn get_i8(&mut self) -> Result<i8> {
        Ok(i8::from_le_bytes(self.take_array()?))
    }

    /// Reads a boolean stored as one byte.
    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    /// Reads a `char` stored as its 32-bit scalar value.
    pub fn get_char(&mut self) -> Result<char> {
        let raw = self.get_u32()?;
        char::from_u32(raw).ok_or_else(|| StateError::corrupt(format!("invalid char {raw:#x}")))
    }

    /// Reads an `i16`.
    pub fn get_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.take_array()?))
    }

    /// Reads a `u16`.
    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    /// Reads an `i32`.
    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    /// Reads a `u32`.
    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    /// Reads an `i64`.
    pub fn get_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    /// Reads a `u64`.
    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    /// Reads an `f32`.
    pub fn get_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    /// Reads an `f64`.
    pub fn get_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    /// Fills `dst` with the next `dst.len()` bytes.
    pub fn get_bytes(&mut self, dst: &mut [u8]) -> Result<()> {
        dst.copy_from_slice(self.take(dst.len())?);
        Ok(())
    }

    /// Reads a fixed-size byte array.
    pub fn get_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.take_array()
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn get_string(&mut self) -> Result<String> {
        let start = self.pos;
        let len = self.get_u16()? as usize;
        let bytes = match self.take(len) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.pos = start;
                return Err(e);
            }
        };
        match String::from_utf8(bytes.to_vec()) {
            Ok(s) => Ok(s),
            Err(e) => {
                self.pos = start;
                Err(StateError::corrupt(format!("invalid UTF-8 in string: {e}")))
            }
        }
    }
}

/// Write cursor over a mutable byte region.
#[derive(Debug)]
pub struct SafeBufferWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> SafeBufferWriter<'a> {
    /// Creates a writer positioned at the start of `buf`.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Returns the current cursor position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Returns the size of the region.
    pub fn limit(&self) -> usize {
        self.buf.len()
    }

    /// Returns the number of bytes left after the cursor.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Moves the cursor to an absolute position within the region.
    pub fn set_position(&mut self, pos: usize) -> Result<()> {
        if pos > self.buf.len() {
            return Err(out_of_bounds(pos, 0, self.buf.len()));
        }
        self.pos = pos;
        Ok(())
    }

    /// Advances the cursor by `n` bytes, leaving their contents unchanged.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.reserve(n).map(|_| ())
    }

    fn reserve(&mut self, n: usize) -> Result<&mut [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| out_of_bounds(self.pos, n, self.buf.len()))?;
        let start = self.pos;
        self.pos = end;
        Ok(&mut self.buf[start..end])
    }

    /// Returns a writer over the next `len` bytes and advances past them.
    pub fn sub_writer(&mut self, len: usize) -> Result<SafeBufferWriter<'_>> {
        self.reserve(len).map(SafeBufferWriter::new)
    }

    /// Writes raw bytes.
    pub fn put_bytes(&mut self, src: &[u8]) -> Result<()> {
        self.reserve(src.len())?.copy_from_slice(src);
        Ok(())
    }

    /// Writes a `u8`.
    pub fn put_u8(&mut self, value: u8) -> Result<()> {
        self.put_bytes(&[value])
    }

    /// Writes an `i8`.
    pub fn put_i8(&mut self, value: i8) -> Result<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Writes a boolean as one byte.
    pub fn put_bool(&mut self, value: bool) -> Result<()> {
        self.put_u8(u8::from(value))
    }

    /// Writes a `char` as its 32-bit scalar value.
    pub fn put_char(&mut self, value: char) -> Result<()> {
        self.put_u32(value as u32)
    }

    /// Writes an `i16`.
    pub fn put_i16(&mut self, value: i16) -> Result<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Writes a `u16`.
    pub fn put_u16(&mut self, value: u16) -> Result<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Writes an `i32`.
    pub fn put_i32(&mut self, value: i32) -> Result<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Writes a `u32`.
    pub fn put_u32(&mut self, value: u32) -> Result<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Writes an `i64`.
    pub fn put_i64(&mut self, value: i64) -> Result<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Writes a `u64`.
    pub fn put_u64(&mut self, value: u64) -> Result<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Writes an `f32`.
    pub fn put_f32(&mut self, value: f32) -> Result<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Writes an `f64`.
    pub fn put_f64(&mut self, value: f64) -> Result<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Writes a length-prefixed UTF-8 string.
    ///
    /// Strings longer than `u16::MAX` bytes are rejected with
    /// [`StateError::OutOfBounds`].
    pub fn put_string(&mut self, value: &str) -> Result<()> {
        let len = u16::try_from(value.len())
            .map_err(|_| out_of_bounds(self.pos, value.len(), u16::MAX as usize))?;
        let needed = encoded_string_size(value);
        if needed > self.remaining() {
            return Err(out_of_bounds(self.pos, needed, self.buf.len()));
        }
        self.put_u16(len)?;
        self.put_bytes(value.as_bytes())
    }
}
