// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Encoding primitives for pipe messages.
//!
//! Every message body has the shape:
//!
//! ```text
//! FieldCount(2B) { FieldId(2B) FieldSize(4B) FieldValue(FieldSize bytes) }*
//! ```
//!
//! All integers are little-endian. A field that is absent is simply not written, which is how
//! "not set" is represented on the wire. Readers skip field ids they don't know about, so newer
//! writers can add fields without breaking older readers.
//!
//! Composite values (arrays and nested records) don't know their encoded size up front. Their
//! writer reserves a placeholder for the size, writes the payload, then patches the placeholder.
//! This is why encoding always targets an in-memory [`BytesMut`]: the transport itself never needs
//! to seek.

use crate::errors::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// A value that can be written as the payload of a field.
pub trait FieldValue {
    /// Writes the value's payload (without a field header).
    fn write_value(&self, buf: &mut BytesMut);
}

impl FieldValue for str {
    fn write_value(&self, buf: &mut BytesMut) {
        buf.put_slice(self.as_bytes());
    }
}

impl FieldValue for String {
    fn write_value(&self, buf: &mut BytesMut) {
        self.as_str().write_value(buf);
    }
}

impl FieldValue for i32 {
    fn write_value(&self, buf: &mut BytesMut) {
        buf.put_i32_le(*self);
    }
}

impl FieldValue for i64 {
    fn write_value(&self, buf: &mut BytesMut) {
        buf.put_i64_le(*self);
    }
}

impl FieldValue for u16 {
    fn write_value(&self, buf: &mut BytesMut) {
        buf.put_u16_le(*self);
    }
}

impl FieldValue for u8 {
    fn write_value(&self, buf: &mut BytesMut) {
        buf.put_u8(*self);
    }
}

impl FieldValue for bool {
    fn write_value(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(*self));
    }
}

/// Writes a record: a field count followed by the fields that are present.
///
/// The field count is written as a placeholder and patched by [`finish`](Self::finish), so the
/// declared count always matches the number of field headers actually emitted.
#[must_use = "call finish() to write the field count"]
pub struct FieldWriter<'a> {
    buf: &'a mut BytesMut,
    count_pos: usize,
    count: u16,
}

impl<'a> FieldWriter<'a> {
    /// Starts a new record at the end of `buf`.
    pub fn new(buf: &'a mut BytesMut) -> Self {
        let count_pos = buf.len();
        buf.put_u16_le(0);
        Self {
            buf,
            count_pos,
            count: 0,
        }
    }

    /// Writes a field if `value` is present. Absent values are omitted from the wire.
    pub fn field<V: FieldValue + ?Sized>(&mut self, id: u16, value: Option<&V>) -> &mut Self {
        if let Some(value) = value {
            self.buf.put_u16_le(id);
            let size_pos = self.reserve_size();
            value.write_value(self.buf);
            self.patch_size(size_pos);
            self.count += 1;
        }
        self
    }

    /// Writes an array field if `values` is present.
    ///
    /// The payload is an element count followed by each element as produced by `write_elem`.
    pub fn array_field<T>(
        &mut self,
        id: u16,
        values: Option<&[T]>,
        mut write_elem: impl FnMut(&mut BytesMut, &T),
    ) -> &mut Self {
        if let Some(values) = values {
            self.buf.put_u16_le(id);
            let size_pos = self.reserve_size();
            write_len(self.buf, values.len());
            for value in values {
                write_elem(self.buf, value);
            }
            self.patch_size(size_pos);
            self.count += 1;
        }
        self
    }

    /// Patches the field count. Must be called once all fields have been written.
    pub fn finish(self) {
        let bytes = self.count.to_le_bytes();
        self.buf[self.count_pos..self.count_pos + 2].copy_from_slice(&bytes);
    }

    fn reserve_size(&mut self) -> usize {
        let pos = self.buf.len();
        self.buf.put_u32_le(0);
        pos
    }

    fn patch_size(&mut self, size_pos: usize) {
        let size = self.buf.len() - size_pos - 4;
        let size = u32::try_from(size).expect("field payloads are smaller than 4 GiB");
        self.buf[size_pos..size_pos + 4].copy_from_slice(&size.to_le_bytes());
    }
}

/// Writes a length-prefixed UTF-8 string, as used for array elements.
pub fn write_string(buf: &mut BytesMut, value: &str) {
    write_len(buf, value.len());
    buf.put_slice(value.as_bytes());
}

fn write_len(buf: &mut BytesMut, len: usize) {
    let len = i32::try_from(len).expect("lengths fit in an i32");
    buf.put_i32_le(len);
}

/// Iterates over the fields of a record, yielding each field's id and payload.
///
/// Each payload is split off as its own [`Bytes`], so a decoder can never read past the end of a
/// field, and unknown fields are skipped by simply ignoring them.
pub struct FieldReader<'a> {
    buf: &'a mut Bytes,
    remaining: u16,
}

impl<'a> FieldReader<'a> {
    /// Reads the field count at the start of a record.
    pub fn new(buf: &'a mut Bytes) -> Result<Self, CodecError> {
        let remaining = read_short(buf)?;
        Ok(Self { buf, remaining })
    }

    /// Returns the next field, or `None` once every declared field has been read.
    pub fn next_field(&mut self) -> Result<Option<(u16, Bytes)>, CodecError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let id = read_short(self.buf)?;
        let size = read_size(self.buf)?;
        ensure_remaining(self.buf, size)?;
        Ok(Some((id, self.buf.split_to(size))))
    }
}

/// Reads a little-endian `u16`.
pub fn read_short(buf: &mut impl Buf) -> Result<u16, CodecError> {
    ensure_remaining(buf, 2)?;
    Ok(buf.get_u16_le())
}

/// Reads a little-endian `i32`.
pub fn read_int(buf: &mut impl Buf) -> Result<i32, CodecError> {
    ensure_remaining(buf, 4)?;
    Ok(buf.get_i32_le())
}

/// Reads a little-endian `i64`.
pub fn read_long(buf: &mut impl Buf) -> Result<i64, CodecError> {
    ensure_remaining(buf, 8)?;
    Ok(buf.get_i64_le())
}

/// Reads a single byte.
pub fn read_byte(buf: &mut impl Buf) -> Result<u8, CodecError> {
    ensure_remaining(buf, 1)?;
    Ok(buf.get_u8())
}

/// Reads a boolean encoded as a single byte.
pub fn read_bool(buf: &mut impl Buf) -> Result<bool, CodecError> {
    Ok(read_byte(buf)? != 0)
}

/// Reads a length-prefixed UTF-8 string.
pub fn read_string(buf: &mut impl Buf) -> Result<String, CodecError> {
    let len = read_size(buf)?;
    read_string_value(buf, len)
}

/// Reads exactly `len` bytes as a UTF-8 string.
pub fn read_string_value(buf: &mut impl Buf, len: usize) -> Result<String, CodecError> {
    ensure_remaining(buf, len)?;
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

/// Reads an array: an element count followed by the elements.
pub fn read_array<T>(
    buf: &mut Bytes,
    mut read_elem: impl FnMut(&mut Bytes) -> Result<T, CodecError>,
) -> Result<Vec<T>, CodecError> {
    let len = read_size(buf)?;
    // Every element takes up at least one byte, which bounds the allocation.
    let mut values = Vec::with_capacity(len.min(buf.remaining()));
    for _ in 0..len {
        values.push(read_elem(buf)?);
    }
    Ok(values)
}

/// Decodes a field payload that holds the whole of a string.
pub fn string_field(field: Bytes) -> Result<String, CodecError> {
    String::from_utf8(field.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

/// Decodes a field payload that holds an `i32`.
pub fn int_field(field_id: u16, mut field: Bytes) -> Result<i32, CodecError> {
    expect_size(field_id, &field, 4)?;
    read_int(&mut field)
}

fn expect_size(field_id: u16, field: &Bytes, expected: usize) -> Result<(), CodecError> {
    if field.len() == expected {
        Ok(())
    } else {
        Err(CodecError::FieldSizeMismatch {
            field_id,
            size: field.len(),
            expected,
        })
    }
}

fn read_size(buf: &mut impl Buf) -> Result<usize, CodecError> {
    let len = read_int(buf)?;
    usize::try_from(len).map_err(|_| CodecError::InvalidLength { len: len.into() })
}

fn ensure_remaining(buf: &impl Buf, needed: usize) -> Result<(), CodecError> {
    let remaining = buf.remaining();
    if remaining < needed {
        Err(CodecError::UnexpectedEof { needed, remaining })
    } else {
        Ok(())
    }
}
