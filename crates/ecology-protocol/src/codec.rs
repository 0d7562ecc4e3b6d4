//! Tagged binary codec for value sequences.
//!
//! The encoded format is:
//! - a type-tag string, one ASCII tag per top-level value (containers nest
//!   their element tags between delimiters), NUL-terminated and padded with
//!   NUL to a 4-byte boundary;
//! - the payload of every value, depth first, in tag order.
//!
//! All multi-byte numbers are big-endian. Strings are NUL-terminated and
//! padded to 4 bytes; blobs carry a 4-byte length and are padded to 4 bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::value::Value;

/// Maximum encoded message size (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Maximum container nesting accepted by the encoder and the decoder.
pub const MAX_NESTING_DEPTH: usize = 32;

/// Errors that can occur during encoding/decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The value has no wire representation.
    #[error("Unsupported value type {kind}: {reason}")]
    UnsupportedValueType {
        /// Variant of the rejected value.
        kind: &'static str,
        /// Why it cannot be encoded.
        reason: &'static str,
    },

    /// The buffer ended early.
    #[error("Truncated input")]
    TruncatedInput,

    /// Unknown or misplaced tag character.
    #[error("Unsupported tag {0:?}")]
    UnsupportedTag(char),

    /// Containers nested deeper than [`MAX_NESTING_DEPTH`].
    #[error("Nesting deeper than {0} levels")]
    NestingTooDeep(usize),

    /// Encoded output exceeds [`MAX_MESSAGE_SIZE`].
    #[error("Message size {0} exceeds maximum {MAX_MESSAGE_SIZE}")]
    MessageTooLarge(usize),

    /// A payload was well framed but its content is invalid.
    #[error("Invalid payload: {0}")]
    InvalidPayload(&'static str),

    /// Envelope routing trailer is missing or has the wrong shape.
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(&'static str),
}

/// Round `len` up to the next multiple of four.
#[inline]
#[must_use]
pub const fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

/// Encode a sequence of values to bytes.
///
/// # Errors
///
/// Returns an error if any value cannot be represented; nothing is produced
/// in that case.
pub fn encode(values: &[Value]) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    encode_into(values, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a sequence of values, appending to an existing buffer.
///
/// `buf` is left untouched when an error is returned.
///
/// # Errors
///
/// Returns an error if any value cannot be represented or the result is too
/// large.
pub fn encode_into(values: &[Value], buf: &mut BytesMut) -> Result<(), CodecError> {
    let mut tags = String::with_capacity(values.len() + 1);
    let mut payload = BytesMut::new();

    for value in values {
        write_value(value, &mut tags, &mut payload, 0)?;
    }

    let header_len = padded_len(tags.len() + 1);
    let total = header_len + payload.len();
    if total > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(total));
    }

    buf.reserve(total);
    buf.put_slice(tags.as_bytes());
    buf.put_bytes(0, header_len - tags.len());
    buf.put_slice(&payload);

    Ok(())
}

fn write_value(
    value: &Value,
    tags: &mut String,
    payload: &mut BytesMut,
    depth: usize,
) -> Result<(), CodecError> {
    tags.push(value.tag());

    match value {
        Value::Int32(v) => payload.put_i32(*v),
        Value::UInt32(v) => {
            let v = u32::try_from(*v).map_err(|_| CodecError::UnsupportedValueType {
                kind: "uint32",
                reason: "value does not fit in 32 bits",
            })?;
            payload.put_u32(v);
        }
        Value::Int64(v) => payload.put_i64(*v),
        Value::Float32(v) => payload.put_f32(*v),
        Value::Float64(v) => payload.put_f64(*v),
        Value::String(s) => put_str(payload, s, "string")?,
        Value::Blob(b) => {
            let len = u32::try_from(b.len()).map_err(|_| CodecError::UnsupportedValueType {
                kind: "blob",
                reason: "length does not fit in 32 bits",
            })?;
            payload.put_u32(len);
            payload.put_slice(b);
            payload.put_bytes(0, padded_len(b.len()) - b.len());
        }
        Value::Char(c) if c.is_ascii() => payload.put_i32(*c as i32),
        Value::Char(c) => {
            let mut utf8 = [0u8; 4];
            put_str(payload, c.encode_utf8(&mut utf8), "char")?;
        }
        Value::Bool(_) | Value::Null => {}
        Value::List(items) => {
            if depth >= MAX_NESTING_DEPTH {
                return Err(CodecError::NestingTooDeep(MAX_NESTING_DEPTH));
            }
            for item in items {
                write_value(item, tags, payload, depth + 1)?;
            }
            tags.push(']');
        }
        Value::Map(entries) => {
            if depth >= MAX_NESTING_DEPTH {
                return Err(CodecError::NestingTooDeep(MAX_NESTING_DEPTH));
            }
            for (key, value) in entries {
                write_value(key, tags, payload, depth + 1)?;
                write_value(value, tags, payload, depth + 1)?;
            }
            tags.push('}');
        }
    }

    Ok(())
}

fn put_str(payload: &mut BytesMut, s: &str, kind: &'static str) -> Result<(), CodecError> {
    if s.as_bytes().contains(&0) {
        return Err(CodecError::UnsupportedValueType {
            kind,
            reason: "contains a NUL byte",
        });
    }
    payload.put_slice(s.as_bytes());
    payload.put_bytes(0, padded_len(s.len() + 1) - s.len());
    Ok(())
}

/// Decode a sequence of values from bytes.
///
/// Bytes following the last payload are ignored.
///
/// # Errors
///
/// Returns an error if the data is truncated, carries an unknown tag, or is
/// otherwise malformed.
pub fn decode(data: &[u8]) -> Result<Vec<Value>, CodecError> {
    let tag_len = data
        .iter()
        .position(|&b| b == 0)
        .ok_or(CodecError::TruncatedInput)?;
    let header_len = padded_len(tag_len + 1);
    if data.len() < header_len {
        return Err(CodecError::TruncatedInput);
    }

    let mut tags = TagCursor {
        tags: &data[..tag_len],
        pos: 0,
    };
    let mut payload = &data[header_len..];
    let mut values = Vec::with_capacity(tag_len);

    while let Some(tag) = tags.next_tag() {
        values.push(read_value(tag, &mut tags, &mut payload, 0)?);
    }

    Ok(values)
}

struct TagCursor<'a> {
    tags: &'a [u8],
    pos: usize,
}

impl TagCursor<'_> {
    fn next_tag(&mut self) -> Option<u8> {
        let tag = self.tags.get(self.pos).copied();
        if tag.is_some() {
            self.pos += 1;
        }
        tag
    }
}

#[inline]
fn need(buf: &[u8], len: usize) -> Result<(), CodecError> {
    if buf.len() < len {
        Err(CodecError::TruncatedInput)
    } else {
        Ok(())
    }
}

fn read_value(
    tag: u8,
    tags: &mut TagCursor<'_>,
    buf: &mut &[u8],
    depth: usize,
) -> Result<Value, CodecError> {
    let value = match tag {
        b'i' => {
            need(buf, 4)?;
            Value::Int32(buf.get_i32())
        }
        b'u' => {
            need(buf, 4)?;
            Value::UInt32(u64::from(buf.get_u32()))
        }
        b'h' => {
            need(buf, 8)?;
            Value::Int64(buf.get_i64())
        }
        b'f' => {
            need(buf, 4)?;
            Value::Float32(buf.get_f32())
        }
        b'd' => {
            need(buf, 8)?;
            Value::Float64(buf.get_f64())
        }
        b's' => Value::String(read_str(buf)?.to_string()),
        b'b' => {
            need(buf, 4)?;
            let len = buf.get_u32() as usize;
            let padded = padded_len(len);
            need(buf, padded)?;
            let blob = Bytes::copy_from_slice(&buf[..len]);
            buf.advance(padded);
            Value::Blob(blob)
        }
        b'c' => {
            need(buf, 4)?;
            let code = buf.get_i32();
            let c = u32::try_from(code)
                .ok()
                .and_then(char::from_u32)
                .ok_or(CodecError::InvalidPayload("char code point"))?;
            Value::Char(c)
        }
        b'C' => {
            let s = read_str(buf)?;
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Value::Char(c),
                _ => return Err(CodecError::InvalidPayload("char must be one code point")),
            }
        }
        b'T' => Value::Bool(true),
        b'F' => Value::Bool(false),
        b'N' => Value::Null,
        b'[' => {
            if depth >= MAX_NESTING_DEPTH {
                return Err(CodecError::NestingTooDeep(MAX_NESTING_DEPTH));
            }
            let mut items = Vec::new();
            loop {
                match tags.next_tag() {
                    None => return Err(CodecError::TruncatedInput),
                    Some(b']') => break,
                    Some(t) => items.push(read_value(t, tags, buf, depth + 1)?),
                }
            }
            Value::List(items)
        }
        b'{' => {
            if depth >= MAX_NESTING_DEPTH {
                return Err(CodecError::NestingTooDeep(MAX_NESTING_DEPTH));
            }
            let mut entries = Vec::new();
            loop {
                let key = match tags.next_tag() {
                    None => return Err(CodecError::TruncatedInput),
                    Some(b'}') => break,
                    Some(t) => read_value(t, tags, buf, depth + 1)?,
                };
                let value = match tags.next_tag() {
                    None => return Err(CodecError::TruncatedInput),
                    Some(b'}') => return Err(CodecError::UnsupportedTag('}')),
                    Some(t) => read_value(t, tags, buf, depth + 1)?,
                };
                entries.push((key, value));
            }
            Value::Map(entries)
        }
        other => return Err(CodecError::UnsupportedTag(char::from(other))),
    };

    Ok(value)
}

fn read_str<'a>(buf: &mut &'a [u8]) -> Result<&'a str, CodecError> {
    let data: &'a [u8] = *buf;
    let len = data
        .iter()
        .position(|&b| b == 0)
        .ok_or(CodecError::TruncatedInput)?;
    let padded = padded_len(len + 1);
    need(data, padded)?;
    let s = std::str::from_utf8(&data[..len]).map_err(|_| CodecError::InvalidPayload("utf-8"))?;
    *buf = &data[padded..];
    Ok(s)
}
