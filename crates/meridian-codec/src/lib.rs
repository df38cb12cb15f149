//! Meridian Value Codec
//!
//! The tagged value type carried by the distributed map and the
//! geospatial pub/sub layer, plus its wire encoding.
//!
//! # Wire Format
//!
//! One tag byte followed by a type-specific payload:
//!
//! ```text
//! TAG  TYPE     PAYLOAD
//! 0x00 Nil      (empty)
//! 0x01 Bool     1 byte (0 or 1)
//! 0x02 Int      8 bytes, big-endian i64
//! 0x03 Double   8 bytes, big-endian IEEE-754 bits
//! 0x04 String   4-byte big-endian length + UTF-8 bytes
//! 0x05 Binary   4-byte big-endian length + raw bytes
//! ```
//!
//! `decode(encode(v)) == v` for every valid value. Unknown tags and
//! short payloads fail with typed errors; trailing bytes are rejected.

mod value;

pub use value::Value;

use thiserror::Error;

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Errors that can occur while decoding a value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The tag byte does not name a known value type.
    #[error("unknown value tag: {0:#04x}")]
    UnknownTag(u8),

    /// The payload ended before the declared length.
    #[error("truncated value: needed {needed} more bytes")]
    Truncated { needed: usize },

    /// Bytes remained after a complete value was decoded.
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    /// A string payload was not valid UTF-8.
    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,
}

const TAG_NIL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_DOUBLE: u8 = 0x03;
const TAG_STRING: u8 = 0x04;
const TAG_BINARY: u8 = 0x05;

/// Encode a value into its wire form.
pub fn encode(value: &Value) -> Vec<u8> {
    match value {
        Value::Nil => vec![TAG_NIL],
        Value::Bool(b) => vec![TAG_BOOL, u8::from(*b)],
        Value::Int(i) => {
            let mut buf = Vec::with_capacity(9);
            buf.push(TAG_INT);
            buf.extend_from_slice(&i.to_be_bytes());
            buf
        }
        Value::Double(d) => {
            let mut buf = Vec::with_capacity(9);
            buf.push(TAG_DOUBLE);
            buf.extend_from_slice(&d.to_bits().to_be_bytes());
            buf
        }
        Value::String(s) => encode_len_prefixed(TAG_STRING, s.as_bytes()),
        Value::Binary(b) => encode_len_prefixed(TAG_BINARY, b),
    }
}

fn encode_len_prefixed(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.push(tag);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Decode a value from its wire form.
///
/// The input must contain exactly one encoded value.
pub fn decode(bytes: &[u8]) -> Result<Value> {
    let mut cursor = Cursor { bytes, pos: 0 };
    let value = cursor.read_value()?;
    let rest = bytes.len() - cursor.pos;
    if rest > 0 {
        return Err(CodecError::TrailingBytes(rest));
    }
    Ok(value)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let remaining = self.bytes.len() - self.pos;
        if remaining < n {
            return Err(CodecError::Truncated {
                needed: n - remaining,
            });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn read_value(&mut self) -> Result<Value> {
        let tag = self.take(1)?[0];
        match tag {
            TAG_NIL => Ok(Value::Nil),
            TAG_BOOL => Ok(Value::Bool(self.take(1)?[0] != 0)),
            TAG_INT => {
                let bytes = self.take(8)?;
                Ok(Value::Int(i64::from_be_bytes(bytes.try_into().unwrap())))
            }
            TAG_DOUBLE => {
                let bytes = self.take(8)?;
                let bits = u64::from_be_bytes(bytes.try_into().unwrap());
                Ok(Value::Double(f64::from_bits(bits)))
            }
            TAG_STRING => {
                let len = self.read_u32()? as usize;
                let bytes = self.take(len)?;
                let s = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
                Ok(Value::String(s.to_owned()))
            }
            TAG_BINARY => {
                let len = self.read_u32()? as usize;
                Ok(Value::Binary(self.take(len)?.to_vec()))
            }
            other => Err(CodecError::UnknownTag(other)),
        }
    }
}
