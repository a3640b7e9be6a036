//! Schema-less wire message codec.
//!
//! The service speaks a tag/length/value binary format with no published
//! schema: each field is a varint tag `(field_number << 3) | wire_type`
//! followed by a payload whose shape depends on the wire type. Decoding
//! keeps every field it sees, including ones this client does not
//! interpret, so new server-side fields never break a deployed client.
//!
//! [`fields`] names the field numbers the rest of the crate navigates by,
//! so mapping code reads as semantic paths instead of magic numbers.

pub mod fields;

use std::collections::BTreeMap;

use thiserror::Error;

/// Wire type discriminants from the low three tag bits.
const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_BYTES: u8 = 2;
const WIRE_FIXED32: u8 = 5;

/// Errors from decoding a wire buffer.
///
/// Decoding fails only on truncation or an unrecognized wire type; unknown
/// field numbers are retained, never rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("message truncated at byte {offset}")]
    Truncated { offset: usize },
    #[error("unknown wire type {wire_type} for field {field} at byte {offset}")]
    UnknownWireType {
        field: u32,
        wire_type: u8,
        offset: usize,
    },
    #[error("varint longer than 10 bytes at byte {offset}")]
    VarintOverflow { offset: usize },
}

/// One decoded field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Varint(u64),
    Fixed64(u64),
    Bytes(Vec<u8>),
    Fixed32(u32),
}

/// A decoded wire message: field number to the ordered list of values seen
/// for that field. Repeated fields keep their on-the-wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    fields: BTreeMap<u32, Vec<Value>>,
}

impl Message {
    /// Decode a complete buffer into a message.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut fields: BTreeMap<u32, Vec<Value>> = BTreeMap::new();
        let mut pos = 0usize;

        while pos < buf.len() {
            let tag_offset = pos;
            let (tag, used) = read_varint(buf, pos)?;
            pos += used;
            let field = (tag >> 3) as u32;
            let wire_type = (tag & 0x7) as u8;

            let value = match wire_type {
                WIRE_VARINT => {
                    let (v, used) = read_varint(buf, pos)?;
                    pos += used;
                    Value::Varint(v)
                }
                WIRE_FIXED64 => {
                    let bytes = take(buf, pos, 8)?;
                    pos += 8;
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(bytes);
                    Value::Fixed64(u64::from_le_bytes(raw))
                }
                WIRE_BYTES => {
                    let (len, used) = read_varint(buf, pos)?;
                    pos += used;
                    let len = len as usize;
                    let bytes = take(buf, pos, len)?;
                    pos += len;
                    Value::Bytes(bytes.to_vec())
                }
                WIRE_FIXED32 => {
                    let bytes = take(buf, pos, 4)?;
                    pos += 4;
                    let mut raw = [0u8; 4];
                    raw.copy_from_slice(bytes);
                    Value::Fixed32(u32::from_le_bytes(raw))
                }
                other => {
                    return Err(WireError::UnknownWireType {
                        field,
                        wire_type: other,
                        offset: tag_offset,
                    })
                }
            };

            fields.entry(field).or_default().push(value);
        }

        Ok(Self { fields })
    }

    /// Re-encode the message. Fields are written in ascending field-number
    /// order; decoders make no ordering assumptions so this is sufficient
    /// for round-tripping.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = MessageBuilder::new();
        for (&field, values) in &self.fields {
            for value in values {
                match value {
                    Value::Varint(v) => out.varint(field, *v),
                    Value::Fixed64(v) => out.fixed64(field, *v),
                    Value::Bytes(b) => out.bytes(field, b),
                    Value::Fixed32(v) => out.fixed32(field, *v),
                };
            }
        }
        out.finish()
    }

    /// True if the field appeared at least once.
    pub fn has(&self, field: u32) -> bool {
        self.fields.contains_key(&field)
    }

    /// First value of a field, whatever its wire type.
    pub fn first(&self, field: u32) -> Option<&Value> {
        self.fields.get(&field).and_then(|v| v.first())
    }

    /// First varint value of a field.
    pub fn uint(&self, field: u32) -> Option<u64> {
        match self.first(field) {
            Some(Value::Varint(v)) => Some(*v),
            _ => None,
        }
    }

    /// First varint value reinterpreted as a signed 64-bit integer.
    pub fn int64(&self, field: u32) -> Option<i64> {
        self.uint(field).map(|v| v as i64)
    }

    /// First 4-byte fixed value of a field.
    pub fn fixed32(&self, field: u32) -> Option<u32> {
        match self.first(field) {
            Some(Value::Fixed32(v)) => Some(*v),
            _ => None,
        }
    }

    /// First length-delimited value of a field.
    pub fn bytes(&self, field: u32) -> Option<&[u8]> {
        match self.first(field) {
            Some(Value::Bytes(b)) => Some(b.as_slice()),
            _ => None,
        }
    }

    /// First length-delimited value of a field as UTF-8 text.
    pub fn str(&self, field: u32) -> Option<&str> {
        self.bytes(field).and_then(|b| std::str::from_utf8(b).ok())
    }

    /// First length-delimited value of a field, decoded as a nested message.
    /// Returns `None` when the field is absent or its payload does not decode.
    pub fn message(&self, field: u32) -> Option<Message> {
        self.bytes(field).and_then(|b| Message::decode(b).ok())
    }

    /// Every repeated length-delimited value of a field that decodes as a
    /// nested message. Values that fail to decode are silently dropped;
    /// callers that care about per-item failures inspect [`Self::bytes_all`].
    pub fn messages(&self, field: u32) -> Vec<Message> {
        self.bytes_all(field)
            .into_iter()
            .filter_map(|b| Message::decode(b).ok())
            .collect()
    }

    /// Every length-delimited value of a field, raw.
    pub fn bytes_all(&self, field: u32) -> Vec<&[u8]> {
        self.fields
            .get(&field)
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| match v {
                        Value::Bytes(b) => Some(b.as_slice()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Walk a nested field path, decoding each step as a message.
    pub fn message_at(&self, path: &[u32]) -> Option<Message> {
        let (&first, rest) = path.split_first()?;
        let mut current = self.message(first)?;
        for &field in rest {
            current = current.message(field)?;
        }
        Some(current)
    }

    /// Iterate `(field, values)` pairs in field-number order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &[Value])> {
        self.fields.iter().map(|(&f, v)| (f, v.as_slice()))
    }

    /// Number of distinct field numbers present.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

fn take(buf: &[u8], pos: usize, len: usize) -> Result<&[u8], WireError> {
    // Hostile inputs can declare lengths near usize::MAX; the end offset
    // must be computed without overflowing.
    match pos.checked_add(len) {
        Some(end) if end <= buf.len() => Ok(&buf[pos..end]),
        _ => Err(WireError::Truncated { offset: buf.len() }),
    }
}

fn read_varint(buf: &[u8], start: usize) -> Result<(u64, usize), WireError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    let mut pos = start;
    loop {
        if pos >= buf.len() {
            return Err(WireError::Truncated { offset: buf.len() });
        }
        if pos - start >= 10 {
            return Err(WireError::VarintOverflow { offset: start });
        }
        let byte = buf[pos];
        pos += 1;
        // Bits past 64 are discarded, matching lenient decoders elsewhere.
        if shift < 64 {
            value |= u64::from(byte & 0x7f) << shift;
        }
        if byte & 0x80 == 0 {
            return Ok((value, pos - start));
        }
        shift += 7;
    }
}

/// Append-only encoder mirroring the tag scheme of [`Message::decode`].
///
/// Request payloads are built with nested builders; no canonical field
/// ordering is required of the server, so fields are emitted in call order.
#[derive(Debug, Default)]
pub struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn tag(&mut self, field: u32, wire_type: u8) -> &mut Self {
        self.raw_varint((u64::from(field) << 3) | u64::from(wire_type));
        self
    }

    fn raw_varint(&mut self, mut v: u64) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    pub fn varint(&mut self, field: u32, v: u64) -> &mut Self {
        self.tag(field, WIRE_VARINT);
        self.raw_varint(v);
        self
    }

    pub fn fixed64(&mut self, field: u32, v: u64) -> &mut Self {
        self.tag(field, WIRE_FIXED64);
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn fixed32(&mut self, field: u32, v: u32) -> &mut Self {
        self.tag(field, WIRE_FIXED32);
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn bytes(&mut self, field: u32, b: &[u8]) -> &mut Self {
        self.tag(field, WIRE_BYTES);
        self.raw_varint(b.len() as u64);
        self.buf.extend_from_slice(b);
        self
    }

    pub fn str(&mut self, field: u32, s: &str) -> &mut Self {
        self.bytes(field, s.as_bytes())
    }

    /// Append a nested message built by the closure.
    pub fn nested(&mut self, field: u32, f: impl FnOnce(&mut MessageBuilder)) -> &mut Self {
        let mut inner = MessageBuilder::new();
        f(&mut inner);
        let inner = inner.finish();
        self.bytes(field, &inner)
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}
