//! Minimal protobuf wire codec.
//!
//! Only the primitives the vehicle actually uses are supported: varints, length-delimited
//! spans and the two fixed-width types (kept as raw little-endian bytes). Nested messages
//! are not decoded eagerly; callers run [`parse_fields`] again on a length-delimited value
//! when they need to look inside it.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// A varint never needs more than 10 groups for a `u64`.
const MAX_VARINT_GROUPS: usize = 10;

/// The encoding category carried in the low three bits of a field tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Varint,
    Fixed64,
    LengthDelimited,
    Fixed32,
}

impl WireType {
    /// Map the raw tag bits, rejecting group markers (3/4) and unknown values.
    pub fn from_bits(bits: u8, offset: usize) -> Result<Self> {
        match bits {
            0 => Ok(WireType::Varint),
            1 => Ok(WireType::Fixed64),
            2 => Ok(WireType::LengthDelimited),
            5 => Ok(WireType::Fixed32),
            other => Err(Error::UnsupportedWireType { wire_type: other, offset }),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            WireType::Varint => 0,
            WireType::Fixed64 => 1,
            WireType::LengthDelimited => 2,
            WireType::Fixed32 => 5,
        }
    }
}

/// The value of a decoded field. Length-delimited values borrow from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue<'a> {
    Varint(u64),
    Fixed64([u8; 8]),
    Bytes(&'a [u8]),
    Fixed32([u8; 4]),
}

impl FieldValue<'_> {
    pub fn wire_type(&self) -> WireType {
        match self {
            FieldValue::Varint(_) => WireType::Varint,
            FieldValue::Fixed64(_) => WireType::Fixed64,
            FieldValue::Bytes(_) => WireType::LengthDelimited,
            FieldValue::Fixed32(_) => WireType::Fixed32,
        }
    }
}

/// One decoded protobuf field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field<'a> {
    pub number: u32,
    pub value: FieldValue<'a>,
}

/// Fields of one message scope, keyed by field number. A repeated number keeps the last
/// occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMessage<'a> {
    fields: BTreeMap<u32, FieldValue<'a>>,
}

impl<'a> ParsedMessage<'a> {
    pub fn get(&self, number: u32) -> Option<&FieldValue<'a>> {
        self.fields.get(&number)
    }

    pub fn contains(&self, number: u32) -> bool {
        self.fields.contains_key(&number)
    }

    /// The field's value if it is present and varint-encoded.
    pub fn varint(&self, number: u32) -> Option<u64> {
        match self.fields.get(&number) {
            Some(FieldValue::Varint(value)) => Some(*value),
            _ => None,
        }
    }

    /// The field's bytes if it is present and length-delimited.
    pub fn bytes(&self, number: u32) -> Option<&'a [u8]> {
        match self.fields.get(&number) {
            Some(FieldValue::Bytes(bytes)) => Some(bytes),
            _ => None,
        }
    }

    pub fn field_numbers(&self) -> Vec<u32> {
        self.fields.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Read a base-128 varint starting at `offset`, returning the value and bytes consumed.
pub fn read_varint(buffer: &[u8], offset: usize) -> Result<(u64, usize)> {
    let mut value = 0u64;
    for (i, byte) in buffer.iter().skip(offset).take(MAX_VARINT_GROUPS).enumerate() {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(Error::MalformedVarint { offset })
}

/// Read one field at `offset`, returning it together with the offset just past it.
///
/// A length-delimited value whose declared length runs past the end of the buffer yields
/// whatever bytes are available; responses reassembled from notifications can be cut short
/// and the leading fields are still worth having.
pub fn read_field(buffer: &[u8], offset: usize) -> Result<(Field<'_>, usize)> {
    let (tag, tag_len) = read_varint(buffer, offset)?;
    let wire_type = WireType::from_bits((tag & 0x07) as u8, offset)?;
    let number = u32::try_from(tag >> 3).map_err(|_| Error::MalformedVarint { offset })?;
    if number == 0 {
        return Err(Error::InvalidFieldNumber { offset });
    }
    let mut pos = offset + tag_len;

    let value = match wire_type {
        WireType::Varint => {
            let (value, len) = read_varint(buffer, pos)?;
            pos += len;
            FieldValue::Varint(value)
        }
        WireType::LengthDelimited => {
            let (len, len_len) = read_varint(buffer, pos)?;
            pos += len_len;
            let end = usize::try_from(len)
                .ok()
                .and_then(|len| pos.checked_add(len))
                .map_or(buffer.len(), |end| end.min(buffer.len()));
            let bytes = &buffer[pos..end];
            pos = end;
            FieldValue::Bytes(bytes)
        }
        WireType::Fixed32 => {
            let bytes = read_fixed::<4>(buffer, pos)?;
            pos += 4;
            FieldValue::Fixed32(bytes)
        }
        WireType::Fixed64 => {
            let bytes = read_fixed::<8>(buffer, pos)?;
            pos += 8;
            FieldValue::Fixed64(bytes)
        }
    };

    Ok((Field { number, value }, pos))
}

fn read_fixed<const N: usize>(buffer: &[u8], offset: usize) -> Result<[u8; N]> {
    buffer
        .get(offset..offset + N)
        .and_then(|span| span.try_into().ok())
        .ok_or(Error::TruncatedField {
            offset,
            needed: N,
            available: buffer.len().saturating_sub(offset),
        })
}

/// Decode fields in wire order until the buffer is exhausted or a field fails to decode.
///
/// A decode failure ends the walk and the fields read so far are returned.
pub fn read_fields(buffer: &[u8]) -> Vec<Field<'_>> {
    let mut fields = Vec::new();
    let mut offset = 0;
    while offset < buffer.len() {
        match read_field(buffer, offset) {
            Ok((field, next)) => {
                fields.push(field);
                offset = next;
            }
            Err(err) => {
                tracing::trace!(offset, %err, "stopped decoding fields");
                break;
            }
        }
    }
    fields
}

/// Decode a message scope into a field map, with the same best-effort stopping rule as
/// [`read_fields`].
pub fn parse_fields(buffer: &[u8]) -> ParsedMessage<'_> {
    ParsedMessage {
        fields: read_fields(buffer).into_iter().map(|field| (field.number, field.value)).collect(),
    }
}

pub fn write_varint(mut value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_VARINT_GROUPS);
    while value > 0x7f {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
    out
}

pub fn write_tag(number: u32, wire_type: WireType) -> Vec<u8> {
    write_varint((u64::from(number) << 3) | u64::from(wire_type.bits()))
}

/// Length prefix followed by the payload, without a tag.
pub fn write_length_delimited(payload: &[u8]) -> Vec<u8> {
    let mut out = write_varint(payload.len() as u64);
    out.extend_from_slice(payload);
    out
}

/// Tag, length and payload of a length-delimited field.
pub fn write_bytes_field(number: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = write_tag(number, WireType::LengthDelimited);
    out.extend(write_length_delimited(payload));
    out
}

pub fn write_varint_field(number: u32, value: u64) -> Vec<u8> {
    let mut out = write_tag(number, WireType::Varint);
    out.extend(write_varint(value));
    out
}

pub fn write_fixed32_field(number: u32, value: u32) -> Vec<u8> {
    let mut out = write_tag(number, WireType::Fixed32);
    out.extend_from_slice(&value.to_le_bytes());
    out
}
