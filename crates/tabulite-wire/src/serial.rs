//! Serialization primitives.
//!
//! Variable-length integers use the 7-bit little-endian group encoding:
//! each byte carries 7 payload bits, the high bit marks continuation.
//! `vi32` fields are encoded as the two's-complement `u32` image of the
//! value, `vi64` as the `u64` image, so negative values round-trip.
//!
//! `vstr` is a `vi32` byte length followed by the raw bytes. Fixed-width
//! integers are little-endian.

use bytes::{BufMut, Bytes, BytesMut};
use tabulite_types::{CellKey, QualifiedRangeSpec, RangeSpec, TableId};

use crate::{Result, WireError};

// ============================================================================
// Varints
// ============================================================================

fn put_uvarint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

fn get_uvarint(input: &mut &[u8], width: u32) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    loop {
        let (&byte, rest) = input.split_first().ok_or(WireError::Truncated {
            needed: 1,
            remaining: 0,
        })?;
        *input = rest;
        if shift >= width {
            return Err(WireError::VarintOverflow { width });
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Encodes a 32-bit value as a varint.
pub fn put_vi32(buf: &mut BytesMut, value: i32) {
    put_uvarint(buf, u64::from(value as u32));
}

/// Decodes a 32-bit varint.
pub fn get_vi32(input: &mut &[u8]) -> Result<i32> {
    Ok(get_uvarint(input, 35)? as u32 as i32)
}

/// Encodes a 64-bit value as a varint.
pub fn put_vi64(buf: &mut BytesMut, value: i64) {
    put_uvarint(buf, value as u64);
}

/// Decodes a 64-bit varint.
pub fn get_vi64(input: &mut &[u8]) -> Result<i64> {
    Ok(get_uvarint(input, 70)? as i64)
}

// ============================================================================
// Fixed-width fields
// ============================================================================

pub fn put_i32(buf: &mut BytesMut, value: i32) {
    buf.put_i32_le(value);
}

pub fn get_i32(input: &mut &[u8]) -> Result<i32> {
    take(input, 4).map(|bytes| i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn put_u32(buf: &mut BytesMut, value: u32) {
    buf.put_u32_le(value);
}

pub fn get_u32(input: &mut &[u8]) -> Result<u32> {
    take(input, 4).map(|bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn put_u16(buf: &mut BytesMut, value: u16) {
    buf.put_u16_le(value);
}

pub fn get_u16(input: &mut &[u8]) -> Result<u16> {
    take(input, 2).map(|bytes| u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

pub fn get_bool(input: &mut &[u8]) -> Result<bool> {
    match take(input, 1)?[0] {
        0 => Ok(false),
        1 => Ok(true),
        byte => Err(WireError::InvalidBool(byte)),
    }
}

fn take<'a>(input: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if input.len() < len {
        return Err(WireError::Truncated {
            needed: len - input.len(),
            remaining: input.len(),
        });
    }
    let (head, rest) = input.split_at(len);
    *input = rest;
    Ok(head)
}

// ============================================================================
// Strings and byte strings
// ============================================================================

/// Encodes a byte string: vi32 length followed by the raw bytes.
pub fn put_vstr(buf: &mut BytesMut, value: &[u8]) {
    put_vi32(buf, value.len() as i32);
    buf.put_slice(value);
}

/// Decodes a byte string.
pub fn get_vstr(input: &mut &[u8]) -> Result<Bytes> {
    let len = get_vi32(input)?;
    if len < 0 {
        return Err(WireError::InvalidValue {
            field: "vstr length",
            value: i64::from(len),
        });
    }
    take(input, len as usize).map(Bytes::copy_from_slice)
}

/// Decodes a UTF-8 string field.
pub fn get_vstr_utf8(input: &mut &[u8]) -> Result<String> {
    let bytes = get_vstr(input)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
}

// ============================================================================
// Composite codecs
// ============================================================================

/// Encodes a qualified range spec:
/// `vstr table_id, vi32 generation, vstr start_row, vstr end_row`.
pub fn put_qualified_range(buf: &mut BytesMut, spec: &QualifiedRangeSpec) {
    put_vstr(buf, spec.table.id.as_bytes());
    put_vi32(buf, spec.table.generation as i32);
    put_vstr(buf, &spec.range.start_row);
    put_vstr(buf, &spec.range.end_row);
}

pub fn get_qualified_range(input: &mut &[u8]) -> Result<QualifiedRangeSpec> {
    let id = get_vstr_utf8(input)?;
    let generation = get_vi32(input)? as u32;
    let start_row = get_vstr(input)?;
    let end_row = get_vstr(input)?;
    Ok(QualifiedRangeSpec::new(
        TableId::new(id, generation),
        RangeSpec::new(start_row, end_row),
    ))
}

/// Encodes one `(key, value)` cell pair:
/// `vstr row, vi64 revision, vstr value`.
pub fn put_cell(buf: &mut BytesMut, key: &CellKey, value: &[u8]) {
    put_vstr(buf, &key.row);
    put_vi64(buf, key.revision);
    put_vstr(buf, value);
}

pub fn get_cell(input: &mut &[u8]) -> Result<(CellKey, Bytes)> {
    let row = get_vstr(input)?;
    let revision = get_vi64(input)?;
    let value = get_vstr(input)?;
    Ok((CellKey { row, revision }, value))
}

/// Decodes a raw key/value block: cell pairs back to back until the input
/// is exhausted.
pub fn get_cell_block(mut input: &[u8]) -> Result<Vec<(CellKey, Bytes)>> {
    let mut cells = Vec::new();
    while !input.is_empty() {
        cells.push(get_cell(&mut input)?);
    }
    Ok(cells)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn varint_boundary_values() {
        for value in [0i64, 1, 127, 128, 16_383, 16_384, i64::from(u32::MAX), -1] {
            let mut buf = BytesMut::new();
            put_vi64(&mut buf, value);
            let mut input = &buf[..];
            assert_eq!(get_vi64(&mut input).unwrap(), value);
            assert!(input.is_empty());
        }
    }

    #[test]
    fn truncated_varint_is_an_error() {
        let mut buf = BytesMut::new();
        put_vi64(&mut buf, 1 << 40);
        let mut input = &buf[..buf.len() - 1];
        assert!(matches!(
            get_vi64(&mut input),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn bool_rejects_garbage() {
        let mut input = &[7u8][..];
        assert_eq!(get_bool(&mut input), Err(WireError::InvalidBool(7)));
    }

    proptest! {
        #[test]
        fn vi32_round_trips(value in any::<i32>()) {
            let mut buf = BytesMut::new();
            put_vi32(&mut buf, value);
            let mut input = &buf[..];
            prop_assert_eq!(get_vi32(&mut input).unwrap(), value);
            prop_assert!(input.is_empty());
        }

        #[test]
        fn vi64_round_trips(value in any::<i64>()) {
            let mut buf = BytesMut::new();
            put_vi64(&mut buf, value);
            let mut input = &buf[..];
            prop_assert_eq!(get_vi64(&mut input).unwrap(), value);
        }

        #[test]
        fn vstr_round_trips(value in proptest::collection::vec(any::<u8>(), 0..256)) {
            let mut buf = BytesMut::new();
            put_vstr(&mut buf, &value);
            let mut input = &buf[..];
            let decoded = get_vstr(&mut input).unwrap();
            prop_assert_eq!(decoded.as_ref(), &value[..]);
        }

        #[test]
        fn cell_round_trips(
            row in proptest::collection::vec(any::<u8>(), 0..64),
            revision in any::<i64>(),
            value in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let mut buf = BytesMut::new();
            let key = CellKey::new(row.clone(), revision);
            put_cell(&mut buf, &key, &value);
            let (decoded_key, decoded_value) = get_cell(&mut &buf[..]).unwrap();
            prop_assert_eq!(decoded_key, key);
            prop_assert_eq!(decoded_value.as_ref(), &value[..]);
        }
    }
}
