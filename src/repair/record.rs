use rusqlite::types::Value;
use thiserror::Error;

/// Text encoding declared in the database header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Utf16Le,
    Utf16Be,
}

impl TextEncoding {
    pub fn from_header(raw: u32) -> Self {
        match raw {
            2 => TextEncoding::Utf16Le,
            3 => TextEncoding::Utf16Be,
            _ => TextEncoding::Utf8,
        }
    }

    fn decode(self, bytes: &[u8]) -> String {
        match self {
            TextEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            TextEncoding::Utf16Le | TextEncoding::Utf16Be => {
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| match self {
                        TextEncoding::Utf16Le => u16::from_le_bytes([pair[0], pair[1]]),
                        _ => u16::from_be_bytes([pair[0], pair[1]]),
                    })
                    .collect();
                String::from_utf16_lossy(&units)
            }
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordFault {
    #[error("record header is truncated")]
    Header,
    #[error("reserved serial type {0}")]
    SerialType(u64),
    #[error("record body is shorter than its header declares")]
    Body,
}

/// Decodes a SQLite varint. Returns the value and the bytes consumed.
pub fn read_varint(buf: &[u8]) -> Option<(u64, usize)> {
    if buf.is_empty() {
        return None;
    }

    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate().take(8) {
        if byte & 0x80 == 0 {
            value = (value << 7) | u64::from(byte);
            return Some((value, i + 1));
        }
        value = (value << 7) | u64::from(byte & 0x7F);
    }

    if buf.len() > 8 {
        value = (value << 8) | u64::from(buf[8]);
        Some((value, 9))
    } else {
        None
    }
}

/// Content length of a serial type, `None` for the reserved types 10 and 11.
pub fn serial_type_len(serial_type: u64) -> Option<u64> {
    match serial_type {
        0 | 8 | 9 => Some(0),
        1 => Some(1),
        2 => Some(2),
        3 => Some(3),
        4 => Some(4),
        5 => Some(6),
        6 | 7 => Some(8),
        10 | 11 => None,
        n if n % 2 == 0 => Some((n - 12) / 2),
        n => Some((n - 13) / 2),
    }
}

fn read_signed(bytes: &[u8]) -> i64 {
    let mut value: i64 = if bytes.first().is_some_and(|b| b & 0x80 != 0) {
        -1
    } else {
        0
    };
    for &b in bytes {
        value = (value << 8) | i64::from(b);
    }
    value
}

/// Decodes a full record payload into column values.
pub fn decode_record(payload: &[u8], encoding: TextEncoding) -> Result<Vec<Value>, RecordFault> {
    let (header_len, consumed) = read_varint(payload).ok_or(RecordFault::Header)?;
    let header_len = usize::try_from(header_len).map_err(|_| RecordFault::Header)?;
    if header_len < consumed || header_len > payload.len() {
        return Err(RecordFault::Header);
    }

    let mut serial_types = Vec::new();
    let mut pos = consumed;
    while pos < header_len {
        let (serial, used) = read_varint(&payload[pos..header_len]).ok_or(RecordFault::Header)?;
        serial_types.push(serial);
        pos += used;
    }

    let mut values = Vec::with_capacity(serial_types.len());
    let mut body = header_len;
    for serial in serial_types {
        let len = serial_type_len(serial).ok_or(RecordFault::SerialType(serial))? as usize;
        let end = body.checked_add(len).ok_or(RecordFault::Body)?;
        let bytes = payload.get(body..end).ok_or(RecordFault::Body)?;
        let value = match serial {
            0 => Value::Null,
            1..=6 => Value::Integer(read_signed(bytes)),
            7 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                Value::Real(f64::from_bits(u64::from_be_bytes(raw)))
            }
            8 => Value::Integer(0),
            9 => Value::Integer(1),
            n if n % 2 == 0 => Value::Blob(bytes.to_vec()),
            _ => Value::Text(encoding.decode(bytes)),
        };
        values.push(value);
        body = end;
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn decodes_mixed_record() {
        // header: len 6, types NULL, int8, float, text(3), blob(2)
        let mut payload = vec![6u8, 0, 1, 7, 13 + 2 * 3, 12 + 2 * 2];
        payload.push(0xFE); // -2
        payload.extend_from_slice(&1.5f64.to_bits().to_be_bytes());
        payload.extend_from_slice(b"abc");
        payload.extend_from_slice(&[0xAA, 0xBB]);

        let values = decode_record(&payload, TextEncoding::Utf8).expect("decode");
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Integer(-2),
                Value::Real(1.5),
                Value::Text("abc".into()),
                Value::Blob(vec![0xAA, 0xBB]),
            ]
        );
    }

    #[test]
    fn rejects_body_shorter_than_header() {
        let payload = vec![2u8, 13 + 2 * 10, b'x'];
        assert_eq!(
            decode_record(&payload, TextEncoding::Utf8),
            Err(RecordFault::Body)
        );
    }

    #[test]
    fn rejects_reserved_serial_types() {
        let payload = vec![2u8, 10];
        assert_eq!(
            decode_record(&payload, TextEncoding::Utf8),
            Err(RecordFault::SerialType(10))
        );
    }

    #[test]
    fn utf16_text_is_decoded() {
        let payload = vec![2u8, 13 + 2 * 4, b'h', 0, b'i', 0];
        let values = decode_record(&payload, TextEncoding::Utf16Le).expect("decode");
        assert_eq!(values, vec![Value::Text("hi".into())]);
    }

    proptest! {
        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = decode_record(&bytes, TextEncoding::Utf8);
        }

        #[test]
        fn small_varints_decode(value in 0u64..(1 << 56)) {
            let mut bytes = Vec::new();
            let mut groups = Vec::new();
            let mut v = value;
            loop {
                groups.push((v & 0x7F) as u8);
                v >>= 7;
                if v == 0 {
                    break;
                }
            }
            for (i, group) in groups.iter().rev().enumerate() {
                let more = i + 1 < groups.len();
                bytes.push(if more { group | 0x80 } else { *group });
            }
            prop_assert_eq!(read_varint(&bytes), Some((value, bytes.len())));
        }
    }
}
