//! Record log frame format with varint encoding and CRC32C checksumming.
//!
//! Frame format:
//! - id: varint
//! - flags: u8 (bit 0 = tombstone, 1-7 reserved)
//! - text_len: varint
//! - dim: varint
//! - text: bytes[text_len] (UTF-8)
//! - vector: f32[dim] (little-endian)
//! - crc32c: u32 (little-endian, over everything above)
//!
//! Tombstone frames carry an empty text and a zero-length vector.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },
    #[error("Invalid UTF-8 in record text")]
    InvalidText,
    #[error("Incomplete record")]
    Incomplete,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Flags: u8 {
        const TOMBSTONE = 0b0000_0001;
    }
}

/// A decoded log frame: either a stored embedding or a tombstone.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub id: u64,
    pub tombstone: bool,
    pub text: String,
    pub vector: Vec<f32>,
}

impl LogRecord {
    /// Creates a new PUT frame.
    pub fn put(id: u64, text: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            id,
            tombstone: false,
            text: text.into(),
            vector,
        }
    }

    /// Creates a new DELETE frame (tombstone).
    pub fn delete(id: u64) -> Self {
        Self {
            id,
            tombstone: true,
            text: String::new(),
            vector: Vec::new(),
        }
    }

    /// Encodes the frame into bytes with CRC32C checksum.
    pub fn encode(&self) -> Bytes {
        encode_frame(self.id, self.tombstone, &self.text, &self.vector)
    }

    /// Decodes a frame from bytes, validating the CRC32C checksum.
    ///
    /// Returns the frame and the number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), RecordError> {
        if data.len() < 8 {
            return Err(RecordError::Incomplete);
        }

        let mut cursor = data;

        let id = decode_varint(&mut cursor)?;
        if cursor.is_empty() {
            return Err(RecordError::Incomplete);
        }
        let flags = Flags::from_bits_truncate(cursor[0]);
        cursor.advance(1);
        let text_len = decode_varint(&mut cursor)? as usize;
        let dim = decode_varint(&mut cursor)? as usize;

        let vector_bytes = dim.checked_mul(4).ok_or(RecordError::Incomplete)?;
        if cursor.len() < text_len.saturating_add(vector_bytes).saturating_add(4) {
            return Err(RecordError::Incomplete);
        }

        let text_bytes = &cursor[..text_len];
        cursor.advance(text_len);

        let mut vector = Vec::with_capacity(dim);
        for _ in 0..dim {
            vector.push(cursor.get_f32_le());
        }

        // Verify CRC before trusting the text bytes
        let bytes_consumed = data.len() - cursor.len() + 4;
        let stored_crc = cursor.get_u32_le();
        let calculated_crc = crc32c::crc32c(&data[..bytes_consumed - 4]);
        if stored_crc != calculated_crc {
            return Err(RecordError::CrcMismatch {
                expected: stored_crc,
                actual: calculated_crc,
            });
        }

        let text = std::str::from_utf8(text_bytes)
            .map_err(|_| RecordError::InvalidText)?
            .to_owned();

        Ok((
            LogRecord {
                id,
                tombstone: flags.contains(Flags::TOMBSTONE),
                text,
                vector,
            },
            bytes_consumed,
        ))
    }
}

/// Encodes a frame from borrowed parts.
///
/// Compaction re-encodes live records straight from the in-memory table, so
/// this avoids cloning text and vectors into a `LogRecord` first.
pub(crate) fn encode_frame(id: u64, tombstone: bool, text: &str, vector: &[f32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(16 + text.len() + vector.len() * 4 + 4);

    encode_varint(&mut buf, id);

    let mut flags = Flags::empty();
    if tombstone {
        flags |= Flags::TOMBSTONE;
    }
    buf.put_u8(flags.bits());

    encode_varint(&mut buf, text.len() as u64);
    encode_varint(&mut buf, vector.len() as u64);

    buf.put_slice(text.as_bytes());
    for &v in vector {
        buf.put_f32_le(v);
    }

    let crc = crc32c::crc32c(&buf);
    buf.put_u32_le(crc);

    buf.freeze()
}

/// Encodes a u64 as a varint (LEB128).
fn encode_varint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decodes a varint (LEB128) from bytes.
fn decode_varint(data: &mut &[u8]) -> Result<u64, RecordError> {
    let mut result = 0u64;
    let mut shift = 0;

    loop {
        if data.is_empty() {
            return Err(RecordError::Incomplete);
        }

        let byte = data[0];
        data.advance(1);

        if shift >= 64 {
            return Err(io::Error::new(ErrorKind::InvalidData, "varint overflow").into());
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if byte & 0x80 == 0 {
            break;
        }

        shift += 7;
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_encoding() {
        for value in [0u64, 127, 128, 255, 16383, 16384, u64::MAX] {
            let mut buf = BytesMut::new();
            encode_varint(&mut buf, value);
            let mut slice = &buf[..];
            let decoded = decode_varint(&mut slice).unwrap();
            assert_eq!(value, decoded, "varint roundtrip failed for {}", value);
        }
    }

    #[test]
    fn test_put_roundtrip() {
        let record = LogRecord::put(42, "the cat sat", vec![1.0, -0.5, 0.25]);
        let encoded = record.encode();
        let (decoded, size) = LogRecord::decode(&encoded).unwrap();

        assert_eq!(record, decoded);
        assert_eq!(size, encoded.len());
    }

    #[test]
    fn test_delete_roundtrip() {
        let record = LogRecord::delete(7);
        let encoded = record.encode();
        let (decoded, size) = LogRecord::decode(&encoded).unwrap();

        assert!(decoded.tombstone);
        assert_eq!(decoded.id, 7);
        assert!(decoded.vector.is_empty());
        assert_eq!(size, encoded.len());
    }

    #[test]
    fn test_consecutive_frames() {
        let mut buf = BytesMut::new();
        buf.put_slice(&LogRecord::put(1, "a", vec![1.0]).encode());
        buf.put_slice(&LogRecord::put(2, "b", vec![2.0]).encode());

        let (first, n) = LogRecord::decode(&buf).unwrap();
        let (second, _) = LogRecord::decode(&buf[n..]).unwrap();
        assert_eq!(first.text, "a");
        assert_eq!(second.id, 2);
    }

    #[test]
    fn test_crc_mismatch() {
        let encoded = LogRecord::put(1, "test", vec![1.0, 2.0]).encode();

        let mut corrupted = encoded.to_vec();
        corrupted[5] ^= 0xFF;

        let result = LogRecord::decode(&corrupted);
        assert!(matches!(result, Err(RecordError::CrcMismatch { .. })));
    }

    #[test]
    fn test_incomplete_record() {
        let encoded = LogRecord::put(1, "key", vec![1.0, 2.0, 3.0]).encode();

        for cut in [0, 5, encoded.len() - 1] {
            let result = LogRecord::decode(&encoded[..cut]);
            assert!(matches!(result, Err(RecordError::Incomplete)), "cut at {}", cut);
        }
    }

    #[test]
    fn test_unicode_text() {
        let record = LogRecord::put(3, "naïve café 東京", vec![0.0; 4]);
        let (decoded, _) = LogRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded.text, "naïve café 東京");
    }
}
