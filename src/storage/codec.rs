//! Binary codec for the persisted matcher blob.
//!
//! A blob is a file header followed by one framed record:
//! - JSON for data (serde)
//! - Length-prefixed format for framing
//! - CRC32 checksum for corruption detection
//! - Version byte for forward compatibility

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

/// Current codec version.
const CODEC_VERSION: u8 = 1;

/// Magic bytes to identify Basalisk blobs.
pub const MAGIC: [u8; 4] = *b"BSLK";

/// Reject records larger than this (64 MiB).
const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// Serializes a value to bytes with checksum.
///
/// Format:
/// ```text
/// [version: 1 byte][length: 4 bytes LE][data: N bytes JSON][crc32: 4 bytes LE]
/// ```
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let data = serde_json::to_vec(value)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("serialization failed: {e}")))?;

    let len = u32::try_from(data.len()).map_err(|_| {
        IoError::new(
            ErrorKind::InvalidData,
            format!("record of {} bytes does not fit a u32 length", data.len()),
        )
    })?;

    let mut hasher = Hasher::new();
    hasher.update(&data);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(1 + 4 + data.len() + 4);
    out.push(CODEC_VERSION);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&data);
    out.extend_from_slice(&crc.to_le_bytes());

    Ok(out)
}

/// Deserializes a value from bytes, verifying checksum.
///
/// # Errors
/// - Returns error if checksum fails (corruption detected)
/// - Returns error if version is unsupported
/// - Returns error if the input is truncated or deserialization fails
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;

    if version[0] != CODEC_VERSION {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("unsupported codec version: {} (expected {})", version[0], CODEC_VERSION),
        ));
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_RECORD_SIZE {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("record size {len} exceeds maximum {MAX_RECORD_SIZE}"),
        ));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;
    let stored_crc = u32::from_le_bytes(crc_bytes);

    let mut hasher = Hasher::new();
    hasher.update(&data);
    let computed_crc = hasher.finalize();

    if stored_crc != computed_crc {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!(
                "CRC mismatch: stored={stored_crc:08x}, computed={computed_crc:08x} (data corrupted)"
            ),
        ));
    }

    serde_json::from_slice(&data)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("deserialization failed: {e}")))
}

/// Write the file header (magic + version).
pub fn write_header(writer: &mut impl Write) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[CODEC_VERSION])?;
    Ok(())
}

/// Read and validate the file header.
pub fn read_header(reader: &mut impl Read) -> IoResult<u8> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;

    if magic != MAGIC {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("invalid magic bytes: expected {MAGIC:?}, got {magic:?}"),
        ));
    }

    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;

    if version[0] != CODEC_VERSION {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("unsupported file version: {} (expected {})", version[0], CODEC_VERSION),
        ));
    }

    Ok(version[0])
}

/// Encodes a whole blob file: header plus one record.
pub fn encode_file<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let mut out = Vec::new();
    write_header(&mut out)?;
    out.extend_from_slice(&encode(value)?);
    Ok(out)
}

/// Decodes a whole blob file, rejecting trailing bytes.
pub fn decode_file<T: DeserializeOwned>(bytes: &[u8]) -> IoResult<T> {
    let mut reader = bytes;
    read_header(&mut reader)?;
    let value = decode(&mut reader)?;
    if !reader.is_empty() {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("{} trailing bytes after record", reader.len()),
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_detects_corruption() {
        let value = "test data".to_string();
        let mut encoded = encode(&value).unwrap();

        // Corrupt a byte in the data section
        encoded[6] ^= 0xFF;

        let mut cursor = Cursor::new(encoded);
        let result: IoResult<String> = decode(&mut cursor);

        let err = result.unwrap_err();
        assert!(err.to_string().contains("CRC") || err.to_string().contains("deserialization"));
    }

    #[test]
    fn test_rejects_oversized_record() {
        // Craft a header claiming huge size
        let mut bad_data = vec![CODEC_VERSION];
        bad_data.extend_from_slice(&(200_000_000u32).to_le_bytes());

        let mut cursor = Cursor::new(bad_data);
        let result: IoResult<String> = decode(&mut cursor);

        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let bytes = encode_file(&vec!["foo".to_string(), "bar".to_string()]).unwrap();
        for cut in [0, 3, 5, 9, bytes.len() - 1] {
            let result: IoResult<Vec<String>> = decode_file(&bytes[..cut]);
            assert!(result.is_err(), "truncation at {cut} should fail");
        }
    }

    #[test]
    fn test_wrong_magic_is_rejected() {
        let mut bytes = encode_file(&"x".to_string()).unwrap();
        bytes[0] = b'K';
        let result: IoResult<String> = decode_file(&bytes);
        assert!(result.unwrap_err().to_string().contains("magic"));
    }

    #[test]
    fn test_trailing_garbage_is_rejected() {
        let mut bytes = encode_file(&"x".to_string()).unwrap();
        bytes.push(0);
        let result: IoResult<String> = decode_file(&bytes);
        assert!(result.unwrap_err().to_string().contains("trailing"));
    }

    #[test]
    fn test_file_roundtrip() {
        let value = vec!["foo".to_string(), "(?i)bar".to_string()];
        let bytes = encode_file(&value).unwrap();
        let decoded: Vec<String> = decode_file(&bytes).unwrap();
        assert_eq!(decoded, value);
    }
}
