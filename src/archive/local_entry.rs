use crate::archive::format::{read_u16, read_u32, read_u64};
use crate::codec::CodecId;
use crate::error::{PakError, Result};
use std::io::{Read, Write};

/// LREC signature for local record headers
pub const LOCAL_RECORD_SIGNATURE: [u8; 4] = [0x4C, 0x52, 0x45, 0x43]; // "LREC"

/// Size of the fixed part of a local record header
pub const LOCAL_RECORD_FIXED_SIZE: usize = 32;

/// Offset of the CRC field from the start of the record
pub const LOCAL_RECORD_CRC_OFFSET: u64 = 24;

/// Local Record Header
///
/// Precedes each file's compressed bytes in the archive. The codec id lets a
/// reader decode a record without consulting the central directory.
///
/// Structure (variable length):
/// - Signature: "LREC" (4 bytes)
/// - Codec Id: uint32 (4 bytes)
/// - Compressed Size: uint64 (8 bytes)
/// - Uncompressed Size: uint64 (8 bytes)
/// - CRC32: uint32 (4 bytes)
/// - Path Length: uint16 (2 bytes)
/// - Extra Length: uint16 (2 bytes)
/// - File Path: variable (UTF-8, not terminated)
/// - Extra: variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRecordHeader {
    pub codec: CodecId,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub crc32: u32,
    pub path: String,
    pub extra: Vec<u8>,
}

impl LocalRecordHeader {
    /// Create a new local record header
    pub fn new(
        codec: CodecId,
        compressed_size: u64,
        uncompressed_size: u64,
        crc32: u32,
        path: impl Into<String>,
    ) -> Self {
        Self {
            codec,
            compressed_size,
            uncompressed_size,
            crc32,
            path: path.into(),
            extra: Vec::new(),
        }
    }

    /// Header size for a path with no extra field
    pub fn size_for_path(path: &str) -> usize {
        LOCAL_RECORD_FIXED_SIZE + path.len()
    }

    /// Calculate the total size of this header when written
    pub fn header_size(&self) -> usize {
        LOCAL_RECORD_FIXED_SIZE + self.path.len() + self.extra.len()
    }

    /// Write local record header to a writer
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<usize> {
        let path_bytes = self.path.as_bytes();
        if path_bytes.len() > u16::MAX as usize {
            return Err(PakError::PathError(format!(
                "Path too long: {} bytes (max {})",
                path_bytes.len(),
                u16::MAX
            )));
        }
        if self.extra.len() > u16::MAX as usize {
            return Err(PakError::InvalidArgument(format!(
                "Extra field too long: {} bytes",
                self.extra.len()
            )));
        }

        writer.write_all(&LOCAL_RECORD_SIGNATURE)?;
        writer.write_all(&self.codec.0.to_le_bytes())?;
        writer.write_all(&self.compressed_size.to_le_bytes())?;
        writer.write_all(&self.uncompressed_size.to_le_bytes())?;
        writer.write_all(&self.crc32.to_le_bytes())?;
        writer.write_all(&(path_bytes.len() as u16).to_le_bytes())?;
        writer.write_all(&(self.extra.len() as u16).to_le_bytes())?;
        writer.write_all(path_bytes)?;
        writer.write_all(&self.extra)?;

        Ok(self.header_size())
    }

    /// Read local record header from a reader
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        // Read and verify signature
        let mut sig = [0u8; 4];
        reader.read_exact(&mut sig)?;
        if sig != LOCAL_RECORD_SIGNATURE {
            return Err(PakError::InvalidFormat(
                "Invalid local record signature (expected LREC)".to_string(),
            ));
        }

        let codec = CodecId(read_u32(&mut reader)?);
        let compressed_size = read_u64(&mut reader)?;
        let uncompressed_size = read_u64(&mut reader)?;
        let crc32 = read_u32(&mut reader)?;
        let path_len = read_u16(&mut reader)?;
        let extra_len = read_u16(&mut reader)?;

        let mut path_buf = vec![0u8; path_len as usize];
        reader.read_exact(&mut path_buf)?;
        let path = String::from_utf8(path_buf)
            .map_err(|e| PakError::PathError(format!("Invalid UTF-8 in path: {}", e)))?;

        let mut extra = vec![0u8; extra_len as usize];
        reader.read_exact(&mut extra)?;

        Ok(Self {
            codec,
            compressed_size,
            uncompressed_size,
            crc32,
            path,
            extra,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_record_roundtrip() {
        let mut header = LocalRecordHeader::new(
            CodecId::ZSTD,
            5000,
            10000,
            0x12345678,
            "textures/stone.dds",
        );
        header.extra = vec![1, 2, 3];

        let mut buf = Vec::new();
        let written = header.write_to(&mut buf).unwrap();

        assert_eq!(written, header.header_size());
        assert_eq!(buf.len(), LOCAL_RECORD_FIXED_SIZE + 18 + 3);

        let parsed = LocalRecordHeader::read_from(&buf[..]).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_crc_field_offset() {
        let header = LocalRecordHeader::new(CodecId::STORE, 1, 1, 0xAABBCCDD, "a");
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();

        let at = LOCAL_RECORD_CRC_OFFSET as usize;
        assert_eq!(&buf[at..at + 4], &0xAABBCCDDu32.to_le_bytes());
    }

    #[test]
    fn test_signature_validation() {
        let mut buf = vec![0xFF, 0xFF, 0xFF, 0xFF]; // Invalid signature
        buf.extend_from_slice(&[0u8; 40]); // Rest of header

        let result = LocalRecordHeader::read_from(&buf[..]);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid local record signature"));
    }
}
