use crate::archive::format::{read_u16, read_u32, read_u64, FileHeader};
use crate::error::{PakError, Result};
use std::io::{Read, Write};

/// ENDR signature for End of Central Directory Record
pub const END_RECORD_SIGNATURE: [u8; 4] = [0x45, 0x4E, 0x44, 0x52]; // "ENDR"

/// End Record size in bytes (fixed)
pub const END_RECORD_SIZE: usize = 64;

/// End of Central Directory Record (ENDR)
///
/// Located at the very end of the archive (last 64 bytes), directly after the
/// central directory. Lets a reader locate the directory from the tail and
/// check that the directory bytes were written completely.
///
/// Structure (64 bytes fixed):
/// - Signature: "ENDR" (4 bytes)
/// - Version Major: uint16 (2 bytes)
/// - Version Minor: uint16 (2 bytes)
/// - CDR Offset: uint64 (8 bytes)
/// - CDR Size: uint64 (8 bytes)
/// - Record Count: uint32 (4 bytes)
/// - CDR CRC32: uint32 (4 bytes)
/// - Reserved: 32 bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndRecord {
    pub version_major: u16,
    pub version_minor: u16,
    pub cdr_offset: u64,
    pub cdr_size: u64,
    pub record_count: u32,
    pub cdr_crc32: u32,
}

impl EndRecord {
    /// Build the end record that matches a header and the directory bytes it points at
    pub fn for_directory(header: &FileHeader, cdr_bytes: &[u8]) -> Self {
        Self {
            version_major: header.version_major,
            version_minor: header.version_minor,
            cdr_offset: header.cdr_offset,
            cdr_size: header.cdr_size,
            record_count: header.record_count,
            cdr_crc32: crc32fast::hash(cdr_bytes),
        }
    }

    /// Write end record to a writer
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<usize> {
        let mut buf = [0u8; END_RECORD_SIZE];
        buf[0..4].copy_from_slice(&END_RECORD_SIGNATURE);
        buf[4..6].copy_from_slice(&self.version_major.to_le_bytes());
        buf[6..8].copy_from_slice(&self.version_minor.to_le_bytes());
        buf[8..16].copy_from_slice(&self.cdr_offset.to_le_bytes());
        buf[16..24].copy_from_slice(&self.cdr_size.to_le_bytes());
        buf[24..28].copy_from_slice(&self.record_count.to_le_bytes());
        buf[28..32].copy_from_slice(&self.cdr_crc32.to_le_bytes());
        // Reserved (32 bytes)

        writer.write_all(&buf)?;
        Ok(END_RECORD_SIZE)
    }

    /// Read end record from a reader
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        // Read and verify signature
        let mut sig = [0u8; 4];
        reader.read_exact(&mut sig)?;
        if sig != END_RECORD_SIGNATURE {
            return Err(PakError::InvalidFormat(
                "Invalid end record signature (expected ENDR)".to_string(),
            ));
        }

        let version_major = read_u16(&mut reader)?;
        let version_minor = read_u16(&mut reader)?;
        let cdr_offset = read_u64(&mut reader)?;
        let cdr_size = read_u64(&mut reader)?;
        let record_count = read_u32(&mut reader)?;
        let cdr_crc32 = read_u32(&mut reader)?;

        // Skip reserved bytes
        let mut reserved = [0u8; 32];
        reader.read_exact(&mut reserved)?;

        Ok(Self {
            version_major,
            version_minor,
            cdr_offset,
            cdr_size,
            record_count,
            cdr_crc32,
        })
    }

    /// Validate end record matches header
    pub fn validate_against_header(&self, header: &FileHeader) -> Result<()> {
        if self.version_major != header.version_major || self.version_minor != header.version_minor
        {
            return Err(PakError::InvalidFormat(format!(
                "ENDR version mismatch: header v{}.{}, ENDR v{}.{}",
                header.version_major, header.version_minor, self.version_major, self.version_minor
            )));
        }

        if self.cdr_offset != header.cdr_offset {
            return Err(PakError::InvalidFormat(format!(
                "ENDR directory offset mismatch: header {}, ENDR {}",
                header.cdr_offset, self.cdr_offset
            )));
        }

        if self.cdr_size != header.cdr_size {
            return Err(PakError::InvalidFormat(format!(
                "ENDR directory size mismatch: header {}, ENDR {}",
                header.cdr_size, self.cdr_size
            )));
        }

        if self.record_count != header.record_count {
            return Err(PakError::InvalidFormat(format!(
                "ENDR record count mismatch: header {}, ENDR {}",
                header.record_count, self.record_count
            )));
        }

        Ok(())
    }

    /// Check the directory bytes against the stored CRC
    pub fn verify_directory(&self, cdr_bytes: &[u8]) -> Result<()> {
        let actual = crc32fast::hash(cdr_bytes);
        if actual != self.cdr_crc32 {
            return Err(PakError::CrcMismatch {
                path: "<central directory>".to_string(),
                expected: self.cdr_crc32,
                actual,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> FileHeader {
        FileHeader {
            cdr_offset: 1024,
            cdr_size: 3200,
            record_count: 10,
            ..FileHeader::new()
        }
    }

    #[test]
    fn test_end_record_roundtrip() {
        let record = EndRecord::for_directory(&header(), b"directory bytes");

        let mut buf = Vec::new();
        let written = record.write_to(&mut buf).unwrap();

        assert_eq!(written, END_RECORD_SIZE);
        assert_eq!(buf.len(), END_RECORD_SIZE);

        let parsed = EndRecord::read_from(&buf[..]).unwrap();
        assert_eq!(parsed, record);
        assert!(parsed.verify_directory(b"directory bytes").is_ok());
        assert!(parsed.verify_directory(b"directory bytez").is_err());
    }

    #[test]
    fn test_signature_validation() {
        let mut buf = vec![0xFF, 0xFF, 0xFF, 0xFF]; // Invalid signature
        buf.extend_from_slice(&[0u8; 60]); // Rest of record

        let result = EndRecord::read_from(&buf[..]);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid end record signature"));
    }

    #[test]
    fn test_validate_against_header() {
        let record = EndRecord::for_directory(&header(), &[]);

        // Valid case
        assert!(record.validate_against_header(&header()).is_ok());

        // Offset mismatch
        let moved = FileHeader {
            cdr_offset: 2048,
            ..header()
        };
        assert!(record.validate_against_header(&moved).is_err());

        // Size mismatch
        let grown = FileHeader {
            cdr_size: 6400,
            ..header()
        };
        assert!(record.validate_against_header(&grown).is_err());

        // Record count mismatch
        let more = FileHeader {
            record_count: 20,
            ..header()
        };
        assert!(record.validate_against_header(&more).is_err());
    }
}
