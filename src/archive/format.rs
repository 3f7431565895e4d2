use crate::error::{PakError, Result};
use std::io::{Read, Write};

/// Magic number: 0x89 'P' 'A' 'K' 0x0D 0x0A 0x1A 0x0A
/// Follows PNG pattern for corruption detection
pub const MAGIC_NUMBER: [u8; 8] = [0x89, b'P', b'A', b'K', 0x0D, 0x0A, 0x1A, 0x0A];

/// Current format version - v1.1 adds the CDR preamble and optional headers
pub const FORMAT_VERSION_MAJOR: u16 = 1;
pub const FORMAT_VERSION_MINOR: u16 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 64;

/// Set while appended data may have overwritten the directory on disk
pub const HEADER_FLAG_CDR_PENDING: u32 = 0x1;

/// Bytes covered by the header CRC (everything before the CRC field)
const HEADER_CRC_SPAN: usize = 36;

/// File header at the beginning of the archive
///
/// The header is the fixed-position pointer to the central directory; the
/// [`EndRecord`](super::EndRecord) at the tail repeats the same location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub version_major: u16,
    pub version_minor: u16,
    pub flags: u32,
    pub cdr_offset: u64,
    pub cdr_size: u64,
    pub record_count: u32,
}

impl FileHeader {
    pub fn new() -> Self {
        Self {
            version_major: FORMAT_VERSION_MAJOR,
            version_minor: FORMAT_VERSION_MINOR,
            flags: 0,
            cdr_offset: HEADER_SIZE as u64,
            cdr_size: 0,
            record_count: 0,
        }
    }

    pub fn is_cdr_pending(&self) -> bool {
        self.flags & HEADER_FLAG_CDR_PENDING != 0
    }

    pub fn set_cdr_pending(&mut self, pending: bool) {
        if pending {
            self.flags |= HEADER_FLAG_CDR_PENDING;
        } else {
            self.flags &= !HEADER_FLAG_CDR_PENDING;
        }
    }

    /// Archives written before the CDR preamble existed
    pub fn is_legacy(&self) -> bool {
        self.version_major == 1 && self.version_minor == 0
    }

    /// Write header to a writer
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC_NUMBER);
        buf[8..10].copy_from_slice(&self.version_major.to_le_bytes());
        buf[10..12].copy_from_slice(&self.version_minor.to_le_bytes());
        buf[12..16].copy_from_slice(&self.flags.to_le_bytes());
        buf[16..24].copy_from_slice(&self.cdr_offset.to_le_bytes());
        buf[24..32].copy_from_slice(&self.cdr_size.to_le_bytes());
        buf[32..36].copy_from_slice(&self.record_count.to_le_bytes());

        let crc = crc32fast::hash(&buf[..HEADER_CRC_SPAN]);
        buf[36..40].copy_from_slice(&crc.to_le_bytes());

        // Remaining 24 bytes are reserved (zero)
        writer.write_all(&buf)?;
        Ok(())
    }

    /// Read header from a reader
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf)?;

        if buf[0..8] != MAGIC_NUMBER {
            return Err(PakError::InvalidMagic);
        }

        let mut cursor = &buf[8..];
        let version_major = read_u16(&mut cursor)?;
        let version_minor = read_u16(&mut cursor)?;
        let flags = read_u32(&mut cursor)?;
        let cdr_offset = read_u64(&mut cursor)?;
        let cdr_size = read_u64(&mut cursor)?;
        let record_count = read_u32(&mut cursor)?;
        let stored_crc = read_u32(&mut cursor)?;

        let header = Self {
            version_major,
            version_minor,
            flags,
            cdr_offset,
            cdr_size,
            record_count,
        };
        header.validate_version()?;

        let actual_crc = crc32fast::hash(&buf[..HEADER_CRC_SPAN]);
        if actual_crc != stored_crc {
            return Err(PakError::InvalidFormat(format!(
                "Header CRC mismatch: expected {:08x}, got {:08x}",
                stored_crc, actual_crc
            )));
        }

        Ok(header)
    }

    /// Validate version compatibility
    pub fn validate_version(&self) -> Result<()> {
        if self.version_major != FORMAT_VERSION_MAJOR || self.version_minor > FORMAT_VERSION_MINOR
        {
            return Err(PakError::UnsupportedVersion(
                self.version_major << 8 | self.version_minor,
            ));
        }
        Ok(())
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new()
    }
}

// Helper functions for reading primitive types
pub(crate) fn read_u8<R: Read>(mut reader: R) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub(crate) fn read_u16<R: Read>(mut reader: R) -> Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

pub(crate) fn read_u32<R: Read>(mut reader: R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn read_i32<R: Read>(mut reader: R) -> Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

pub(crate) fn read_u64<R: Read>(mut reader: R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub(crate) fn read_array<R: Read, const N: usize>(mut reader: R) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_header_roundtrip() {
        let header = FileHeader {
            version_major: 1,
            version_minor: 1,
            flags: HEADER_FLAG_CDR_PENDING,
            cdr_offset: 1024,
            cdr_size: 512,
            record_count: 10,
        };

        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();

        assert_eq!(buf.len(), HEADER_SIZE);

        let parsed = FileHeader::read_from(&buf[..]).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.is_cdr_pending());
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = Vec::new();
        FileHeader::new().write_to(&mut buf).unwrap();
        buf[0] = 0xFF;
        assert!(matches!(
            FileHeader::read_from(&buf[..]),
            Err(PakError::InvalidMagic)
        ));
    }

    #[test]
    fn test_header_crc_detects_flipped_offset() {
        let mut buf = Vec::new();
        FileHeader::new().write_to(&mut buf).unwrap();
        buf[17] ^= 0x40;
        let err = FileHeader::read_from(&buf[..]).unwrap_err();
        assert!(err.to_string().contains("Header CRC mismatch"));
    }

    #[test]
    fn test_future_version_rejected() {
        let header = FileHeader {
            version_major: 2,
            ..FileHeader::new()
        };
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert!(matches!(
            FileHeader::read_from(&buf[..]),
            Err(PakError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_pending_flag_toggle() {
        let mut header = FileHeader::new();
        assert!(!header.is_cdr_pending());
        header.set_cdr_pending(true);
        assert!(header.is_cdr_pending());
        header.set_cdr_pending(false);
        assert_eq!(header.flags, 0);
    }
}
