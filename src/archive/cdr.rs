//! Central directory codec
//!
//! Layout of the directory region:
//!
//! ```text
//! [preamble "CDRH"][ENCH?][SIGH?][EXTH?][body]
//! ```
//!
//! The body is one "CENT" record per file entry or explicit directory,
//! AES-GCM encrypted when an encryption header is present. Archives at format
//! v1.0 have no preamble; their directory region is the bare record sequence.

use crate::archive::end_record::{EndRecord, END_RECORD_SIZE};
use crate::archive::entry::FileEntry;
use crate::archive::flags::EntryFlags;
use crate::archive::format::{
    read_array, read_i32, read_u16, read_u32, read_u64, FileHeader, FORMAT_VERSION_MINOR,
};
use crate::archive::headers::{CdrKey, EncryptionHeader, ExtendedHeader, SignatureHeader};
use crate::archive::tree::FileEntryTree;
use crate::codec::CodecId;
use crate::error::{PakError, Result};
use ed25519_dalek::SigningKey;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

pub const CDR_PREAMBLE_SIGNATURE: [u8; 4] = *b"CDRH";
pub const CDR_PREAMBLE_SIZE: usize = 20;
pub const CDR_VERSION: u16 = 1;

pub const CENTRAL_RECORD_SIGNATURE: [u8; 4] = *b"CENT";
pub const CENTRAL_RECORD_FIXED_SIZE: usize = 44;

const HEADER_FLAG_ENCRYPTED: u16 = 1 << 0;
const HEADER_FLAG_SIGNED: u16 = 1 << 1;
const HEADER_FLAG_EXTENDED: u16 = 1 << 2;

/// One serialized directory record
///
/// Structure (44 bytes + path):
/// - Signature: "CENT" (4 bytes)
/// - Record Offset: uint64
/// - Compressed Size: uint64
/// - Uncompressed Size: uint64
/// - CRC32: uint32
/// - Codec Id: uint32
/// - Level: int32
/// - Entry Flags: uint16
/// - Path Length: uint16
/// - Path: variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CentralRecord {
    pub record_offset: u64,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub crc32: u32,
    pub codec: CodecId,
    pub level: i32,
    pub flags: EntryFlags,
    pub path: String,
}

impl CentralRecord {
    pub fn from_entry(entry: &FileEntry) -> Self {
        Self {
            record_offset: entry.record_offset,
            compressed_size: entry.compressed_size,
            uncompressed_size: entry.uncompressed_size,
            crc32: entry.crc32,
            codec: entry.codec,
            level: entry.level,
            flags: entry.flags,
            path: entry.path.to_string(),
        }
    }

    /// Record for an explicitly created directory
    pub fn directory(path: &str) -> Self {
        Self {
            record_offset: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            crc32: 0,
            codec: CodecId::STORE,
            level: 0,
            flags: EntryFlags::DIRECTORY,
            path: path.to_string(),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.flags.contains(EntryFlags::DIRECTORY)
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<usize> {
        let path_bytes = self.path.as_bytes();
        if path_bytes.len() > u16::MAX as usize {
            return Err(PakError::PathError(format!(
                "Path too long: {} bytes (max {})",
                path_bytes.len(),
                u16::MAX
            )));
        }

        writer.write_all(&CENTRAL_RECORD_SIGNATURE)?;
        writer.write_all(&self.record_offset.to_le_bytes())?;
        writer.write_all(&self.compressed_size.to_le_bytes())?;
        writer.write_all(&self.uncompressed_size.to_le_bytes())?;
        writer.write_all(&self.crc32.to_le_bytes())?;
        writer.write_all(&self.codec.0.to_le_bytes())?;
        writer.write_all(&self.level.to_le_bytes())?;
        writer.write_all(&self.flags.bits().to_le_bytes())?;
        writer.write_all(&(path_bytes.len() as u16).to_le_bytes())?;
        writer.write_all(path_bytes)?;

        Ok(CENTRAL_RECORD_FIXED_SIZE + path_bytes.len())
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let sig: [u8; 4] = read_array(&mut reader)?;
        if sig != CENTRAL_RECORD_SIGNATURE {
            return Err(PakError::InvalidFormat(
                "Invalid central record signature (expected CENT)".to_string(),
            ));
        }

        let record_offset = read_u64(&mut reader)?;
        let compressed_size = read_u64(&mut reader)?;
        let uncompressed_size = read_u64(&mut reader)?;
        let crc32 = read_u32(&mut reader)?;
        let codec = CodecId(read_u32(&mut reader)?);
        let level = read_i32(&mut reader)?;
        let flags = EntryFlags::from_bits_truncate(read_u16(&mut reader)?);
        let path_len = read_u16(&mut reader)?;

        let mut path_buf = vec![0u8; path_len as usize];
        reader.read_exact(&mut path_buf)?;
        let path = String::from_utf8(path_buf)
            .map_err(|e| PakError::PathError(format!("Invalid UTF-8 in path: {}", e)))?;

        Ok(Self {
            record_offset,
            compressed_size,
            uncompressed_size,
            crc32,
            codec,
            level,
            flags,
            path,
        })
    }
}

/// Headers found in (or destined for) a directory region
#[derive(Debug, Clone, Default)]
pub struct CdrHeaders {
    pub encryption: Option<EncryptionHeader>,
    pub signature: Option<SignatureHeader>,
    pub extended: Option<ExtendedHeader>,
}

/// What the encoder needs besides the tree
#[derive(Default)]
pub struct EncodeOptions<'a> {
    /// Encryption header (nonce already refreshed) and its derived key
    pub encryption: Option<(&'a EncryptionHeader, &'a [u8; 32])>,
    pub signing_key: Option<&'a SigningKey>,
    pub extended: Option<&'a ExtendedHeader>,
}

/// Serialized directory region ready to be written
#[derive(Debug, Clone)]
pub struct EncodedDirectory {
    pub bytes: Vec<u8>,
    pub record_count: u32,
    pub signature: Option<SignatureHeader>,
}

/// Parsed directory region
#[derive(Debug, Clone)]
pub struct DecodedDirectory {
    pub headers: CdrHeaders,
    pub records: Vec<CentralRecord>,
    /// AES key the body was decrypted with, kept so rewrites skip the KDF
    pub derived_key: Option<[u8; 32]>,
}

/// Serialize `tree` (files first, then explicit directories) with headers
pub fn encode_directory(tree: &FileEntryTree, options: &EncodeOptions<'_>) -> Result<EncodedDirectory> {
    let mut body = Vec::new();
    let mut record_count: u32 = 0;

    for entry in tree.entries() {
        CentralRecord::from_entry(entry).write_to(&mut body)?;
        record_count += 1;
    }
    for dir in tree.explicit_dirs() {
        CentralRecord::directory(&dir).write_to(&mut body)?;
        record_count += 1;
    }

    let mut header_flags = 0u16;
    let mut encryption_bytes = Vec::new();
    if let Some((header, key)) = options.encryption {
        body = header.encrypt(key, &body)?;
        header.write_to(&mut encryption_bytes)?;
        header_flags |= HEADER_FLAG_ENCRYPTED;
    }

    let mut extended_bytes = Vec::new();
    if let Some(extended) = options.extended {
        extended.write_to(&mut extended_bytes)?;
        header_flags |= HEADER_FLAG_EXTENDED;
    }

    if options.signing_key.is_some() {
        header_flags |= HEADER_FLAG_SIGNED;
    }

    let mut preamble = Vec::with_capacity(CDR_PREAMBLE_SIZE);
    preamble.extend_from_slice(&CDR_PREAMBLE_SIGNATURE);
    preamble.extend_from_slice(&CDR_VERSION.to_le_bytes());
    preamble.extend_from_slice(&header_flags.to_le_bytes());
    preamble.extend_from_slice(&record_count.to_le_bytes());
    preamble.extend_from_slice(&(body.len() as u64).to_le_bytes());

    let signature = options.signing_key.map(|signing_key| {
        let digest = signing_digest(&preamble, &encryption_bytes, &extended_bytes, &body);
        SignatureHeader::sign(signing_key, &digest)
    });

    let mut bytes = preamble;
    bytes.extend_from_slice(&encryption_bytes);
    if let Some(signature) = &signature {
        signature.write_to(&mut bytes)?;
    }
    bytes.extend_from_slice(&extended_bytes);
    bytes.extend_from_slice(&body);

    Ok(EncodedDirectory {
        bytes,
        record_count,
        signature,
    })
}

/// Parse a directory region read from disk
///
/// `legacy_record_count` is `Some` for v1.0 archives, whose region is a bare
/// record sequence. A signature, when present, is always checked; an
/// encrypted body needs `key`.
pub fn decode_directory(
    bytes: &[u8],
    legacy_record_count: Option<u32>,
    key: Option<&CdrKey>,
) -> Result<DecodedDirectory> {
    if let Some(count) = legacy_record_count {
        return Ok(DecodedDirectory {
            headers: CdrHeaders::default(),
            records: decode_records(bytes, count)?,
            derived_key: None,
        });
    }

    if bytes.len() < CDR_PREAMBLE_SIZE {
        return Err(PakError::InvalidFormat(format!(
            "Directory region too small: {} bytes",
            bytes.len()
        )));
    }
    let (preamble, mut rest) = bytes.split_at(CDR_PREAMBLE_SIZE);

    let mut cursor = preamble;
    let sig: [u8; 4] = read_array(&mut cursor)?;
    if sig != CDR_PREAMBLE_SIGNATURE {
        return Err(PakError::InvalidFormat(
            "Invalid directory preamble signature (expected CDRH)".to_string(),
        ));
    }
    let version = read_u16(&mut cursor)?;
    if version != CDR_VERSION {
        return Err(PakError::UnsupportedVersion(version));
    }
    let header_flags = read_u16(&mut cursor)?;
    let record_count = read_u32(&mut cursor)?;
    let body_len = read_u64(&mut cursor)?;

    let mut headers = CdrHeaders::default();
    let mut encryption_bytes: &[u8] = &[];
    let mut extended_bytes: &[u8] = &[];

    if header_flags & HEADER_FLAG_ENCRYPTED != 0 {
        let before = rest;
        headers.encryption = Some(EncryptionHeader::read_from(&mut rest)?);
        encryption_bytes = &before[..before.len() - rest.len()];
    }
    if header_flags & HEADER_FLAG_SIGNED != 0 {
        headers.signature = Some(SignatureHeader::read_from(&mut rest)?);
    }
    if header_flags & HEADER_FLAG_EXTENDED != 0 {
        let before = rest;
        headers.extended = Some(ExtendedHeader::read_from(&mut rest)?);
        extended_bytes = &before[..before.len() - rest.len()];
    }

    let body = rest;
    if body.len() as u64 != body_len {
        return Err(PakError::InvalidFormat(format!(
            "Directory body length mismatch: preamble says {}, found {}",
            body_len,
            body.len()
        )));
    }

    if let Some(signature) = &headers.signature {
        let digest = signing_digest(preamble, encryption_bytes, extended_bytes, body);
        signature.verify(&digest)?;
    }

    let (records, derived_key) = match &headers.encryption {
        Some(encryption) => {
            let key = key.ok_or(PakError::MissingDecryptionKey)?;
            let derived = encryption.derive_key(key)?;
            let plaintext = encryption.decrypt(&derived, body)?;
            (decode_records(&plaintext, record_count)?, Some(derived))
        }
        None => (decode_records(body, record_count)?, None),
    };

    Ok(DecodedDirectory {
        headers,
        records,
        derived_key,
    })
}

fn decode_records(mut bytes: &[u8], count: u32) -> Result<Vec<CentralRecord>> {
    // Each record is at least the fixed size, so a count the region cannot
    // hold is rejected before allocating
    if (count as usize).saturating_mul(CENTRAL_RECORD_FIXED_SIZE) > bytes.len() {
        return Err(PakError::InvalidFormat(format!(
            "Directory claims {} records but holds only {} bytes",
            count,
            bytes.len()
        )));
    }

    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        records.push(CentralRecord::read_from(&mut bytes)?);
    }

    if !bytes.is_empty() {
        return Err(PakError::InvalidFormat(format!(
            "{} trailing bytes after directory records",
            bytes.len()
        )));
    }
    Ok(records)
}

/// SHA-256 over everything in the region except the signature header itself
fn signing_digest(preamble: &[u8], encryption: &[u8], extended: &[u8], body: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(preamble);
    hasher.update(encryption);
    hasher.update(extended);
    hasher.update(body);
    hasher.finalize().into()
}

/// Write a directory region at `cdr_offset`, then the end record, truncate
/// the file after it and finally rewrite the file header
///
/// The header goes last so a crash before it leaves the pending flag set.
/// Returns the new file length.
pub(crate) fn write_directory(
    file: &mut File,
    header: &mut FileHeader,
    cdr_offset: u64,
    directory: &EncodedDirectory,
) -> Result<u64> {
    file.seek(SeekFrom::Start(cdr_offset))?;
    file.write_all(&directory.bytes)?;

    header.version_minor = FORMAT_VERSION_MINOR;
    header.cdr_offset = cdr_offset;
    header.cdr_size = directory.bytes.len() as u64;
    header.record_count = directory.record_count;
    header.set_cdr_pending(false);

    EndRecord::for_directory(header, &directory.bytes).write_to(&mut *file)?;

    let file_len = cdr_offset + directory.bytes.len() as u64 + END_RECORD_SIZE as u64;
    file.set_len(file_len)?;

    file.seek(SeekFrom::Start(0))?;
    header.write_to(&mut *file)?;
    file.flush()?;

    Ok(file_len)
}
