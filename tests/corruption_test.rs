//! Corruption detection
//!
//! Damaged archives must fail with a format error, never panic and never
//! return wrong bytes.

use pakcache_rs::{ArchiveCache, CacheOptions, CodecId, ErrorKind, PakError, HEADER_SIZE};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Helper: Create a valid test archive
fn create_test_archive() -> NamedTempFile {
    let temp_file = NamedTempFile::new().unwrap();
    let mut cache = ArchiveCache::create(temp_file.path(), CacheOptions::default()).unwrap();
    cache
        .update_file("test.txt", b"Hello, World!", CodecId::STORE, 0)
        .unwrap();
    cache
        .update_file("data.bin", &vec![0xAB; 1024], CodecId::STORE, 0)
        .unwrap();
    let text = "compressible line of text\n".repeat(200);
    cache
        .update_file("notes.txt", text.as_bytes(), CodecId::ZSTD, 3)
        .unwrap();
    cache.write_cdr().unwrap();
    temp_file
}

fn open(path: &Path) -> pakcache_rs::Result<ArchiveCache> {
    ArchiveCache::open(path, CacheOptions::default())
}

/// Helper: Corrupt bytes at specific offset
fn corrupt_byte_at(path: &Path, offset: u64, new_value: u8) {
    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&[new_value]).unwrap();
}

/// Helper: Flip every bit of the byte at `offset`
fn flip_byte_at(path: &Path, offset: u64) {
    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.read_exact(&mut byte).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&[!byte[0]]).unwrap();
}

/// Helper: Truncate file at specific offset
fn truncate_at(path: &Path, new_length: u64) {
    let file = OpenOptions::new().write(true).open(path).unwrap();
    file.set_len(new_length).unwrap();
}

#[test]
fn test_corrupted_magic_number() {
    let temp_file = create_test_archive();
    corrupt_byte_at(temp_file.path(), 0, 0xFF);

    match open(temp_file.path()) {
        Err(PakError::InvalidMagic) => {}
        other => panic!("Expected InvalidMagic, got: {:?}", other),
    }
}

#[test]
fn test_corrupted_version_major() {
    let temp_file = create_test_archive();
    corrupt_byte_at(temp_file.path(), 8, 99);

    match open(temp_file.path()) {
        Err(PakError::UnsupportedVersion(_)) => {}
        other => panic!("Expected UnsupportedVersion, got: {:?}", other),
    }
}

#[test]
fn test_corrupted_header_field_fails_crc() {
    let temp_file = create_test_archive();
    // Low byte of the directory offset
    flip_byte_at(temp_file.path(), 16);

    match open(temp_file.path()) {
        Err(PakError::InvalidFormat(msg)) => assert!(msg.contains("CRC"), "{}", msg),
        other => panic!("Expected header CRC failure, got: {:?}", other),
    }
}

#[test]
fn test_truncated_header() {
    let temp_file = create_test_archive();
    truncate_at(temp_file.path(), 30);

    let err = open(temp_file.path()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corrupt);
}

#[test]
fn test_corrupted_directory_fails_crc() {
    let temp_file = create_test_archive();
    let cdr_offset = open(temp_file.path()).unwrap().cdr_offset();

    // A byte well inside the record body
    flip_byte_at(temp_file.path(), cdr_offset + 40);

    match open(temp_file.path()) {
        Err(PakError::CrcMismatch { path, .. }) => assert_eq!(path, "<central directory>"),
        other => panic!("Expected CrcMismatch, got: {:?}", other),
    }
}

#[test]
fn test_corrupted_end_record() {
    let temp_file = create_test_archive();
    let len = std::fs::metadata(temp_file.path()).unwrap().len();
    corrupt_byte_at(temp_file.path(), len - 64, b'X');

    match open(temp_file.path()) {
        Err(PakError::InvalidFormat(_)) => {}
        other => panic!("Expected InvalidFormat, got: {:?}", other),
    }
}

#[test]
fn test_bit_flip_in_stored_data() {
    let temp_file = create_test_archive();
    let entry = {
        let mut cache = open(temp_file.path()).unwrap();
        cache.find_file("data.bin", true).unwrap().unwrap()
    };
    flip_byte_at(temp_file.path(), entry.data_offset + 500);

    // Open still succeeds, the damage shows up on read
    let mut cache = open(temp_file.path()).unwrap();
    match cache.read_file_to_vec("data.bin") {
        Err(PakError::CrcMismatch { path, .. }) => assert_eq!(path, "data.bin"),
        other => panic!("Expected CrcMismatch, got: {:?}", other),
    }
    assert_eq!(cache.read_file_to_vec("test.txt").unwrap(), b"Hello, World!");
}

#[test]
fn test_bit_flip_in_compressed_data() {
    let temp_file = create_test_archive();
    let entry = {
        let mut cache = open(temp_file.path()).unwrap();
        cache.find_file("notes.txt", true).unwrap().unwrap()
    };
    assert_eq!(entry.codec, CodecId::ZSTD);
    flip_byte_at(temp_file.path(), entry.data_offset + entry.compressed_size / 2);

    let mut cache = open(temp_file.path()).unwrap();
    let err = cache.read_file_to_vec("notes.txt").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corrupt, "{:?}", err);
}

#[test]
fn test_local_header_disagrees_with_directory() {
    let temp_file = create_test_archive();
    let entry = {
        let mut cache = open(temp_file.path()).unwrap();
        cache.find_file("data.bin", false).unwrap().unwrap()
    };
    // compressed_size field of the local header
    flip_byte_at(temp_file.path(), entry.record_offset + 8);

    let mut cache = open(temp_file.path()).unwrap();
    match cache.find_file("data.bin", true) {
        Err(PakError::InvalidFormat(_)) => {}
        other => panic!("Expected InvalidFormat, got: {:?}", other),
    }
    assert!(cache.read_file_to_vec("data.bin").is_err());
}

#[test]
fn test_local_signature_destroyed() {
    let temp_file = create_test_archive();
    let entry = {
        let mut cache = open(temp_file.path()).unwrap();
        cache.find_file("test.txt", false).unwrap().unwrap()
    };
    corrupt_byte_at(temp_file.path(), entry.record_offset, 0);

    let mut cache = open(temp_file.path()).unwrap();
    let err = cache.read_file_to_vec("test.txt").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corrupt);
}

#[test]
fn test_empty_file() {
    let temp_file = NamedTempFile::new().unwrap();

    match open(temp_file.path()) {
        Err(PakError::InvalidFormat(_)) => {}
        other => panic!("Expected InvalidFormat, got: {:?}", other),
    }
}

#[test]
fn test_random_data_file() {
    let temp_file = NamedTempFile::new().unwrap();
    let noise: Vec<u8> = (0..4096).map(|_| rand::random::<u8>()).collect();
    std::fs::write(temp_file.path(), &noise).unwrap();

    assert!(open(temp_file.path()).is_err());
}

#[test]
fn test_truncated_prefixes_are_rejected() {
    let temp_file = create_test_archive();
    let original = std::fs::read(temp_file.path()).unwrap();

    // Any prefix of a valid archive must be rejected rather than misread
    for len in (0..original.len()).step_by(97) {
        std::fs::write(temp_file.path(), &original[..len]).unwrap();
        assert!(open(temp_file.path()).is_err(), "prefix of {} bytes opened", len);
    }
    println!("✓ All truncations rejected");
}

#[test]
fn test_multiple_corruption_points() {
    let temp_file = create_test_archive();
    let len = std::fs::metadata(temp_file.path()).unwrap().len();

    for offset in [HEADER_SIZE as u64 + 3, len / 2, len - 10] {
        flip_byte_at(temp_file.path(), offset);
    }

    // Either open fails or every read is either correct or an error
    if let Ok(mut cache) = open(temp_file.path()) {
        for path in cache.list_files() {
            let _ = cache.read_file_to_vec(&path);
        }
    }
}
