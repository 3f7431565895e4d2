//! Integration tests for pakcache-rs

use pakcache_rs::{
    ArchiveCache, CacheOptions, CodecId, ErrorKind, ExtendedHeader, PakError, HEADER_SIZE,
};
use tempfile::{NamedTempFile, TempDir};

#[test]
fn test_basic_archive_roundtrip() {
    let temp_file = NamedTempFile::new().unwrap();
    let archive_path = temp_file.path();

    // Create archive
    {
        let mut cache = ArchiveCache::create(archive_path, CacheOptions::default()).unwrap();
        cache
            .update_file("test.txt", b"Hello, World!", CodecId::STORE, 0)
            .unwrap();
        cache
            .update_file("data/nested.txt", b"Nested content", CodecId::STORE, 0)
            .unwrap();
        cache.write_cdr().unwrap();
    }

    // Reopen and read
    {
        let mut cache = ArchiveCache::open(archive_path, CacheOptions::default()).unwrap();
        assert_eq!(cache.entry_count(), 2);
        assert!(!cache.is_uncompacted());
        assert!(!cache.is_cdr_dirty());

        assert_eq!(cache.read_file_to_vec("test.txt").unwrap(), b"Hello, World!");
        assert_eq!(
            cache.read_file_to_vec("data/nested.txt").unwrap(),
            b"Nested content"
        );
    }
}

#[test]
fn test_roundtrip_every_codec() {
    let temp_file = NamedTempFile::new().unwrap();
    let test_data = b"This is test data that should compress well. ".repeat(100);

    let mut cache = ArchiveCache::create(temp_file.path(), CacheOptions::default()).unwrap();
    let codecs = [
        ("store.txt", CodecId::STORE, 0),
        ("deflate.txt", CodecId::DEFLATE, 6),
        ("zstd.txt", CodecId::ZSTD, 3),
        ("lz4.txt", CodecId::LZ4, 0),
    ];
    for (path, codec, level) in codecs {
        cache.update_file(path, &test_data, codec, level).unwrap();
    }
    cache.write_cdr().unwrap();
    drop(cache);

    let mut cache = ArchiveCache::open(temp_file.path(), CacheOptions::default()).unwrap();
    for (path, codec, _) in codecs {
        let entry = cache.find_file(path, true).unwrap().unwrap();
        assert_eq!(entry.codec, codec, "{} kept its codec", path);
        if !codec.is_store() {
            assert!(entry.compressed_size < entry.uncompressed_size);
        }

        let mut out = vec![0u8; entry.uncompressed_size as usize];
        cache.read_file(&entry, &mut out).unwrap();
        assert_eq!(out, test_data);
    }
}

#[test]
fn test_idempotent_removal() {
    let temp_file = NamedTempFile::new().unwrap();
    let mut cache = ArchiveCache::create(temp_file.path(), CacheOptions::default()).unwrap();
    cache.update_file("gone.txt", b"bye", CodecId::STORE, 0).unwrap();

    assert!(cache.remove_file("gone.txt").unwrap());
    assert!(cache.find_file("gone.txt", false).unwrap().is_none());
    assert!(!cache.remove_file("gone.txt").unwrap());
    assert!(cache.find_file("gone.txt", false).unwrap().is_none());

    assert_eq!(cache.remove_dir("never/existed").unwrap(), 0);
}

#[test]
fn test_directory_semantics() {
    let temp_file = NamedTempFile::new().unwrap();
    let mut cache = ArchiveCache::create(temp_file.path(), CacheOptions::default()).unwrap();

    cache.update_file("a/b/c.txt", b"deep", CodecId::STORE, 0).unwrap();
    cache.update_file("a/d.txt", b"shallow", CodecId::STORE, 0).unwrap();
    cache.update_file("e.txt", b"root", CodecId::STORE, 0).unwrap();

    assert!(cache.contains_dir("a/b"));
    assert!(cache.contains_dir("a"));

    // A directory path is not a file
    assert!(cache.find_file("a/b", false).unwrap().is_none());

    // File/directory conflicts
    let err = cache.update_file("a/b", b"x", CodecId::STORE, 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    let err = cache
        .update_file("e.txt/inner", b"x", CodecId::STORE, 0)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    assert_eq!(cache.remove_dir("a").unwrap(), 2);
    assert!(cache.find_file("a/b/c.txt", false).unwrap().is_none());
    assert!(!cache.contains_dir("a"));
    assert_eq!(cache.list_files(), vec!["e.txt".to_string()]);
    assert!(cache.is_uncompacted());
}

#[test]
fn test_remove_append_relink_scenario() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("scenario.pak");
    let mut cache = ArchiveCache::create(&path, CacheOptions::default()).unwrap();

    let x = vec![0x11u8; 100];
    let y = vec![0x22u8; 50];
    let z = vec![0x33u8; 10];
    cache.update_file("x.bin", &x, CodecId::STORE, 0).unwrap();
    cache.update_file("y.bin", &y, CodecId::STORE, 0).unwrap();
    cache.write_cdr().unwrap();

    cache.remove_file("x.bin").unwrap();
    cache.update_file("z.bin", &z, CodecId::STORE, 0).unwrap();

    assert!(cache.is_uncompacted());
    assert!(cache.find_file("x.bin", false).unwrap().is_none());
    assert_eq!(cache.read_file_to_vec("y.bin").unwrap(), y);
    assert_eq!(cache.read_file_to_vec("z.bin").unwrap(), z);

    cache.relink_zip().unwrap();
    assert!(!cache.is_uncompacted());
    assert_eq!(cache.read_file_to_vec("y.bin").unwrap(), y);
    assert_eq!(cache.read_file_to_vec("z.bin").unwrap(), z);

    // Only y.bin and z.bin remain in the data region
    let y_entry = cache.find_file("y.bin", true).unwrap().unwrap();
    let z_entry = cache.find_file("z.bin", true).unwrap().unwrap();
    let live = y_entry.record_len() + z_entry.record_len();
    assert_eq!(cache.cdr_offset(), HEADER_SIZE as u64 + live);
    assert_eq!(
        cache.file_length(),
        std::fs::metadata(&path).unwrap().len()
    );

    drop(cache);
    let mut reopened = ArchiveCache::open(&path, CacheOptions::default()).unwrap();
    assert!(!reopened.is_uncompacted());
    assert_eq!(reopened.read_file_to_vec("z.bin").unwrap(), z);
}

#[test]
fn test_explicit_directory_persists() {
    let temp_file = NamedTempFile::new().unwrap();
    {
        let mut cache = ArchiveCache::create(temp_file.path(), CacheOptions::default()).unwrap();
        assert!(cache.create_dir("saves/slot1").unwrap());
        assert!(!cache.create_dir("saves/slot1").unwrap());
        cache.write_cdr().unwrap();
    }

    let mut cache = ArchiveCache::open(temp_file.path(), CacheOptions::default()).unwrap();
    assert!(cache.contains_dir("saves/slot1"));
    assert_eq!(cache.entry_count(), 0);

    assert_eq!(cache.remove_dir("saves").unwrap(), 0);
    assert!(!cache.contains_dir("saves"));
    assert!(cache.is_cdr_dirty());
}

#[test]
fn test_remove_all() {
    let temp_file = NamedTempFile::new().unwrap();
    let mut cache = ArchiveCache::create(temp_file.path(), CacheOptions::default()).unwrap();
    for i in 0..5 {
        cache
            .update_file(&format!("dir{}/file.txt", i % 2), &[i as u8; 32], CodecId::STORE, 0)
            .unwrap();
    }
    cache.update_file("f0.txt", b"a", CodecId::STORE, 0).unwrap();

    let removed = cache.remove_all().unwrap();
    assert_eq!(removed, 3);
    assert_eq!(cache.entry_count(), 0);
    assert_eq!(cache.hole_bytes(), cache.cdr_offset() - HEADER_SIZE as u64);

    cache.relink_zip().unwrap();
    assert_eq!(cache.cdr_offset(), HEADER_SIZE as u64);
    assert_eq!(cache.remove_all().unwrap(), 0);
}

#[test]
fn test_update_file_auto_selects_codec() {
    let temp_file = NamedTempFile::new().unwrap();
    let mut cache = ArchiveCache::create(temp_file.path(), CacheOptions::default()).unwrap();

    let text = "lorem ipsum dolor sit amet ".repeat(400);
    cache.update_file_auto("readme.txt", text.as_bytes()).unwrap();
    cache.update_file_auto("tiny.bin", b"small").unwrap();
    cache.update_file_auto("mesh.bin", &vec![7u8; 8192]).unwrap();

    assert_eq!(cache.find_file("readme.txt", false).unwrap().unwrap().codec, CodecId::ZSTD);
    assert_eq!(cache.find_file("tiny.bin", false).unwrap().unwrap().codec, CodecId::STORE);
    assert_eq!(cache.find_file("mesh.bin", false).unwrap().unwrap().codec, CodecId::LZ4);
    assert_eq!(cache.read_file_to_vec("readme.txt").unwrap(), text.as_bytes());
}

#[test]
fn test_extended_header_persists() {
    let temp_file = NamedTempFile::new().unwrap();
    let header = ExtendedHeader::new("pakcache-tests").with_property("build", "42");
    {
        let options = CacheOptions::default().with_extended_header(header.clone());
        let mut cache = ArchiveCache::create(temp_file.path(), options).unwrap();
        cache.update_file("a.txt", b"a", CodecId::STORE, 0).unwrap();
        cache.write_cdr().unwrap();
    }

    let cache = ArchiveCache::open(temp_file.path(), CacheOptions::default()).unwrap();
    assert_eq!(cache.extended_header(), Some(&header));
}

#[test]
fn test_read_file_buffer_size_checked() {
    let temp_file = NamedTempFile::new().unwrap();
    let mut cache = ArchiveCache::create(temp_file.path(), CacheOptions::default()).unwrap();
    cache.update_file("a.txt", b"four", CodecId::STORE, 0).unwrap();

    let entry = cache.find_file("a.txt", false).unwrap().unwrap();
    let mut short = [0u8; 3];
    assert!(matches!(
        cache.read_file(&entry, &mut short),
        Err(PakError::InvalidArgument(_))
    ));

    // Entries go stale once the file is replaced
    cache.update_file("a.txt", b"five!", CodecId::STORE, 0).unwrap();
    let mut out = [0u8; 4];
    assert!(cache.read_file(&entry, &mut out).is_err());
}

#[test]
fn test_empty_file_roundtrip() {
    let temp_file = NamedTempFile::new().unwrap();
    let mut cache = ArchiveCache::create(temp_file.path(), CacheOptions::default()).unwrap();
    cache.update_file("empty.txt", b"", CodecId::ZSTD, 3).unwrap();
    cache.write_cdr().unwrap();
    drop(cache);

    let mut cache = ArchiveCache::open(temp_file.path(), CacheOptions::default()).unwrap();
    assert_eq!(cache.read_file_to_vec("empty.txt").unwrap(), Vec::<u8>::new());
}

#[test]
fn test_config_file_drives_cache() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("pakcache.toml");
    std::fs::write(
        &config_path,
        "reuse_slots = true\nmax_entry_size = 1024\n\n[relink]\nbuffer_size = 4096\n",
    )
    .unwrap();

    let config = pakcache_rs::CacheConfig::load(&config_path).unwrap();
    let options = CacheOptions::default().with_config(config);
    let mut cache = ArchiveCache::create(dir.path().join("configured.pak"), options).unwrap();
    assert!(cache.config().reuse_slots);
    assert_eq!(cache.config().relink.buffer_size, 4096);

    let err = cache
        .update_file("big.bin", &[0u8; 2048], CodecId::STORE, 0)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    cache.update_file("ok.bin", &[0u8; 1024], CodecId::STORE, 0).unwrap();

    let bad = dir.path().join("bad.toml");
    std::fs::write(&bad, "[relink]\nauto_threshold = 3.0\n").unwrap();
    assert!(matches!(
        pakcache_rs::CacheConfig::load(&bad),
        Err(PakError::Config(_))
    ));
}
