//! Decompression bomb protection
//!
//! Highly compressible entries are legitimate, but a cache refuses to
//! inflate anything above its configured `max_entry_size`, and a codec never
//! produces more bytes than the entry declares.

use pakcache_rs::{ArchiveCache, CacheConfig, CacheOptions, CodecId, CodecRegistry, PakError};
use tempfile::NamedTempFile;

fn limited(max_entry_size: u64) -> CacheOptions {
    let mut config = CacheConfig::default();
    config.max_entry_size = max_entry_size;
    CacheOptions::default().with_config(config)
}

#[test]
fn test_legitimate_highly_compressible_data() {
    let temp_file = NamedTempFile::new().unwrap();
    let data = vec![0u8; 10 * 1024 * 1024];
    {
        let mut cache = ArchiveCache::create(temp_file.path(), CacheOptions::default()).unwrap();
        cache.update_file("zeros.bin", &data, CodecId::ZSTD, 3).unwrap();
        cache.write_cdr().unwrap();
    }

    let size = std::fs::metadata(temp_file.path()).unwrap().len();
    println!("  10 MB of zeros stored in {} bytes", size);
    assert!(size < 64 * 1024);

    let mut cache = ArchiveCache::open(temp_file.path(), CacheOptions::default()).unwrap();
    assert_eq!(cache.read_file_to_vec("zeros.bin").unwrap(), data);
}

#[test]
fn test_oversized_entry_refused_on_read() {
    let temp_file = NamedTempFile::new().unwrap();
    {
        let mut cache = ArchiveCache::create(temp_file.path(), CacheOptions::default()).unwrap();
        cache
            .update_file("bomb.bin", &vec![0u8; 1024 * 1024], CodecId::ZSTD, 19)
            .unwrap();
        cache.update_file("small.bin", b"fine", CodecId::STORE, 0).unwrap();
        cache.write_cdr().unwrap();
    }

    let mut cache = ArchiveCache::open(temp_file.path(), limited(64 * 1024)).unwrap();
    match cache.read_file_to_vec("bomb.bin") {
        Err(PakError::InvalidFormat(msg)) => {
            assert!(msg.contains("max_entry_size"), "{}", msg);
            println!("✓ Oversized entry refused before inflating");
        }
        other => panic!("Expected InvalidFormat, got {:?}", other),
    }
    assert_eq!(cache.read_file_to_vec("small.bin").unwrap(), b"fine");
}

#[test]
fn test_oversized_entry_refused_on_write() {
    let temp_file = NamedTempFile::new().unwrap();
    let mut cache = ArchiveCache::create(temp_file.path(), limited(1000)).unwrap();

    assert!(matches!(
        cache.update_file("big.bin", &[1u8; 1001], CodecId::STORE, 0),
        Err(PakError::InvalidArgument(_))
    ));
    assert!(matches!(
        cache.start_continuous_file_update("big.bin", 1_000_000),
        Err(PakError::InvalidArgument(_))
    ));
    cache.update_file("ok.bin", &[1u8; 1000], CodecId::STORE, 0).unwrap();
}

#[test]
fn test_codec_never_exceeds_declared_size() {
    let registry = CodecRegistry::with_defaults();
    let data = vec![b'x'; 100_000];

    for id in [CodecId::DEFLATE, CodecId::ZSTD, CodecId::LZ4] {
        let codec = registry.get(id).unwrap();
        let mut compressed = Vec::new();
        codec.compress(&data, 1, &mut compressed).unwrap();

        // Declaring less than the real size must fail instead of over-allocating
        match codec.decompress(&compressed, 1000) {
            Err(PakError::DecompressionFailed(_)) => {}
            other => panic!("{}: expected DecompressionFailed, got {:?}", codec.name(), other.map(|v| v.len())),
        }
    }
}
