//! Generate seed corpus for fuzzing

use ed25519_dalek::SigningKey;
use pakcache_rs::{ArchiveCache, CacheOptions, CdrKey, CodecId, ExtendedHeader, Result};
use std::fs;

const CORPUS_DIR: &str = "fuzz/corpus/fuzz_archive_parse";

fn seed(name: &str, options: CacheOptions, fill: impl FnOnce(&mut ArchiveCache) -> Result<()>) -> Result<()> {
    let path = format!("{}/{}.pak", CORPUS_DIR, name);
    let _ = fs::remove_file(&path);
    let mut cache = ArchiveCache::create(&path, options)?;
    fill(&mut cache)?;
    cache.write_cdr()?;
    println!("✓ Generated: {}", path);
    Ok(())
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    fs::create_dir_all(CORPUS_DIR)?;
    println!("Generating seed corpus...");

    seed("seed_empty", CacheOptions::default(), |_| Ok(()))?;

    seed("seed_single_small", CacheOptions::default(), |c| {
        c.update_file("test.txt", b"Hello, World!", CodecId::STORE, 0)
    })?;

    seed("seed_multi_codec", CacheOptions::default(), |c| {
        let text = b"This is test data for compression. ".repeat(200);
        c.update_file("a.txt", &text, CodecId::DEFLATE, 6)?;
        c.update_file("dir/b.txt", &text, CodecId::ZSTD, 3)?;
        c.update_file("dir/sub/c.bin", &text, CodecId::LZ4, 0)?;
        c.create_dir("empty_dir")?;
        c.update_file("empty.txt", b"", CodecId::STORE, 0)
    })?;

    seed("seed_holes", CacheOptions::default(), |c| {
        for i in 0..8u8 {
            c.update_file(&format!("f{}.bin", i), &[i; 64], CodecId::STORE, 0)?;
        }
        c.remove_file("f2.bin")?;
        c.update_file("f5.bin", b"replaced", CodecId::STORE, 0)?;
        Ok(())
    })?;

    seed("seed_pending_stream", CacheOptions::default(), |c| {
        c.start_continuous_file_update("stream.bin", 256)?;
        c.update_file_continuous_segment("stream.bin", 256, &[1u8; 100], None)?;
        Ok(())
    })?;

    let options = CacheOptions::default()
        .with_signing_key(SigningKey::from_bytes(&[0x11; 32]))
        .with_extended_header(ExtendedHeader::new("fuzz").with_property("seed", "1"));
    seed("seed_signed", options, |c| {
        c.update_file("signed.txt", b"signed payload", CodecId::STORE, 0)
    })?;

    let options = CacheOptions::default().with_cdr_key(CdrKey::Raw([0x42; 32]));
    seed("seed_encrypted", options, |c| {
        c.update_file("secret.txt", b"hidden path", CodecId::STORE, 0)
    })?;

    println!("\nSeed corpus written to {}", CORPUS_DIR);
    Ok(())
}
