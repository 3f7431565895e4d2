/// Example comparing the built-in codecs
///
/// Run with: cargo run --example compression
use pakcache_rs::{ArchiveCache, CacheConfig, CacheOptions, CodecId};
use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    println!("=== pakcache-rs Compression Example ===\n");

    let medium_text = "Lorem ipsum ".repeat(500); // ~6KB
    let large_data = vec![0u8; 100_000]; // 100KB

    // Keep whatever the codec produces so the sizes are comparable
    let mut config = CacheConfig::default();
    config.fallback_to_store = false;
    let options = CacheOptions::default().with_config(config);

    println!("1. Creating archives with different codecs...\n");
    let methods = [
        ("store", CodecId::STORE, 0),
        ("deflate", CodecId::DEFLATE, 6),
        ("lz4", CodecId::LZ4, 0),
        ("zstd", CodecId::ZSTD, 19),
    ];

    let mut sizes = Vec::new();
    for (name, codec, level) in methods {
        let path = format!("example_{}.pak", name);
        let mut cache = ArchiveCache::create(&path, options.clone())?;
        cache.update_file("medium.txt", medium_text.as_bytes(), codec, level)?;
        cache.update_file("large.bin", &large_data, codec, level)?;
        cache.write_cdr()?;

        let entry = cache
            .find_file("medium.txt", false)?
            .ok_or("medium.txt missing")?;
        println!(
            "   ✓ {:<8} medium.txt {} -> {} bytes",
            name, entry.uncompressed_size, entry.compressed_size
        );
        sizes.push((name, cache.file_length()));
    }

    println!("\n2. Comparing archive sizes:");
    let stored = sizes[0].1 as f64;
    for (name, size) in &sizes {
        println!(
            "     {:<8} {:>8} bytes ({:.1}% of stored)",
            name,
            size,
            *size as f64 / stored * 100.0
        );
    }

    println!("\n3. Verifying decompression:");
    let mut reference = None;
    for (name, _, _) in methods {
        let mut cache =
            ArchiveCache::open(format!("example_{}.pak", name), CacheOptions::default())?;
        let data = cache.read_file_to_vec("medium.txt")?;
        println!("     ✓ {} decompressed: {} bytes", name, data.len());
        match &reference {
            None => reference = Some(data),
            Some(expected) if *expected != data => return Err(format!("{} mismatch", name).into()),
            Some(_) => {}
        }
    }
    println!("     ✓ Decompressed data matches across codecs");

    println!("\n✓ Example complete!");
    Ok(())
}
