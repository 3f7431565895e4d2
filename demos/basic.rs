/// Basic example: create an archive, patch it in place, compact it
///
/// Run with: cargo run --example basic
use pakcache_rs::{ArchiveCache, CacheOptions, CodecId};
use std::error::Error;

const ARCHIVE: &str = "example_basic.pak";

fn main() -> Result<(), Box<dyn Error>> {
    println!("=== pakcache-rs Basic Example ===\n");

    println!("1. Creating archive...");
    create_archive()?;

    println!("\n2. Patching archive...");
    patch_archive()?;

    println!("\n3. Reading from archive...");
    read_archive()?;

    println!("\n✓ Example complete!");
    Ok(())
}

fn create_archive() -> Result<(), Box<dyn Error>> {
    let mut cache = ArchiveCache::create(ARCHIVE, CacheOptions::default())?;

    // Codec picked from size and extension
    cache.update_file_auto("readme.txt", b"This is a readme file for the basic example.")?;
    cache.update_file_auto(
        "data.json",
        br#"{"name": "Basic Example", "version": "1.0.0"}"#,
    )?;
    cache.update_file_auto("notes.md", b"# Notes\n\nThis is a markdown file.")?;

    // Or chosen explicitly
    cache.update_file("binary.dat", &[0u8; 1000], CodecId::LZ4, 0)?;

    cache.write_cdr()?;
    println!("   ✓ Archive created: {}", ARCHIVE);
    Ok(())
}

fn patch_archive() -> Result<(), Box<dyn Error>> {
    let mut cache = ArchiveCache::open(ARCHIVE, CacheOptions::default())?;

    cache.update_file(
        "data.json",
        br#"{"name": "Basic Example", "version": "1.1.0"}"#,
        CodecId::ZSTD,
        3,
    )?;
    cache.remove_file("notes.md")?;
    cache.write_cdr()?;
    println!("   Holes after patching: {} bytes", cache.hole_bytes());

    let stats = cache.relink_zip()?;
    println!(
        "   ✓ Relinked {} entries: {} -> {} bytes",
        stats.entries, stats.bytes_before, stats.bytes_after
    );
    Ok(())
}

fn read_archive() -> Result<(), Box<dyn Error>> {
    let mut cache = ArchiveCache::open(ARCHIVE, CacheOptions::default().read_only())?;

    println!("   Files in archive:");
    for filename in cache.list_files() {
        println!("     - {}", filename);
    }

    println!("\n   Reading readme.txt:");
    let readme = cache.read_file_to_vec("readme.txt")?;
    println!("     {}", String::from_utf8_lossy(&readme));

    println!("\n   Reading data.json:");
    let json_data = cache.read_file_to_vec("data.json")?;
    let json: serde_json::Value = serde_json::from_slice(&json_data)?;
    println!("     Name: {}", json["name"]);
    println!("     Version: {}", json["version"]);

    Ok(())
}
