/// Example: signed and encrypted central directory
///
/// Run with: RUST_LOG=pakcache_rs=debug cargo run --example signed
use ed25519_dalek::SigningKey;
use pakcache_rs::{ArchiveCache, CacheOptions, CdrKey, CodecId, ExtendedHeader};
use rand::rngs::OsRng;
use std::error::Error;
use tracing_subscriber::EnvFilter;

const ARCHIVE: &str = "example_signed.pak";

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== pakcache-rs Signed Archive Example ===\n");

    let signing_key = SigningKey::generate(&mut OsRng);
    let verifying_key = signing_key.verifying_key();
    let cdr_key = CdrKey::Passphrase("correct horse battery staple".to_string());

    println!("1. Creating signed, encrypted archive...");
    {
        let options = CacheOptions::default()
            .with_signing_key(signing_key)
            .with_cdr_key(cdr_key.clone())
            .with_extended_header(
                ExtendedHeader::new("example-engine").with_property("build", "1024"),
            );
        let mut cache = ArchiveCache::create(ARCHIVE, options)?;
        cache.update_file("config/game.toml", b"difficulty = \"hard\"\n", CodecId::STORE, 0)?;
        cache.update_file_auto("levels/intro.txt", "welcome ".repeat(1000).as_bytes())?;
        cache.write_cdr()?;
        println!("   ✓ Signed by {}", hex::encode(verifying_key.to_bytes()));
    }

    println!("\n2. Opening with the pinned publisher key...");
    let options = CacheOptions::default()
        .with_cdr_key(cdr_key)
        .with_trusted_key(verifying_key)
        .read_only();
    let mut cache = ArchiveCache::open(ARCHIVE, options)?;
    println!("   Signer:    {}", cache.signer().unwrap_or_default());
    println!("   Encrypted: {}", cache.is_encrypted());
    if let Some(header) = cache.extended_header() {
        println!("   Vendor:    {}", header.vendor);
    }
    for path in cache.list_files() {
        let data = cache.read_file_to_vec(&path)?;
        println!("     - {} ({} bytes)", path, data.len());
    }

    println!("\n3. Opening without the key...");
    match ArchiveCache::open(ARCHIVE, CacheOptions::default()) {
        Err(e) => println!("   ✓ Refused: {}", e),
        Ok(_) => return Err("encrypted directory opened without a key".into()),
    }

    println!("\n✓ Example complete!");
    Ok(())
}
