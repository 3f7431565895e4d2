//! Compression codec registry
//!
//! Codecs are stateless: each one turns a byte slice into a compressed byte
//! slice at a given level and back. The registry is an ordinary value owned
//! (through an `Arc`) by every cache that uses it, so different caches can run
//! with different codec sets and tests can register fakes.

use crate::error::{PakError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

/// Identifier stored in every record header and directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodecId(pub u32);

impl CodecId {
    /// Pass-through, always available
    pub const STORE: CodecId = CodecId(0);
    /// Raw deflate (same id zip uses)
    pub const DEFLATE: CodecId = CodecId(8);
    /// Zstandard (same id zip uses)
    pub const ZSTD: CodecId = CodecId(93);
    /// LZ4 block format
    pub const LZ4: CodecId = CodecId(0x4C5A);

    pub fn is_store(self) -> bool {
        self == Self::STORE
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A compression algorithm the cache can select per file
pub trait Codec: Send + Sync {
    /// Identifier written to disk
    fn id(&self) -> CodecId;

    /// Human readable name, used in errors and logs
    fn name(&self) -> &'static str;

    /// Upper bound of the compressed size, used to pre-size write buffers
    fn estimate_compressed_size(&self, uncompressed_size: usize) -> usize;

    /// Accepted level range (inclusive)
    fn level_range(&self) -> (i32, i32);

    /// Compress `data`, appending the output to `out`
    fn compress(&self, data: &[u8], level: i32, out: &mut Vec<u8>) -> Result<()>;

    /// Decompress `data`, which must expand to exactly `expected_size` bytes
    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>>;

    /// Reject levels outside [`Codec::level_range`]
    fn validate_level(&self, level: i32) -> Result<()> {
        let (min, max) = self.level_range();
        if level < min || level > max {
            return Err(PakError::InvalidLevel {
                codec: self.name(),
                level,
            });
        }
        Ok(())
    }
}

/// Stored (uncompressed) payloads
#[derive(Debug, Default, Clone, Copy)]
pub struct StoreCodec;

impl Codec for StoreCodec {
    fn id(&self) -> CodecId {
        CodecId::STORE
    }

    fn name(&self) -> &'static str {
        "store"
    }

    fn estimate_compressed_size(&self, uncompressed_size: usize) -> usize {
        uncompressed_size
    }

    fn level_range(&self) -> (i32, i32) {
        // Level is meaningless for stored data, accept anything
        (i32::MIN, i32::MAX)
    }

    fn compress(&self, data: &[u8], _level: i32, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(data);
        Ok(())
    }

    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        check_size(self.name(), data.len(), expected_size)?;
        Ok(data.to_vec())
    }
}

/// Raw deflate via flate2
#[derive(Debug, Default, Clone, Copy)]
pub struct DeflateCodec;

impl Codec for DeflateCodec {
    fn id(&self) -> CodecId {
        CodecId::DEFLATE
    }

    fn name(&self) -> &'static str {
        "deflate"
    }

    fn estimate_compressed_size(&self, n: usize) -> usize {
        // zlib's deflateBound for the default window/memory settings
        n + (n >> 12) + (n >> 14) + (n >> 25) + 13
    }

    fn level_range(&self) -> (i32, i32) {
        (0, 9)
    }

    fn compress(&self, data: &[u8], level: i32, out: &mut Vec<u8>) -> Result<()> {
        self.validate_level(level)?;
        let mut encoder =
            flate2::write::DeflateEncoder::new(out, flate2::Compression::new(level as u32));
        encoder
            .write_all(data)
            .map_err(|e| PakError::CompressionFailed(format!("Deflate compression failed: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| PakError::CompressionFailed(format!("Deflate compression failed: {}", e)))?;
        Ok(())
    }

    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        let mut output = Vec::with_capacity(expected_size);
        // Read at most one byte past the expected size so oversized streams are caught
        flate2::read::DeflateDecoder::new(data)
            .take(expected_size as u64 + 1)
            .read_to_end(&mut output)
            .map_err(|e| {
                PakError::DecompressionFailed(format!("Deflate decompression failed: {}", e))
            })?;
        check_size(self.name(), output.len(), expected_size)?;
        Ok(output)
    }
}

/// Zstandard via the zstd crate
#[derive(Debug, Default, Clone, Copy)]
pub struct ZstdCodec;

impl Codec for ZstdCodec {
    fn id(&self) -> CodecId {
        CodecId::ZSTD
    }

    fn name(&self) -> &'static str {
        "zstd"
    }

    fn estimate_compressed_size(&self, uncompressed_size: usize) -> usize {
        zstd::zstd_safe::compress_bound(uncompressed_size)
    }

    fn level_range(&self) -> (i32, i32) {
        (1, 22)
    }

    fn compress(&self, data: &[u8], level: i32, out: &mut Vec<u8>) -> Result<()> {
        self.validate_level(level)?;
        let compressed = zstd::bulk::compress(data, level)
            .map_err(|e| PakError::CompressionFailed(format!("Zstd compression failed: {}", e)))?;
        out.extend_from_slice(&compressed);
        Ok(())
    }

    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        let output = zstd::bulk::decompress(data, expected_size).map_err(|e| {
            PakError::DecompressionFailed(format!("Zstd decompression failed: {}", e))
        })?;
        check_size(self.name(), output.len(), expected_size)?;
        Ok(output)
    }
}

/// LZ4 block format via lz4_flex
#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn id(&self) -> CodecId {
        CodecId::LZ4
    }

    fn name(&self) -> &'static str {
        "lz4"
    }

    fn estimate_compressed_size(&self, uncompressed_size: usize) -> usize {
        lz4_flex::block::get_maximum_output_size(uncompressed_size)
    }

    fn level_range(&self) -> (i32, i32) {
        // lz4_flex has a single speed setting
        (0, 12)
    }

    fn compress(&self, data: &[u8], level: i32, out: &mut Vec<u8>) -> Result<()> {
        self.validate_level(level)?;
        out.extend_from_slice(&lz4_flex::block::compress(data));
        Ok(())
    }

    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        let output = lz4_flex::block::decompress(data, expected_size).map_err(|e| {
            PakError::DecompressionFailed(format!("LZ4 decompression failed: {}", e))
        })?;
        check_size(self.name(), output.len(), expected_size)?;
        Ok(output)
    }
}

fn check_size(codec: &str, actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(PakError::DecompressionFailed(format!(
            "{} output size mismatch: expected {}, got {}",
            codec, expected, actual
        )));
    }
    Ok(())
}

/// Threshold below which files are stored rather than compressed (4KB)
const MIN_COMPRESSION_SIZE: usize = 4096;

/// Maps codec ids to codec implementations
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<CodecId, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// Registry with only the store codec
    pub fn store_only() -> Self {
        let mut codecs: HashMap<CodecId, Arc<dyn Codec>> = HashMap::new();
        codecs.insert(CodecId::STORE, Arc::new(StoreCodec));
        Self { codecs }
    }

    /// Registry with store, deflate, zstd and lz4
    pub fn with_defaults() -> Self {
        let mut registry = Self::store_only();
        registry.register(Arc::new(DeflateCodec));
        registry.register(Arc::new(ZstdCodec));
        registry.register(Arc::new(Lz4Codec));
        registry
    }

    /// Add or replace a codec. The store codec cannot be replaced.
    pub fn register(&mut self, codec: Arc<dyn Codec>) -> Option<Arc<dyn Codec>> {
        let id = codec.id();
        if id.is_store() {
            return None;
        }
        self.codecs.insert(id, codec)
    }

    /// Look up a codec by id
    pub fn get(&self, id: CodecId) -> Result<&Arc<dyn Codec>> {
        self.codecs.get(&id).ok_or(PakError::UnknownCodec(id.0))
    }

    pub fn contains(&self, id: CodecId) -> bool {
        self.codecs.contains_key(&id)
    }

    /// Registered ids in ascending order
    pub fn ids(&self) -> Vec<CodecId> {
        let mut ids: Vec<CodecId> = self.codecs.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Choose a codec from file name and size, restricted to registered codecs
    pub fn choose_for_file(&self, path: &str, size: usize) -> CodecId {
        // Don't compress small files
        if size < MIN_COMPRESSION_SIZE {
            return CodecId::STORE;
        }

        let extension = path.rsplit('.').next().unwrap_or("").to_lowercase();

        let preferred = match extension.as_str() {
            // Already compressed formats
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "mp3" | "mp4" | "ogg" | "zip" | "gz"
            | "bz2" | "pak" => CodecId::STORE,
            // Text formats - use Zstd for best compression
            "json" | "txt" | "xml" | "html" | "css" | "js" | "lua" | "md" | "csv" | "cfg"
            | "ini" => CodecId::ZSTD,
            // Default: LZ4 for speed
            _ => CodecId::LZ4,
        };

        if self.contains(preferred) {
            preferred
        } else {
            CodecId::STORE
        }
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&'static str> = self
            .ids()
            .into_iter()
            .filter_map(|id| self.codecs.get(&id).map(|c| c.name()))
            .collect();
        f.debug_struct("CodecRegistry").field("codecs", &names).finish()
    }
}
