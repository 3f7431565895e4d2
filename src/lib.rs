//! pakcache-rs: randomly updatable pak archives
//!
//! An archive is one file holding many compressed records followed by a
//! central directory. Files can be added, replaced, removed or streamed in
//! piecewise without rewriting the archive; replaced and removed records
//! leave holes that a bounded-memory compaction pass reclaims later.
//!
//! - Pluggable per-file compression (store, deflate, zstd, lz4)
//! - Optional AES-256-GCM encrypted and Ed25519 signed directories
//! - Continuous (segmented) updates for streaming writers
//! - Fast path lookup through an in-memory directory tree
//!
//! # Example
//!
//! ```no_run
//! use pakcache_rs::{ArchiveCache, CacheOptions, CodecId};
//!
//! let mut cache = ArchiveCache::create("example.pak", CacheOptions::default())?;
//! cache.update_file("data/hello.txt", b"Hello, World!", CodecId::ZSTD, 3)?;
//! cache.write_cdr()?;
//!
//! let data = cache.read_file_to_vec("data/hello.txt")?;
//! assert_eq!(data, b"Hello, World!");
//!
//! cache.remove_file("data/hello.txt")?;
//! cache.relink_zip()?;
//! # Ok::<(), pakcache_rs::PakError>(())
//! ```

pub mod archive;
pub mod codec;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use archive::{
    ArchiveCache, CacheFactory, CacheFlags, CacheOptions, CdrKey, EntryFlags, ExtendedHeader,
    FileEntry, FileEntryTree, FileHeader, RelinkStats, SharedCache, FORMAT_VERSION_MAJOR,
    FORMAT_VERSION_MINOR, HEADER_SIZE, MAGIC_NUMBER,
};
pub use codec::{Codec, CodecId, CodecRegistry};
pub use config::{CacheConfig, RelinkConfig};
pub use error::{ErrorKind, PakError, Result};
