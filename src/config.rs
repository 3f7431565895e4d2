//! Cache configuration
//!
//! Every field has a default, so a TOML file only needs the keys it changes:
//!
//! ```toml
//! verify_crc = false
//!
//! [relink]
//! auto_threshold = 0.25
//! ```

use crate::error::{PakError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Behavior switches for an [`ArchiveCache`](crate::ArchiveCache)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Reject every mutation
    pub read_only: bool,
    /// Reject `relink_zip` with `CompactionDisallowed`
    pub dont_compact: bool,
    /// Check CRC-32 on reads of entries whose CRC is known
    pub verify_crc: bool,
    /// Let a replacement overwrite the old record in place when it fits
    pub reuse_slots: bool,
    /// Store a payload instead when compression does not shrink it
    pub fallback_to_store: bool,
    /// Largest accepted entry (uncompressed bytes)
    pub max_entry_size: u64,
    /// Level used by `update_file_auto`
    pub default_level: i32,
    /// PBKDF2 rounds for passphrase-keyed directories
    pub kdf_iterations: u32,
    pub relink: RelinkConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            dont_compact: false,
            verify_crc: true,
            reuse_slots: false,
            fallback_to_store: true,
            max_entry_size: u32::MAX as u64,
            default_level: 6,
            kdf_iterations: 100_000,
            relink: RelinkConfig::default(),
        }
    }
}

/// Compaction tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelinkConfig {
    /// Bytes buffered before a batch is flushed to the new file
    pub buffer_size: usize,
    /// Entries buffered before a batch is flushed
    pub max_batch_items: usize,
    /// Hole ratio at which `write_cdr` compacts instead (None disables)
    pub auto_threshold: Option<f64>,
}

impl Default for RelinkConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024 * 1024,
            max_batch_items: 128,
            auto_threshold: None,
        }
    }
}

impl CacheConfig {
    /// Parse from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: CacheConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_entry_size == 0 {
            return Err(PakError::Config("max_entry_size must be positive".into()));
        }
        if self.kdf_iterations == 0 {
            return Err(PakError::Config("kdf_iterations must be positive".into()));
        }
        if self.relink.buffer_size == 0 {
            return Err(PakError::Config("relink.buffer_size must be positive".into()));
        }
        if self.relink.max_batch_items == 0 {
            return Err(PakError::Config(
                "relink.max_batch_items must be positive".into(),
            ));
        }
        if let Some(threshold) = self.relink.auto_threshold {
            if !(threshold > 0.0 && threshold <= 1.0) {
                return Err(PakError::Config(format!(
                    "relink.auto_threshold must be in (0, 1], got {}",
                    threshold
                )));
            }
        }
        Ok(())
    }
}
