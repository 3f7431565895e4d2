use std::io;
use thiserror::Error;

/// Result type for pak cache operations
pub type Result<T> = std::result::Result<T, PakError>;

/// Coarse classification of a [`PakError`]
///
/// Callers that only need to branch on the kind of failure (retry, report,
/// give up) should match on this instead of the concrete variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Operation attempted on a cache that has no archive bound
    NotOpen,
    /// Path absent from the archive
    NotFound,
    /// Conflicting insert (file vs. directory, or an active stream)
    AlreadyExists,
    /// Mutation attempted on a read-only cache
    ReadOnly,
    /// Directory or entry data inconsistent with the file, checksum or signature
    Corrupt,
    /// Underlying file operation failed
    IoFailure,
    /// `relink_zip` called while compaction is disabled
    CompactionDisallowed,
    /// Bad caller input: sizes, paths, codecs, levels, keys
    InvalidArgument,
    /// A codec failed to compress
    CodecFailure,
}

/// Unified error type for all pak cache operations
#[derive(Debug, Error)]
pub enum PakError {
    // Cache state errors
    #[error("No archive is open in this cache")]
    NotOpen,

    #[error("Archive is opened read-only")]
    ReadOnly,

    #[error("Compaction is disabled for this archive")]
    CompactionDisallowed,

    // Lookup errors
    #[error("File not found in archive: {0}")]
    FileNotFound(String),

    #[error("Path already exists in archive: {0}")]
    AlreadyExists(String),

    // Argument errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Path error: {0}")]
    PathError(String),

    #[error("Unknown codec id: {0:#x}")]
    UnknownCodec(u32),

    #[error("Invalid level {level} for codec {codec}")]
    InvalidLevel { codec: &'static str, level: i32 },

    #[error("Entry is still being streamed: {0}")]
    IncompleteEntry(String),

    #[error("Directory is encrypted and no key was supplied")]
    MissingDecryptionKey,

    #[error("Configuration error: {0}")]
    Config(String),

    // Format errors
    #[error("Invalid archive format: {0}")]
    InvalidFormat(String),

    #[error("Invalid magic number in archive header")]
    InvalidMagic,

    #[error("Unsupported archive version: {0}")]
    UnsupportedVersion(u16),

    #[error("CRC mismatch for {path}: expected {expected:08x}, got {actual:08x}")]
    CrcMismatch {
        path: String,
        expected: u32,
        actual: u32,
    },

    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("Directory decryption failed")]
    DecryptionFailed,

    #[error("Signature verification failed: {0}")]
    SignatureVerificationFailed(String),

    #[error("Extended header is malformed: {0}")]
    Json(#[from] serde_json::Error),

    // Codec errors
    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    #[error("Directory encryption failed")]
    EncryptionFailed,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PakError {
    /// Map this error onto its [`ErrorKind`]
    pub fn kind(&self) -> ErrorKind {
        match self {
            PakError::NotOpen => ErrorKind::NotOpen,
            PakError::ReadOnly => ErrorKind::ReadOnly,
            PakError::CompactionDisallowed => ErrorKind::CompactionDisallowed,
            PakError::FileNotFound(_) => ErrorKind::NotFound,
            PakError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            PakError::InvalidArgument(_)
            | PakError::PathError(_)
            | PakError::UnknownCodec(_)
            | PakError::InvalidLevel { .. }
            | PakError::IncompleteEntry(_)
            | PakError::MissingDecryptionKey
            | PakError::Config(_) => ErrorKind::InvalidArgument,
            PakError::InvalidFormat(_)
            | PakError::InvalidMagic
            | PakError::UnsupportedVersion(_)
            | PakError::CrcMismatch { .. }
            | PakError::DecompressionFailed(_)
            | PakError::DecryptionFailed
            | PakError::SignatureVerificationFailed(_)
            | PakError::Json(_) => ErrorKind::Corrupt,
            PakError::CompressionFailed(_) | PakError::EncryptionFailed => {
                ErrorKind::CodecFailure
            }
            PakError::Io(_) => ErrorKind::IoFailure,
        }
    }
}

impl From<toml::de::Error> for PakError {
    fn from(err: toml::de::Error) -> Self {
        PakError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for PakError {
    fn from(err: toml::ser::Error) -> Self {
        PakError::Config(err.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for PakError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        PakError::SignatureVerificationFailed(err.to_string())
    }
}
