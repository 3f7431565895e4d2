use crate::archive::cdr::{self, CentralRecord, EncodeOptions};
use crate::archive::end_record::{EndRecord, END_RECORD_SIZE};
use crate::archive::entry::{FileEntry, TreeId};
use crate::archive::flags::{CacheFlags, EntryFlags};
use crate::archive::format::{FileHeader, HEADER_SIZE};
use crate::archive::headers::{CdrKey, EncryptionHeader, ExtendedHeader, SignatureHeader};
use crate::archive::local_entry::{LocalRecordHeader, LOCAL_RECORD_CRC_OFFSET};
use crate::archive::path_pool::{normalize_dir_path, normalize_path, PathPool};
use crate::archive::relink::{self, DirectoryWrite, RelinkSource, RelinkStats};
use crate::archive::stream::StreamProgress;
use crate::archive::tree::{Entries, FileEntryTree};
use crate::codec::{Codec, CodecId, CodecRegistry};
use crate::config::CacheConfig;
use crate::error::{PakError, Result};
use ed25519_dalek::{SigningKey, VerifyingKey};
use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything an [`ArchiveCache`] is constructed with
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    pub config: CacheConfig,
    pub codecs: Arc<CodecRegistry>,
    /// Key for an encrypted directory; also enables encryption of an
    /// unencrypted archive at its next directory write
    pub cdr_key: Option<CdrKey>,
    /// Directories written by the cache are signed with this key
    pub signing_key: Option<SigningKey>,
    /// Only open archives signed by this key
    pub trusted_key: Option<VerifyingKey>,
    /// Extended header for new archives, or archives that have none
    pub extended_header: Option<ExtendedHeader>,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_codecs(mut self, codecs: Arc<CodecRegistry>) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn with_cdr_key(mut self, key: CdrKey) -> Self {
        self.cdr_key = Some(key);
        self
    }

    pub fn with_signing_key(mut self, key: SigningKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    pub fn with_trusted_key(mut self, key: VerifyingKey) -> Self {
        self.trusted_key = Some(key);
        self
    }

    pub fn with_extended_header(mut self, header: ExtendedHeader) -> Self {
        self.extended_header = Some(header);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.config.read_only = true;
        self
    }
}

/// Encryption header plus the AES key derived for it
struct CdrCrypto {
    header: EncryptionHeader,
    key: [u8; 32],
}

impl CdrCrypto {
    fn new(key: &CdrKey, iterations: u32) -> Result<Self> {
        let header = EncryptionHeader::for_key(key, iterations);
        let key = header.derive_key(key)?;
        Ok(Self { header, key })
    }
}

/// Compressed bytes of one record with its header already in front
struct PreparedRecord {
    bytes: Vec<u8>,
    header: LocalRecordHeader,
    level: i32,
}

/// A mutable archive bound to one file
///
/// New and replaced records are appended at the tail of live data, which is
/// where the central directory starts; the directory is rewritten behind
/// them by [`write_cdr`](Self::write_cdr). Replaced and removed records leave
/// holes that only [`relink_zip`](Self::relink_zip) reclaims.
///
/// Nothing is flushed implicitly: a cache dropped with a dirty directory
/// leaves an archive that fails to open until it is rebuilt.
pub struct ArchiveCache {
    path: Option<PathBuf>,
    file: Option<File>,
    header: FileHeader,
    tree: FileEntryTree,
    pool: PathPool,
    flags: CacheFlags,
    config: CacheConfig,
    codecs: Arc<CodecRegistry>,
    /// Start of the directory on disk, which is also the end of live data
    cdr_offset: u64,
    /// Directory region as last read or written
    cdr_buffer: Vec<u8>,
    hole_bytes: u64,
    file_len: u64,
    streams: HashMap<Arc<str>, StreamProgress>,
    crypto: Option<CdrCrypto>,
    signing_key: Option<SigningKey>,
    signature: Option<SignatureHeader>,
    extended: Option<ExtendedHeader>,
}

impl ArchiveCache {
    /// A cache bound to no file; every archive operation returns `NotOpen`
    pub fn unbound(options: CacheOptions) -> Self {
        let mut flags = CacheFlags::empty();
        if options.config.read_only {
            flags.insert(CacheFlags::READ_ONLY);
        }
        if options.config.dont_compact {
            flags.insert(CacheFlags::DONT_COMPACT);
        }

        Self {
            path: None,
            file: None,
            header: FileHeader::new(),
            tree: FileEntryTree::new(),
            pool: PathPool::new(),
            flags,
            config: options.config,
            codecs: options.codecs,
            cdr_offset: HEADER_SIZE as u64,
            cdr_buffer: Vec::new(),
            hole_bytes: 0,
            file_len: 0,
            streams: HashMap::new(),
            crypto: None,
            signing_key: options.signing_key,
            signature: None,
            extended: options.extended_header,
        }
    }

    /// Create (or truncate) an archive and write an empty directory
    pub fn create<P: AsRef<Path>>(path: P, options: CacheOptions) -> Result<Self> {
        options.config.validate()?;
        if options.config.read_only {
            return Err(PakError::ReadOnly);
        }

        let crypto = match &options.cdr_key {
            Some(key) => Some(CdrCrypto::new(key, options.config.kdf_iterations)?),
            None => None,
        };

        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let header = FileHeader::new();
        header.write_to(&mut file)?;

        let mut cache = Self::unbound(options);
        cache.path = Some(path);
        cache.file = Some(file);
        cache.header = header;
        cache.file_len = HEADER_SIZE as u64;
        cache.crypto = crypto;
        cache.flags.mark_cdr_dirty();
        cache.write_cdr()?;

        info!(path = %cache.display_path(), "created archive");
        Ok(cache)
    }

    /// Open an existing archive
    pub fn open<P: AsRef<Path>>(path: P, options: CacheOptions) -> Result<Self> {
        options.config.validate()?;

        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(!options.config.read_only)
            .open(&path)?;

        let file_len = file.metadata()?.len();
        let min_len = (HEADER_SIZE + END_RECORD_SIZE) as u64;
        if file_len < min_len {
            return Err(PakError::InvalidFormat(format!(
                "File too small to be an archive: {} bytes",
                file_len
            )));
        }

        let header = FileHeader::read_from(&mut file)?;
        if header.is_cdr_pending() {
            return Err(PakError::InvalidFormat(
                "Archive was modified without rewriting its directory".to_string(),
            ));
        }

        let cdr_end = header
            .cdr_offset
            .checked_add(header.cdr_size)
            .and_then(|end| end.checked_add(END_RECORD_SIZE as u64));
        if header.cdr_offset < HEADER_SIZE as u64 || cdr_end != Some(file_len) {
            return Err(PakError::InvalidFormat(format!(
                "Directory at {} (+{} bytes) does not end the {} byte file",
                header.cdr_offset, header.cdr_size, file_len
            )));
        }

        file.seek(SeekFrom::Start(file_len - END_RECORD_SIZE as u64))?;
        let end = EndRecord::read_from(&mut file)?;
        end.validate_against_header(&header)?;

        let mut cdr_bytes = vec![0u8; header.cdr_size as usize];
        file.seek(SeekFrom::Start(header.cdr_offset))?;
        file.read_exact(&mut cdr_bytes)?;
        end.verify_directory(&cdr_bytes)?;

        let legacy_count = header.is_legacy().then_some(header.record_count);
        let decoded = cdr::decode_directory(&cdr_bytes, legacy_count, options.cdr_key.as_ref())?;
        if decoded.records.len() != header.record_count as usize {
            return Err(PakError::InvalidFormat(format!(
                "Directory holds {} records, header says {}",
                decoded.records.len(),
                header.record_count
            )));
        }

        if let Some(trusted) = &options.trusted_key {
            match &decoded.headers.signature {
                None => {
                    return Err(PakError::SignatureVerificationFailed(
                        "archive directory is not signed".to_string(),
                    ))
                }
                Some(signature) if signature.public_key != trusted.to_bytes() => {
                    return Err(PakError::SignatureVerificationFailed(format!(
                        "directory signed by untrusted key {}",
                        signature.fingerprint()
                    )))
                }
                Some(_) => {}
            }
        }

        let crypto = match (decoded.headers.encryption, decoded.derived_key) {
            (Some(header), Some(key)) => Some(CdrCrypto { header, key }),
            _ => match &options.cdr_key {
                Some(key) => Some(CdrCrypto::new(key, options.config.kdf_iterations)?),
                None => None,
            },
        };

        let mut cache = Self::unbound(options);
        cache.path = Some(path);
        cache.cdr_offset = header.cdr_offset;
        cache.file_len = file_len;
        cache.header = header;
        cache.load_records(decoded.records)?;
        cache.crypto = crypto;
        cache.signature = decoded.headers.signature;
        if decoded.headers.extended.is_some() {
            cache.extended = decoded.headers.extended;
        }
        cache.cdr_buffer = cdr_bytes;
        cache.file = Some(file);

        if cache.header.is_legacy() {
            info!(path = %cache.display_path(), "opened v1.0 archive, next directory write upgrades it");
        }
        info!(
            path = %cache.display_path(),
            entries = cache.tree.len(),
            hole_bytes = cache.hole_bytes,
            signed = cache.signature.is_some(),
            encrypted = cache.crypto.is_some(),
            "opened archive"
        );
        Ok(cache)
    }

    pub fn open_or_create<P: AsRef<Path>>(path: P, options: CacheOptions) -> Result<Self> {
        if path.as_ref().exists() {
            Self::open(path, options)
        } else {
            Self::create(path, options)
        }
    }

    /// Release the file without writing anything
    pub fn close(&mut self) {
        if self.file.is_none() {
            return;
        }
        if self.flags.is_cdr_dirty() {
            warn!(path = %self.display_path(), "closing archive with unwritten directory changes");
        }

        self.file = None;
        self.path = None;
        self.tree.clear();
        self.streams.clear();
        self.cdr_buffer.clear();
        self.pool.purge();
        self.flags.clear_cdr_dirty();
        self.flags.clear_uncompacted();
        self.hole_bytes = 0;
        self.file_len = 0;
        self.cdr_offset = HEADER_SIZE as u64;
    }

    fn load_records(&mut self, records: Vec<CentralRecord>) -> Result<()> {
        let mut regions = Vec::with_capacity(records.len());

        for record in records {
            let normalized = normalize_path(&record.path).map_err(|_| {
                PakError::InvalidFormat(format!("Unsafe path in directory: {:?}", record.path))
            })?;
            if normalized != record.path {
                return Err(PakError::InvalidFormat(format!(
                    "Non-canonical path in directory: {:?}",
                    record.path
                )));
            }

            if record.is_directory() {
                self.tree
                    .create_dir(&mut self.pool, &normalized)
                    .map_err(|e| PakError::InvalidFormat(e.to_string()))?;
                continue;
            }

            let data_offset =
                record.record_offset + LocalRecordHeader::size_for_path(&normalized) as u64;
            let data_end = data_offset.checked_add(record.compressed_size);
            if record.record_offset < HEADER_SIZE as u64
                || data_end.map_or(true, |end| end > self.cdr_offset)
            {
                return Err(PakError::InvalidFormat(format!(
                    "Entry {} lies outside the data region",
                    normalized
                )));
            }

            let entry = FileEntry {
                path: self.pool.intern(&normalized),
                record_offset: record.record_offset,
                data_offset,
                compressed_size: record.compressed_size,
                uncompressed_size: record.uncompressed_size,
                codec: record.codec,
                level: record.level,
                crc32: record.crc32,
                flags: record.flags,
                full_info: false,
                owner: TreeId::DETACHED,
            };
            regions.push((record.record_offset, data_offset + record.compressed_size));

            let previous = self
                .tree
                .insert(&mut self.pool, entry)
                .map_err(|e| PakError::InvalidFormat(e.to_string()))?;
            if previous.is_some() {
                return Err(PakError::InvalidFormat(format!(
                    "Duplicate path in directory: {}",
                    normalized
                )));
            }
        }

        regions.sort_unstable();
        let mut live = 0u64;
        let mut previous_end = HEADER_SIZE as u64;
        for (start, end) in regions {
            if start < previous_end {
                return Err(PakError::InvalidFormat(format!(
                    "Overlapping records at offset {}",
                    start
                )));
            }
            live += end - start;
            previous_end = end;
        }

        self.hole_bytes = self.cdr_offset - HEADER_SIZE as u64 - live;
        if self.hole_bytes > 0 {
            self.flags.mark_uncompacted();
        }
        Ok(())
    }

    // ---- queries ----

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn flags(&self) -> CacheFlags {
        self.flags
    }

    pub fn is_uncompacted(&self) -> bool {
        self.flags.is_uncompacted()
    }

    pub fn is_cdr_dirty(&self) -> bool {
        self.flags.is_cdr_dirty()
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.is_read_only()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.codecs
    }

    /// Bytes in the data region no live entry references
    pub fn hole_bytes(&self) -> u64 {
        self.hole_bytes
    }

    pub fn file_length(&self) -> u64 {
        self.file_len
    }

    pub fn cdr_offset(&self) -> u64 {
        self.cdr_offset
    }

    /// The directory region as last read from or written to disk
    pub fn cdr_bytes(&self) -> &[u8] {
        &self.cdr_buffer
    }

    pub fn entry_count(&self) -> usize {
        self.tree.len()
    }

    /// All file entries, depth-first
    pub fn entries(&self) -> Entries<'_> {
        self.tree.entries()
    }

    pub fn list_files(&self) -> Vec<String> {
        self.tree.entries().map(|e| e.path.to_string()).collect()
    }

    pub fn contains_dir(&self, path: &str) -> bool {
        normalize_dir_path(path).map_or(false, |p| self.tree.contains_dir(&p))
    }

    pub fn is_encrypted(&self) -> bool {
        self.crypto.is_some()
    }

    /// Hex fingerprint of the key that signed the directory on disk
    pub fn signer(&self) -> Option<String> {
        self.signature.as_ref().map(SignatureHeader::fingerprint)
    }

    pub fn extended_header(&self) -> Option<&ExtendedHeader> {
        self.extended.as_ref()
    }

    /// Progress of an unfinished continuous update
    pub fn stream_progress(&self, path: &str) -> Option<&StreamProgress> {
        let normalized = normalize_path(path).ok()?;
        self.streams.get(normalized.as_str())
    }

    /// Look up an entry; `full_info` forces its local header to be read
    pub fn find_file(&mut self, path: &str, full_info: bool) -> Result<Option<FileEntry>> {
        self.ensure_open()?;
        let normalized = normalize_path(path)?;

        let needs_refresh = match self.tree.find(&normalized) {
            None => return Ok(None),
            Some(entry) => full_info && !entry.full_info,
        };
        if needs_refresh {
            self.hydrate(&normalized).map(Some)
        } else {
            Ok(self.tree.find(&normalized).cloned())
        }
    }

    /// Re-read an entry's metadata from its local record header
    pub fn refresh(&mut self, entry: &mut FileEntry) -> Result<()> {
        self.ensure_open()?;
        if !self.tree.is_owner_of(entry) {
            return Err(PakError::InvalidArgument(format!(
                "Entry {} does not belong to this archive",
                entry.path
            )));
        }

        if let Some(live) = self.tree.find_mut(&entry.path) {
            live.full_info = false;
        }
        *entry = self.hydrate(&entry.path)?;
        Ok(())
    }

    /// Decompress `entry` into `out`, which must be exactly its uncompressed size
    pub fn read_file(&mut self, entry: &FileEntry, out: &mut [u8]) -> Result<()> {
        self.ensure_open()?;
        if !self.tree.is_owner_of(entry) {
            return Err(PakError::InvalidArgument(format!(
                "Entry {} does not belong to this archive",
                entry.path
            )));
        }
        if out.len() as u64 != entry.uncompressed_size {
            return Err(PakError::InvalidArgument(format!(
                "Output buffer is {} bytes, {} expands to {}",
                out.len(),
                entry.path,
                entry.uncompressed_size
            )));
        }

        let live = self.hydrate(&entry.path)?;
        if live.is_pending() {
            return Err(PakError::IncompleteEntry(live.path.to_string()));
        }
        if live.data_end() > self.file_len || live.data_end() > self.cdr_offset {
            return Err(PakError::InvalidFormat(format!(
                "Entry {} ends at {}, past the data region",
                live.path,
                live.data_end()
            )));
        }
        if live.codec.is_store() && live.compressed_size != live.uncompressed_size {
            return Err(PakError::InvalidFormat(format!(
                "Stored entry {} has mismatched sizes",
                live.path
            )));
        }

        let codec = Arc::clone(self.codecs.get(live.codec)?);
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(live.data_offset))?;

        if live.codec.is_store() {
            file.read_exact(out)
                .map_err(|e| truncated_as_corrupt(e.into()))?;
        } else {
            let mut compressed = vec![0u8; live.compressed_size as usize];
            file.read_exact(&mut compressed)
                .map_err(|e| truncated_as_corrupt(e.into()))?;
            let decompressed = codec.decompress(&compressed, out.len())?;
            if decompressed.len() != out.len() {
                return Err(PakError::DecompressionFailed(format!(
                    "{} expanded to {} bytes, expected {}",
                    live.path,
                    decompressed.len(),
                    out.len()
                )));
            }
            out.copy_from_slice(&decompressed);
        }

        if self.config.verify_crc && live.has_valid_crc() {
            let actual = crc32fast::hash(out);
            if actual != live.crc32 {
                return Err(PakError::CrcMismatch {
                    path: live.path.to_string(),
                    expected: live.crc32,
                    actual,
                });
            }
        }
        Ok(())
    }

    pub fn read_file_to_vec(&mut self, path: &str) -> Result<Vec<u8>> {
        let entry = self
            .find_file(path, false)?
            .ok_or_else(|| PakError::FileNotFound(path.to_string()))?;
        if entry.uncompressed_size > self.config.max_entry_size {
            return Err(PakError::InvalidFormat(format!(
                "Entry {} claims {} bytes, above max_entry_size",
                entry.path, entry.uncompressed_size
            )));
        }

        let mut out = vec![0u8; entry.uncompressed_size as usize];
        self.read_file(&entry, &mut out)?;
        Ok(out)
    }

    // ---- mutations ----

    /// Insert or replace a file, compressing it with `codec` at `level`
    ///
    /// The tree only changes once the record is on disk, so a failure leaves
    /// any previous entry intact.
    pub fn update_file(&mut self, path: &str, data: &[u8], codec: CodecId, level: i32) -> Result<()> {
        self.ensure_writable()?;
        let normalized = normalize_path(path)?;
        self.check_entry_size(data.len() as u64)?;
        let codec = Arc::clone(self.codecs.get(codec)?);
        codec.validate_level(level)?;
        self.tree.check_insert(&normalized)?;

        let record = self.build_record(&normalized, data, codec.as_ref(), level)?;

        let mut previous = self.tree.find(&normalized).cloned();
        let mut slot = None;
        if let Some(old) = &previous {
            if self.config.reuse_slots && !old.is_pending() {
                let old = self.hydrate(&normalized)?;
                if record.bytes.len() as u64 <= old.record_len() {
                    slot = Some(old.record_offset);
                }
                previous = Some(old);
            }
        }

        let offset = match slot {
            Some(offset) => {
                self.write_at(offset, &record.bytes)?;
                offset
            }
            None => self.append_record(&record.bytes)?,
        };

        let entry = FileEntry::from_record(
            self.pool.intern(&normalized),
            offset,
            &record.header,
            record.level,
            EntryFlags::CRC_VALID,
        );
        let new_len = entry.record_len();
        self.tree.insert(&mut self.pool, entry)?;
        self.streams.remove(normalized.as_str());

        if let Some(old) = previous {
            if slot.is_some() {
                self.add_hole(old.record_len() - new_len);
            } else {
                self.release_region(&old);
            }
        }
        self.flags.mark_cdr_dirty();

        debug!(
            path = %normalized,
            offset,
            compressed = record.header.compressed_size,
            uncompressed = data.len(),
            codec = %record.header.codec,
            reused_slot = slot.is_some(),
            "updated file"
        );
        Ok(())
    }

    /// [`update_file`](Self::update_file) with a codec picked from the file
    /// name and size, at the configured default level
    pub fn update_file_auto(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let id = self.codecs.choose_for_file(path, data.len());
        let (min, max) = self.codecs.get(id)?.level_range();
        let level = self.config.default_level.clamp(min, max);
        self.update_file(path, data, id, level)
    }

    /// Reserve a stored entry of `expected_size` bytes for streamed writes
    pub fn start_continuous_file_update(&mut self, path: &str, expected_size: u64) -> Result<()> {
        self.ensure_writable()?;
        let normalized = normalize_path(path)?;
        if expected_size == 0 {
            return Err(PakError::InvalidArgument(format!(
                "Continuous update of {} needs a non-zero size",
                normalized
            )));
        }
        self.check_entry_size(expected_size)?;
        self.tree.check_insert(&normalized)?;

        if let Some(existing) = self.tree.find(&normalized).cloned() {
            if existing.is_pending() {
                if existing.uncompressed_size != expected_size {
                    return Err(PakError::AlreadyExists(format!(
                        "{} (pending update of {} bytes)",
                        normalized, existing.uncompressed_size
                    )));
                }
                self.streams
                    .insert(Arc::clone(&existing.path), StreamProgress::new(expected_size));
                debug!(path = %normalized, "restarted continuous update");
                return Ok(());
            }

            if existing.codec.is_store() && existing.uncompressed_size == expected_size {
                if let Some(live) = self.tree.find_mut(&normalized) {
                    live.flags.insert(EntryFlags::PENDING);
                    live.flags.remove(EntryFlags::CRC_VALID);
                }
                self.streams
                    .insert(Arc::clone(&existing.path), StreamProgress::new(expected_size));
                self.flags.mark_cdr_dirty();
                debug!(path = %normalized, offset = existing.record_offset, "continuous update reuses slot");
                return Ok(());
            }
        }

        let header = LocalRecordHeader::new(
            CodecId::STORE,
            expected_size,
            expected_size,
            0,
            normalized.as_str(),
        );
        let mut header_bytes = Vec::with_capacity(header.header_size());
        header.write_to(&mut header_bytes)?;

        let offset = self.cdr_offset;
        let data_end = offset + header_bytes.len() as u64 + expected_size;
        self.invalidate_disk_directory()?;
        self.write_at(offset, &header_bytes)?;
        if data_end > self.file_len {
            self.file_mut()?.set_len(data_end)?;
            self.file_len = data_end;
        }
        self.cdr_offset = data_end;

        let entry = FileEntry::from_record(
            self.pool.intern(&normalized),
            offset,
            &header,
            0,
            EntryFlags::PENDING,
        );
        if let Some(previous) = self.tree.insert(&mut self.pool, entry)? {
            self.release_region(&previous);
        }
        self.streams
            .insert(self.pool.intern(&normalized), StreamProgress::new(expected_size));
        self.flags.mark_cdr_dirty();

        debug!(path = %normalized, offset, size = expected_size, "reserved continuous update");
        Ok(())
    }

    /// Write one segment of a continuous update
    ///
    /// `seek` of `None` continues after the previous segment. Returns whether
    /// every byte of the entry has now been written; the CRC stays unknown
    /// until [`update_file_crc`](Self::update_file_crc).
    pub fn update_file_continuous_segment(
        &mut self,
        path: &str,
        total_size: u64,
        data: &[u8],
        seek: Option<u64>,
    ) -> Result<bool> {
        self.ensure_writable()?;
        let normalized = normalize_path(path)?;
        let entry = self.hydrate(&normalized)?;

        if !entry.codec.is_store() {
            return Err(PakError::InvalidArgument(format!(
                "{} is compressed; continuous updates need a stored entry",
                normalized
            )));
        }
        if entry.uncompressed_size != total_size {
            return Err(PakError::InvalidArgument(format!(
                "Total size {} does not match reserved size {} for {}",
                total_size, entry.uncompressed_size, normalized
            )));
        }
        if !entry.is_pending() && !self.streams.contains_key(&*entry.path) {
            return Err(PakError::InvalidArgument(format!(
                "{} has no continuous update in progress",
                normalized
            )));
        }

        let len = data.len() as u64;
        let pos = self
            .streams
            .entry(Arc::clone(&entry.path))
            .or_insert_with(|| StreamProgress::new(total_size))
            .position_for(seek, len)?;

        self.write_at(entry.data_offset + pos, data)?;

        let complete = match self.streams.get_mut(&*entry.path) {
            Some(progress) => {
                progress.record(pos, len);
                progress.is_complete()
            }
            None => false,
        };

        if let Some(live) = self.tree.find_mut(&normalized) {
            live.flags.remove(EntryFlags::CRC_VALID);
            if complete {
                live.flags.remove(EntryFlags::PENDING);
            }
        }
        if complete {
            self.streams.remove(&*entry.path);
        }
        self.flags.mark_cdr_dirty();

        debug!(path = %normalized, pos, len, complete, "wrote continuous segment");
        Ok(complete)
    }

    /// Patch the stored CRC of a fully written entry
    pub fn update_file_crc(&mut self, path: &str, crc: u32) -> Result<()> {
        self.ensure_writable()?;
        let normalized = normalize_path(path)?;
        let entry = self
            .tree
            .find(&normalized)
            .cloned()
            .ok_or_else(|| PakError::FileNotFound(normalized.clone()))?;
        if entry.is_pending() {
            return Err(PakError::IncompleteEntry(normalized));
        }

        self.write_at(entry.record_offset + LOCAL_RECORD_CRC_OFFSET, &crc.to_le_bytes())?;
        if let Some(live) = self.tree.find_mut(&normalized) {
            live.crc32 = crc;
            live.flags.insert(EntryFlags::CRC_VALID);
        }
        self.flags.mark_cdr_dirty();

        debug!(path = %normalized, crc = format_args!("{:08x}", crc), "updated crc");
        Ok(())
    }

    /// Remove one file; removing a missing path succeeds
    pub fn remove_file(&mut self, path: &str) -> Result<bool> {
        self.ensure_writable()?;
        let normalized = normalize_path(path)?;

        let Some(removed) = self.tree.remove_file(&normalized) else {
            return Ok(false);
        };
        self.release_region(&removed);
        self.streams.remove(normalized.as_str());
        drop(removed);
        self.pool.release(&normalized);
        self.flags.mark_cdr_dirty();

        debug!(path = %normalized, hole_bytes = self.hole_bytes, "removed file");
        Ok(true)
    }

    /// Remove a directory and everything below it, returning the number of
    /// files removed
    pub fn remove_dir(&mut self, path: &str) -> Result<usize> {
        self.ensure_writable()?;
        let normalized = normalize_dir_path(path)?;
        if !self.tree.contains_dir(&normalized) {
            return Ok(0);
        }

        let removed = self.tree.remove_dir(&normalized);
        let count = removed.len();
        for entry in &removed {
            self.release_region(entry);
            self.streams.remove(&*entry.path);
        }
        drop(removed);
        self.pool.purge();
        self.flags.mark_cdr_dirty();

        debug!(path = %normalized, count, "removed directory");
        Ok(count)
    }

    /// Remove every entry and directory
    pub fn remove_all(&mut self) -> Result<usize> {
        self.ensure_writable()?;
        let had_dirs = !self.tree.explicit_dirs().is_empty();

        let removed = self.tree.clear();
        let count = removed.len();
        for entry in &removed {
            self.release_region(entry);
        }
        drop(removed);
        self.streams.clear();
        self.pool.purge();
        if count > 0 || had_dirs {
            self.flags.mark_cdr_dirty();
        }

        debug!(count, "removed all entries");
        Ok(count)
    }

    /// Explicitly create a directory; `false` if it already was one
    pub fn create_dir(&mut self, path: &str) -> Result<bool> {
        self.ensure_writable()?;
        let normalized = normalize_dir_path(path)?;
        let created = self.tree.create_dir(&mut self.pool, &normalized)?;
        if created {
            self.flags.mark_cdr_dirty();
        }
        Ok(created)
    }

    /// Serialize the directory behind the live data, if it changed
    ///
    /// With `relink.auto_threshold` configured and enough of the data region
    /// wasted, this compacts the archive instead (which also writes the
    /// directory). A failure leaves the directory dirty, so retrying is safe.
    pub fn write_cdr(&mut self) -> Result<()> {
        self.ensure_writable()?;
        if !self.flags.is_cdr_dirty() {
            return Ok(());
        }

        if self.should_auto_compact() {
            info!(
                path = %self.display_path(),
                hole_bytes = self.hole_bytes,
                "hole threshold reached, compacting instead of writing directory"
            );
            self.relink_zip()?;
            return Ok(());
        }

        self.prepare_directory_write();
        let encoded = cdr::encode_directory(&self.tree, &self.encode_options())?;
        let mut header = self.header.clone();
        let offset = self.cdr_offset;
        let file = self.file.as_mut().ok_or(PakError::NotOpen)?;
        let file_len = cdr::write_directory(file, &mut header, offset, &encoded)?;

        self.header = header;
        self.file_len = file_len;
        self.signature = encoded.signature;
        self.cdr_buffer = encoded.bytes;
        self.flags.clear_cdr_dirty();

        debug!(
            offset,
            size = self.cdr_buffer.len(),
            records = self.header.record_count,
            file_len,
            "wrote directory"
        );
        Ok(())
    }

    /// Rewrite the archive without holes
    pub fn relink_zip(&mut self) -> Result<RelinkStats> {
        self.ensure_writable()?;
        if self.flags.is_dont_compact() {
            return Err(PakError::CompactionDisallowed);
        }

        let config = self.config.relink.clone();
        let stats = relink::relink(self, &config)?;

        info!(
            path = %self.display_path(),
            entries = stats.entries,
            batches = stats.batches,
            before = stats.bytes_before,
            after = stats.bytes_after,
            "relinked archive"
        );
        Ok(stats)
    }

    pub fn set_dont_compact(&mut self, dont_compact: bool) {
        self.flags.set(CacheFlags::DONT_COMPACT, dont_compact);
    }

    /// Encrypt (or stop encrypting) the directory from the next write on
    pub fn set_cdr_encryption(&mut self, key: Option<CdrKey>) -> Result<()> {
        self.ensure_writable()?;
        self.crypto = match key {
            Some(key) => Some(CdrCrypto::new(&key, self.config.kdf_iterations)?),
            None => None,
        };
        self.flags.mark_cdr_dirty();
        Ok(())
    }

    /// Sign (or stop signing) the directory from the next write on
    pub fn set_signing_key(&mut self, key: Option<SigningKey>) -> Result<()> {
        self.ensure_writable()?;
        self.signing_key = key;
        self.flags.mark_cdr_dirty();
        Ok(())
    }

    pub fn set_extended_header(&mut self, header: Option<ExtendedHeader>) -> Result<()> {
        self.ensure_writable()?;
        self.extended = header;
        self.flags.mark_cdr_dirty();
        Ok(())
    }

    // ---- internals ----

    fn ensure_open(&self) -> Result<()> {
        if self.file.is_none() {
            return Err(PakError::NotOpen);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.flags.is_read_only() {
            return Err(PakError::ReadOnly);
        }
        Ok(())
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or(PakError::NotOpen)
    }

    fn display_path(&self) -> String {
        self.path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<unbound>".to_string())
    }

    fn check_entry_size(&self, size: u64) -> Result<()> {
        if size > self.config.max_entry_size {
            return Err(PakError::InvalidArgument(format!(
                "Entry of {} bytes exceeds max_entry_size {}",
                size, self.config.max_entry_size
            )));
        }
        Ok(())
    }

    fn build_record(
        &self,
        path: &str,
        data: &[u8],
        codec: &dyn Codec,
        level: i32,
    ) -> Result<PreparedRecord> {
        let header_len = LocalRecordHeader::size_for_path(path);
        let mut bytes =
            Vec::with_capacity(header_len + codec.estimate_compressed_size(data.len()));
        bytes.resize(header_len, 0);
        codec.compress(data, level, &mut bytes)?;

        let mut codec_id = codec.id();
        let mut level = level;
        if !codec_id.is_store()
            && self.config.fallback_to_store
            && bytes.len() - header_len >= data.len()
        {
            bytes.truncate(header_len);
            bytes.extend_from_slice(data);
            codec_id = CodecId::STORE;
            level = 0;
        }

        let header = LocalRecordHeader::new(
            codec_id,
            (bytes.len() - header_len) as u64,
            data.len() as u64,
            crc32fast::hash(data),
            path,
        );
        header.write_to(&mut bytes[..header_len])?;

        Ok(PreparedRecord {
            bytes,
            header,
            level,
        })
    }

    /// Complete an entry's metadata from its local record header
    fn hydrate(&mut self, path: &str) -> Result<FileEntry> {
        let entry = self
            .tree
            .find(path)
            .cloned()
            .ok_or_else(|| PakError::FileNotFound(path.to_string()))?;
        if entry.full_info {
            return Ok(entry);
        }

        let header = self.read_local_header(entry.record_offset)?;
        if header.path != path
            || header.codec != entry.codec
            || header.compressed_size != entry.compressed_size
            || header.uncompressed_size != entry.uncompressed_size
        {
            return Err(PakError::InvalidFormat(format!(
                "Local record for {} disagrees with the directory",
                path
            )));
        }

        let data_offset = entry.record_offset + header.header_size() as u64;
        if data_offset + entry.compressed_size > self.cdr_offset {
            return Err(PakError::InvalidFormat(format!(
                "Entry {} extends past the data region",
                path
            )));
        }

        let live = self
            .tree
            .find_mut(path)
            .ok_or_else(|| PakError::FileNotFound(path.to_string()))?;
        live.data_offset = data_offset;
        live.full_info = true;
        Ok(live.clone())
    }

    fn read_local_header(&mut self, offset: u64) -> Result<LocalRecordHeader> {
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(offset))?;
        LocalRecordHeader::read_from(BufReader::new(file)).map_err(truncated_as_corrupt)
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;

        let end = offset + bytes.len() as u64;
        if end > self.file_len {
            self.file_len = end;
        }
        Ok(())
    }

    /// Write a record at the tail of live data
    fn append_record(&mut self, bytes: &[u8]) -> Result<u64> {
        self.invalidate_disk_directory()?;
        let offset = self.cdr_offset;
        self.write_at(offset, bytes)?;
        self.cdr_offset = offset + bytes.len() as u64;
        Ok(offset)
    }

    /// Appends overwrite the directory on disk; flag that in the header first
    fn invalidate_disk_directory(&mut self) -> Result<()> {
        if self.header.is_cdr_pending() {
            return Ok(());
        }

        let mut header = self.header.clone();
        header.set_cdr_pending(true);
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(0))?;
        header.write_to(&mut *file)?;
        self.header = header;
        Ok(())
    }

    fn release_region(&mut self, entry: &FileEntry) {
        self.add_hole(entry.record_len());
    }

    fn add_hole(&mut self, bytes: u64) {
        if bytes > 0 {
            self.hole_bytes += bytes;
            self.flags.mark_uncompacted();
        }
    }

    fn should_auto_compact(&self) -> bool {
        let Some(threshold) = self.config.relink.auto_threshold else {
            return false;
        };
        if self.flags.is_dont_compact() || self.hole_bytes == 0 {
            return false;
        }

        let data_len = self.cdr_offset.saturating_sub(HEADER_SIZE as u64);
        data_len > 0 && self.hole_bytes as f64 / data_len as f64 >= threshold
    }

    /// Fresh nonce, and drop a loaded signature nobody can renew
    fn prepare_directory_write(&mut self) {
        if let Some(crypto) = &mut self.crypto {
            crypto.header.refresh_nonce();
        }
        if self.signing_key.is_none() {
            if let Some(signature) = self.signature.take() {
                warn!(
                    signer = %signature.fingerprint(),
                    "no signing key, rewritten directory will be unsigned"
                );
            }
        }
    }

    fn encode_options(&self) -> EncodeOptions<'_> {
        EncodeOptions {
            encryption: self.crypto.as_ref().map(|c| (&c.header, &c.key)),
            signing_key: self.signing_key.as_ref(),
            extended: self.extended.as_ref(),
        }
    }
}

impl RelinkSource for ArchiveCache {
    fn archive_path(&self) -> Result<PathBuf> {
        self.path.clone().ok_or(PakError::NotOpen)
    }

    fn source_len(&self) -> u64 {
        self.file_len
    }

    fn snapshot_tree(&self) -> FileEntryTree {
        self.tree.clone()
    }

    fn source_file(&mut self) -> Result<&mut File> {
        self.file_mut()
    }

    fn write_directory_to(
        &mut self,
        tree: &FileEntryTree,
        file: &mut File,
        offset: u64,
    ) -> Result<DirectoryWrite> {
        // Nothing here may touch the live state: the relink can still fail
        let mut encryption = self.crypto.as_ref().map(|c| c.header.clone());
        if let Some(header) = &mut encryption {
            header.refresh_nonce();
        }
        let options = EncodeOptions {
            encryption: encryption.as_ref().zip(self.crypto.as_ref().map(|c| &c.key)),
            signing_key: self.signing_key.as_ref(),
            extended: self.extended.as_ref(),
        };
        let encoded = cdr::encode_directory(tree, &options)?;
        let mut header = FileHeader::new();
        let file_len = cdr::write_directory(file, &mut header, offset, &encoded)?;
        Ok(DirectoryWrite {
            header,
            encoded,
            encryption,
            file_len,
        })
    }

    fn release_handle(&mut self) {
        self.file = None;
    }

    fn reopen(&mut self) -> Result<()> {
        let path = self.archive_path()?;
        self.file = Some(OpenOptions::new().read(true).write(true).open(path)?);
        Ok(())
    }

    fn adopt(&mut self, file: File, tree: FileEntryTree, written: DirectoryWrite) {
        self.file = Some(file);
        self.tree = tree;
        if let (Some(old), None) = (&self.signature, &written.encoded.signature) {
            warn!(
                signer = %old.fingerprint(),
                "no signing key, relinked directory is unsigned"
            );
        }
        if let (Some(crypto), Some(header)) = (&mut self.crypto, written.encryption) {
            crypto.header = header;
        }
        self.cdr_offset = written.header.cdr_offset;
        self.header = written.header;
        self.file_len = written.file_len;
        self.signature = written.encoded.signature;
        self.cdr_buffer = written.encoded.bytes;
        self.hole_bytes = 0;
        self.flags.clear_uncompacted();
        self.flags.clear_cdr_dirty();
        self.pool.purge();
    }
}

impl Drop for ArchiveCache {
    fn drop(&mut self) {
        if self.file.is_some() && self.flags.is_cdr_dirty() {
            warn!(path = %self.display_path(), "archive dropped with unwritten directory changes");
        }
    }
}

impl fmt::Debug for ArchiveCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveCache")
            .field("path", &self.path)
            .field("flags", &self.flags)
            .field("entries", &self.tree.len())
            .field("cdr_offset", &self.cdr_offset)
            .field("hole_bytes", &self.hole_bytes)
            .field("file_len", &self.file_len)
            .finish_non_exhaustive()
    }
}

fn truncated_as_corrupt(err: PakError) -> PakError {
    match err {
        PakError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            PakError::InvalidFormat("Unexpected end of archive".to_string())
        }
        other => other,
    }
}
