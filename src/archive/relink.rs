//! Compaction: rewrite live records into a fresh file, dropping holes
//!
//! Records are copied verbatim (no recompression) in depth-first order.
//! Small records are gathered into a bounded batch buffer and flushed once it
//! holds `buffer_size` bytes or `max_batch_items` records; records larger
//! than the buffer are streamed through it in chunks. The new directory is
//! written into the temporary file, which then replaces the archive. Any
//! failure before that point deletes the temporary file and leaves the
//! original archive and its handle untouched.

use crate::archive::cdr::EncodedDirectory;
use crate::archive::format::{FileHeader, HEADER_SIZE};
use crate::archive::headers::EncryptionHeader;
use crate::archive::local_entry::LocalRecordHeader;
use crate::archive::tree::FileEntryTree;
use crate::config::RelinkConfig;
use crate::error::{PakError, Result};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of one compaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelinkStats {
    /// Records copied
    pub entries: usize,
    /// Batch flushes (streamed records not counted)
    pub batches: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// Directory written into the new file, handed back to the source on adoption
pub(crate) struct DirectoryWrite {
    pub header: FileHeader,
    pub encoded: EncodedDirectory,
    /// Encryption header the directory was written with
    pub encryption: Option<EncryptionHeader>,
    pub file_len: u64,
}

/// What the engine needs from the archive being compacted
pub(crate) trait RelinkSource {
    fn archive_path(&self) -> Result<PathBuf>;

    fn source_len(&self) -> u64;

    /// Copy of the live tree; offsets in it are rewritten as records move
    fn snapshot_tree(&self) -> FileEntryTree;

    fn source_file(&mut self) -> Result<&mut File>;

    /// Serialize `tree` with the source's headers into `file` at `offset`
    fn write_directory_to(
        &mut self,
        tree: &FileEntryTree,
        file: &mut File,
        offset: u64,
    ) -> Result<DirectoryWrite>;

    /// Close the source handle so the archive path can be replaced
    fn release_handle(&mut self);

    /// Reopen the original archive after a failed replacement
    fn reopen(&mut self) -> Result<()>;

    /// Take over the compacted file and its tree
    fn adopt(&mut self, file: File, tree: FileEntryTree, written: DirectoryWrite);
}

/// Records gathered for the next flush
struct Batch {
    buffer: Vec<u8>,
    /// (path, offset of the record within `buffer`, header length)
    items: Vec<(Arc<str>, usize, usize)>,
}

impl Batch {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            items: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub(crate) fn relink<S: RelinkSource>(source: &mut S, config: &RelinkConfig) -> Result<RelinkStats> {
    let archive_path = source.archive_path()?;
    let dir = match archive_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut temp = tempfile::Builder::new()
        .prefix(".pakrelink")
        .suffix(".tmp")
        .tempfile_in(&dir)?;

    let snapshot = source.snapshot_tree();
    let mut relinked = snapshot.clone();
    let mut stats = RelinkStats {
        bytes_before: source.source_len(),
        ..RelinkStats::default()
    };

    FileHeader::new().write_to(temp.as_file_mut())?;
    let mut write_pos = HEADER_SIZE as u64;
    let mut batch = Batch::new(config.buffer_size);

    for entry in snapshot.entries() {
        let src = source.source_file()?;
        src.seek(SeekFrom::Start(entry.record_offset))?;
        let header = LocalRecordHeader::read_from(BufReader::new(&mut *src))?;
        if header.path != *entry.path || header.compressed_size != entry.compressed_size {
            return Err(PakError::InvalidFormat(format!(
                "Local record for {} disagrees with the directory",
                entry.path
            )));
        }
        // BufReader may have read ahead; position explicitly at the data
        let data_offset = entry.record_offset + header.header_size() as u64;
        src.seek(SeekFrom::Start(data_offset))?;

        let mut rebuilt = header;
        rebuilt.extra.clear();
        let header_len = rebuilt.header_size();
        let record_len = header_len + rebuilt.compressed_size as usize;

        if !batch.is_empty() && batch.buffer.len() + record_len > config.buffer_size {
            write_pos = flush(&mut batch, temp.as_file_mut(), &mut relinked, write_pos)?;
            stats.batches += 1;
        }

        if record_len > config.buffer_size {
            let record_offset = write_pos;
            rebuilt.write_to(temp.as_file_mut())?;
            stream_copy(
                src,
                temp.as_file_mut(),
                rebuilt.compressed_size,
                config.buffer_size,
            )?;
            write_pos += record_len as u64;
            relocate(&mut relinked, &entry.path, record_offset, header_len)?;
            debug!(path = %entry.path, size = record_len, "streamed large record");
        } else {
            let start = batch.buffer.len();
            rebuilt.write_to(&mut batch.buffer)?;
            let data_start = batch.buffer.len();
            batch.buffer.resize(data_start + rebuilt.compressed_size as usize, 0);
            src.read_exact(&mut batch.buffer[data_start..])?;
            batch.items.push((Arc::clone(&entry.path), start, header_len));

            if batch.items.len() >= config.max_batch_items {
                write_pos = flush(&mut batch, temp.as_file_mut(), &mut relinked, write_pos)?;
                stats.batches += 1;
            }
        }
        stats.entries += 1;
    }

    if !batch.is_empty() {
        write_pos = flush(&mut batch, temp.as_file_mut(), &mut relinked, write_pos)?;
        stats.batches += 1;
    }

    let written = source.write_directory_to(&relinked, temp.as_file_mut(), write_pos)?;
    temp.as_file().sync_all()?;
    stats.bytes_after = written.file_len;

    source.release_handle();
    match temp.persist(&archive_path) {
        Ok(file) => {
            source.adopt(file, relinked, written);
            Ok(stats)
        }
        Err(err) => {
            // Dropping err.file deletes the temporary file
            match source.reopen() {
                Ok(()) => Err(err.error.into()),
                Err(reopen_err) => {
                    warn!(
                        path = %archive_path.display(),
                        error = %reopen_err,
                        "failed to reopen archive after relink failure"
                    );
                    Err(PakError::Io(io::Error::new(
                        err.error.kind(),
                        format!(
                            "{}; reopening the archive also failed ({}), cache is closed",
                            err.error, reopen_err
                        ),
                    )))
                }
            }
        }
    }
}

/// Write the batch and point its entries at their new offsets
fn flush(
    batch: &mut Batch,
    out: &mut File,
    tree: &mut FileEntryTree,
    write_pos: u64,
) -> Result<u64> {
    out.write_all(&batch.buffer)?;
    for (path, rel, header_len) in batch.items.drain(..) {
        relocate(tree, &path, write_pos + rel as u64, header_len)?;
    }

    let next = write_pos + batch.buffer.len() as u64;
    debug!(bytes = batch.buffer.len(), next, "flushed relink batch");
    batch.buffer.clear();
    Ok(next)
}

fn relocate(tree: &mut FileEntryTree, path: &str, record_offset: u64, header_len: usize) -> Result<()> {
    let entry = tree
        .find_mut(path)
        .ok_or_else(|| PakError::FileNotFound(path.to_string()))?;
    entry.record_offset = record_offset;
    entry.data_offset = record_offset + header_len as u64;
    entry.full_info = true;
    Ok(())
}

fn stream_copy(src: &mut File, out: &mut File, mut remaining: u64, chunk: usize) -> Result<()> {
    let mut buf = vec![0u8; chunk];
    while remaining > 0 {
        let n = remaining.min(chunk as u64) as usize;
        src.read_exact(&mut buf[..n])?;
        out.write_all(&buf[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Leftover temporary files from relinks of archives in `dir`
pub fn stale_temp_files<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_temp = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.starts_with(".pakrelink") && n.ends_with(".tmp"));
        if is_temp {
            found.push(path);
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::cache::{ArchiveCache, CacheOptions};
    use crate::codec::CodecId;
    use crate::config::CacheConfig;
    use ed25519_dalek::SigningKey;
    use tempfile::TempDir;

    fn small_buffer_options() -> CacheOptions {
        let mut config = CacheConfig::default();
        config.relink.buffer_size = 256;
        config.relink.max_batch_items = 3;
        CacheOptions::default().with_config(config)
    }

    #[test]
    fn test_batches_and_streamed_records() {
        let dir = TempDir::new().unwrap();
        let mut cache =
            ArchiveCache::create(dir.path().join("batch.pak"), small_buffer_options()).unwrap();

        for i in 0..7 {
            let data = vec![i as u8; 20];
            cache
                .update_file(&format!("small/{}.bin", i), &data, CodecId::STORE, 0)
                .unwrap();
        }
        let big: Vec<u8> = (0..5000).map(|i| (i % 251) as u8).collect();
        cache.update_file("big.bin", &big, CodecId::STORE, 0).unwrap();
        cache.remove_file("small/3.bin").unwrap();

        let stats = cache.relink_zip().unwrap();
        assert_eq!(stats.entries, 7);
        assert!(stats.batches >= 2);
        assert!(stats.bytes_after < stats.bytes_before);

        assert_eq!(cache.read_file_to_vec("big.bin").unwrap(), big);
        for i in [0, 1, 2, 4, 5, 6] {
            assert_eq!(
                cache.read_file_to_vec(&format!("small/{}.bin", i)).unwrap(),
                vec![i as u8; 20]
            );
        }
        assert!(stale_temp_files(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_failed_relink_leaves_original() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.pak");
        let mut cache = ArchiveCache::create(&path, CacheOptions::default()).unwrap();
        cache.update_file("a.bin", &[1u8; 64], CodecId::STORE, 0).unwrap();
        cache.update_file("b.bin", &[2u8; 64], CodecId::STORE, 0).unwrap();
        cache.remove_file("a.bin").unwrap();
        cache.write_cdr().unwrap();

        // Break the local header of b.bin behind the cache's back
        let b = cache.find_file("b.bin", false).unwrap().unwrap();
        {
            let mut f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            f.seek(SeekFrom::Start(b.record_offset)).unwrap();
            f.write_all(b"XXXX").unwrap();
        }
        let before = std::fs::read(&path).unwrap();

        assert!(cache.relink_zip().is_err());
        assert!(cache.is_open());
        assert!(cache.is_uncompacted());
        assert_eq!(std::fs::read(&path).unwrap(), before);
        assert!(stale_temp_files(dir.path()).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_replace_reports_closed_cache() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("signed.pak");
        {
            let options =
                CacheOptions::default().with_signing_key(SigningKey::from_bytes(&[0x11; 32]));
            let mut cache = ArchiveCache::create(&path, options).unwrap();
            cache.update_file("a.bin", &[1u8; 64], CodecId::STORE, 0).unwrap();
            cache.update_file("b.bin", &[2u8; 64], CodecId::STORE, 0).unwrap();
            cache.remove_file("a.bin").unwrap();
            cache.write_cdr().unwrap();
        }

        // Opened without the signing key, so a successful relink would drop the signature
        let mut cache = ArchiveCache::open(&path, CacheOptions::default()).unwrap();
        let signer = cache.signer();
        assert!(signer.is_some());

        // A directory now sits at the archive path; the open handle still reads the old file
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("blocker"), b"x").unwrap();

        match cache.relink_zip() {
            Err(PakError::Io(e)) => assert!(e.to_string().contains("cache is closed"), "{}", e),
            other => panic!("Expected Io error, got {:?}", other),
        }
        assert!(!cache.is_open());
        assert_eq!(cache.signer(), signer);
        assert!(cache.is_uncompacted());
        assert!(stale_temp_files(dir.path()).unwrap().is_empty());
    }
}
