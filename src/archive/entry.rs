use crate::archive::flags::EntryFlags;
use crate::archive::local_entry::LocalRecordHeader;
use crate::codec::CodecId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_TREE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one [`FileEntryTree`](super::FileEntryTree)
///
/// Entries remember the tree that created them, which is how the cache
/// rejects entries handed back from a different archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeId(u64);

impl TreeId {
    pub(crate) fn next() -> Self {
        TreeId(NEXT_TREE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Id no tree ever has, for entries not yet inserted
    pub(crate) const DETACHED: TreeId = TreeId(0);
}

/// Metadata for one archive member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Normalized relative path, shared with the cache's path pool
    pub path: Arc<str>,
    /// Offset of the local record header
    pub record_offset: u64,
    /// Offset of the compressed bytes; exact only once `full_info` is set
    pub data_offset: u64,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub codec: CodecId,
    pub level: i32,
    pub crc32: u32,
    pub flags: EntryFlags,
    pub(crate) full_info: bool,
    pub(crate) owner: TreeId,
}

impl FileEntry {
    /// Entry for a record just written by this process (all metadata known)
    pub(crate) fn from_record(
        path: Arc<str>,
        record_offset: u64,
        header: &LocalRecordHeader,
        level: i32,
        flags: EntryFlags,
    ) -> Self {
        Self {
            path,
            record_offset,
            data_offset: record_offset + header.header_size() as u64,
            compressed_size: header.compressed_size,
            uncompressed_size: header.uncompressed_size,
            codec: header.codec,
            level,
            crc32: header.crc32,
            flags,
            full_info: true,
            owner: TreeId::DETACHED,
        }
    }

    /// Whether the data offset came from the local record header
    pub fn is_full_info(&self) -> bool {
        self.full_info
    }

    /// Whether a continuous update is still filling this entry
    pub fn is_pending(&self) -> bool {
        self.flags.contains(EntryFlags::PENDING)
    }

    pub fn has_valid_crc(&self) -> bool {
        self.flags.contains(EntryFlags::CRC_VALID)
    }

    /// End of the compressed bytes
    pub fn data_end(&self) -> u64 {
        self.data_offset + self.compressed_size
    }

    /// Bytes the record occupies on disk, header included
    pub fn record_len(&self) -> u64 {
        self.data_end() - self.record_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_record_layout() {
        let header = LocalRecordHeader::new(CodecId::STORE, 100, 100, 7, "x.bin");
        let entry = FileEntry::from_record(
            Arc::from("x.bin"),
            64,
            &header,
            0,
            EntryFlags::CRC_VALID,
        );

        assert_eq!(entry.data_offset, 64 + header.header_size() as u64);
        assert_eq!(entry.record_len(), header.header_size() as u64 + 100);
        assert!(entry.is_full_info());
        assert!(entry.has_valid_crc());
        assert!(!entry.is_pending());
    }

    #[test]
    fn test_tree_ids_are_unique() {
        assert_ne!(TreeId::next(), TreeId::next());
        assert_ne!(TreeId::next(), TreeId::DETACHED);
    }
}
