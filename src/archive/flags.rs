use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Archive-level state of an [`ArchiveCache`](super::ArchiveCache)
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CacheFlags: u32 {
        /// At least one byte range in the file is an unreclaimed hole
        const UNCOMPACTED = 1 << 0;
        /// The on-disk directory no longer matches the in-memory tree
        const CDR_DIRTY = 1 << 1;
        /// Mutations are rejected
        const READ_ONLY = 1 << 2;
        /// `relink_zip` is rejected
        const DONT_COMPACT = 1 << 3;
    }
}

impl CacheFlags {
    pub fn is_uncompacted(self) -> bool {
        self.contains(Self::UNCOMPACTED)
    }

    pub fn is_cdr_dirty(self) -> bool {
        self.contains(Self::CDR_DIRTY)
    }

    pub fn is_read_only(self) -> bool {
        self.contains(Self::READ_ONLY)
    }

    pub fn is_dont_compact(self) -> bool {
        self.contains(Self::DONT_COMPACT)
    }

    pub fn mark_uncompacted(&mut self) {
        self.insert(Self::UNCOMPACTED);
    }

    pub fn mark_cdr_dirty(&mut self) {
        self.insert(Self::CDR_DIRTY);
    }

    pub fn clear_cdr_dirty(&mut self) {
        self.remove(Self::CDR_DIRTY);
    }

    pub fn clear_uncompacted(&mut self) {
        self.remove(Self::UNCOMPACTED);
    }
}

#[rustfmt::skip]
impl fmt::Debug for CacheFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let uncompacted = if self.is_uncompacted() { 'U' } else { '-' };
        let dirty = if self.is_cdr_dirty() { 'D' } else { '-' };
        let read_only = if self.is_read_only() { 'R' } else { '-' };
        let dont_compact = if self.is_dont_compact() { 'N' } else { '-' };

        write!(f, "CacheFlags[{}{}{}{}]", uncompacted, dirty, read_only, dont_compact)
    }
}

bitflags! {
    /// Per-entry flags stored in the central directory
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EntryFlags: u16 {
        /// Explicitly created directory record, sizes are zero
        const DIRECTORY = 1 << 0;
        /// The stored CRC describes the current content
        const CRC_VALID = 1 << 1;
        /// A continuous update has reserved the record but not finished it
        const PENDING = 1 << 2;
    }
}
