//! Hierarchical index over the archive's entries
//!
//! Paths are split on `/`; every segment but the last names a directory node,
//! the last names a file leaf. Directory nodes exist while they have a
//! descendant or were created explicitly, and empty implicit directories are
//! pruned as soon as their last descendant goes away.

use crate::archive::entry::{FileEntry, TreeId};
use crate::archive::path_pool::PathPool;
use crate::error::{PakError, Result};
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
struct DirNode {
    dirs: BTreeMap<Arc<str>, DirNode>,
    files: BTreeMap<Arc<str>, FileEntry>,
    explicit: bool,
}

impl DirNode {
    fn is_empty(&self) -> bool {
        self.dirs.is_empty() && self.files.is_empty()
    }

    /// Move every file below this node into `out`, depth-first
    fn drain_into(self, out: &mut Vec<FileEntry>) {
        out.extend(self.files.into_values());
        for dir in self.dirs.into_values() {
            dir.drain_into(out);
        }
    }
}

/// Path-keyed tree of [`FileEntry`] leaves
#[derive(Debug, Clone)]
pub struct FileEntryTree {
    id: TreeId,
    root: DirNode,
    file_count: usize,
}

impl FileEntryTree {
    pub fn new() -> Self {
        Self {
            id: TreeId::next(),
            root: DirNode::default(),
            file_count: 0,
        }
    }

    pub fn id(&self) -> TreeId {
        self.id
    }

    /// Number of file entries
    pub fn len(&self) -> usize {
        self.file_count
    }

    pub fn is_empty(&self) -> bool {
        self.file_count == 0
    }

    /// Check that `path` can hold a file without colliding with a directory
    /// or running through an existing file
    pub fn check_insert(&self, path: &str) -> Result<()> {
        let (parents, leaf) = split_path(path);
        let mut node = &self.root;

        for (depth, segment) in parents.iter().enumerate() {
            if node.files.contains_key(*segment) {
                return Err(PakError::AlreadyExists(parents[..=depth].join("/")));
            }
            match node.dirs.get(*segment) {
                Some(child) => node = child,
                None => return Ok(()),
            }
        }

        if node.dirs.contains_key(leaf) {
            return Err(PakError::AlreadyExists(path.to_string()));
        }
        Ok(())
    }

    /// Insert or replace the leaf at `entry.path`, creating parent directories
    ///
    /// Returns the replaced entry, if any.
    pub fn insert(&mut self, pool: &mut PathPool, mut entry: FileEntry) -> Result<Option<FileEntry>> {
        self.check_insert(&entry.path)?;

        let path = Arc::clone(&entry.path);
        let (parents, leaf) = split_path(&path);
        let mut node = &mut self.root;
        for segment in parents {
            node = node.dirs.entry(pool.intern(segment)).or_default();
        }

        entry.owner = self.id;
        let previous = node.files.insert(pool.intern(leaf), entry);
        if previous.is_none() {
            self.file_count += 1;
        }
        Ok(previous)
    }

    pub fn find(&self, path: &str) -> Option<&FileEntry> {
        let (parents, leaf) = split_path(path);
        let mut node = &self.root;
        for segment in parents {
            node = node.dirs.get(segment)?;
        }
        node.files.get(leaf)
    }

    pub(crate) fn find_mut(&mut self, path: &str) -> Option<&mut FileEntry> {
        let (parents, leaf) = split_path(path);
        let mut node = &mut self.root;
        for segment in parents {
            node = node.dirs.get_mut(segment)?;
        }
        node.files.get_mut(leaf)
    }

    /// Whether a directory node exists at `path` (the empty path is the root)
    pub fn contains_dir(&self, path: &str) -> bool {
        if path.is_empty() {
            return true;
        }
        let mut node = &self.root;
        for segment in path.split('/') {
            match node.dirs.get(segment) {
                Some(child) => node = child,
                None => return false,
            }
        }
        true
    }

    /// Explicitly create a directory (and its parents)
    ///
    /// Returns `false` if it was already explicit.
    pub fn create_dir(&mut self, pool: &mut PathPool, path: &str) -> Result<bool> {
        if path.is_empty() {
            return Ok(false);
        }

        // Validate the whole chain before touching anything
        let mut probe = &self.root;
        for segment in path.split('/') {
            if probe.files.contains_key(segment) {
                return Err(PakError::AlreadyExists(path.to_string()));
            }
            match probe.dirs.get(segment) {
                Some(child) => probe = child,
                None => break,
            }
        }

        let mut node = &mut self.root;
        for segment in path.split('/') {
            node = node.dirs.entry(pool.intern(segment)).or_default();
        }
        let created = !node.explicit;
        node.explicit = true;
        Ok(created)
    }

    /// Remove one file leaf, pruning directories it leaves empty
    pub fn remove_file(&mut self, path: &str) -> Option<FileEntry> {
        let segments: Vec<&str> = path.split('/').collect();
        let removed = remove_file_in(&mut self.root, &segments)?;
        self.file_count -= 1;
        Some(removed)
    }

    /// Remove a directory and everything below it
    ///
    /// Returns the removed file entries (depth-first); an unknown directory
    /// removes nothing.
    pub fn remove_dir(&mut self, path: &str) -> Vec<FileEntry> {
        if path.is_empty() {
            return self.clear();
        }

        let segments: Vec<&str> = path.split('/').collect();
        let Some(detached) = detach_dir(&mut self.root, &segments) else {
            return Vec::new();
        };

        let mut removed = Vec::new();
        detached.drain_into(&mut removed);
        self.file_count -= removed.len();
        removed
    }

    /// Remove every entry and directory
    pub fn clear(&mut self) -> Vec<FileEntry> {
        let root = std::mem::take(&mut self.root);
        let mut removed = Vec::with_capacity(self.file_count);
        root.drain_into(&mut removed);
        self.file_count = 0;
        removed
    }

    /// Depth-first iteration: a directory's files in name order, then its
    /// subdirectories in name order
    pub fn entries(&self) -> Entries<'_> {
        Entries {
            stack: vec![(self.root.files.values(), self.root.dirs.values())],
        }
    }

    /// Paths of explicitly created directories, depth-first
    pub fn explicit_dirs(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_explicit_dirs(&self.root, "", &mut out);
        out
    }

    /// Whether `entry` came from this tree and still describes a live leaf
    pub fn is_owner_of(&self, entry: &FileEntry) -> bool {
        entry.owner == self.id
            && self
                .find(&entry.path)
                .map_or(false, |live| live.record_offset == entry.record_offset)
    }
}

impl Default for FileEntryTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator returned by [`FileEntryTree::entries`]
pub struct Entries<'a> {
    stack: Vec<(
        btree_map::Values<'a, Arc<str>, FileEntry>,
        btree_map::Values<'a, Arc<str>, DirNode>,
    )>,
}

impl<'a> Iterator for Entries<'a> {
    type Item = &'a FileEntry;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let next_dir = {
                let (files, dirs) = self.stack.last_mut()?;
                if let Some(entry) = files.next() {
                    return Some(entry);
                }
                dirs.next()
            };

            match next_dir {
                Some(dir) => self.stack.push((dir.files.values(), dir.dirs.values())),
                None => {
                    self.stack.pop();
                }
            }
        }
    }
}

fn split_path(path: &str) -> (Vec<&str>, &str) {
    let mut parents: Vec<&str> = path.split('/').collect();
    let leaf = parents.pop().unwrap_or("");
    (parents, leaf)
}

fn remove_file_in(node: &mut DirNode, segments: &[&str]) -> Option<FileEntry> {
    match segments {
        [] => None,
        [leaf] => node.files.remove(*leaf),
        [head, rest @ ..] => {
            let child = node.dirs.get_mut(*head)?;
            let removed = remove_file_in(child, rest)?;
            if child.is_empty() && !child.explicit {
                node.dirs.remove(*head);
            }
            Some(removed)
        }
    }
}

fn detach_dir(node: &mut DirNode, segments: &[&str]) -> Option<DirNode> {
    match segments {
        [] => None,
        [leaf] => node.dirs.remove(*leaf),
        [head, rest @ ..] => {
            let child = node.dirs.get_mut(*head)?;
            let detached = detach_dir(child, rest)?;
            if child.is_empty() && !child.explicit {
                node.dirs.remove(*head);
            }
            Some(detached)
        }
    }
}

fn collect_explicit_dirs(node: &DirNode, prefix: &str, out: &mut Vec<String>) {
    for (name, child) in &node.dirs {
        let full = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", prefix, name)
        };
        if child.explicit {
            out.push(full.clone());
        }
        collect_explicit_dirs(child, &full, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::flags::EntryFlags;
    use crate::codec::CodecId;

    fn entry(pool: &mut PathPool, path: &str, offset: u64) -> FileEntry {
        FileEntry {
            path: pool.intern(path),
            record_offset: offset,
            data_offset: offset + 32,
            compressed_size: 10,
            uncompressed_size: 10,
            codec: CodecId::STORE,
            level: 0,
            crc32: 0,
            flags: EntryFlags::CRC_VALID,
            full_info: true,
            owner: TreeId::DETACHED,
        }
    }

    #[test]
    fn test_insert_creates_parents() {
        let mut pool = PathPool::new();
        let mut tree = FileEntryTree::new();
        let e = entry(&mut pool, "a/b/c.txt", 64);
        assert!(tree.insert(&mut pool, e).unwrap().is_none());

        assert_eq!(tree.len(), 1);
        assert!(tree.contains_dir("a"));
        assert!(tree.contains_dir("a/b"));
        assert!(!tree.contains_dir("a/b/c.txt"));
        assert_eq!(tree.find("a/b/c.txt").unwrap().record_offset, 64);
        assert!(tree.find("a/b").is_none());
    }

    #[test]
    fn test_replace_returns_previous() {
        let mut pool = PathPool::new();
        let mut tree = FileEntryTree::new();
        let first = entry(&mut pool, "x.bin", 64);
        let second = entry(&mut pool, "x.bin", 200);
        tree.insert(&mut pool, first).unwrap();
        let previous = tree.insert(&mut pool, second).unwrap().unwrap();

        assert_eq!(previous.record_offset, 64);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.find("x.bin").unwrap().record_offset, 200);
    }

    #[test]
    fn test_file_directory_conflicts() {
        let mut pool = PathPool::new();
        let mut tree = FileEntryTree::new();
        let e = entry(&mut pool, "a/b", 64);
        tree.insert(&mut pool, e).unwrap();

        // "a/b" is a file, cannot become a directory
        let nested = entry(&mut pool, "a/b/c", 100);
        assert!(matches!(
            tree.insert(&mut pool, nested),
            Err(PakError::AlreadyExists(_))
        ));
        assert!(tree.create_dir(&mut pool, "a/b/d").is_err());

        // "a" is a directory, cannot become a file
        let clash = entry(&mut pool, "a", 200);
        assert!(tree.insert(&mut pool, clash).is_err());
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_remove_prunes_implicit_dirs() {
        let mut pool = PathPool::new();
        let mut tree = FileEntryTree::new();
        let e = entry(&mut pool, "a/b/c.txt", 64);
        tree.insert(&mut pool, e).unwrap();

        assert!(tree.remove_file("a/b/c.txt").is_some());
        assert!(!tree.contains_dir("a"));
        assert!(tree.is_empty());

        // Second removal is a no-op
        assert!(tree.remove_file("a/b/c.txt").is_none());
    }

    #[test]
    fn test_explicit_dir_survives_last_removal() {
        let mut pool = PathPool::new();
        let mut tree = FileEntryTree::new();
        assert!(tree.create_dir(&mut pool, "levels/empty").unwrap());
        assert!(!tree.create_dir(&mut pool, "levels/empty").unwrap());

        let e = entry(&mut pool, "levels/empty/tmp.bin", 64);
        tree.insert(&mut pool, e).unwrap();
        tree.remove_file("levels/empty/tmp.bin");

        assert!(tree.contains_dir("levels/empty"));
        assert_eq!(tree.explicit_dirs(), vec!["levels/empty".to_string()]);
    }

    #[test]
    fn test_remove_dir_counts_descendants() {
        let mut pool = PathPool::new();
        let mut tree = FileEntryTree::new();
        for (i, path) in ["a/b/c.txt", "a/b/d.txt", "a/e.txt", "f.txt"].iter().enumerate() {
            let e = entry(&mut pool, path, 64 + i as u64 * 100);
            tree.insert(&mut pool, e).unwrap();
        }

        let removed = tree.remove_dir("a");
        assert_eq!(removed.len(), 3);
        assert_eq!(tree.len(), 1);
        assert!(!tree.contains_dir("a"));
        assert!(tree.find("f.txt").is_some());

        assert!(tree.remove_dir("missing").is_empty());
    }

    #[test]
    fn test_depth_first_order() {
        let mut pool = PathPool::new();
        let mut tree = FileEntryTree::new();
        for (i, path) in ["z.txt", "a/y.txt", "a/b/x.txt", "b.txt"].iter().enumerate() {
            let e = entry(&mut pool, path, 64 + i as u64 * 100);
            tree.insert(&mut pool, e).unwrap();
        }

        let order: Vec<&str> = tree.entries().map(|e| &*e.path).collect();
        assert_eq!(order, vec!["b.txt", "z.txt", "a/y.txt", "a/b/x.txt"]);
    }

    #[test]
    fn test_ownership() {
        let mut pool = PathPool::new();
        let mut tree = FileEntryTree::new();
        let mut other = FileEntryTree::new();
        let e = entry(&mut pool, "x.bin", 64);
        tree.insert(&mut pool, e.clone()).unwrap();
        other.insert(&mut pool, e).unwrap();

        let mine = tree.find("x.bin").unwrap().clone();
        let theirs = other.find("x.bin").unwrap().clone();
        assert!(tree.is_owner_of(&mine));
        assert!(!tree.is_owner_of(&theirs));

        // A stale copy stops being owned once the leaf moves
        let moved = entry(&mut pool, "x.bin", 500);
        tree.insert(&mut pool, moved).unwrap();
        assert!(!tree.is_owner_of(&mine));
    }

    #[test]
    fn test_clear() {
        let mut pool = PathPool::new();
        let mut tree = FileEntryTree::new();
        let a = entry(&mut pool, "a/1", 64);
        let b = entry(&mut pool, "b/2", 128);
        tree.insert(&mut pool, a).unwrap();
        tree.insert(&mut pool, b).unwrap();
        tree.create_dir(&mut pool, "c").unwrap();

        assert_eq!(tree.clear().len(), 2);
        assert!(tree.is_empty());
        assert!(tree.explicit_dirs().is_empty());
        assert_eq!(tree.entries().count(), 0);
    }
}
