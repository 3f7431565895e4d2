//! Deduplicated storage for archive paths
//!
//! Every path and path segment the tree keys on is interned here once and
//! shared as an `Arc<str>`, so an archive with thousands of files under the
//! same directories keeps a single copy of each directory name.

use crate::error::{PakError, Result};
use std::collections::HashSet;
use std::sync::Arc;

/// Pool of interned path strings owned by one cache
#[derive(Debug, Default)]
pub struct PathPool {
    strings: HashSet<Arc<str>>,
}

impl PathPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the pooled copy of `s`, adding it if needed
    pub fn intern(&mut self, s: &str) -> Arc<str> {
        if let Some(existing) = self.strings.get(s) {
            return Arc::clone(existing);
        }
        let interned: Arc<str> = Arc::from(s);
        self.strings.insert(Arc::clone(&interned));
        interned
    }

    /// Look up without inserting
    pub fn get(&self, s: &str) -> Option<Arc<str>> {
        self.strings.get(s).cloned()
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Drop the pooled copies of `path` and its segments once nothing else
    /// holds them
    pub fn release(&mut self, path: &str) -> usize {
        let before = self.strings.len();
        for s in std::iter::once(path).chain(path.split('/')) {
            if self.strings.get(s).map_or(false, |a| Arc::strong_count(a) == 1) {
                self.strings.remove(s);
            }
        }
        before - self.strings.len()
    }

    /// Drop strings nothing outside the pool references any more
    pub fn purge(&mut self) -> usize {
        let before = self.strings.len();
        self.strings.retain(|s| Arc::strong_count(s) > 1);
        before - self.strings.len()
    }
}

/// Normalize a caller-supplied path to the archive's canonical form
///
/// Backslashes become forward slashes, empty and `.` segments are dropped.
/// `..` segments and drive prefixes are rejected rather than resolved, so an
/// entry can never name something outside the archive root.
pub fn normalize_path(path: &str) -> Result<String> {
    let unified = path.replace('\\', "/");
    let mut segments = Vec::new();

    for (index, segment) in unified.split('/').enumerate() {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(PakError::PathError(format!(
                    "Parent directory segment in path: {}",
                    path
                )))
            }
            s if index == 0 && s.ends_with(':') => {
                return Err(PakError::PathError(format!(
                    "Drive prefix in path: {}",
                    path
                )))
            }
            s if s.contains('\0') => {
                return Err(PakError::PathError(format!("NUL byte in path: {:?}", path)))
            }
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return Err(PakError::InvalidArgument(format!(
            "Path has no file name: {:?}",
            path
        )));
    }

    let normalized = segments.join("/");
    if normalized.len() > u16::MAX as usize {
        return Err(PakError::PathError(format!(
            "Path too long: {} bytes (max {})",
            normalized.len(),
            u16::MAX
        )));
    }
    Ok(normalized)
}

/// Like [`normalize_path`], but the empty path names the archive root
pub fn normalize_dir_path(path: &str) -> Result<String> {
    let is_root = path
        .split(|c| c == '/' || c == '\\')
        .all(|segment| segment.is_empty() || segment == ".");
    if is_root {
        return Ok(String::new());
    }
    normalize_path(path)
}
