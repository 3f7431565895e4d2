use crate::archive::cache::{ArchiveCache, CacheOptions};
use crate::error::Result;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use tracing::debug;

/// Shared handle to an open cache
pub type SharedCache = Rc<RefCell<ArchiveCache>>;

/// Hands out one shared cache per archive path
///
/// The factory only keeps weak references: a cache lives exactly as long as
/// some caller holds its handle, and an archive is "in use" while that is
/// the case. Caches are single-threaded, hence `Rc`.
#[derive(Debug)]
pub struct CacheFactory {
    options: CacheOptions,
    open: HashMap<PathBuf, Weak<RefCell<ArchiveCache>>>,
}

impl CacheFactory {
    pub fn new(options: CacheOptions) -> Self {
        Self {
            options,
            open: HashMap::new(),
        }
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Open an existing archive, or return the live handle if already open
    pub fn open<P: AsRef<Path>>(&mut self, path: P) -> Result<SharedCache> {
        let key = canonical_key(path.as_ref())?;
        if let Some(live) = self.get_by_key(&key) {
            return Ok(live);
        }

        let cache = ArchiveCache::open(path.as_ref(), self.options.clone())?;
        Ok(self.register(key, cache))
    }

    /// Like [`open`](Self::open), creating the archive when it does not exist
    pub fn open_or_create<P: AsRef<Path>>(&mut self, path: P) -> Result<SharedCache> {
        let key = canonical_key(path.as_ref())?;
        if let Some(live) = self.get_by_key(&key) {
            return Ok(live);
        }

        let cache = ArchiveCache::open_or_create(path.as_ref(), self.options.clone())?;
        Ok(self.register(key, cache))
    }

    /// The live handle for `path`, if some caller still holds one
    pub fn get<P: AsRef<Path>>(&self, path: P) -> Option<SharedCache> {
        let key = canonical_key(path.as_ref()).ok()?;
        self.get_by_key(&key)
    }

    pub fn is_in_use<P: AsRef<Path>>(&self, path: P) -> bool {
        self.get(path).is_some()
    }

    /// Number of archives currently in use
    pub fn live_count(&self) -> usize {
        self.open.values().filter(|w| w.strong_count() > 0).count()
    }

    /// Forget released caches; returns how many were dropped
    pub fn purge(&mut self) -> usize {
        let before = self.open.len();
        self.open.retain(|_, weak| weak.strong_count() > 0);
        before - self.open.len()
    }

    fn get_by_key(&self, key: &Path) -> Option<SharedCache> {
        self.open.get(key).and_then(Weak::upgrade)
    }

    fn register(&mut self, key: PathBuf, cache: ArchiveCache) -> SharedCache {
        let shared = Rc::new(RefCell::new(cache));
        debug!(path = %key.display(), "factory opened archive");
        self.open.insert(key, Rc::downgrade(&shared));
        shared
    }
}

/// Canonical path of an archive that may not exist yet
fn canonical_key(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(fs::canonicalize(path)?);
    }

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::canonicalize(parent)?,
        _ => std::env::current_dir()?,
    };
    Ok(match path.file_name() {
        Some(name) => parent.join(name),
        None => parent,
    })
}
