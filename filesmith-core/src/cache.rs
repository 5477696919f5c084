use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::trace;

/// Largest file content the cache will hold per entry.
const MAX_CACHED_FILE_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
enum CacheEntry {
    Content(Arc<Vec<u8>>),
    Listing(Arc<Vec<PathBuf>>),
}

/// Read-through cache for file contents and directory listings.
///
/// The engine's contract is that every successful mutation invalidates the
/// file entry and the affected parent-directory entries, so a read issued
/// after a write always observes post-mutation bytes.
pub struct FileCache {
    entries: RwLock<HashMap<PathBuf, CacheEntry>>,
    max_entries: usize,
}

impl FileCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Read file bytes through the cache.
    pub fn read(&self, path: &Path) -> std::io::Result<Arc<Vec<u8>>> {
        if let Some(CacheEntry::Content(bytes)) = self.entries.read().get(path) {
            trace!(path = %path.display(), "cache hit");
            return Ok(Arc::clone(bytes));
        }

        let bytes = Arc::new(fs::read(path)?);
        if (bytes.len() as u64) <= MAX_CACHED_FILE_SIZE {
            self.insert(path.to_path_buf(), CacheEntry::Content(Arc::clone(&bytes)));
        }
        Ok(bytes)
    }

    /// Read a directory listing through the cache.
    pub fn read_dir(&self, path: &Path) -> std::io::Result<Arc<Vec<PathBuf>>> {
        if let Some(CacheEntry::Listing(listing)) = self.entries.read().get(path) {
            return Ok(Arc::clone(listing));
        }

        let mut listing = Vec::new();
        for entry in fs::read_dir(path)? {
            listing.push(entry?.path());
        }
        listing.sort();
        let listing = Arc::new(listing);
        self.insert(path.to_path_buf(), CacheEntry::Listing(Arc::clone(&listing)));
        Ok(listing)
    }

    /// Drop the entry for `path` together with its parent directory's
    /// listing. Operations that touch two paths (copy, rename) call this
    /// once per path so both parent directories are invalidated.
    pub fn invalidate(&self, path: &Path) {
        let mut entries = self.entries.write();
        entries.remove(path);
        if let Some(parent) = path.parent() {
            entries.remove(parent);
        }
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn insert(&self, path: PathBuf, entry: CacheEntry) {
        let mut entries = self.entries.write();
        // Crude bound: clear everything rather than tracking recency.
        if entries.len() >= self.max_entries {
            entries.clear();
        }
        entries.insert(path, entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_through_and_hit() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, b"hello").unwrap();

        let cache = FileCache::new(16);
        assert_eq!(&*cache.read(&file).unwrap(), b"hello");

        // Mutate behind the cache's back: the stale entry is served.
        fs::write(&file, b"changed").unwrap();
        assert_eq!(&*cache.read(&file).unwrap(), b"hello");
    }

    #[test]
    fn test_invalidate_exposes_new_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, b"old").unwrap();

        let cache = FileCache::new(16);
        cache.read(&file).unwrap();

        fs::write(&file, b"new").unwrap();
        cache.invalidate(&file);
        assert_eq!(&*cache.read(&file).unwrap(), b"new");
    }

    #[test]
    fn test_invalidate_drops_parent_listing() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, b"x").unwrap();

        let cache = FileCache::new(16);
        let before = cache.read_dir(temp_dir.path()).unwrap();
        assert_eq!(before.len(), 1);

        let newcomer = temp_dir.path().join("b.txt");
        fs::write(&newcomer, b"y").unwrap();
        cache.invalidate(&newcomer);

        let after = cache.read_dir(temp_dir.path()).unwrap();
        assert_eq!(after.len(), 2);
    }

    #[test]
    fn test_entry_bound() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FileCache::new(2);
        for i in 0..5 {
            let file = temp_dir.path().join(format!("{i}.txt"));
            fs::write(&file, b"x").unwrap();
            cache.read(&file).unwrap();
        }
        assert!(cache.len() <= 2);
    }
}
