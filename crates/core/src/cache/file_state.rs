use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Content cache keyed by `(absolute path, mtime_ns)`. Readers see either
/// pre- or post-write bytes, never torn content: the map lock serializes
/// all access, and every mutating tool invalidates before it returns.
#[derive(Debug, Default)]
pub struct FileStateCache {
    entries: Mutex<HashMap<PathBuf, Vec<(u128, Arc<Vec<u8>>)>>>,
}

impl FileStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached bytes for `path` iff the on-disk mtime still matches a
    /// cached version. Anything else is a miss.
    pub fn get(&self, path: &Path) -> Option<Arc<Vec<u8>>> {
        let disk_mtime = mtime_ns(path)?;
        let entries = self.entries.lock().unwrap();
        entries.get(path).and_then(|versions| {
            versions
                .iter()
                .find(|(mtime, _)| *mtime == disk_mtime)
                .map(|(_, bytes)| Arc::clone(bytes))
        })
    }

    pub fn put(&self, path: &Path, bytes: Vec<u8>) {
        let Some(disk_mtime) = mtime_ns(path) else {
            return;
        };
        let mut entries = self.entries.lock().unwrap();
        let versions = entries.entry(path.to_path_buf()).or_default();
        versions.retain(|(mtime, _)| *mtime != disk_mtime);
        versions.push((disk_mtime, Arc::new(bytes)));
    }

    /// Drop every cached version of `path`. Mutating tools call this
    /// before returning, so the next `get` on any worker observes a miss
    /// or fresh content.
    pub fn invalidate(&self, path: &Path) {
        self.entries.lock().unwrap().remove(path);
    }

    /// Read through the cache: serve cached bytes when the mtime matches,
    /// otherwise load from disk and refresh the entry.
    pub fn read(&self, path: &Path) -> std::io::Result<Arc<Vec<u8>>> {
        if let Some(bytes) = self.get(path) {
            return Ok(bytes);
        }
        let bytes = std::fs::read(path)?;
        self.put(path, bytes.clone());
        Ok(Arc::new(bytes))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

fn mtime_ns(path: &Path) -> Option<u128> {
    let meta = std::fs::metadata(path).ok()?;
    let mtime = meta.modified().ok()?;
    mtime
        .duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_nanos())
}
