//! Static file cache backing `add_directory_route` (spec.md §4.7).
//!
//! Grounded on `original_source/src/core/file_cache.h`/`.cpp`: a directory
//! scan populates a map from request-relative path to file bytes plus
//! `{size, mtime}`, with a periodic re-scan thread keeping it current. §5
//! describes the external file cache as "a shared map under a mutex and
//! per-worker thread-local maps updated via cross-thread event-loop posts";
//! this module keeps the shared map and gives each worker a thread-local
//! read-through cache that refreshes in one shot whenever the shared map's
//! version counter advances, which is the single-process equivalent of that
//! cross-thread post without needing a handle back into every worker's
//! event loop from the rescan thread.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

/// One indexed file: its bytes plus the metadata used to decide whether a
/// re-scan picked up a change.
#[derive(Debug, Clone)]
pub struct CachedFile {
    pub bytes: Arc<[u8]>,
    pub size: u64,
    pub mtime: Option<SystemTime>,
}

/// Shared, mutex-guarded static file index. One instance serves every
/// worker; [`WorkerFileCache`] is the thread-local fast path in front of it.
#[derive(Debug, Default)]
pub struct FileCache {
    files: Mutex<HashMap<String, Arc<CachedFile>>>,
    version: AtomicU64,
}

impl FileCache {
    pub fn new() -> Self {
        FileCache::default()
    }

    /// Scans `dir` recursively, indexing every regular file under
    /// `route_prefix` + its path relative to `dir`. Returns the number of
    /// files indexed. Used by `add_directory_route` at bootstrap and by the
    /// periodic re-scan thread thereafter.
    pub fn scan_directory(&self, route_prefix: &str, dir: &Path) -> io::Result<usize> {
        let mut indexed = HashMap::new();
        scan_into(dir, dir, route_prefix, &mut indexed)?;
        let count = indexed.len();

        let mut files = self.files.lock();
        files.extend(indexed);
        self.version.fetch_add(1, Ordering::Release);
        Ok(count)
    }

    pub fn get(&self, path: &str) -> Option<Arc<CachedFile>> {
        self.files.lock().get(path).cloned()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Snapshot of the whole map, used by [`WorkerFileCache`] to refresh its
    /// local copy after a re-scan.
    fn snapshot(&self) -> HashMap<String, Arc<CachedFile>> {
        self.files.lock().clone()
    }
}

fn scan_into(
    root: &Path,
    dir: &Path,
    route_prefix: &str,
    out: &mut HashMap<String, Arc<CachedFile>>,
) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            scan_into(root, &path, route_prefix, out)?;
            continue;
        }
        if !file_type.is_file() {
            continue;
        }

        let relative = path.strip_prefix(root).unwrap_or(&path);
        let key = format!("{}/{}", route_prefix.trim_end_matches('/'), relative.to_string_lossy());

        let bytes = fs::read(&path)?;
        let metadata = entry.metadata()?;
        out.insert(
            key,
            Arc::new(CachedFile {
                size: bytes.len() as u64,
                mtime: metadata.modified().ok(),
                bytes: Arc::from(bytes.into_boxed_slice()),
            }),
        );
    }
    Ok(())
}

/// Per-worker lock-free read-through cache in front of a shared
/// [`FileCache`]. Refreshes its local copy only when the shared map's
/// version has advanced since the last refresh.
#[derive(Debug, Default)]
pub struct WorkerFileCache {
    local: RefCell<HashMap<String, Arc<CachedFile>>>,
    seen_version: std::cell::Cell<u64>,
}

impl WorkerFileCache {
    pub fn new() -> Self {
        WorkerFileCache::default()
    }

    pub fn get(&self, shared: &FileCache, path: &str) -> Option<Arc<CachedFile>> {
        if self.seen_version.get() != shared.version() {
            *self.local.borrow_mut() = shared.snapshot();
            self.seen_version.set(shared.version());
        }
        self.local.borrow().get(path).cloned()
    }
}

/// Directory-scan route registration result, used by
/// `Server::add_directory_route`.
#[derive(Debug)]
pub struct DirectoryRoute {
    pub route_prefix: String,
    pub directory: PathBuf,
    pub files_indexed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn scans_directory_and_serves_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = fs::File::create(dir.path().join("index.html")).unwrap();
        file.write_all(b"<html></html>").unwrap();

        let cache = FileCache::new();
        let count = cache.scan_directory("/static", dir.path()).unwrap();
        assert_eq!(count, 1);

        let served = cache.get("/static/index.html").unwrap();
        assert_eq!(&*served.bytes, b"<html></html>");
    }

    #[test]
    fn worker_cache_refreshes_after_rescan() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"one").unwrap();

        let cache = FileCache::new();
        cache.scan_directory("/s", dir.path()).unwrap();
        let worker = WorkerFileCache::new();
        assert!(worker.get(&cache, "/s/a.txt").is_some());
        assert!(worker.get(&cache, "/s/b.txt").is_none());

        fs::write(dir.path().join("b.txt"), b"two").unwrap();
        cache.scan_directory("/s", dir.path()).unwrap();
        assert!(worker.get(&cache, "/s/b.txt").is_some());
    }

    #[test]
    fn missing_path_returns_none() {
        let cache = FileCache::new();
        assert!(cache.get("/nope").is_none());
    }
}
