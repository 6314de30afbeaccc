//! Shared bounded caches: the open-file cache and the global I/O counters.
//!
//! The open-file cache is keyed `(path, mode)` and bounded by an LRU; each
//! entry carries its own slot lock so that two threads never race to open
//! the same path, and so the global map lock is never held across a
//! syscall.

use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tracing::debug;

use crate::error::Result;

// ── IoCounters ───────────────────────────────────────────────────────────────

/// Process-wide I/O tallies updated by every access implementation.
#[derive(Debug, Default)]
pub struct IoCounters {
    pub nopen:  AtomicU64,
    pub rbytes: AtomicU64,
    pub wbytes: AtomicU64,
}

impl IoCounters {
    pub fn new() -> Arc<IoCounters> {
        Arc::new(Self::default())
    }

    #[inline]
    pub fn add_read(&self, bytes: u64) {
        self.rbytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_write(&self, bytes: u64) {
        self.wbytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.nopen.load(Ordering::Relaxed),
            self.rbytes.load(Ordering::Relaxed),
            self.wbytes.load(Ordering::Relaxed),
        )
    }
}

// ── OpenFileCache ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileMode {
    Read,
    ReadWrite,
}

/// One cached descriptor. The slot mutex doubles as the per-path lock: it
/// serializes opens and all I/O on that file.
#[derive(Debug, Default)]
struct FileSlot {
    file: Mutex<Option<File>>,
}

pub const DEFAULT_OPEN_FILES: usize = 64;

pub struct OpenFileCache {
    map:      Mutex<LruCache<(PathBuf, FileMode), Arc<FileSlot>>>,
    counters: Arc<IoCounters>,
}

impl std::fmt::Debug for OpenFileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let open = self.map.lock().map(|m| m.len()).unwrap_or(0);
        f.debug_struct("OpenFileCache").field("open", &open).finish()
    }
}

impl OpenFileCache {
    pub fn new(capacity: usize, counters: Arc<IoCounters>) -> Arc<OpenFileCache> {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Arc::new(OpenFileCache { map: Mutex::new(LruCache::new(capacity)), counters })
    }

    /// Run `op` with the (possibly freshly opened) file for `path`.
    ///
    /// The slot lock is held for the whole of `op`, so per-file reads and
    /// writes are serialized; distinct paths proceed concurrently. In
    /// `ReadWrite` mode a missing file is created (parents included) and
    /// `init` is invoked exactly once to lay down its structure.
    pub fn with_file<T>(
        &self,
        path: &Path,
        mode: FileMode,
        init: Option<&dyn Fn(&mut File) -> Result<()>>,
        op: impl FnOnce(&mut File) -> Result<T>,
    ) -> Result<T> {
        let slot = {
            let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
            let key = (path.to_owned(), mode);
            if let Some(slot) = map.get(&key) {
                Arc::clone(slot)
            } else {
                let slot = Arc::new(FileSlot::default());
                map.push(key, Arc::clone(&slot));
                slot
            }
        };

        let mut guard = slot.file.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            let file = match mode {
                FileMode::Read => OpenOptions::new().read(true).open(path)?,
                FileMode::ReadWrite => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let existed = path.exists();
                    let mut file = OpenOptions::new()
                        .read(true)
                        .write(true)
                        .create(true)
                        .open(path)?;
                    if !existed {
                        if let Some(init) = init {
                            init(&mut file)?;
                        }
                    }
                    file
                }
            };
            debug!(path = %path.display(), ?mode, "opened block file");
            self.counters.nopen.fetch_add(1, Ordering::Relaxed);
            *guard = Some(file);
        }
        op(guard.as_mut().unwrap())
    }

    /// Drop every cached descriptor (used after external mutation, e.g.
    /// tests rewriting files out from under the cache).
    pub fn clear(&self) {
        self.map.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn counters(&self) -> &Arc<IoCounters> {
        &self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    #[test]
    fn creates_and_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let counters = IoCounters::new();
        let cache = OpenFileCache::new(4, Arc::clone(&counters));
        let path = dir.path().join("sub/file.bin");

        cache
            .with_file(&path, FileMode::ReadWrite, None, |f| {
                f.write_all(b"hello")?;
                Ok(())
            })
            .unwrap();
        // Second use hits the cached descriptor: nopen stays at 1.
        let read = cache
            .with_file(&path, FileMode::ReadWrite, None, |f| {
                f.seek(SeekFrom::Start(0))?;
                let mut s = String::new();
                f.read_to_string(&mut s)?;
                Ok(s)
            })
            .unwrap();
        assert_eq!(read, "hello");
        assert_eq!(counters.nopen.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn read_mode_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let cache = OpenFileCache::new(4, IoCounters::new());
        let missing = dir.path().join("absent.bin");
        let err = cache
            .with_file(&missing, FileMode::Read, None, |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound));
    }

    #[test]
    fn init_runs_once_on_create() {
        let dir = tempfile::tempdir().unwrap();
        let cache = OpenFileCache::new(4, IoCounters::new());
        let path = dir.path().join("with-header.bin");
        let init = |f: &mut File| -> Result<()> {
            f.write_all(b"HDR!")?;
            Ok(())
        };
        for _ in 0..2 {
            cache
                .with_file(&path, FileMode::ReadWrite, Some(&init), |f| {
                    f.seek(SeekFrom::Start(0))?;
                    let mut magic = [0u8; 4];
                    f.read_exact(&mut magic)?;
                    assert_eq!(&magic, b"HDR!");
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(std::fs::read(&path).unwrap(), b"HDR!");
    }

    #[test]
    fn lru_bound_evicts() {
        let dir = tempfile::tempdir().unwrap();
        let counters = IoCounters::new();
        let cache = OpenFileCache::new(2, Arc::clone(&counters));
        for i in 0..5 {
            let path = dir.path().join(format!("f{i}"));
            cache
                .with_file(&path, FileMode::ReadWrite, None, |f| {
                    f.write_all(&[i as u8])?;
                    Ok(())
                })
                .unwrap();
        }
        // Re-touch the first file: it was evicted, so it reopens.
        let first = dir.path().join("f0");
        cache
            .with_file(&first, FileMode::ReadWrite, None, |_| Ok(()))
            .unwrap();
        assert_eq!(counters.nopen.load(Ordering::Relaxed), 6);
    }
}
