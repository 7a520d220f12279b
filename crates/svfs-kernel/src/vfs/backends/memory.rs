//! In-memory backing store.
//!
//! Used for testing and scratch datastores. All data is ephemeral.
//! Clones share state, so a test can keep one clone to inspect what the
//! relay engine did through another.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::ops::{BackingFile, BackingStore};
use crate::vfs::types::StatFs;

type Contents = Arc<RwLock<Vec<u8>>>;

#[derive(Debug)]
struct Inner {
    files: RwLock<HashMap<PathBuf, Contents>>,
    geometry: StatFs,
    open_handles: AtomicUsize,
    fail_open: AtomicBool,
    fail_unlink: AtomicBool,
}

/// In-memory backing store.
///
/// Thread-safe via internal locks.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create a new empty store reporting 1M 4K blocks, half free.
    pub fn new() -> Self {
        Self::with_geometry(StatFs {
            blocks: 1024 * 1024,
            bfree: 512 * 1024,
            bavail: 512 * 1024,
            files: 1024 * 1024,
            ffree: 512 * 1024,
            ..StatFs::default()
        })
    }

    /// Create a store whose `statfs` reports `geometry`.
    pub fn with_geometry(geometry: StatFs) -> Self {
        Self {
            inner: Arc::new(Inner {
                files: RwLock::new(HashMap::new()),
                geometry,
                open_handles: AtomicUsize::new(0),
                fail_open: AtomicBool::new(false),
                fail_unlink: AtomicBool::new(false),
            }),
        }
    }

    /// Normalize a path: remove leading `/` and `.`; `..` is rejected by
    /// callers before this point.
    fn normalize(path: &Path) -> VfsResult<PathBuf> {
        let mut result = PathBuf::new();
        for component in path.components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(s) => result.push(s),
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(VfsError::path_escapes_root(path.display().to_string()));
                }
            }
        }
        if result.as_os_str().is_empty() {
            return Err(VfsError::invalid_path("empty backing path"));
        }
        Ok(result)
    }

    /// Make subsequent `open` calls fail with an I/O error.
    pub fn fail_open(&self, fail: bool) {
        self.inner.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `unlink` calls fail with an I/O error.
    pub fn fail_unlink(&self, fail: bool) {
        self.inner.fail_unlink.store(fail, Ordering::SeqCst);
    }

    /// Number of handles currently open on this store.
    pub fn open_handles(&self) -> usize {
        self.inner.open_handles.load(Ordering::SeqCst)
    }

    /// Read a whole file, bypassing the relay.
    pub fn contents(&self, rel: impl AsRef<Path>) -> Option<Vec<u8>> {
        let path = Self::normalize(rel.as_ref()).ok()?;
        let files = self.inner.files.read();
        files.get(&path).map(|c| c.read().clone())
    }

    /// Names of all files, sorted.
    pub fn file_names(&self) -> Vec<String> {
        let files = self.inner.files.read();
        let mut names: Vec<_> = files
            .keys()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

impl BackingStore for MemoryBackend {
    fn open(&self, rel: &Path, create: bool) -> VfsResult<Box<dyn BackingFile>> {
        if self.inner.fail_open.load(Ordering::SeqCst) {
            return Err(VfsError::Io(std::io::Error::other("injected open failure")));
        }
        let path = Self::normalize(rel)?;

        let contents = if create {
            let mut files = self.inner.files.write();
            Arc::clone(files.entry(path).or_default())
        } else {
            let files = self.inner.files.read();
            files
                .get(&path)
                .cloned()
                .ok_or_else(|| VfsError::not_found(path.display().to_string()))?
        };

        self.inner.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryFile {
            contents,
            store: Arc::clone(&self.inner),
        }))
    }

    fn create(&self, rel: &Path) -> VfsResult<Box<dyn BackingFile>> {
        if self.inner.fail_open.load(Ordering::SeqCst) {
            return Err(VfsError::Io(std::io::Error::other("injected open failure")));
        }
        let path = Self::normalize(rel)?;
        let contents: Contents = Arc::default();
        self.inner.files.write().insert(path, Arc::clone(&contents));

        self.inner.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryFile {
            contents,
            store: Arc::clone(&self.inner),
        }))
    }

    fn unlink(&self, rel: &Path) -> VfsResult<()> {
        if self.inner.fail_unlink.load(Ordering::SeqCst) {
            return Err(VfsError::Io(std::io::Error::other("injected unlink failure")));
        }
        let path = Self::normalize(rel)?;
        let mut files = self.inner.files.write();
        files
            .remove(&path)
            .map(|_| ())
            .ok_or_else(|| VfsError::not_found(path.display().to_string()))
    }

    fn exists(&self, rel: &Path) -> bool {
        match Self::normalize(rel) {
            Ok(path) => self.inner.files.read().contains_key(&path),
            Err(_) => false,
        }
    }

    fn statfs(&self) -> VfsResult<StatFs> {
        Ok(self.inner.geometry.clone())
    }
}

/// Handle on an in-memory file. Unlinking the name keeps the contents
/// alive for open handles, as on a POSIX filesystem.
#[derive(Debug)]
struct MemoryFile {
    contents: Contents,
    store: Arc<Inner>,
}

impl Drop for MemoryFile {
    fn drop(&mut self) {
        self.store.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

impl BackingFile for MemoryFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        let data = self.contents.read();
        let start = offset as usize;
        if start >= data.len() {
            return Ok(0);
        }
        let end = std::cmp::min(start + buf.len(), data.len());
        buf[..end - start].copy_from_slice(&data[start..end]);
        Ok(end - start)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> VfsResult<usize> {
        let mut data = self.contents.write();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn len(&self) -> VfsResult<u64> {
        Ok(self.contents.read().len() as u64)
    }

    fn set_len(&self, size: u64) -> VfsResult<()> {
        self.contents.write().resize(size as usize, 0);
        Ok(())
    }

    fn sync(&self) -> VfsResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_read() {
        let store = MemoryBackend::new();
        let file = store.open(Path::new("ino_1"), true).unwrap();
        file.write_all_at(b"hello world", 0).unwrap();

        let mut buf = [0u8; 5];
        assert_eq!(file.read_at(&mut buf, 6).unwrap(), 5);
        assert_eq!(&buf, b"world");
        assert_eq!(store.contents("ino_1").unwrap(), b"hello world");
    }

    #[test]
    fn test_sparse_write_zero_fills() {
        let store = MemoryBackend::new();
        let file = store.open(Path::new("ino_1"), true).unwrap();
        file.write_at(b"x", 3).unwrap();
        assert_eq!(store.contents("ino_1").unwrap(), b"\0\0\0x");
    }

    #[test]
    fn test_create_replaces_contents() {
        let store = MemoryBackend::new();
        let old = store.open(Path::new("ino_1"), true).unwrap();
        old.write_all_at(b"stale", 0).unwrap();

        let fresh = store.create(Path::new("ino_1")).unwrap();
        assert_eq!(fresh.len().unwrap(), 0);
        assert_eq!(store.contents("ino_1").unwrap(), b"");
        // The old handle keeps the detached contents.
        assert_eq!(old.len().unwrap(), 5);
    }

    #[test]
    fn test_open_missing() {
        let store = MemoryBackend::new();
        assert!(store.open(Path::new("ino_1"), false).unwrap_err().is_not_found());
    }

    #[test]
    fn test_clones_share_state() {
        let store = MemoryBackend::new();
        let other = store.clone();
        store.open(Path::new("a"), true).unwrap();
        assert!(other.exists(Path::new("a")));
        assert_eq!(other.file_names(), vec!["a".to_string()]);
    }

    #[test]
    fn test_handle_accounting() {
        let store = MemoryBackend::new();
        let a = store.open(Path::new("a"), true).unwrap();
        let b = store.open(Path::new("a"), false).unwrap();
        assert_eq!(store.open_handles(), 2);
        drop(a);
        drop(b);
        assert_eq!(store.open_handles(), 0);
    }

    #[test]
    fn test_unlink_keeps_open_handle_readable() {
        let store = MemoryBackend::new();
        let file = store.open(Path::new("a"), true).unwrap();
        file.write_all_at(b"data", 0).unwrap();
        store.unlink(Path::new("a")).unwrap();

        assert!(!store.exists(Path::new("a")));
        let mut buf = [0u8; 4];
        assert_eq!(file.read_at(&mut buf, 0).unwrap(), 4);
    }

    #[test]
    fn test_fault_injection() {
        let store = MemoryBackend::new();
        store.open(Path::new("a"), true).unwrap();

        store.fail_unlink(true);
        assert!(store.unlink(Path::new("a")).is_err());
        assert!(store.exists(Path::new("a")));

        store.fail_open(true);
        assert!(store.open(Path::new("b"), true).is_err());
        assert!(!store.exists(Path::new("b")));
    }

    #[test]
    fn test_parent_dir_rejected() {
        let store = MemoryBackend::new();
        assert!(matches!(
            store.open(Path::new("../x"), true),
            Err(VfsError::PathEscapesRoot(_))
        ));
    }
}
