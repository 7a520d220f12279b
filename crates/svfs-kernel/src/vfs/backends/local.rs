//! Local filesystem backend.
//!
//! Relays file data into a directory of the host filesystem, typically
//! the root of a mounted ext3/ext4/NFS volume.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::ops::{BackingFile, BackingStore};
use crate::vfs::types::StatFs;

/// Local filesystem backend.
///
/// All operations are relative to `root`. For example, if `root` is
/// `/mnt/ext4`, then `open("ino_2")` opens `/mnt/ext4/ino_2`.
///
/// The root directory stays open for the lifetime of the backend and is
/// closed when the backend is dropped.
#[derive(Debug)]
pub struct LocalBackend {
    root: PathBuf,
    root_dir: File,
}

impl LocalBackend {
    /// Open a backend rooted at the given directory.
    ///
    /// The root is canonicalized at construction time to handle symlinks
    /// (e.g. macOS `/tmp` → `/private/tmp`).
    pub fn open(root: impl Into<PathBuf>) -> VfsResult<Self> {
        let root: PathBuf = root.into();
        let root = root.canonicalize().map_err(VfsError::from)?;
        let root_dir = File::open(&root).map_err(VfsError::from)?;
        if !root_dir.metadata().map_err(VfsError::from)?.is_dir() {
            return Err(VfsError::not_a_directory(root.display().to_string()));
        }
        Ok(Self { root, root_dir })
    }

    /// Get the root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path to an absolute path within the root.
    ///
    /// Only plain components are accepted, so the result can never
    /// escape the root.
    fn resolve(&self, rel: &Path) -> VfsResult<PathBuf> {
        let rel = rel.strip_prefix("/").unwrap_or(rel);
        if rel.as_os_str().is_empty() {
            return Err(VfsError::invalid_path("empty backing path"));
        }
        for component in rel.components() {
            if !matches!(component, Component::Normal(_)) {
                return Err(VfsError::path_escapes_root(format!(
                    "{} is not under {}",
                    rel.display(),
                    self.root.display()
                )));
            }
        }
        Ok(self.root.join(rel))
    }

    fn open_with(&self, rel: &Path, create: bool, truncate: bool) -> VfsResult<Box<dyn BackingFile>> {
        let full_path = self.resolve(rel)?;

        if create {
            if let Some(parent) = full_path.parent() {
                fs::create_dir_all(parent).map_err(VfsError::from)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(truncate)
            .open(&full_path)
            .map_err(VfsError::from)?;

        debug!(path = %full_path.display(), create, truncate, "opened backing file");
        Ok(Box::new(LocalFile { file }))
    }
}

impl BackingStore for LocalBackend {
    fn open(&self, rel: &Path, create: bool) -> VfsResult<Box<dyn BackingFile>> {
        self.open_with(rel, create, false)
    }

    fn create(&self, rel: &Path) -> VfsResult<Box<dyn BackingFile>> {
        self.open_with(rel, true, true)
    }

    fn unlink(&self, rel: &Path) -> VfsResult<()> {
        let full_path = self.resolve(rel)?;
        fs::remove_file(&full_path).map_err(VfsError::from)
    }

    fn exists(&self, rel: &Path) -> bool {
        self.resolve(rel).map(|p| p.exists()).unwrap_or(false)
    }

    fn statfs(&self) -> VfsResult<StatFs> {
        use rustix::fs::fstatvfs;

        let stat = fstatvfs(&self.root_dir).map_err(|e| VfsError::Io(e.into()))?;

        Ok(StatFs {
            blocks: stat.f_blocks,
            bfree: stat.f_bfree,
            bavail: stat.f_bavail,
            files: stat.f_files,
            ffree: stat.f_ffree,
            bsize: stat.f_bsize as u32,
            namelen: stat.f_namemax as u32,
            frsize: stat.f_frsize as u32,
        })
    }
}

/// Handle on a host file.
#[derive(Debug)]
struct LocalFile {
    file: File,
}

impl BackingFile for LocalFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        self.file.read_at(buf, offset).map_err(VfsError::from)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> VfsResult<usize> {
        self.file.write_at(buf, offset).map_err(VfsError::from)
    }

    fn len(&self) -> VfsResult<u64> {
        Ok(self.file.metadata().map_err(VfsError::from)?.len())
    }

    fn set_len(&self, size: u64) -> VfsResult<()> {
        self.file.set_len(size).map_err(VfsError::from)
    }

    fn sync(&self) -> VfsResult<()> {
        self.file.sync_all().map_err(VfsError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (LocalBackend, TempDir) {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::open(dir.path()).unwrap();
        (backend, dir)
    }

    #[test]
    fn test_create_write_read() {
        let (backend, dir) = setup();

        let file = backend.open(Path::new("ino_2"), true).unwrap();
        file.write_all_at(b"hello world", 0).unwrap();

        let mut buf = [0u8; 5];
        assert_eq!(file.read_full_at(&mut buf, 6).unwrap(), 5);
        assert_eq!(&buf, b"world");
        assert_eq!(file.len().unwrap(), 11);
        assert!(dir.path().join("ino_2").exists());
    }

    #[test]
    fn test_open_missing_without_create() {
        let (backend, _dir) = setup();
        let err = backend.open(Path::new("ino_9"), false).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_create_keeps_existing_content() {
        let (backend, _dir) = setup();
        backend
            .open(Path::new("ino_3"), true)
            .unwrap()
            .write_all_at(b"keep", 0)
            .unwrap();

        let again = backend.open(Path::new("ino_3"), true).unwrap();
        assert_eq!(again.len().unwrap(), 4);
    }

    #[test]
    fn test_create_discards_existing_content() {
        let (backend, _dir) = setup();
        backend
            .open(Path::new("ino_6"), true)
            .unwrap()
            .write_all_at(b"leftover", 0)
            .unwrap();

        let fresh = backend.create(Path::new("ino_6")).unwrap();
        assert_eq!(fresh.len().unwrap(), 0);
        let mut buf = [0u8; 8];
        assert_eq!(fresh.read_full_at(&mut buf, 0).unwrap(), 0);
    }

    #[test]
    fn test_unlink() {
        let (backend, _dir) = setup();
        backend.open(Path::new("ino_4"), true).unwrap();
        assert!(backend.exists(Path::new("ino_4")));

        backend.unlink(Path::new("ino_4")).unwrap();
        assert!(!backend.exists(Path::new("ino_4")));
        assert!(backend.unlink(Path::new("ino_4")).unwrap_err().is_not_found());
    }

    #[test]
    fn test_truncate() {
        let (backend, _dir) = setup();
        let file = backend.open(Path::new("ino_5"), true).unwrap();
        file.write_all_at(b"hello world", 0).unwrap();
        file.set_len(5).unwrap();

        let mut buf = vec![0u8; 100];
        let n = file.read_full_at(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn test_path_escape_blocked() {
        let (backend, _dir) = setup();

        let result = backend.open(Path::new("../../../etc/passwd"), false);
        assert!(matches!(result, Err(VfsError::PathEscapesRoot(_))));
    }

    #[test]
    fn test_statfs() {
        let (backend, _dir) = setup();
        let stat = backend.statfs().unwrap();
        assert!(stat.blocks > 0);
        assert!(stat.bsize > 0);
    }

    #[test]
    fn test_root_must_be_directory() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        assert!(LocalBackend::open(&file).is_err());
    }
}
