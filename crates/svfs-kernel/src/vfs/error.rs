//! VFS error types.

use std::io;
use thiserror::Error;

use super::types::{FsKind, Ino};

/// VFS error type.
#[derive(Debug, Error)]
pub enum VfsError {
    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Name already exists in the parent directory.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Directory not empty.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Not a symbolic link.
    #[error("not a symbolic link: {0}")]
    NotASymlink(String),

    /// Path escapes a backing store root.
    #[error("path escapes root: {0}")]
    PathEscapesRoot(String),

    /// Invalid path or name.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// File name too long.
    #[error("file name too long")]
    NameTooLong,

    /// Symlink target does not fit inline in the metadata entry.
    #[error("symlink target too long")]
    TargetTooLong,

    /// No free metadata entry left.
    #[error("no free inode slot")]
    NoSpace,

    /// No registered datastore can serve the request.
    #[error("no datastore available: {0}")]
    NoDatastore(String),

    /// Registration target is not a mount the resolver knows about.
    #[error("no mount point for path: {0}")]
    NoMountPoint(String),

    /// Registration target is mounted with another filesystem kind.
    #[error("{path} is mounted as {found}, expected {expected}")]
    WrongFsKind {
        path: String,
        expected: FsKind,
        found: String,
    },

    /// A relay attempt failed earlier; the inode stays failed until it is
    /// looked up again.
    #[error("inode {ino} relay failed: {reason}")]
    ConnectionFailed { ino: Ino, reason: String },

    /// Metadata invariant violated.
    #[error("metadata corruption: {0}")]
    Corrupt(String),

    /// Entry changed between lookup and mutation.
    #[error("stale entry: {0}")]
    Stale(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl VfsError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create an IsADirectory error.
    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    /// Create a DirectoryNotEmpty error.
    pub fn directory_not_empty(path: impl Into<String>) -> Self {
        Self::DirectoryNotEmpty(path.into())
    }

    /// Create a PathEscapesRoot error.
    pub fn path_escapes_root(path: impl Into<String>) -> Self {
        Self::PathEscapesRoot(path.into())
    }

    /// Create an InvalidPath error.
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    /// Create a NoDatastore error.
    pub fn no_datastore(what: impl Into<String>) -> Self {
        Self::NoDatastore(what.into())
    }

    /// Create a NoMountPoint error.
    pub fn no_mount_point(path: impl Into<String>) -> Self {
        Self::NoMountPoint(path.into())
    }

    /// Create a Corrupt error.
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Create a Stale error.
    pub fn stale(msg: impl Into<String>) -> Self {
        Self::Stale(msg.into())
    }

    /// Create an Other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// True for misses that callers treat as a normal negative result.
    pub fn is_not_found(&self) -> bool {
        match self {
            VfsError::NotFound(_) => true,
            VfsError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Convert VfsError to std::io::Error for compatibility.
impl From<VfsError> for io::Error {
    fn from(e: VfsError) -> Self {
        match e {
            VfsError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            VfsError::AlreadyExists(msg) => io::Error::new(io::ErrorKind::AlreadyExists, msg),
            VfsError::NotADirectory(msg) => io::Error::new(io::ErrorKind::NotADirectory, msg),
            VfsError::IsADirectory(msg) => io::Error::new(io::ErrorKind::IsADirectory, msg),
            VfsError::DirectoryNotEmpty(msg) => {
                io::Error::new(io::ErrorKind::DirectoryNotEmpty, msg)
            }
            VfsError::NotASymlink(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            VfsError::PathEscapesRoot(msg) => {
                io::Error::new(io::ErrorKind::PermissionDenied, msg)
            }
            VfsError::InvalidPath(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            VfsError::NameTooLong => {
                io::Error::new(io::ErrorKind::InvalidInput, "file name too long")
            }
            VfsError::TargetTooLong => {
                io::Error::new(io::ErrorKind::InvalidInput, "symlink target too long")
            }
            VfsError::NoSpace => io::Error::new(io::ErrorKind::StorageFull, "no free inode slot"),
            VfsError::NoMountPoint(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            VfsError::Io(e) => e,
            other => io::Error::other(other.to_string()),
        }
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(VfsError::not_found("x").is_not_found());
        assert!(VfsError::Io(io::Error::from(io::ErrorKind::NotFound)).is_not_found());
        assert!(!VfsError::NoSpace.is_not_found());
    }

    #[test]
    fn test_io_error_mapping() {
        let e: io::Error = VfsError::directory_not_empty("/d").into();
        assert_eq!(e.kind(), io::ErrorKind::DirectoryNotEmpty);

        let e: io::Error = VfsError::NoSpace.into();
        assert_eq!(e.kind(), io::ErrorKind::StorageFull);

        let e: io::Error = VfsError::ConnectionFailed {
            ino: 3,
            reason: "gone".into(),
        }
        .into();
        assert_eq!(e.kind(), io::ErrorKind::Other);
    }
}
