//! Core VFS types.
//!
//! Inode numbers index the metadata array directly, so they are small
//! and dense. Attribute types mirror what the metadata index stores and
//! serialize into its fixed-size records.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::SystemTime;
use strum::{Display, EnumString};

/// Virtual inode number (slot in the metadata index).
pub type Ino = u32;

/// Path-derived identity of a datastore.
pub type Fsid = u64;

/// The root directory always lives in slot 0.
pub const ROOT_INO: Ino = 0;

/// Longest name component accepted by the namespace.
pub const NAME_MAX: usize = 255;

/// Longest symlink target stored inline in a metadata entry.
pub const LINK_TARGET_MAX: usize = 255;

/// Setgid bit; inherited by children of a setgid directory.
pub const S_ISGID: u32 = 0o2000;

/// Filesystem kind of a backing store.
///
/// `Any` is the wildcard used when selecting a datastore; it is never
/// the kind of a registered mount.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, EnumString, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive, serialize_all = "lowercase")]
pub enum FsKind {
    /// Wildcard: any registered datastore.
    #[default]
    Any,
    Ext3,
    Ext4,
    Nfs,
    Nfs4,
    Xfs,
    Btrfs,
    Tmpfs,
    /// In-process memory store (tests, scratch).
    Memory,
}

impl FsKind {
    /// Returns true for the selection wildcard.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, FsKind::Any)
    }

    /// Parse from a mount table fstype column.
    pub fn from_fstype(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok().filter(|k| !k.is_wildcard())
    }
}

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

impl FileType {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }

    /// Returns true if this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        matches!(self, FileType::Symlink)
    }
}

/// Persistent per-inode flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InodeFlags(u32);

impl InodeFlags {
    /// Backing store assignment deferred until first data access.
    /// On a directory: new files created inside inherit it.
    pub const DELAY_ALLOC: InodeFlags = InodeFlags(0x1);

    pub const fn empty() -> Self {
        InodeFlags(0)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: InodeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: InodeFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: InodeFlags) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: InodeFlags, on: bool) {
        if on {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}

/// File owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

impl Owner {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// Owner of the current process.
    #[cfg(unix)]
    pub fn current() -> Self {
        Self {
            uid: rustix::process::getuid().as_raw(),
            gid: rustix::process::getgid().as_raw(),
        }
    }

    #[cfg(not(unix))]
    pub fn current() -> Self {
        Self::default()
    }
}

/// File attributes (metadata).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAttr {
    /// Virtual inode number.
    pub ino: Ino,
    /// Distinguishes reuses of the same inode number.
    pub generation: u32,
    /// Size in bytes.
    pub size: u64,
    /// File type.
    pub kind: FileType,
    /// Unix permissions including setuid/setgid/sticky (e.g., 0o644).
    pub perm: u32,
    /// Number of hard links.
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    /// Persistent inode flags.
    pub flags: InodeFlags,
}

impl FileAttr {
    fn new(ino: Ino, kind: FileType, perm: u32, nlink: u32, size: u64) -> Self {
        let now = SystemTime::now();
        Self {
            ino,
            generation: 0,
            size,
            kind,
            perm,
            nlink,
            uid: 0,
            gid: 0,
            atime: now,
            mtime: now,
            ctime: now,
            flags: InodeFlags::empty(),
        }
    }

    /// Create attributes for a new file.
    pub fn file(ino: Ino, perm: u32) -> Self {
        Self::new(ino, FileType::File, perm, 1, 0)
    }

    /// Create attributes for a new directory.
    pub fn directory(ino: Ino, perm: u32) -> Self {
        Self::new(ino, FileType::Directory, perm, 2, 0) // . and ..
    }

    /// Create attributes for a symlink.
    pub fn symlink(ino: Ino, target_len: u64) -> Self {
        Self::new(ino, FileType::Symlink, 0o777, 1, target_len)
    }

    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Returns true if this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.kind.is_symlink()
    }

    /// Returns true if the file's backing assignment is still deferred.
    pub fn delay_alloc(&self) -> bool {
        self.flags.contains(InodeFlags::DELAY_ALLOC)
    }
}

/// Directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Child inode number; doubles as the readdir resume cookie.
    pub ino: Ino,
    /// Entry name (not full path).
    pub name: String,
    /// Entry type.
    pub kind: FileType,
}

impl DirEntry {
    /// Create a new directory entry.
    pub fn new(ino: Ino, name: impl Into<String>, kind: FileType) -> Self {
        Self {
            ino,
            name: name.into(),
            kind,
        }
    }
}

/// Attributes to set (for setattr operation).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetAttr {
    /// New size (truncate/extend).
    pub size: Option<u64>,
    /// New modification time.
    pub mtime: Option<SystemTime>,
    /// New access time.
    pub atime: Option<SystemTime>,
    /// New permissions.
    pub perm: Option<u32>,
    /// New user ID.
    pub uid: Option<u32>,
    /// New group ID.
    pub gid: Option<u32>,
}

impl SetAttr {
    /// Create a new empty SetAttr.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the size.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Set the modification time.
    pub fn with_mtime(mut self, mtime: SystemTime) -> Self {
        self.mtime = Some(mtime);
        self
    }

    /// Set permissions.
    pub fn with_perm(mut self, perm: u32) -> Self {
        self.perm = Some(perm);
        self
    }

    /// Set owner.
    pub fn with_owner(mut self, owner: Owner) -> Self {
        self.uid = Some(owner.uid);
        self.gid = Some(owner.gid);
        self
    }
}

/// Parameters for create/mkdir/symlink.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Permissions; 0o644 for files and 0o755 for directories if unset.
    pub perm: Option<u32>,
    /// Owner; the mount's default owner if unset.
    pub owner: Option<Owner>,
    /// Force delayed allocation on or off; inherited from the parent
    /// directory (or the mount default) if unset.
    pub delay_alloc: Option<bool>,
}

impl CreateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_perm(mut self, perm: u32) -> Self {
        self.perm = Some(perm);
        self
    }

    pub fn with_owner(mut self, owner: Owner) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_delay_alloc(mut self, delay_alloc: bool) -> Self {
        self.delay_alloc = Some(delay_alloc);
        self
    }
}

/// Write mode flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteFlags {
    /// Ignore the offset and write at the current end of the backing file.
    pub append: bool,
    /// Flush the backing file before returning.
    pub sync: bool,
}

impl WriteFlags {
    pub fn append() -> Self {
        Self {
            append: true,
            ..Default::default()
        }
    }

    pub fn sync() -> Self {
        Self {
            sync: true,
            ..Default::default()
        }
    }
}

/// Filesystem statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatFs {
    /// Total blocks.
    pub blocks: u64,
    /// Free blocks.
    pub bfree: u64,
    /// Available blocks (to non-root).
    pub bavail: u64,
    /// Total inodes.
    pub files: u64,
    /// Free inodes.
    pub ffree: u64,
    /// Block size.
    pub bsize: u32,
    /// Maximum name length.
    pub namelen: u32,
    /// Fragment size.
    pub frsize: u32,
}

impl Default for StatFs {
    fn default() -> Self {
        Self {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: 0,
            bsize: 4096,
            namelen: NAME_MAX as u32,
            frsize: 4096,
        }
    }
}

impl StatFs {
    /// Sum block counts into `self`, scaling `other` to this block size.
    pub fn accumulate(&mut self, other: &StatFs) {
        let scale = |v: u64| {
            if other.frsize == 0 || self.frsize == 0 {
                v
            } else {
                v.saturating_mul(u64::from(other.frsize)) / u64::from(self.frsize)
            }
        };
        self.blocks = self.blocks.saturating_add(scale(other.blocks));
        self.bfree = self.bfree.saturating_add(scale(other.bfree));
        self.bavail = self.bavail.saturating_add(scale(other.bavail));
    }
}

/// Validate a single name component.
pub fn check_name(name: &str) -> super::VfsResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0')
    {
        return Err(super::VfsError::invalid_path(name));
    }
    if name.len() > NAME_MAX {
        return Err(super::VfsError::NameTooLong);
    }
    Ok(())
}
