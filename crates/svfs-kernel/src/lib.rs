//! # svfs-kernel
//!
//! Metadata relay engine of a stacking filesystem.
//!
//! A virtual namespace of directories and files whose data is relayed
//! into one or more independently mounted backing filesystems. The
//! virtual layer owns inode numbers, the tree and file attributes; each
//! file's bytes live in a backing file on the datastore it was assigned.

pub mod config;
pub mod vfs;

pub use config::{ConfigError, SvfsConfig};
pub use vfs::{
    ConnectionState, CreateOptions, DatastoreRegistry, DirEntry, FileAttr, FileType, FsKind, Ino,
    MetadataIndex, MountOptions, ROOT_INO, SetAttr, StatFs, Svfs, VfsError, VfsResult, WriteFlags,
};
