//! Stacking metadata filesystem.
//!
//! The virtual layer owns inode numbers, the directory tree and a small
//! metadata index; file bytes live on whichever backing store (datastore)
//! a file was assigned when it was created or first written.
//!
//! - [`MetadataIndex`] - fixed array of entries addressed by inode number
//! - [`DatastoreRegistry`] - registered backing-store mounts and selection
//! - [`VirtualInode`] - in-memory inode with its lazy backing connection
//! - [`Svfs`] - namespace and file operations over all of the above
//! - [`LocalBackend`] / [`MemoryBackend`] - backing store implementations
//!
//! ## Design Decisions
//!
//! - **Inode numbers are slots**: the index is an arena; ino 0 is the root.
//! - **Backing files are named by inode**: `ino_<n>` on the assigned
//!   datastore, so renames never touch backing stores.
//! - **Lazy relay**: lookups never open backing files; the first read or
//!   write does.
//! - **Synchronous**: every operation runs to completion on the calling
//!   thread.

pub mod backends;
mod error;
mod index;
mod inode;
mod mount;
mod namespace;
mod ops;
pub mod persist;
mod relay;
mod resolver;
mod types;

pub use backends::{LocalBackend, MemoryBackend};
pub use error::{VfsError, VfsResult};
pub use index::{BackingRef, EntryInit, EntryState, MetadataEntry, MetadataIndex, backing_fragment};
pub use inode::{ConnectionState, VirtualInode};
pub use mount::{Datastore, DatastoreInfo, DatastoreRegistry, elf_hash, fsid_of};
pub use namespace::{MountOptions, Svfs};
pub use ops::{BackingFile, BackingStore};
pub use resolver::{
    FixedMounts, MountEntry, MountResolver, MountSource, ProcMounts, owning_mount, parse_mounts,
};
pub use types::{
    CreateOptions, DirEntry, FileAttr, FileType, FsKind, Fsid, InodeFlags, Ino, LINK_TARGET_MAX,
    NAME_MAX, Owner, ROOT_INO, S_ISGID, SetAttr, StatFs, WriteFlags, check_name,
};
