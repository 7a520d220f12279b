//! Backing store capability traits.
//!
//! A backing store (LLFS) is any mounted filesystem the relay engine can
//! place file data on. Each filesystem kind plugs in by implementing
//! [`BackingStore`]; the datastore registry keeps the kind tag and picks
//! the implementation, so nothing above this layer dispatches on kind.

use std::fmt::Debug;
use std::path::Path;

use super::types::StatFs;
use super::VfsResult;

/// Capability interface of a registered backing store.
///
/// Paths are relative to the store root.
pub trait BackingStore: Send + Sync + Debug {
    /// Open the file at `rel` for reading and writing.
    ///
    /// With `create` the file is created if missing; existing content is
    /// kept.
    fn open(&self, rel: &Path, create: bool) -> VfsResult<Box<dyn BackingFile>>;

    /// Create an empty file at `rel`, discarding whatever was there.
    ///
    /// Used when a file is placed: a leftover backing file from an
    /// earlier index must never leak into the new inode.
    fn create(&self, rel: &Path) -> VfsResult<Box<dyn BackingFile>>;

    /// Remove the file at `rel`.
    fn unlink(&self, rel: &Path) -> VfsResult<()>;

    /// Check if a file exists at `rel`.
    fn exists(&self, rel: &Path) -> bool;

    /// Capacity of the store.
    fn statfs(&self) -> VfsResult<StatFs>;
}

/// An open handle into a backing store.
///
/// All I/O is positional so a handle can be shared by concurrent readers
/// and writers without a cursor.
pub trait BackingFile: Send + Sync + Debug {
    /// Read into `buf` starting at `offset`. Returns the bytes read; 0 at EOF.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> VfsResult<usize>;

    /// Write `buf` at `offset`. Returns the bytes written.
    fn write_at(&self, buf: &[u8], offset: u64) -> VfsResult<usize>;

    /// Current size of the backing file.
    fn len(&self) -> VfsResult<u64>;

    /// Truncate or extend.
    fn set_len(&self, size: u64) -> VfsResult<()>;

    /// Flush data and metadata to stable storage.
    fn sync(&self) -> VfsResult<()>;

    /// Returns true if the backing file is empty.
    fn is_empty(&self) -> VfsResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Fill `buf` completely unless EOF is reached first.
    fn read_full_at(&self, mut buf: &mut [u8], mut offset: u64) -> VfsResult<usize> {
        let mut total = 0;
        while !buf.is_empty() {
            let n = self.read_at(buf, offset)?;
            if n == 0 {
                break;
            }
            total += n;
            offset += n as u64;
            buf = &mut buf[n..];
        }
        Ok(total)
    }

    /// Write all of `buf`, looping over short writes.
    fn write_all_at(&self, mut buf: &[u8], mut offset: u64) -> VfsResult<usize> {
        let mut total = 0;
        while !buf.is_empty() {
            let n = self.write_at(buf, offset)?;
            if n == 0 {
                break;
            }
            total += n;
            offset += n as u64;
            buf = &buf[n..];
        }
        Ok(total)
    }
}
