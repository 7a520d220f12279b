//! In-memory virtual inodes.
//!
//! A [`VirtualInode`] is materialized from a live metadata entry on a
//! cache miss and lives as long as something references it. It carries
//! the working copy of the attributes and the connection to the backing
//! file. Dropping the last reference writes dirty attributes back,
//! releases the backing handle, and finishes reclaiming the slot if the
//! entry was unlinked.

use parking_lot::{Mutex, MutexGuard, RwLock};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

use super::error::VfsResult;
use super::index::{EntryState, MetadataEntry, MetadataIndex};
use super::ops::BackingFile;
use super::types::{FileAttr, Ino};

/// Observable connection state of an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No backing handle yet; the datastore is recorded in the entry.
    Disconnected,
    /// No datastore chosen yet; one is picked on first data access.
    DelayAlloc,
    /// Holds an open backing handle.
    Connected,
    /// A relay attempt failed; every I/O fails until the inode is
    /// looked up again.
    Failed,
}

pub(crate) enum Connection {
    Disconnected,
    DelayAlloc,
    Connected(Box<dyn BackingFile>),
    Failed { reason: String },
}

impl Connection {
    pub(crate) fn state(&self) -> ConnectionState {
        match self {
            Connection::Disconnected => ConnectionState::Disconnected,
            Connection::DelayAlloc => ConnectionState::DelayAlloc,
            Connection::Connected(_) => ConnectionState::Connected,
            Connection::Failed { .. } => ConnectionState::Failed,
        }
    }
}

/// A virtual inode held in memory.
pub struct VirtualInode {
    ino: Ino,
    attr: Mutex<FileAttr>,
    dirty: AtomicBool,
    /// Serializes namespace changes inside this directory.
    dir_lock: Mutex<()>,
    pub(crate) connection: RwLock<Connection>,
    pub(crate) index: Arc<MetadataIndex>,
}

impl fmt::Debug for VirtualInode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualInode")
            .field("ino", &self.ino)
            .field("state", &self.connection_state())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

impl VirtualInode {
    /// Materialize an inode from its entry.
    pub fn from_entry(index: Arc<MetadataIndex>, entry: &MetadataEntry) -> Self {
        let connection = if entry.attr.is_file() && entry.backing.is_none() {
            Connection::DelayAlloc
        } else {
            Connection::Disconnected
        };
        Self::with_connection(index, entry.attr.clone(), connection)
    }

    /// Build an inode that already holds its backing handle.
    pub(crate) fn connected(
        index: Arc<MetadataIndex>,
        attr: FileAttr,
        handle: Box<dyn BackingFile>,
    ) -> Self {
        Self::with_connection(index, attr, Connection::Connected(handle))
    }

    fn with_connection(index: Arc<MetadataIndex>, attr: FileAttr, connection: Connection) -> Self {
        Self {
            ino: attr.ino,
            attr: Mutex::new(attr),
            dirty: AtomicBool::new(false),
            dir_lock: Mutex::new(()),
            connection: RwLock::new(connection),
            index,
        }
    }

    pub fn ino(&self) -> Ino {
        self.ino
    }

    /// Copy of the current attributes.
    pub fn attr(&self) -> FileAttr {
        self.attr.lock().clone()
    }

    /// Change attributes in place and mark the inode dirty.
    pub fn update_attr<R>(&self, f: impl FnOnce(&mut FileAttr) -> R) -> R {
        let mut attr = self.attr.lock();
        let out = f(&mut attr);
        self.dirty.store(true, Ordering::Release);
        out
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.read().state()
    }

    /// Reason recorded by the failed relay attempt, if any.
    pub fn failure(&self) -> Option<String> {
        match &*self.connection.read() {
            Connection::Failed { reason } => Some(reason.clone()),
            _ => None,
        }
    }

    /// Take the directory mutation lock.
    pub(crate) fn lock_dir(&self) -> MutexGuard<'_, ()> {
        self.dir_lock.lock()
    }

    /// Push the working attributes into the index entry without
    /// committing it.
    pub(crate) fn stage(&self) -> VfsResult<()> {
        let attr = self.attr.lock().clone();
        self.index.mark_dirty(self.ino, &attr)
    }

    /// Write dirty attributes back and commit the entry.
    ///
    /// A DELETING entry only receives the attributes; it is committed
    /// (and so reclaimed) when the inode is dropped.
    pub fn flush(&self) -> VfsResult<()> {
        if self.dirty.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.stage() {
                self.dirty.store(true, Ordering::Release);
                return Err(e);
            }
        }
        match self.index.state(self.ino)? {
            EntryState::Dirty | EntryState::New => {
                self.index.commit(self.ino)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Drop the backing handle, if any.
    ///
    /// A failed inode stays failed.
    pub fn disconnect(&self) {
        let mut conn = self.connection.write();
        if matches!(*conn, Connection::Connected(_)) {
            *conn = Connection::Disconnected;
            debug!(ino = self.ino, "disconnected");
        }
    }
}

impl Drop for VirtualInode {
    fn drop(&mut self) {
        if self.dirty.load(Ordering::Acquire) {
            let attr = self.attr.get_mut().clone();
            if let Err(e) = self.index.mark_dirty(self.ino, &attr) {
                warn!(ino = self.ino, error = %e, "attribute write-back failed");
            }
        }

        let conn = std::mem::replace(self.connection.get_mut(), Connection::Disconnected);
        if matches!(conn, Connection::Connected(_)) {
            debug!(ino = self.ino, "released backing handle");
        }
        drop(conn);

        match self.index.state(self.ino) {
            Ok(EntryState::Deleting | EntryState::Dirty) => {
                if let Err(e) = self.index.commit(self.ino) {
                    warn!(ino = self.ino, error = %e, "commit on evict failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(ino = self.ino, error = %e, "evicted inode has no entry"),
        }
    }
}
