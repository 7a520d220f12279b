//! Connection state machine and I/O relay.
//!
//! File inodes bind to their backing file lazily. The first data access
//! on a DISCONNECTED inode opens the file on the datastore recorded in
//! its entry; on a DELAY_ALLOC inode it first picks any datastore,
//! records it as the file's permanent home and creates the file. A
//! failure leaves the inode FAILED, and it stays that way: the caller has
//! to look the name up again to retry.
//!
//! Once connected, reads and writes go straight to the backing handle at
//! the caller's offset.

use std::io::{IoSlice, IoSliceMut};
use std::path::Path;
use std::time::SystemTime;
use tracing::{debug, warn};

use super::error::{VfsError, VfsResult};
use super::index::{BackingRef, backing_fragment};
use super::inode::{Connection, VirtualInode};
use super::mount::DatastoreRegistry;
use super::ops::BackingFile;
use super::types::{FsKind, InodeFlags, WriteFlags};

impl VirtualInode {
    /// Bind to the backing file if not already bound.
    ///
    /// Only one caller performs the transition; the others wait on the
    /// connection lock and see its outcome.
    pub fn ensure_connected(&self, registry: &DatastoreRegistry) -> VfsResult<()> {
        {
            let conn = self.connection.read();
            match &*conn {
                Connection::Connected(_) => return Ok(()),
                Connection::Failed { reason } => return Err(self.failed_error(reason)),
                Connection::Disconnected | Connection::DelayAlloc => {}
            }
        }

        let attr = self.attr();
        if attr.is_dir() {
            return Err(VfsError::is_a_directory(format!("inode {}", self.ino())));
        }
        if !attr.is_file() {
            return Err(VfsError::invalid_path(format!(
                "inode {} has no data to relay",
                self.ino()
            )));
        }

        let mut conn = self.connection.write();
        let result = match &*conn {
            Connection::Connected(_) => return Ok(()),
            Connection::Failed { reason } => return Err(self.failed_error(reason)),
            Connection::Disconnected => self.open_recorded(registry),
            Connection::DelayAlloc => self.allocate_and_create(registry),
        };

        match result {
            Ok(handle) => {
                *conn = Connection::Connected(handle);
                debug!(ino = self.ino(), "connected");
                Ok(())
            }
            Err(e) => {
                warn!(ino = self.ino(), error = %e, "relay failed");
                *conn = Connection::Failed {
                    reason: e.to_string(),
                };
                Err(e)
            }
        }
    }

    fn failed_error(&self, reason: &str) -> VfsError {
        VfsError::ConnectionFailed {
            ino: self.ino(),
            reason: reason.to_string(),
        }
    }

    /// Open the backing file on the datastore recorded in the entry.
    fn open_recorded(&self, registry: &DatastoreRegistry) -> VfsResult<Box<dyn BackingFile>> {
        let entry = self.index.entry(self.ino())?;
        let backing = entry.backing.ok_or_else(|| {
            VfsError::corrupt(format!("inode {} has no datastore recorded", self.ino()))
        })?;
        let datastore = registry.select(backing.kind, backing.fsid).ok_or_else(|| {
            VfsError::no_datastore(format!("{} fsid {:#x}", backing.kind, backing.fsid))
        })?;

        let fragment = entry.backing_fragment();
        datastore.with_store(|store| store.open(Path::new(&fragment), false))
    }

    /// Pick a datastore for a delayed-allocation file, record it, and
    /// create the backing file.
    fn allocate_and_create(&self, registry: &DatastoreRegistry) -> VfsResult<Box<dyn BackingFile>> {
        let datastore = registry
            .select(FsKind::Any, 0)
            .ok_or_else(|| VfsError::no_datastore("no datastore registered"))?;

        let fragment = backing_fragment(self.ino());
        let handle = datastore.with_store(|store| store.create(Path::new(&fragment)))?;

        let recorded = self
            .index
            .assign_backing(
                self.ino(),
                BackingRef {
                    kind: datastore.kind(),
                    fsid: datastore.fsid(),
                },
            )
            .and_then(|()| {
                self.update_attr(|a| a.flags.remove(InodeFlags::DELAY_ALLOC));
                self.flush()
            });
        if let Err(e) = recorded {
            drop(handle);
            self.update_attr(|a| a.flags.insert(InodeFlags::DELAY_ALLOC));
            if let Err(undo) = self.index.clear_backing(self.ino()) {
                warn!(ino = self.ino(), error = %undo, "failed to clear datastore record");
            }
            if let Err(cleanup) = datastore.with_store(|store| store.unlink(Path::new(&fragment))) {
                warn!(ino = self.ino(), error = %cleanup, "failed to remove unplaced backing file");
            }
            return Err(e);
        }

        debug!(
            ino = self.ino(),
            kind = %datastore.kind(),
            fsid = datastore.fsid(),
            "delayed allocation placed"
        );
        Ok(handle)
    }

    /// Run `f` with the connected backing handle, connecting first.
    pub fn with_backing<R>(
        &self,
        registry: &DatastoreRegistry,
        f: impl FnOnce(&dyn BackingFile) -> VfsResult<R>,
    ) -> VfsResult<R> {
        self.ensure_connected(registry)?;
        let conn = self.connection.read();
        match &*conn {
            Connection::Connected(handle) => f(handle.as_ref()),
            Connection::Failed { reason } => Err(self.failed_error(reason)),
            Connection::Disconnected | Connection::DelayAlloc => Err(VfsError::stale(format!(
                "inode {} disconnected during I/O",
                self.ino()
            ))),
        }
    }

    /// Scatter read starting at `offset`. Stops at end of file.
    pub fn read_vectored(
        &self,
        registry: &DatastoreRegistry,
        offset: u64,
        bufs: &mut [IoSliceMut<'_>],
    ) -> VfsResult<usize> {
        let total = self.with_backing(registry, |handle| {
            let mut total = 0usize;
            let mut pos = offset;
            for buf in bufs.iter_mut() {
                let n = handle.read_full_at(buf, pos)?;
                total += n;
                pos += n as u64;
                if n < buf.len() {
                    break;
                }
            }
            Ok(total)
        })?;

        self.update_attr(|a| a.atime = SystemTime::now());
        Ok(total)
    }

    /// Gather write starting at `offset`, or at the backing file's end
    /// for appends.
    ///
    /// Growing the file past its recorded size updates the index entry
    /// right away.
    pub fn write_vectored(
        &self,
        registry: &DatastoreRegistry,
        offset: u64,
        bufs: &[IoSlice<'_>],
        flags: WriteFlags,
    ) -> VfsResult<usize> {
        let (start, written) = self.with_backing(registry, |handle| {
            let start = if flags.append { handle.len()? } else { offset };
            let mut pos = start;
            for buf in bufs {
                let n = handle.write_all_at(buf, pos)?;
                pos += n as u64;
                if n < buf.len() {
                    break;
                }
            }
            if flags.sync {
                handle.sync()?;
            }
            Ok((start, (pos - start) as usize))
        })?;

        let end = start + written as u64;
        let grew = self.update_attr(|a| {
            let now = SystemTime::now();
            a.mtime = now;
            a.ctime = now;
            if end > a.size {
                a.size = end;
                true
            } else {
                false
            }
        });
        if grew {
            self.stage()?;
        }
        if flags.sync {
            self.flush()?;
        }
        Ok(written)
    }

    /// Set the file size, relaying to the backing file.
    pub fn truncate(&self, registry: &DatastoreRegistry, size: u64) -> VfsResult<()> {
        self.with_backing(registry, |handle| handle.set_len(size))?;
        self.update_attr(|a| {
            let now = SystemTime::now();
            a.size = size;
            a.mtime = now;
            a.ctime = now;
        });
        self.stage()
    }

    /// Flush the backing file if connected. Never connects.
    pub fn sync_backing(&self) -> VfsResult<()> {
        match &*self.connection.read() {
            Connection::Connected(handle) => handle.sync(),
            _ => Ok(()),
        }
    }
}
