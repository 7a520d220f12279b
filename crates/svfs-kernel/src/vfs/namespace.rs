//! Namespace operations.
//!
//! [`Svfs`] is the mounted filesystem: the metadata index, the datastore
//! registry, and a cache of materialized inodes. Directory mutations
//! take the parent directory's lock, allocate or retire entries in the
//! index, and relay to the backing store where file data is involved.
//! Directories and symlinks live entirely in the index.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::io::{IoSlice, IoSliceMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

use super::backends::LocalBackend;
use super::error::{VfsError, VfsResult};
use super::index::{BackingRef, EntryInit, EntryState, MetadataEntry, MetadataIndex};
use super::inode::{ConnectionState, VirtualInode};
use super::mount::{Datastore, DatastoreInfo, DatastoreRegistry};
use super::ops::{BackingFile, BackingStore};
use super::persist;
use super::resolver::{MountResolver, ProcMounts};
use super::types::{
    CreateOptions, DirEntry, FileAttr, FileType, FsKind, Fsid, InodeFlags, Ino, LINK_TARGET_MAX,
    Owner, ROOT_INO, S_ISGID, SetAttr, StatFs, WriteFlags, check_name,
};
use crate::config::SvfsConfig;

/// Mount parameters.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Slots in a fresh index. Ignored when an image is loaded.
    pub capacity: u32,
    /// Whether new files defer datastore assignment by default.
    pub delay_alloc: bool,
    /// Kind used to place eagerly connected files.
    pub default_kind: FsKind,
    /// Owner of new inodes when the caller does not name one.
    pub owner: Owner,
    /// Index image loaded at mount and written by `sync_fs`.
    pub image: Option<PathBuf>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            capacity: 4096,
            delay_alloc: false,
            default_kind: FsKind::Any,
            owner: Owner::current(),
            image: None,
        }
    }
}

impl MountOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_delay_alloc(mut self, delay_alloc: bool) -> Self {
        self.delay_alloc = delay_alloc;
        self
    }

    pub fn with_default_kind(mut self, kind: FsKind) -> Self {
        self.default_kind = kind;
        self
    }

    pub fn with_owner(mut self, owner: Owner) -> Self {
        self.owner = owner;
        self
    }

    pub fn with_image(mut self, image: impl Into<PathBuf>) -> Self {
        self.image = Some(image.into());
        self
    }
}

/// What a new entry will be.
enum NewKind {
    File,
    Directory,
    Symlink(String),
}

/// A mounted stacking filesystem.
#[derive(Debug)]
pub struct Svfs {
    index: Arc<MetadataIndex>,
    registry: DatastoreRegistry,
    inodes: DashMap<Ino, Arc<VirtualInode>>,
    next_generation: Mutex<u32>,
    /// Unlinks interrupted before the last mount, finished once their
    /// datastore is registered.
    orphans: Mutex<Vec<Ino>>,
    /// Serializes renames so directory ancestry is stable while one runs.
    rename_lock: Mutex<()>,
    options: MountOptions,
}

impl Svfs {
    /// Mount: load the index image if one exists, otherwise start fresh.
    ///
    /// Entries left NEW by an interrupted allocation are rolled back.
    /// Entries left DELETING are finished as soon as their datastore is
    /// registered.
    pub fn mount(options: MountOptions, resolver: impl MountResolver + 'static) -> VfsResult<Self> {
        let index = match &options.image {
            Some(image) if image.exists() => persist::load(image)?,
            _ => MetadataIndex::new(options.capacity)?,
        };

        for ino in index.entries_in_state(EntryState::New) {
            index.release_new(ino)?;
            debug!(ino, "rolled back uncommitted entry");
        }
        let orphans = index.entries_in_state(EntryState::Deleting);
        if !orphans.is_empty() {
            info!(count = orphans.len(), "unlinks pending from previous mount");
        }

        let generation = index.max_generation().wrapping_add(1);
        info!(
            capacity = index.capacity(),
            free = index.free_count(),
            delay_alloc = options.delay_alloc,
            "mounted"
        );

        Ok(Self {
            index: Arc::new(index),
            registry: DatastoreRegistry::new(resolver),
            inodes: DashMap::new(),
            next_generation: Mutex::new(generation),
            orphans: Mutex::new(orphans),
            rename_lock: Mutex::new(()),
            options,
        })
    }

    /// Mount from a configuration file's contents and register every
    /// configured datastore.
    ///
    /// Verified datastores are checked against the host mount table;
    /// unverified ones are opened as plain directories.
    pub fn from_config(config: &SvfsConfig) -> VfsResult<Self> {
        let param = &config.parameter;
        let mut options = MountOptions::new()
            .with_capacity(param.capacity)
            .with_delay_alloc(param.delay_alloc)
            .with_default_kind(param.default_fstype);
        if let Some(image) = &param.backing_store {
            options = options.with_image(image);
        }

        let svfs = Self::mount(options, ProcMounts::new())?;
        for ds in &config.datastore {
            if ds.verify {
                svfs.register_datastore(ds.fstype, &ds.mountpoint)?;
            } else {
                let store = LocalBackend::open(&ds.mountpoint)?;
                let root = store.root().to_path_buf();
                svfs.register_store(ds.fstype, &root, Box::new(store))?;
            }
        }

        let pending = svfs.orphans.lock().len();
        if pending > 0 {
            warn!(pending, "unlinked entries whose datastore is not registered");
        }
        Ok(svfs)
    }

    /// The metadata index.
    pub fn index(&self) -> &MetadataIndex {
        &self.index
    }

    /// The datastore registry.
    pub fn registry(&self) -> &DatastoreRegistry {
        &self.registry
    }

    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    // ========================================================================
    // Datastores
    // ========================================================================

    /// Register the mount at `path` as a datastore of `kind`.
    pub fn register_datastore(&self, kind: FsKind, path: impl AsRef<Path>) -> VfsResult<DatastoreInfo> {
        let datastore = self.registry.register(kind, path)?;
        self.finish_orphans();
        Ok(info_of(&datastore))
    }

    /// Register an already-opened backing store.
    pub fn register_store(
        &self,
        kind: FsKind,
        path: impl AsRef<Path>,
        store: Box<dyn BackingStore>,
    ) -> VfsResult<DatastoreInfo> {
        let datastore = self.registry.register_store(kind, path, store)?;
        self.finish_orphans();
        Ok(info_of(&datastore))
    }

    /// Deregister a datastore. Inodes connected to it keep their open
    /// handles; new connections to it fail.
    pub fn deregister_datastore(&self, kind: FsKind, fsid: Fsid) -> VfsResult<()> {
        self.registry.deregister(kind, fsid)
    }

    /// Finish unlinks interrupted before this mount whose datastore is
    /// now available.
    fn finish_orphans(&self) {
        let mut orphans = self.orphans.lock();
        orphans.retain(|&ino| {
            let entry = match self.index.entry(ino) {
                Ok(entry) if entry.state == EntryState::Deleting => entry,
                _ => return false,
            };
            match self.unlink_backing(&entry) {
                Ok(()) => {
                    if let Err(e) = self.index.commit(ino) {
                        warn!(ino, error = %e, "reclaiming orphan failed");
                    }
                    info!(ino, "finished interrupted unlink");
                    false
                }
                Err(VfsError::NoDatastore(_)) => true,
                Err(e) => {
                    warn!(ino, error = %e, "interrupted unlink still failing");
                    true
                }
            }
        });
    }

    // ========================================================================
    // Inode cache
    // ========================================================================

    /// Get or materialize the inode for a live entry.
    ///
    /// The entry is read while the cache slot is held, and
    /// [`remove_entry`](Self::remove_entry) reclaims uncached entries under
    /// the same guard, so a reused inode number never gets the old file's
    /// inode.
    fn inode(&self, ino: Ino) -> VfsResult<Arc<VirtualInode>> {
        if let Some(inode) = self.inodes.get(&ino) {
            return Ok(Arc::clone(inode.value()));
        }
        match self.inodes.entry(ino) {
            Entry::Occupied(cached) => Ok(Arc::clone(cached.get())),
            Entry::Vacant(slot) => {
                let entry = self.index.live_entry(ino)?;
                let inode = Arc::new(VirtualInode::from_entry(Arc::clone(&self.index), &entry));
                slot.insert(Arc::clone(&inode));
                Ok(inode)
            }
        }
    }

    fn dir_inode(&self, ino: Ino) -> VfsResult<Arc<VirtualInode>> {
        let inode = self.inode(ino)?;
        if !inode.attr().is_dir() {
            return Err(VfsError::not_a_directory(format!("inode {ino}")));
        }
        Ok(inode)
    }

    /// Drop the cached inode. The host calls this when it evicts the
    /// inode; the last reference going away writes back attributes and
    /// releases the backing handle.
    pub fn forget(&self, ino: Ino) {
        if self.inodes.remove(&ino).is_some() {
            debug!(ino, "forgot inode");
        }
    }

    /// Connection state of a cached inode, `None` if not in memory.
    pub fn connection_state(&self, ino: Ino) -> Option<ConnectionState> {
        self.inodes.get(&ino).map(|i| i.connection_state())
    }

    fn generation(&self) -> u32 {
        let mut next = self.next_generation.lock();
        let generation = *next;
        *next = next.wrapping_add(1);
        generation
    }

    // ========================================================================
    // Directory operations
    // ========================================================================

    /// Create a regular file.
    ///
    /// Without delayed allocation the file is placed on a datastore of
    /// the mount's default kind and its backing file is created now;
    /// otherwise only the index entry is written.
    pub fn create(&self, parent: Ino, name: &str, opts: &CreateOptions) -> VfsResult<FileAttr> {
        self.make_entry(parent, name, opts, NewKind::File)
    }

    /// Create a directory.
    pub fn mkdir(&self, parent: Ino, name: &str, opts: &CreateOptions) -> VfsResult<FileAttr> {
        self.make_entry(parent, name, opts, NewKind::Directory)
    }

    /// Create a symlink whose target is stored in the index entry.
    pub fn symlink(&self, parent: Ino, name: &str, target: &str) -> VfsResult<FileAttr> {
        if target.is_empty() {
            return Err(VfsError::invalid_path("empty symlink target"));
        }
        if target.len() > LINK_TARGET_MAX {
            return Err(VfsError::TargetTooLong);
        }
        self.make_entry(
            parent,
            name,
            &CreateOptions::new(),
            NewKind::Symlink(target.to_string()),
        )
    }

    fn make_entry(
        &self,
        parent: Ino,
        name: &str,
        opts: &CreateOptions,
        kind: NewKind,
    ) -> VfsResult<FileAttr> {
        check_name(name)?;
        let dir = self.dir_inode(parent)?;
        let _guard = dir.lock_dir();

        if self.index.lookup_child(parent, name).is_some() {
            return Err(VfsError::already_exists(name));
        }

        let ino = self.index.allocate_free_entry()?;
        match self.init_entry(&dir, ino, name, opts, kind) {
            Ok(attr) => {
                if attr.is_dir() {
                    dir.update_attr(|a| a.nlink += 1);
                }
                touch(&dir);
                dir.flush()?;
                debug!(parent, name, ino, kind = ?attr.kind, "created");
                Ok(attr)
            }
            Err(e) => {
                if let Err(rollback) = self.index.release_new(ino) {
                    warn!(ino, error = %rollback, "rollback of new entry failed");
                }
                Err(e)
            }
        }
    }

    /// Fill and commit a NEW entry. On error the caller releases it.
    fn init_entry(
        &self,
        dir: &VirtualInode,
        ino: Ino,
        name: &str,
        opts: &CreateOptions,
        kind: NewKind,
    ) -> VfsResult<FileAttr> {
        let parent_attr = dir.attr();
        let owner = opts.owner.unwrap_or(self.options.owner);
        let delay_alloc = opts
            .delay_alloc
            .unwrap_or(parent_attr.delay_alloc() || self.options.delay_alloc);

        let (mut attr, link_target) = match kind {
            NewKind::File => (FileAttr::file(ino, opts.perm.unwrap_or(0o644) & 0o7777), None),
            NewKind::Directory => (
                FileAttr::directory(ino, opts.perm.unwrap_or(0o755) & 0o7777),
                None,
            ),
            NewKind::Symlink(target) => (FileAttr::symlink(ino, target.len() as u64), Some(target)),
        };
        attr.generation = self.generation();
        attr.uid = owner.uid;
        attr.gid = owner.gid;
        if parent_attr.perm & S_ISGID != 0 {
            attr.gid = parent_attr.gid;
            if attr.is_dir() {
                attr.perm |= S_ISGID;
            }
        }
        if !attr.is_symlink() {
            attr.flags.set(InodeFlags::DELAY_ALLOC, delay_alloc);
        }

        let eager = attr.is_file() && !delay_alloc;
        let placement = if eager {
            let datastore = self
                .registry
                .select_kind(self.options.default_kind)
                .ok_or_else(|| {
                    VfsError::no_datastore(format!("no {} datastore", self.options.default_kind))
                })?;
            Some(datastore)
        } else {
            None
        };

        self.index.update_entry(
            ino,
            EntryInit {
                parent: dir.ino(),
                name: name.to_string(),
                attr: attr.clone(),
                link_target,
                backing: placement.as_ref().map(|d| BackingRef {
                    kind: d.kind(),
                    fsid: d.fsid(),
                }),
            },
        )?;

        if let Some(datastore) = placement {
            let entry = self.index.entry(ino)?;
            let fragment = entry.backing_fragment();
            let handle = datastore.with_store(|s| s.create(Path::new(&fragment)))?;
            if let Err(e) = self.index.commit(ino) {
                drop(handle);
                if let Err(cleanup) = datastore.with_store(|s| s.unlink(Path::new(&fragment))) {
                    warn!(ino, error = %cleanup, "failed to remove unplaced backing file");
                }
                return Err(e);
            }
            let inode = VirtualInode::connected(Arc::clone(&self.index), attr.clone(), handle);
            self.inodes.insert(ino, Arc::new(inode));
            debug!(ino, path = %datastore.path().display(), "placed on datastore");
        } else {
            self.index.commit(ino)?;
        }
        Ok(attr)
    }

    /// Look up `name` in `parent`.
    ///
    /// Never connects. A cached inode whose relay failed is discarded so
    /// the returned inode starts over.
    pub fn lookup(&self, parent: Ino, name: &str) -> VfsResult<FileAttr> {
        check_name(name)?;
        self.dir_inode(parent)?;
        let ino = self
            .index
            .lookup_child(parent, name)
            .ok_or_else(|| VfsError::not_found(name))?;

        self.inodes
            .remove_if(&ino, |_, inode| inode.connection_state() == ConnectionState::Failed);
        Ok(self.inode(ino)?.attr())
    }

    /// Remove a file or symlink.
    ///
    /// The entry is marked DELETING first, so it leaves the namespace
    /// before the backing file does. The backing file is then removed;
    /// if that fails the entry goes back to VALID and the error is
    /// returned. The slot is reclaimed once no inode references it.
    pub fn unlink(&self, parent: Ino, name: &str) -> VfsResult<()> {
        check_name(name)?;
        let dir = self.dir_inode(parent)?;
        let _guard = dir.lock_dir();

        let ino = self
            .index
            .lookup_child(parent, name)
            .ok_or_else(|| VfsError::not_found(name))?;
        if self.index.live_entry(ino)?.attr.is_dir() {
            return Err(VfsError::is_a_directory(name));
        }

        self.remove_entry(parent, ino, name)?;
        touch(&dir);
        dir.flush()
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, parent: Ino, name: &str) -> VfsResult<()> {
        check_name(name)?;
        let dir = self.dir_inode(parent)?;
        let _guard = dir.lock_dir();

        let ino = self
            .index
            .lookup_child(parent, name)
            .ok_or_else(|| VfsError::not_found(name))?;
        let child = self.dir_inode(ino)?;
        {
            let _child_guard = child.lock_dir();
            if !self.index.is_empty_dir(ino) {
                return Err(VfsError::directory_not_empty(name));
            }
            self.remove_entry(parent, ino, name)?;
        }
        drop(child);

        dir.update_attr(|a| a.nlink = a.nlink.saturating_sub(1));
        touch(&dir);
        dir.flush()
    }

    /// Retire `ino` (named `name` under `parent`). Caller holds the
    /// parent's directory lock.
    fn remove_entry(&self, parent: Ino, ino: Ino, name: &str) -> VfsResult<()> {
        self.index.delete(parent, ino, name)?;
        let entry = self.index.entry(ino)?;

        if let Err(e) = self.unlink_backing(&entry) {
            warn!(ino, name, error = %e, "backing unlink failed, entry restored");
            self.index.undelete(ino)?;
            return Err(e);
        }

        match self.inodes.entry(ino) {
            Entry::Occupied(cached) => {
                let inode = cached.remove();
                inode.update_attr(|a| {
                    a.nlink = 0;
                    a.ctime = SystemTime::now();
                });
                // Reclaimed when the last reference drops.
                drop(inode);
            }
            Entry::Vacant(_slot) => {
                self.index.commit(ino)?;
            }
        }
        debug!(parent, name, ino, "removed");
        Ok(())
    }

    /// Remove the backing file of `entry`, if it has one. A backing file
    /// that is already gone counts as removed.
    fn unlink_backing(&self, entry: &MetadataEntry) -> VfsResult<()> {
        let Some(backing) = entry.backing else {
            return Ok(());
        };
        let datastore = self.registry.select(backing.kind, backing.fsid).ok_or_else(|| {
            VfsError::no_datastore(format!("{} fsid {:#x}", backing.kind, backing.fsid))
        })?;
        let fragment = entry.backing_fragment();
        match datastore.with_store(|s| s.unlink(Path::new(&fragment))) {
            Err(e) if e.is_not_found() => {
                debug!(ino = entry.attr.ino, "backing file already gone");
                Ok(())
            }
            other => other,
        }
    }

    /// Move `old_name` in `old_parent` to `new_name` in `new_parent`.
    ///
    /// Only the index changes: backing files are named after the inode
    /// number. An existing target is replaced if the kinds are
    /// compatible; a directory target must be empty.
    pub fn rename(
        &self,
        old_parent: Ino,
        old_name: &str,
        new_parent: Ino,
        new_name: &str,
    ) -> VfsResult<()> {
        check_name(old_name)?;
        check_name(new_name)?;
        let _rename = self.rename_lock.lock();

        let old_dir = self.dir_inode(old_parent)?;
        let new_dir = self.dir_inode(new_parent)?;

        // Ancestor first, otherwise lower inode first.
        let (first, second) = if old_parent == new_parent {
            (&old_dir, None)
        } else if self.index.is_descendant(new_parent, old_parent)? {
            (&old_dir, Some(&new_dir))
        } else if self.index.is_descendant(old_parent, new_parent)? || new_parent < old_parent {
            (&new_dir, Some(&old_dir))
        } else {
            (&old_dir, Some(&new_dir))
        };
        let _first_guard = first.lock_dir();
        let _second_guard = second.map(|d| d.lock_dir());

        let src = self
            .index
            .lookup_child(old_parent, old_name)
            .ok_or_else(|| VfsError::not_found(old_name))?;
        let src_is_dir = self.index.live_entry(src)?.attr.is_dir();

        if src_is_dir && self.index.is_descendant(new_parent, src)? {
            return Err(VfsError::invalid_path(format!(
                "cannot move {old_name} beneath itself"
            )));
        }

        if let Some(target) = self.index.lookup_child(new_parent, new_name) {
            if target == src {
                return Ok(());
            }
            let target_is_dir = self.index.live_entry(target)?.attr.is_dir();
            match (src_is_dir, target_is_dir) {
                (true, false) => return Err(VfsError::not_a_directory(new_name)),
                (false, true) => return Err(VfsError::is_a_directory(new_name)),
                (true, true) => {
                    // The source's own parent lies under the target.
                    if self.index.is_descendant(old_parent, target)? {
                        return Err(VfsError::directory_not_empty(new_name));
                    }
                    let target_dir = self.dir_inode(target)?;
                    {
                        // Held like rmdir so no create lands in the target.
                        let _target_guard = target_dir.lock_dir();
                        if !self.index.is_empty_dir(target) {
                            return Err(VfsError::directory_not_empty(new_name));
                        }
                        self.remove_entry(new_parent, target, new_name)?;
                    }
                    drop(target_dir);
                    new_dir.update_attr(|a| a.nlink = a.nlink.saturating_sub(1));
                }
                (false, false) => self.remove_entry(new_parent, target, new_name)?,
            }
        }

        self.index.relink(src, new_parent, new_name)?;
        if let Some(inode) = self.inodes.get(&src) {
            inode.update_attr(|a| a.ctime = SystemTime::now());
        }
        if src_is_dir && old_parent != new_parent {
            old_dir.update_attr(|a| a.nlink = a.nlink.saturating_sub(1));
            new_dir.update_attr(|a| a.nlink += 1);
        }
        touch(&old_dir);
        touch(&new_dir);
        old_dir.flush()?;
        new_dir.flush()?;
        debug!(old_parent, old_name, new_parent, new_name, ino = src, "renamed");
        Ok(())
    }

    /// List up to `limit` children of `dir` after `cookie`.
    ///
    /// Start with [`ROOT_INO`]; continue with the `ino` of the last entry
    /// returned. Entries come back in slot order.
    pub fn readdir(&self, dir: Ino, cookie: Ino, limit: usize) -> VfsResult<Vec<DirEntry>> {
        self.dir_inode(dir)?;
        let mut entries = Vec::new();
        let mut cursor = cookie;
        while entries.len() < limit {
            let Some(child) = self.index.next_child(dir, cursor) else {
                break;
            };
            cursor = child;
            // The child may have gone between the scan and this read.
            if let Ok(entry) = self.index.live_entry(child) {
                entries.push(DirEntry::new(child, entry.name, entry.attr.kind));
            }
        }
        Ok(entries)
    }

    /// Target of a symlink.
    pub fn readlink(&self, ino: Ino) -> VfsResult<String> {
        let entry = self.index.live_entry(ino)?;
        match (entry.attr.kind, entry.link_target) {
            (FileType::Symlink, Some(target)) => Ok(target),
            _ => Err(VfsError::NotASymlink(format!("inode {ino}"))),
        }
    }

    /// Attributes of `ino`.
    pub fn getattr(&self, ino: Ino) -> VfsResult<FileAttr> {
        Ok(self.inode(ino)?.attr())
    }

    /// Change attributes. A size change is relayed as a truncate; a
    /// delayed-allocation file truncated to zero stays unplaced.
    pub fn setattr(&self, ino: Ino, set: &SetAttr) -> VfsResult<FileAttr> {
        let inode = self.inode(ino)?;

        if let Some(size) = set.size {
            let attr = inode.attr();
            if attr.is_dir() {
                return Err(VfsError::is_a_directory(format!("inode {ino}")));
            }
            if !attr.is_file() {
                return Err(VfsError::invalid_path(format!("inode {ino} cannot be truncated")));
            }
            if size == 0 && inode.connection_state() == ConnectionState::DelayAlloc {
                inode.update_attr(|a| a.size = 0);
            } else {
                inode.truncate(&self.registry, size)?;
            }
        }

        let now = SystemTime::now();
        inode.update_attr(|a| {
            if let Some(perm) = set.perm {
                a.perm = perm & 0o7777;
            }
            if let Some(uid) = set.uid {
                a.uid = uid;
            }
            if let Some(gid) = set.gid {
                a.gid = gid;
            }
            if let Some(atime) = set.atime {
                a.atime = atime;
            }
            if let Some(mtime) = set.mtime {
                a.mtime = mtime;
            }
            a.ctime = now;
        });
        inode.flush()?;
        Ok(inode.attr())
    }

    /// Resolve an absolute virtual path such as `/dir1/f1`.
    pub fn resolve(&self, path: &str) -> VfsResult<Ino> {
        let mut ino = ROOT_INO;
        for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            let entry = self.index.live_entry(ino)?;
            if !entry.attr.is_dir() {
                return Err(VfsError::not_a_directory(path));
            }
            ino = if component == ".." {
                entry.parent
            } else {
                self.index
                    .lookup_child(ino, component)
                    .ok_or_else(|| VfsError::not_found(path))?
            };
        }
        Ok(ino)
    }

    /// Virtual path of `ino` in index form (`/.dir1.f1`).
    pub fn reconstruct_path(&self, ino: Ino) -> VfsResult<String> {
        self.index.reconstruct_path(ino)
    }

    // ========================================================================
    // File operations
    // ========================================================================

    /// Read up to `size` bytes at `offset`.
    pub fn read(&self, ino: Ino, offset: u64, size: usize) -> VfsResult<Vec<u8>> {
        let mut buf = vec![0u8; size];
        let n = self.read_vectored(ino, offset, &mut [IoSliceMut::new(&mut buf)])?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Scatter read at `offset`.
    pub fn read_vectored(
        &self,
        ino: Ino,
        offset: u64,
        bufs: &mut [IoSliceMut<'_>],
    ) -> VfsResult<usize> {
        self.inode(ino)?.read_vectored(&self.registry, offset, bufs)
    }

    /// Write `data` at `offset`.
    pub fn write(&self, ino: Ino, offset: u64, data: &[u8], flags: WriteFlags) -> VfsResult<usize> {
        self.write_vectored(ino, offset, &[IoSlice::new(data)], flags)
    }

    /// Gather write at `offset`.
    pub fn write_vectored(
        &self,
        ino: Ino,
        offset: u64,
        bufs: &[IoSlice<'_>],
        flags: WriteFlags,
    ) -> VfsResult<usize> {
        self.inode(ino)?
            .write_vectored(&self.registry, offset, bufs, flags)
    }

    /// Set the size of a file.
    pub fn truncate(&self, ino: Ino, size: u64) -> VfsResult<FileAttr> {
        self.setattr(ino, &SetAttr::new().with_size(size))
    }

    /// Flush attributes of `ino` if dirty, and its backing file if
    /// connected.
    pub fn fsync(&self, ino: Ino) -> VfsResult<()> {
        let inode = self.inode(ino)?;
        inode.flush()?;
        inode.sync_backing()
    }

    /// Lend the backing handle of `ino` to `f`, connecting first.
    pub fn with_backing<R>(
        &self,
        ino: Ino,
        f: impl FnOnce(&dyn BackingFile) -> VfsResult<R>,
    ) -> VfsResult<R> {
        self.inode(ino)?.with_backing(&self.registry, f)
    }

    // ========================================================================
    // Filesystem
    // ========================================================================

    /// Capacity summed over every datastore, with inode counts from the
    /// index.
    pub fn statfs(&self) -> StatFs {
        let mut stat = self.registry.aggregate_statfs();
        stat.files = u64::from(self.index.capacity());
        stat.ffree = u64::from(self.index.free_count());
        stat
    }

    /// Write back every dirty inode and entry, then dump the index if an
    /// image is configured.
    pub fn sync_fs(&self) -> VfsResult<()> {
        let cached: Vec<_> = self.inodes.iter().map(|i| Arc::clone(i.value())).collect();
        for inode in cached {
            inode.flush()?;
            inode.sync_backing()?;
        }
        for ino in self.index.entries_in_state(EntryState::Dirty) {
            self.index.commit(ino)?;
        }
        if let Some(image) = &self.options.image {
            persist::dump(&self.index, image)?;
        }
        Ok(())
    }

    /// Sync, drop every cached inode and deregister all datastores.
    pub fn unmount(self) -> VfsResult<()> {
        self.sync_fs()?;
        self.inodes.clear();
        self.registry.deregister_all();
        info!("unmounted");
        Ok(())
    }
}

fn info_of(datastore: &Datastore) -> DatastoreInfo {
    DatastoreInfo {
        kind: datastore.kind(),
        fsid: datastore.fsid(),
        path: datastore.path().to_path_buf(),
    }
}

fn touch(dir: &VirtualInode) {
    dir.update_attr(|a| {
        let now = SystemTime::now();
        a.mtime = now;
        a.ctime = now;
    });
}
