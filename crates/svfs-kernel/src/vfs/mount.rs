//! Datastore registry.
//!
//! Tracks the backing-store mounts available for relay and picks one
//! when a virtual file needs a home. Datastores are keyed by
//! `(kind, fsid)`, where the fsid is a hash of the mount path, so the
//! same mount registered at different times keeps its identity.

use parking_lot::RwLock;
use rand::Rng;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, info, warn};

use super::error::{VfsError, VfsResult};
use super::ops::BackingStore;
use super::resolver::MountResolver;
use super::types::{FsKind, Fsid, StatFs};

/// ELF-style rolling hash.
pub fn elf_hash(bytes: &[u8]) -> u64 {
    let mut h: u32 = 0;
    for &b in bytes {
        h = (h << 4).wrapping_add(u32::from(b));
        let g = h & 0xF000_0000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }
    u64::from(h)
}

/// Normalize a mount path lexically: `.` components, repeated and
/// trailing slashes dropped, `/` for the empty path.
///
/// Symlinks and `..` are left alone; resolvers that see the host
/// filesystem canonicalize first (see [`MountResolver::canonical`]).
pub fn normalize_mount_path(path: &Path) -> PathBuf {
    let normalized: PathBuf = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    if normalized.as_os_str().is_empty() {
        PathBuf::from("/")
    } else {
        normalized
    }
}

/// Identity of the mount at `path`.
pub fn fsid_of(path: &Path) -> Fsid {
    let path = normalize_mount_path(path);
    elf_hash(path.as_os_str().as_encoded_bytes())
}

/// One registered backing-store mount.
///
/// The registry owns the root handle for as long as the datastore is
/// registered. [`Datastore::release`] drops it exactly once; after that
/// the datastore is FREE and every relay through it fails.
pub struct Datastore {
    kind: FsKind,
    fsid: Fsid,
    path: PathBuf,
    root: RwLock<Option<Box<dyn BackingStore>>>,
}

impl fmt::Debug for Datastore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datastore")
            .field("kind", &self.kind)
            .field("fsid", &self.fsid)
            .field("path", &self.path)
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl Datastore {
    fn new(kind: FsKind, path: PathBuf, root: Box<dyn BackingStore>) -> Self {
        Self {
            kind,
            fsid: fsid_of(&path),
            path,
            root: RwLock::new(Some(root)),
        }
    }

    pub fn kind(&self) -> FsKind {
        self.kind
    }

    pub fn fsid(&self) -> Fsid {
        self.fsid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True until the root handle has been released.
    pub fn is_valid(&self) -> bool {
        self.root.read().is_some()
    }

    /// Run `f` against the backing store.
    pub fn with_store<R>(&self, f: impl FnOnce(&dyn BackingStore) -> VfsResult<R>) -> VfsResult<R> {
        let root = self.root.read();
        match root.as_deref() {
            Some(store) => f(store),
            None => Err(VfsError::no_datastore(format!(
                "{} ({}) was deregistered",
                self.path.display(),
                self.kind
            ))),
        }
    }

    /// Drop the root handle. Returns false if it was already released.
    fn release(&self) -> bool {
        self.root.write().take().is_some()
    }
}

/// Summary of a registered datastore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatastoreInfo {
    pub kind: FsKind,
    pub fsid: Fsid,
    pub path: PathBuf,
}

/// The set of registered datastores.
///
/// Selection takes the read lock; register and deregister take the
/// write lock, so a selector never sees a half-updated set.
pub struct DatastoreRegistry {
    stores: RwLock<Vec<Arc<Datastore>>>,
    live: AtomicUsize,
    selections: AtomicU64,
    resolver: Box<dyn MountResolver>,
}

impl fmt::Debug for DatastoreRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatastoreRegistry")
            .field("live", &self.live_count())
            .field("resolver", &self.resolver)
            .finish()
    }
}

impl DatastoreRegistry {
    /// Create an empty registry resolving mounts through `resolver`.
    pub fn new(resolver: impl MountResolver + 'static) -> Self {
        Self::with_resolver(Box::new(resolver))
    }

    pub fn with_resolver(resolver: Box<dyn MountResolver>) -> Self {
        Self {
            stores: RwLock::new(Vec::new()),
            live: AtomicUsize::new(0),
            selections: AtomicU64::new(0),
            resolver,
        }
    }

    /// Resolve `path` to a live mount of `kind` and register it.
    ///
    /// Fails if the path is not a mount of that kind, or if a datastore
    /// with the same `(kind, fsid)` is already registered. On failure any
    /// acquired root handle is released before returning.
    pub fn register(&self, kind: FsKind, path: impl AsRef<Path>) -> VfsResult<Arc<Datastore>> {
        if kind.is_wildcard() {
            return Err(VfsError::other("cannot register a datastore of kind any"));
        }
        let path = self.resolver.canonical(path.as_ref())?;
        let root = self.resolver.resolve(kind, &path)?;
        self.insert(Datastore::new(kind, path, root))
    }

    /// Register an already-opened backing store, skipping resolution.
    pub fn register_store(
        &self,
        kind: FsKind,
        path: impl AsRef<Path>,
        store: Box<dyn BackingStore>,
    ) -> VfsResult<Arc<Datastore>> {
        if kind.is_wildcard() {
            return Err(VfsError::other("cannot register a datastore of kind any"));
        }
        let path = normalize_mount_path(path.as_ref());
        self.insert(Datastore::new(kind, path, store))
    }

    fn insert(&self, datastore: Datastore) -> VfsResult<Arc<Datastore>> {
        let mut stores = self.stores.write();
        if stores
            .iter()
            .any(|d| d.kind == datastore.kind && d.fsid == datastore.fsid)
        {
            datastore.release();
            return Err(VfsError::already_exists(format!(
                "datastore {} ({})",
                datastore.path.display(),
                datastore.kind
            )));
        }

        let datastore = Arc::new(datastore);
        stores.push(Arc::clone(&datastore));
        self.live.fetch_add(1, Ordering::SeqCst);

        info!(
            kind = %datastore.kind,
            fsid = datastore.fsid,
            path = %datastore.path.display(),
            "registered datastore"
        );
        Ok(datastore)
    }

    /// Remove the datastore keyed by `(kind, fsid)` and release its root.
    pub fn deregister(&self, kind: FsKind, fsid: Fsid) -> VfsResult<()> {
        let removed = {
            let mut stores = self.stores.write();
            let pos = stores
                .iter()
                .position(|d| d.kind == kind && d.fsid == fsid)
                .ok_or_else(|| VfsError::no_datastore(format!("{kind} fsid {fsid:#x}")))?;
            self.live.fetch_sub(1, Ordering::SeqCst);
            stores.remove(pos)
        };

        if !removed.release() {
            warn!(path = %removed.path.display(), "datastore root already released");
        }
        info!(kind = %kind, fsid, path = %removed.path.display(), "deregistered datastore");
        Ok(())
    }

    /// Deregister everything.
    pub fn deregister_all(&self) {
        let drained: Vec<_> = {
            let mut stores = self.stores.write();
            self.live.store(0, Ordering::SeqCst);
            stores.drain(..).collect()
        };
        for datastore in drained {
            datastore.release();
            info!(path = %datastore.path.display(), "deregistered datastore");
        }
    }

    /// Pick a datastore.
    ///
    /// A concrete `kind` returns the unique datastore registered under
    /// `(kind, fsid)`. The wildcard kind ignores `fsid` and draws a random
    /// ordinal over the live count, then returns whichever datastore sits
    /// at that position when the set is scanned. A concurrent deregister
    /// between the draw and the scan can shift the mapping or leave the
    /// ordinal past the end, in which case nothing is returned; the
    /// spread is best-effort only.
    pub fn select(&self, kind: FsKind, fsid: Fsid) -> Option<Arc<Datastore>> {
        self.selections.fetch_add(1, Ordering::Relaxed);

        if kind.is_wildcard() {
            let live = self.live.load(Ordering::SeqCst);
            if live == 0 {
                debug!("no datastore registered");
                return None;
            }
            let ordinal = rand::thread_rng().gen_range(0..live);
            let stores = self.stores.read();
            let picked = stores.iter().nth(ordinal).cloned();
            debug!(ordinal, live, found = picked.is_some(), "wildcard datastore selection");
            return picked;
        }

        let stores = self.stores.read();
        stores
            .iter()
            .find(|d| d.kind == kind && d.fsid == fsid)
            .cloned()
    }

    /// Pick any datastore of `kind`, or any datastore at all for the
    /// wildcard. Used to place eagerly connected files.
    pub fn select_kind(&self, kind: FsKind) -> Option<Arc<Datastore>> {
        if kind.is_wildcard() {
            return self.select(kind, 0);
        }
        self.selections.fetch_add(1, Ordering::Relaxed);
        let stores = self.stores.read();
        let matching: Vec<_> = stores.iter().filter(|d| d.kind == kind).collect();
        if matching.is_empty() {
            return None;
        }
        let ordinal = rand::thread_rng().gen_range(0..matching.len());
        Some(Arc::clone(matching[ordinal]))
    }

    /// Number of registered datastores.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// How many selections have been made since the registry was created.
    pub fn selection_count(&self) -> u64 {
        self.selections.load(Ordering::Relaxed)
    }

    /// List registered datastores in registration order.
    pub fn list(&self) -> Vec<DatastoreInfo> {
        self.stores
            .read()
            .iter()
            .map(|d| DatastoreInfo {
                kind: d.kind,
                fsid: d.fsid,
                path: d.path.clone(),
            })
            .collect()
    }

    /// Sum block counts across every live datastore.
    ///
    /// A datastore whose statfs fails is skipped with a warning.
    pub fn aggregate_statfs(&self) -> StatFs {
        let stores: Vec<_> = self.stores.read().iter().cloned().collect();
        let mut total = StatFs::default();
        for datastore in stores {
            match datastore.with_store(|s| s.statfs()) {
                Ok(stat) => total.accumulate(&stat),
                Err(e) => warn!(path = %datastore.path.display(), error = %e, "statfs failed"),
            }
        }
        total
    }
}
