//! Mount-point resolution.
//!
//! Registration hands a path and a filesystem kind to a [`MountResolver`],
//! which checks that the path really is a mount of that kind and opens a
//! backing store rooted there.

use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::backends::{LocalBackend, MemoryBackend};
use super::error::{VfsError, VfsResult};
use super::mount::normalize_mount_path;
use super::ops::BackingStore;
use super::types::FsKind;

/// Resolves a registration path to a live backing store.
pub trait MountResolver: Send + Sync + Debug {
    /// The path a registration is known by. Its hash is the fsid.
    fn canonical(&self, path: &Path) -> VfsResult<PathBuf> {
        Ok(normalize_mount_path(path))
    }

    fn resolve(&self, kind: FsKind, path: &Path) -> VfsResult<Box<dyn BackingStore>>;
}

fn canonicalize_mount(path: &Path) -> VfsResult<PathBuf> {
    path.canonicalize().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            VfsError::no_mount_point(path.display().to_string())
        } else {
            VfsError::Io(e)
        }
    })
}

/// One line of a mounts table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: PathBuf,
    pub fstype: String,
}

/// Parse a table in `/proc/self/mounts` format.
///
/// Malformed lines are skipped. Octal escapes (`\040` for space) in the
/// target column are decoded.
pub fn parse_mounts(text: &str) -> Vec<MountEntry> {
    text.lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let source = cols.next()?;
            let target = cols.next()?;
            let fstype = cols.next()?;
            Some(MountEntry {
                source: unescape(source),
                target: PathBuf::from(unescape(target)),
                fstype: fstype.to_string(),
            })
        })
        .collect()
}

fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|oct| u8::from_str_radix(oct, 8).ok());
            if let Some(v) = decoded {
                out.push(v);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Find the mount owning `path` by longest matching target.
pub fn owning_mount<'a>(mounts: &'a [MountEntry], path: &Path) -> Option<&'a MountEntry> {
    mounts
        .iter()
        .filter(|m| path.starts_with(&m.target))
        .max_by_key(|m| m.target.as_os_str().len())
}

/// Resolver backed by the host mounts table.
///
/// The registration path must be mounted with the requested kind; the
/// datastore is a [`LocalBackend`] rooted at that path.
#[derive(Debug, Clone)]
pub struct ProcMounts {
    table: PathBuf,
}

impl Default for ProcMounts {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcMounts {
    pub fn new() -> Self {
        Self::with_table("/proc/self/mounts")
    }

    /// Read mounts from another file in the same format.
    pub fn with_table(table: impl Into<PathBuf>) -> Self {
        Self {
            table: table.into(),
        }
    }
}

impl MountResolver for ProcMounts {
    /// Symlinks resolved, so every spelling of a mount shares one fsid.
    fn canonical(&self, path: &Path) -> VfsResult<PathBuf> {
        canonicalize_mount(path)
    }

    fn resolve(&self, kind: FsKind, path: &Path) -> VfsResult<Box<dyn BackingStore>> {
        let canonical = canonicalize_mount(path)?;

        let text = fs::read_to_string(&self.table)?;
        let mounts = parse_mounts(&text);
        let mount = owning_mount(&mounts, &canonical)
            .ok_or_else(|| VfsError::no_mount_point(canonical.display().to_string()))?;

        debug!(
            path = %canonical.display(),
            target = %mount.target.display(),
            fstype = %mount.fstype,
            "resolved mount"
        );

        if FsKind::from_fstype(&mount.fstype) != Some(kind) {
            return Err(VfsError::WrongFsKind {
                path: canonical.display().to_string(),
                expected: kind,
                found: mount.fstype.clone(),
            });
        }

        Ok(Box::new(LocalBackend::open(canonical)?))
    }
}

/// Where a fixed mount's data lives.
#[derive(Debug, Clone)]
pub enum MountSource {
    /// A host directory.
    Local(PathBuf),
    /// An in-memory store; every resolution shares the same contents.
    Memory(MemoryBackend),
}

#[derive(Debug, Clone)]
struct FixedMount {
    path: PathBuf,
    kind: FsKind,
    source: MountSource,
}

/// Resolver over an explicit table, for unverified deployments and tests.
#[derive(Debug, Clone, Default)]
pub struct FixedMounts {
    mounts: Vec<FixedMount>,
}

impl FixedMounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a mount.
    pub fn with(mut self, path: impl AsRef<Path>, kind: FsKind, source: MountSource) -> Self {
        self.mounts.push(FixedMount {
            path: normalize_mount_path(path.as_ref()),
            kind,
            source,
        });
        self
    }

    /// Add a mount backed by a host directory.
    pub fn with_local(self, path: impl AsRef<Path>, kind: FsKind, dir: impl Into<PathBuf>) -> Self {
        self.with(path, kind, MountSource::Local(dir.into()))
    }

    /// Add a mount backed by an in-memory store.
    pub fn with_memory(self, path: impl AsRef<Path>, kind: FsKind, store: MemoryBackend) -> Self {
        self.with(path, kind, MountSource::Memory(store))
    }
}

impl MountResolver for FixedMounts {
    fn resolve(&self, kind: FsKind, path: &Path) -> VfsResult<Box<dyn BackingStore>> {
        let path = normalize_mount_path(path);
        let mount = self
            .mounts
            .iter()
            .find(|m| m.path == path)
            .ok_or_else(|| VfsError::no_mount_point(path.display().to_string()))?;

        if mount.kind != kind {
            return Err(VfsError::WrongFsKind {
                path: path.display().to_string(),
                expected: kind,
                found: mount.kind.to_string(),
            });
        }

        match &mount.source {
            MountSource::Local(dir) => Ok(Box::new(LocalBackend::open(dir)?)),
            MountSource::Memory(store) => Ok(Box::new(store.clone())),
        }
    }
}
