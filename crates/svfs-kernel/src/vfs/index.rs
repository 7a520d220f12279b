//! Metadata index.
//!
//! A fixed-capacity array of [`MetadataEntry`] records addressed by inode
//! number. It is the authoritative record of the virtual tree: parent
//! links, names, attributes, and which datastore holds each file's data.
//!
//! Each slot has its own lock. Free slots are tracked in an ordered set
//! with a cursor at the last allocation, so allocation hands out the
//! first free slot after the cursor and wraps around. The allocator lock
//! is always taken before a slot lock, and a slot lock is dropped before
//! a freed slot goes back on the free set.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use super::error::{VfsError, VfsResult};
use super::types::{FileAttr, FileType, FsKind, Fsid, InodeFlags, Ino, ROOT_INO};

/// Lifecycle of a metadata entry.
///
/// ```text
/// Free -> New -> Valid <-> Dirty
///          |       |
///          v       v
///        Free   Deleting -> Free
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryState {
    /// Unused slot.
    Free,
    /// Allocated but not yet committed.
    New,
    /// Committed and safe to read.
    Valid,
    /// Attributes changed since the last commit.
    Dirty,
    /// Unlinked; reclaimed once the in-memory inode is gone.
    Deleting,
}

impl EntryState {
    /// Visible in the namespace.
    pub fn is_live(&self) -> bool {
        matches!(self, EntryState::Valid | EntryState::Dirty)
    }
}

/// Datastore holding a file's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackingRef {
    pub kind: FsKind,
    pub fsid: Fsid,
}

/// One record of the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub parent: Ino,
    pub depth: u32,
    pub state: EntryState,
    pub attr: FileAttr,
    /// Name component within the parent.
    pub name: String,
    /// Symlink target, stored inline.
    pub link_target: Option<String>,
    /// Assigned datastore; `None` until a file is placed.
    pub backing: Option<BackingRef>,
}

impl MetadataEntry {
    fn free(ino: Ino) -> Self {
        Self {
            parent: ino,
            depth: 0,
            state: EntryState::Free,
            attr: FileAttr {
                ino,
                generation: 0,
                size: 0,
                kind: FileType::File,
                perm: 0,
                nlink: 0,
                uid: 0,
                gid: 0,
                atime: UNIX_EPOCH,
                mtime: UNIX_EPOCH,
                ctime: UNIX_EPOCH,
                flags: InodeFlags::empty(),
            },
            name: String::new(),
            link_target: None,
            backing: None,
        }
    }

    fn root() -> Self {
        Self {
            parent: ROOT_INO,
            depth: 0,
            state: EntryState::Valid,
            attr: FileAttr::directory(ROOT_INO, 0o755),
            name: String::new(),
            link_target: None,
            backing: None,
        }
    }

    /// Backing-store relative path of this entry's data.
    ///
    /// Derived from the inode number alone, so renames never move data.
    pub fn backing_fragment(&self) -> String {
        backing_fragment(self.attr.ino)
    }
}

fn push_escaped(path: &mut String, name: &str) {
    for c in name.chars() {
        if c == '.' || c == '\\' {
            path.push('\\');
        }
        path.push(c);
    }
}

/// Backing-store relative path for `ino`.
pub fn backing_fragment(ino: Ino) -> String {
    format!("ino_{ino}")
}

/// Initial contents of a freshly allocated entry.
#[derive(Debug, Clone)]
pub struct EntryInit {
    pub parent: Ino,
    pub name: String,
    pub attr: FileAttr,
    pub link_target: Option<String>,
    pub backing: Option<BackingRef>,
}

#[derive(Debug)]
struct Allocator {
    free: BTreeSet<Ino>,
    cursor: Ino,
}

/// The metadata index.
#[derive(Debug)]
pub struct MetadataIndex {
    slots: Box<[Mutex<MetadataEntry>]>,
    alloc: Mutex<Allocator>,
}

impl MetadataIndex {
    /// Create an index with `capacity` slots; slot 0 is the root directory.
    pub fn new(capacity: u32) -> VfsResult<Self> {
        if capacity == 0 {
            return Err(VfsError::other("index capacity must be at least 1"));
        }
        let entries = (0..capacity)
            .map(|ino| {
                if ino == ROOT_INO {
                    MetadataEntry::root()
                } else {
                    MetadataEntry::free(ino)
                }
            })
            .collect();
        Self::from_entries(entries)
    }

    /// Rebuild an index from entries in array order.
    pub fn from_entries(entries: Vec<MetadataEntry>) -> VfsResult<Self> {
        let root = entries
            .first()
            .ok_or_else(|| VfsError::corrupt("empty index"))?;
        if !root.attr.is_dir() || root.parent != ROOT_INO || root.depth != 0 {
            return Err(VfsError::corrupt("slot 0 is not the root directory"));
        }
        if u32::try_from(entries.len()).is_err() {
            return Err(VfsError::corrupt("index larger than the inode space"));
        }

        let free = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state == EntryState::Free)
            .map(|(ino, _)| ino as Ino)
            .collect();

        Ok(Self {
            slots: entries.into_iter().map(Mutex::new).collect(),
            alloc: Mutex::new(Allocator {
                free,
                cursor: ROOT_INO,
            }),
        })
    }

    /// Number of slots.
    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Number of FREE slots.
    pub fn free_count(&self) -> u32 {
        self.alloc.lock().free.len() as u32
    }

    fn slot(&self, ino: Ino) -> VfsResult<&Mutex<MetadataEntry>> {
        self.slots
            .get(ino as usize)
            .ok_or_else(|| VfsError::not_found(format!("inode {ino}")))
    }

    /// Copy of the entry at `ino`, whatever its state.
    pub fn entry(&self, ino: Ino) -> VfsResult<MetadataEntry> {
        Ok(self.slot(ino)?.lock().clone())
    }

    /// Copy of the entry at `ino` if it is live.
    pub fn live_entry(&self, ino: Ino) -> VfsResult<MetadataEntry> {
        let entry = self.entry(ino)?;
        if entry.state.is_live() {
            Ok(entry)
        } else {
            Err(VfsError::not_found(format!("inode {ino}")))
        }
    }

    /// Current state of `ino`.
    pub fn state(&self, ino: Ino) -> VfsResult<EntryState> {
        Ok(self.slot(ino)?.lock().state)
    }

    /// Claim the first FREE slot after the last allocation, wrapping.
    ///
    /// The slot is NEW on return. Fails with `NoSpace` without touching
    /// any slot when nothing is free.
    pub fn allocate_free_entry(&self) -> VfsResult<Ino> {
        let mut alloc = self.alloc.lock();
        let ino = alloc
            .free
            .range(alloc.cursor.saturating_add(1)..)
            .next()
            .or_else(|| alloc.free.iter().next())
            .copied()
            .ok_or(VfsError::NoSpace)?;

        alloc.free.remove(&ino);
        alloc.cursor = ino;

        let mut slot = self.slot(ino)?.lock();
        if slot.state != EntryState::Free {
            // The free set and the slot disagree; never hand out a live slot.
            warn!(ino, state = ?slot.state, "free set held a non-free slot");
            return Err(VfsError::corrupt(format!("slot {ino} is {:?}", slot.state)));
        }
        *slot = MetadataEntry::free(ino);
        slot.state = EntryState::New;
        debug!(ino, "allocated entry");
        Ok(ino)
    }

    /// Fill a NEW entry and link it under `init.parent`.
    ///
    /// The entry stays NEW until [`commit`](Self::commit).
    pub fn update_entry(&self, ino: Ino, init: EntryInit) -> VfsResult<()> {
        let parent_depth = {
            let parent = self.slot(init.parent)?.lock();
            if !parent.state.is_live() || !parent.attr.is_dir() {
                return Err(VfsError::not_a_directory(format!("inode {}", init.parent)));
            }
            parent.depth
        };

        let mut slot = self.slot(ino)?.lock();
        if slot.state != EntryState::New {
            return Err(VfsError::stale(format!("slot {ino} is {:?}", slot.state)));
        }
        slot.parent = init.parent;
        slot.depth = parent_depth + 1;
        slot.name = init.name;
        slot.attr = init.attr;
        slot.attr.ino = ino;
        slot.link_target = init.link_target;
        slot.backing = init.backing;
        Ok(())
    }

    /// Find the live child of `parent` named `name`.
    ///
    /// Linear scan, exact byte comparison. A second match means the
    /// unique-name invariant broke; it is logged and the first match wins.
    pub fn lookup_child(&self, parent: Ino, name: &str) -> Option<Ino> {
        let mut found = None;
        for (ino, slot) in self.slots.iter().enumerate() {
            let ino = ino as Ino;
            if ino == parent {
                continue;
            }
            let entry = slot.lock();
            if entry.state.is_live() && entry.parent == parent && entry.name == name {
                match found {
                    None => found = Some(ino),
                    Some(first) => {
                        warn!(parent, name, first, duplicate = ino, "duplicate directory entry");
                    }
                }
            }
        }
        found
    }

    /// First live child of `parent` strictly after `after`, in slot order.
    ///
    /// Pass [`ROOT_INO`] to start from the beginning. No snapshot is
    /// taken: entries created or removed behind a paused scan may or may
    /// not be seen.
    pub fn next_child(&self, parent: Ino, after: Ino) -> Option<Ino> {
        let start = after as usize + 1;
        self.slots.iter().enumerate().skip(start).find_map(|(ino, slot)| {
            let ino = ino as Ino;
            if ino == parent {
                return None;
            }
            let entry = slot.lock();
            (entry.state.is_live() && entry.parent == parent).then_some(ino)
        })
    }

    /// True if `dir` has no live children.
    pub fn is_empty_dir(&self, dir: Ino) -> bool {
        self.next_child(dir, ROOT_INO).is_none()
    }

    /// Rebuild the virtual path of `ino` as `/.a.b.c`.
    ///
    /// Inside a component `\` is written `\\` and `.` is written `\.`,
    /// so every unescaped `.` is a separator and distinct names give
    /// distinct paths.
    ///
    /// Walks exactly `depth` parent links. Reaching the root early, not
    /// reaching it at all, or passing a dead ancestor is corruption.
    pub fn reconstruct_path(&self, ino: Ino) -> VfsResult<String> {
        let start = self.live_entry(ino)?;
        let depth = start.depth;
        let mut names = Vec::with_capacity(depth as usize);
        let mut current = start;
        let mut cursor = ino;

        for step in 0..depth {
            if cursor == ROOT_INO {
                warn!(ino, depth, step, "ancestor chain shorter than depth");
                return Err(VfsError::corrupt(format!(
                    "inode {ino}: reached root after {step} of {depth} steps"
                )));
            }
            names.push(std::mem::take(&mut current.name));
            cursor = current.parent;
            current = self.entry(cursor)?;
            if !current.state.is_live() {
                warn!(ino, ancestor = cursor, state = ?current.state, "dead ancestor");
                return Err(VfsError::corrupt(format!(
                    "inode {ino}: ancestor {cursor} is {:?}",
                    current.state
                )));
            }
        }

        if cursor != ROOT_INO {
            warn!(ino, depth, stopped_at = cursor, "ancestor chain longer than depth");
            return Err(VfsError::corrupt(format!(
                "inode {ino}: {depth} steps ended at {cursor}, not the root"
            )));
        }

        let mut path = String::from("/");
        for name in names.iter().rev() {
            path.push('.');
            push_escaped(&mut path, name);
        }
        Ok(path)
    }

    /// Record new attributes for `ino`.
    ///
    /// A live entry becomes DIRTY; NEW and DELETING entries keep their
    /// state.
    pub fn mark_dirty(&self, ino: Ino, attr: &FileAttr) -> VfsResult<()> {
        let mut slot = self.slot(ino)?.lock();
        match slot.state {
            EntryState::Free => Err(VfsError::stale(format!("inode {ino} is free"))),
            state => {
                slot.attr = attr.clone();
                slot.attr.ino = ino;
                if state == EntryState::Valid {
                    slot.state = EntryState::Dirty;
                }
                Ok(())
            }
        }
    }

    /// Commit `ino` and return its resulting state.
    ///
    /// NEW and DIRTY become VALID. A DELETING entry is reset to FREE,
    /// completing reclamation.
    pub fn commit(&self, ino: Ino) -> VfsResult<EntryState> {
        let reclaimed = {
            let mut slot = self.slot(ino)?.lock();
            match slot.state {
                EntryState::New | EntryState::Dirty => {
                    slot.state = EntryState::Valid;
                    return Ok(EntryState::Valid);
                }
                EntryState::Valid | EntryState::Free => return Ok(slot.state),
                EntryState::Deleting => {
                    *slot = MetadataEntry::free(ino);
                    true
                }
            }
        };

        if reclaimed {
            self.alloc.lock().free.insert(ino);
            debug!(ino, "reclaimed entry");
        }
        Ok(EntryState::Free)
    }

    /// Mark `ino` DELETING after checking it is still `name` under `parent`.
    ///
    /// The check runs under the slot lock. A mismatch means the entry was
    /// renamed or replaced since the caller looked it up; nothing changes
    /// and `Stale` is returned.
    pub fn delete(&self, parent: Ino, ino: Ino, name: &str) -> VfsResult<()> {
        if ino == ROOT_INO {
            return Err(VfsError::invalid_path("cannot delete the root"));
        }
        let mut slot = self.slot(ino)?.lock();
        if !slot.state.is_live() {
            return Err(VfsError::not_found(name));
        }
        if slot.parent != parent || slot.name != name {
            warn!(
                ino,
                expected_parent = parent,
                expected_name = name,
                parent = slot.parent,
                name = %slot.name,
                "delete target changed since lookup"
            );
            return Err(VfsError::stale(format!("{name} (inode {ino})")));
        }
        slot.state = EntryState::Deleting;
        debug!(ino, parent, name, "entry deleting");
        Ok(())
    }

    /// Roll a DELETING entry back to VALID.
    pub fn undelete(&self, ino: Ino) -> VfsResult<()> {
        let mut slot = self.slot(ino)?.lock();
        if slot.state != EntryState::Deleting {
            return Err(VfsError::stale(format!("inode {ino} is {:?}", slot.state)));
        }
        slot.state = EntryState::Valid;
        Ok(())
    }

    /// Roll a NEW entry back to FREE.
    pub fn release_new(&self, ino: Ino) -> VfsResult<()> {
        {
            let mut slot = self.slot(ino)?.lock();
            if slot.state != EntryState::New {
                return Err(VfsError::stale(format!("inode {ino} is {:?}", slot.state)));
            }
            *slot = MetadataEntry::free(ino);
        }
        self.alloc.lock().free.insert(ino);
        debug!(ino, "released new entry");
        Ok(())
    }

    /// Record the datastore chosen for `ino` and clear its delay flag.
    pub fn assign_backing(&self, ino: Ino, backing: BackingRef) -> VfsResult<()> {
        let mut slot = self.slot(ino)?.lock();
        if slot.state == EntryState::Free {
            return Err(VfsError::stale(format!("inode {ino} is free")));
        }
        slot.backing = Some(backing);
        slot.attr.flags.remove(InodeFlags::DELAY_ALLOC);
        if slot.state == EntryState::Valid {
            slot.state = EntryState::Dirty;
        }
        Ok(())
    }

    /// Undo [`assign_backing`](Self::assign_backing) after a failed
    /// placement.
    pub fn clear_backing(&self, ino: Ino) -> VfsResult<()> {
        let mut slot = self.slot(ino)?.lock();
        if slot.state != EntryState::Free {
            slot.backing = None;
            slot.attr.flags.insert(InodeFlags::DELAY_ALLOC);
        }
        Ok(())
    }

    /// Move `ino` to `name` under `new_parent` and fix the depth of every
    /// entry beneath it.
    pub fn relink(&self, ino: Ino, new_parent: Ino, name: &str) -> VfsResult<()> {
        let parent_depth = self.live_entry(new_parent)?.depth;
        let old_depth = {
            let mut slot = self.slot(ino)?.lock();
            if !slot.state.is_live() {
                return Err(VfsError::not_found(format!("inode {ino}")));
            }
            let old = slot.depth;
            slot.parent = new_parent;
            slot.depth = parent_depth + 1;
            slot.name = name.to_string();
            slot.attr.ctime = SystemTime::now();
            slot.state = EntryState::Dirty;
            old
        };

        let new_depth = parent_depth + 1;
        if new_depth != old_depth {
            let mut pending = vec![ino];
            while let Some(dir) = pending.pop() {
                let mut cursor = ROOT_INO;
                while let Some(child) = self.next_child(dir, cursor) {
                    let mut slot = self.slot(child)?.lock();
                    slot.depth = slot.depth + new_depth - old_depth;
                    if slot.attr.is_dir() {
                        pending.push(child);
                    }
                    cursor = child;
                }
            }
        }
        Ok(())
    }

    /// True if `ino` is `ancestor` or lies beneath it.
    pub fn is_descendant(&self, ino: Ino, ancestor: Ino) -> VfsResult<bool> {
        let mut cursor = ino;
        let mut entry = self.entry(cursor)?;
        for _ in 0..=entry.depth {
            if cursor == ancestor {
                return Ok(true);
            }
            if cursor == ROOT_INO {
                return Ok(false);
            }
            cursor = entry.parent;
            entry = self.entry(cursor)?;
        }
        Ok(cursor == ancestor)
    }

    /// Inode numbers in `state`, in slot order.
    pub fn entries_in_state(&self, state: EntryState) -> Vec<Ino> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.lock().state == state)
            .map(|(ino, _)| ino as Ino)
            .collect()
    }

    /// Highest generation stamped into any non-free entry.
    pub fn max_generation(&self) -> u32 {
        self.slots
            .iter()
            .map(|slot| {
                let entry = slot.lock();
                if entry.state == EntryState::Free {
                    0
                } else {
                    entry.attr.generation
                }
            })
            .max()
            .unwrap_or(0)
    }

    /// Copy of every entry in slot order.
    pub fn snapshot(&self) -> Vec<MetadataEntry> {
        self.slots.iter().map(|slot| slot.lock().clone()).collect()
    }
}
