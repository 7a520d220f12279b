//! End-to-end relay scenarios.
//!
//! # Tiers
//!
//! - **Tier 1:** placement — eager creation on a host directory, path
//!   reconstruction, registry identity
//! - **Tier 2:** delayed allocation — no selection before first I/O,
//!   fixed placement after, failure without a datastore and retry
//! - **Tier 3:** unlink ordering — backing file removed before the slot
//!   is freed, including injected partial failures
//! - **Tier 4:** persistence — index image round trip and mount-time
//!   recovery of interrupted operations
//! - **Tier 5:** concurrent namespace changes — directory replacement
//!   against creation, inode number reuse against lookups

use std::path::Path;
use std::sync::Arc;
use std::thread;

use svfs_kernel::vfs::{
    BackingStore, ConnectionState, CreateOptions, EntryState, FixedMounts, FsKind, MemoryBackend,
    MetadataIndex, MountOptions, ROOT_INO, Svfs, VfsError, WriteFlags, fsid_of, persist,
};
use svfs_kernel::SvfsConfig;
use tempfile::TempDir;

// ============================================================================
// Shared test setup
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("svfs_kernel=debug")
        .with_test_writer()
        .try_init();
}

/// Two in-memory ext4 datastores at /mnt/a and /mnt/b plus an nfs one at
/// /mnt/c, none registered yet.
fn memory_mounts() -> (FixedMounts, [MemoryBackend; 3]) {
    let stores = [MemoryBackend::new(), MemoryBackend::new(), MemoryBackend::new()];
    let mounts = FixedMounts::new()
        .with_memory("/mnt/a", FsKind::Ext4, stores[0].clone())
        .with_memory("/mnt/b", FsKind::Ext4, stores[1].clone())
        .with_memory("/mnt/c", FsKind::Nfs, stores[2].clone());
    (mounts, stores)
}

fn fragment(ino: u32) -> String {
    format!("ino_{ino}")
}

// ============================================================================
// Tier 1: placement
// ============================================================================

#[test]
fn test_eager_create_on_host_directory() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let svfs = Svfs::mount(
        MountOptions::new().with_capacity(32),
        FixedMounts::new().with_local("/mnt/a", FsKind::Ext3, dir.path()),
    )
    .unwrap();
    let a = svfs.register_datastore(FsKind::Ext3, "/mnt/a").unwrap();

    let dir1 = svfs.mkdir(ROOT_INO, "dir1", &CreateOptions::new()).unwrap();
    let f1 = svfs
        .create(dir1.ino, "f1", &CreateOptions::new().with_delay_alloc(false))
        .unwrap();

    assert_eq!(dir1.ino, 1);
    assert_eq!(f1.ino, 2);
    assert!(dir.path().join(fragment(2)).exists());
    assert_eq!(svfs.reconstruct_path(f1.ino).unwrap(), "/.dir1.f1");

    let entry = svfs.index().entry(f1.ino).unwrap();
    let backing = entry.backing.unwrap();
    assert_eq!(backing.kind, FsKind::Ext3);
    assert_eq!(backing.fsid, a.fsid);

    svfs.write(f1.ino, 0, b"relayed bytes", WriteFlags::sync()).unwrap();
    assert_eq!(
        std::fs::read(dir.path().join(fragment(2))).unwrap(),
        b"relayed bytes"
    );
    assert_eq!(svfs.read(f1.ino, 8, 100).unwrap(), b"bytes");
}

#[test]
fn test_fresh_index_over_used_directory_starts_files_empty() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mounts = FixedMounts::new().with_local("/mnt/a", FsKind::Ext4, dir.path());

    let svfs = Svfs::mount(MountOptions::new().with_capacity(16), mounts.clone()).unwrap();
    svfs.register_datastore(FsKind::Ext4, "/mnt/a").unwrap();
    let eager = svfs
        .create(ROOT_INO, "old", &CreateOptions::new().with_delay_alloc(false))
        .unwrap();
    let delayed = svfs
        .create(ROOT_INO, "old2", &CreateOptions::new().with_delay_alloc(true))
        .unwrap();
    svfs.write(eager.ino, 0, b"previous tenant", WriteFlags::sync()).unwrap();
    svfs.write(delayed.ino, 0, b"previous tenant", WriteFlags::sync()).unwrap();
    svfs.unmount().unwrap();

    // No image: the same inode numbers come back over the same fragments.
    let svfs = Svfs::mount(MountOptions::new().with_capacity(16), mounts).unwrap();
    svfs.register_datastore(FsKind::Ext4, "/mnt/a").unwrap();
    let fresh = svfs
        .create(ROOT_INO, "new", &CreateOptions::new().with_delay_alloc(false))
        .unwrap();
    let late = svfs
        .create(ROOT_INO, "new2", &CreateOptions::new().with_delay_alloc(true))
        .unwrap();
    assert_eq!(fresh.ino, eager.ino);
    assert_eq!(late.ino, delayed.ino);

    assert!(svfs.read(fresh.ino, 0, 64).unwrap().is_empty());
    assert_eq!(std::fs::metadata(dir.path().join(fragment(fresh.ino))).unwrap().len(), 0);

    svfs.write(late.ino, 0, b"new", WriteFlags::sync()).unwrap();
    assert_eq!(svfs.read(late.ino, 0, 64).unwrap(), b"new");
    assert_eq!(std::fs::read(dir.path().join(fragment(late.ino))).unwrap(), b"new");
}

#[test]
fn test_dotted_names_reconstruct_to_distinct_paths() {
    let (mounts, _stores) = memory_mounts();
    let svfs = Svfs::mount(MountOptions::new().with_capacity(16), mounts).unwrap();

    let a = svfs.mkdir(ROOT_INO, "a", &CreateOptions::new()).unwrap();
    let nested = svfs.create(a.ino, "b", &CreateOptions::new()).unwrap();
    let flat = svfs.create(ROOT_INO, "a.b", &CreateOptions::new()).unwrap();

    let nested_path = svfs.reconstruct_path(nested.ino).unwrap();
    let flat_path = svfs.reconstruct_path(flat.ino).unwrap();
    assert_eq!(nested_path, "/.a.b");
    assert_eq!(flat_path, "/.a\\.b");
    assert_ne!(nested_path, flat_path);
}

#[test]
fn test_directories_never_touch_datastores() {
    let (mounts, stores) = memory_mounts();
    let svfs = Svfs::mount(MountOptions::new().with_capacity(16), mounts).unwrap();
    svfs.register_datastore(FsKind::Ext4, "/mnt/a").unwrap();

    let d = svfs.mkdir(ROOT_INO, "d", &CreateOptions::new()).unwrap();
    svfs.mkdir(d.ino, "e", &CreateOptions::new()).unwrap();
    svfs.rmdir(d.ino, "e").unwrap();

    assert_eq!(svfs.registry().selection_count(), 0);
    assert!(stores[0].file_names().is_empty());
    assert!(matches!(svfs.read(d.ino, 0, 1), Err(VfsError::IsADirectory(_))));
}

#[test]
fn test_registry_identity_is_path_derived() {
    let (mounts, _stores) = memory_mounts();
    let svfs = Svfs::mount(MountOptions::new().with_capacity(8), mounts).unwrap();

    let first = svfs.register_datastore(FsKind::Ext4, "/mnt/a").unwrap();
    assert_eq!(first.fsid, fsid_of(Path::new("/mnt/a")));
    svfs.deregister_datastore(FsKind::Ext4, first.fsid).unwrap();

    svfs.register_datastore(FsKind::Ext4, "/mnt/b").unwrap();
    let again = svfs.register_datastore(FsKind::Ext4, "/mnt/a").unwrap();
    assert_eq!(again.fsid, first.fsid);

    for _ in 0..32 {
        let picked = svfs.registry().select(FsKind::Ext4, first.fsid).unwrap();
        assert_eq!(picked.path(), Path::new("/mnt/a"));
    }
}

#[test]
fn test_default_kind_restricts_eager_placement() {
    let (mounts, stores) = memory_mounts();
    let svfs = Svfs::mount(
        MountOptions::new()
            .with_capacity(64)
            .with_default_kind(FsKind::Nfs),
        mounts,
    )
    .unwrap();
    svfs.register_datastore(FsKind::Ext4, "/mnt/a").unwrap();
    svfs.register_datastore(FsKind::Nfs, "/mnt/c").unwrap();

    for i in 0..10 {
        svfs.create(ROOT_INO, &format!("f{i}"), &CreateOptions::new())
            .unwrap();
    }
    assert!(stores[0].file_names().is_empty());
    assert_eq!(stores[2].file_names().len(), 10);
}

// ============================================================================
// Tier 2: delayed allocation
// ============================================================================

#[test]
fn test_delay_alloc_defers_selection_until_first_write() {
    init_tracing();
    let (mounts, stores) = memory_mounts();
    let svfs = Svfs::mount(
        MountOptions::new().with_capacity(16).with_delay_alloc(true),
        mounts,
    )
    .unwrap();
    svfs.register_datastore(FsKind::Ext4, "/mnt/a").unwrap();

    let f = svfs.create(ROOT_INO, "lazy", &CreateOptions::new()).unwrap();
    svfs.lookup(ROOT_INO, "lazy").unwrap();
    svfs.getattr(f.ino).unwrap();
    assert_eq!(svfs.registry().selection_count(), 0);
    assert_eq!(svfs.connection_state(f.ino), Some(ConnectionState::DelayAlloc));
    assert!(svfs.index().entry(f.ino).unwrap().backing.is_none());

    svfs.write(f.ino, 0, b"first", WriteFlags::default()).unwrap();
    assert_eq!(svfs.registry().selection_count(), 1);
    assert_eq!(stores[0].contents(fragment(f.ino)).unwrap(), b"first");

    let placed = svfs.index().entry(f.ino).unwrap().backing.unwrap();
    assert!(!svfs.getattr(f.ino).unwrap().delay_alloc());

    // More datastores do not move an already placed file.
    svfs.register_datastore(FsKind::Ext4, "/mnt/b").unwrap();
    svfs.register_datastore(FsKind::Nfs, "/mnt/c").unwrap();
    for round in 0..5 {
        svfs.forget(f.ino);
        svfs.lookup(ROOT_INO, "lazy").unwrap();
        svfs.write(f.ino, 5, format!("{round}").as_bytes(), WriteFlags::default())
            .unwrap();
        assert_eq!(svfs.index().entry(f.ino).unwrap().backing.unwrap(), placed);
    }
    assert!(stores[1].file_names().is_empty());
    assert!(stores[2].file_names().is_empty());
    assert_eq!(stores[0].contents(fragment(f.ino)).unwrap(), b"first4");
}

#[test]
fn test_write_without_datastore_fails_then_retries_after_lookup() {
    init_tracing();
    let (mounts, stores) = memory_mounts();
    let svfs = Svfs::mount(MountOptions::new().with_capacity(16), mounts).unwrap();

    let f = svfs
        .create(ROOT_INO, "f", &CreateOptions::new().with_delay_alloc(true))
        .unwrap();

    let err = svfs.write(f.ino, 0, b"x", WriteFlags::default()).unwrap_err();
    assert!(matches!(err, VfsError::NoDatastore(_)));
    assert_eq!(svfs.connection_state(f.ino), Some(ConnectionState::Failed));
    assert_eq!(svfs.index().state(f.ino).unwrap(), EntryState::Valid);

    // Still failed, even once a datastore shows up.
    svfs.register_datastore(FsKind::Ext4, "/mnt/a").unwrap();
    assert!(matches!(
        svfs.write(f.ino, 0, b"x", WriteFlags::default()),
        Err(VfsError::ConnectionFailed { .. })
    ));

    // A fresh lookup starts over.
    svfs.lookup(ROOT_INO, "f").unwrap();
    assert_eq!(svfs.connection_state(f.ino), Some(ConnectionState::DelayAlloc));
    svfs.write(f.ino, 0, b"x", WriteFlags::default()).unwrap();
    assert_eq!(stores[0].contents(fragment(f.ino)).unwrap(), b"x");
}

#[test]
fn test_deregistered_datastore_fails_connection() {
    let (mounts, _stores) = memory_mounts();
    let svfs = Svfs::mount(MountOptions::new().with_capacity(16), mounts).unwrap();
    let a = svfs.register_datastore(FsKind::Ext4, "/mnt/a").unwrap();

    let f = svfs.create(ROOT_INO, "f", &CreateOptions::new()).unwrap();
    svfs.forget(f.ino);
    svfs.deregister_datastore(FsKind::Ext4, a.fsid).unwrap();

    svfs.lookup(ROOT_INO, "f").unwrap();
    assert!(matches!(
        svfs.read(f.ino, 0, 1),
        Err(VfsError::NoDatastore(_))
    ));
    assert_eq!(svfs.connection_state(f.ino), Some(ConnectionState::Failed));
}

#[test]
fn test_concurrent_first_writes_connect_once() {
    let (mounts, stores) = memory_mounts();
    let svfs = std::sync::Arc::new(
        Svfs::mount(
            MountOptions::new().with_capacity(16).with_delay_alloc(true),
            mounts,
        )
        .unwrap(),
    );
    svfs.register_datastore(FsKind::Ext4, "/mnt/a").unwrap();
    svfs.register_datastore(FsKind::Ext4, "/mnt/b").unwrap();
    let f = svfs.create(ROOT_INO, "f", &CreateOptions::new()).unwrap();

    let handles: Vec<_> = (0..8u64)
        .map(|i| {
            let svfs = std::sync::Arc::clone(&svfs);
            std::thread::spawn(move || {
                svfs.write(f.ino, i, b"z", WriteFlags::default()).unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(svfs.registry().selection_count(), 1);
    let holders = stores[0].open_handles() + stores[1].open_handles();
    assert_eq!(holders, 1);
    assert_eq!(svfs.getattr(f.ino).unwrap().size, 8);
}

// ============================================================================
// Tier 3: unlink ordering
// ============================================================================

#[test]
fn test_unlink_removes_backing_before_freeing_slot() {
    let (mounts, stores) = memory_mounts();
    let svfs = Svfs::mount(MountOptions::new().with_capacity(16), mounts).unwrap();
    svfs.register_datastore(FsKind::Ext4, "/mnt/a").unwrap();

    let f = svfs.create(ROOT_INO, "f", &CreateOptions::new()).unwrap();
    svfs.write(f.ino, 0, b"doomed", WriteFlags::default()).unwrap();
    svfs.unlink(ROOT_INO, "f").unwrap();

    assert!(!stores[0].exists(Path::new(&fragment(f.ino))));
    assert_eq!(svfs.index().state(f.ino).unwrap(), EntryState::Free);
    assert_eq!(stores[0].open_handles(), 0);
}

#[test]
fn test_unlink_backing_failure_keeps_entry_and_file() {
    init_tracing();
    let (mounts, stores) = memory_mounts();
    let svfs = Svfs::mount(MountOptions::new().with_capacity(16), mounts).unwrap();
    svfs.register_datastore(FsKind::Ext4, "/mnt/a").unwrap();

    let f = svfs.create(ROOT_INO, "f", &CreateOptions::new()).unwrap();
    svfs.write(f.ino, 0, b"kept", WriteFlags::default()).unwrap();

    stores[0].fail_unlink(true);
    assert!(matches!(svfs.unlink(ROOT_INO, "f"), Err(VfsError::Io(_))));

    // Both sides still agree the file exists.
    assert!(stores[0].exists(Path::new(&fragment(f.ino))));
    assert!(svfs.index().state(f.ino).unwrap().is_live());
    assert_eq!(svfs.lookup(ROOT_INO, "f").unwrap().ino, f.ino);
    assert_eq!(svfs.read(f.ino, 0, 16).unwrap(), b"kept");

    stores[0].fail_unlink(false);
    svfs.unlink(ROOT_INO, "f").unwrap();
    assert!(!stores[0].exists(Path::new(&fragment(f.ino))));
}

#[test]
fn test_unlink_never_leaves_valid_entry_without_backing() {
    let (mounts, stores) = memory_mounts();
    let svfs = Svfs::mount(MountOptions::new().with_capacity(16), mounts).unwrap();
    svfs.register_datastore(FsKind::Ext4, "/mnt/a").unwrap();

    let f = svfs.create(ROOT_INO, "f", &CreateOptions::new()).unwrap();
    // Simulate the backing file vanishing behind our back.
    stores[0].unlink(Path::new(&fragment(f.ino))).unwrap();

    svfs.unlink(ROOT_INO, "f").unwrap();
    assert_eq!(svfs.index().state(f.ino).unwrap(), EntryState::Free);
}

#[test]
fn test_unlink_without_datastore_restores_entry() {
    let (mounts, _stores) = memory_mounts();
    let svfs = Svfs::mount(MountOptions::new().with_capacity(16), mounts).unwrap();
    let a = svfs.register_datastore(FsKind::Ext4, "/mnt/a").unwrap();

    let f = svfs.create(ROOT_INO, "f", &CreateOptions::new()).unwrap();
    svfs.deregister_datastore(FsKind::Ext4, a.fsid).unwrap();

    assert!(matches!(
        svfs.unlink(ROOT_INO, "f"),
        Err(VfsError::NoDatastore(_))
    ));
    assert_eq!(svfs.lookup(ROOT_INO, "f").unwrap().ino, f.ino);
}

#[test]
fn test_unlink_of_connected_inode_releases_handle() {
    let (mounts, stores) = memory_mounts();
    let svfs = Svfs::mount(MountOptions::new().with_capacity(16), mounts).unwrap();
    svfs.register_datastore(FsKind::Ext4, "/mnt/a").unwrap();
    let f = svfs.create(ROOT_INO, "f", &CreateOptions::new()).unwrap();

    svfs.with_backing(f.ino, |handle| {
        handle.write_all_at(b"open", 0)?;
        Ok(())
    })
    .unwrap();
    assert_eq!(stores[0].open_handles(), 1);

    svfs.unlink(ROOT_INO, "f").unwrap();
    assert_eq!(svfs.index().state(f.ino).unwrap(), EntryState::Free);
    assert_eq!(svfs.connection_state(f.ino), None);
    assert_eq!(stores[0].open_handles(), 0);
}

// ============================================================================
// Tier 4: persistence and recovery
// ============================================================================

#[test]
fn test_index_survives_remount() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let image = tmp.path().join("index.img");
    let (mounts, stores) = memory_mounts();

    let svfs = Svfs::mount(
        MountOptions::new().with_capacity(32).with_image(&image),
        mounts.clone(),
    )
    .unwrap();
    svfs.register_datastore(FsKind::Ext4, "/mnt/a").unwrap();
    let d = svfs.mkdir(ROOT_INO, "d", &CreateOptions::new()).unwrap();
    let f = svfs.create(d.ino, "f", &CreateOptions::new()).unwrap();
    svfs.write(f.ino, 0, b"persisted", WriteFlags::default()).unwrap();
    let generation = f.generation;
    svfs.unmount().unwrap();

    let svfs = Svfs::mount(MountOptions::new().with_image(&image), mounts).unwrap();
    svfs.register_datastore(FsKind::Ext4, "/mnt/a").unwrap();
    assert_eq!(svfs.index().capacity(), 32);
    assert_eq!(svfs.resolve("/d/f").unwrap(), f.ino);
    assert_eq!(svfs.getattr(f.ino).unwrap().size, 9);
    assert_eq!(svfs.read(f.ino, 0, 64).unwrap(), b"persisted");
    assert_eq!(stores[0].file_names(), vec![fragment(f.ino)]);

    let g = svfs.create(ROOT_INO, "g", &CreateOptions::new()).unwrap();
    assert!(g.generation > generation);
}

#[test]
fn test_mount_recovers_interrupted_operations() {
    let tmp = TempDir::new().unwrap();
    let image = tmp.path().join("index.img");
    let (mounts, stores) = memory_mounts();

    let svfs = Svfs::mount(
        MountOptions::new().with_capacity(16).with_image(&image),
        mounts.clone(),
    )
    .unwrap();
    svfs.register_datastore(FsKind::Ext4, "/mnt/a").unwrap();
    let f = svfs.create(ROOT_INO, "f", &CreateOptions::new()).unwrap();
    svfs.sync_fs().unwrap();
    drop(svfs);

    // Forge an image with one unlink cut short after the intent was
    // recorded and one allocation that never committed.
    let mut entries = persist::load(&image).unwrap().snapshot();
    entries[f.ino as usize].state = EntryState::Deleting;
    let stray = 5;
    entries[stray].state = EntryState::New;
    persist::dump(&MetadataIndex::from_entries(entries).unwrap(), &image).unwrap();

    let svfs = Svfs::mount(MountOptions::new().with_image(&image), mounts).unwrap();
    assert_eq!(svfs.index().state(stray as u32).unwrap(), EntryState::Free);
    // Datastore not registered yet: the unlink waits.
    assert_eq!(svfs.index().state(f.ino).unwrap(), EntryState::Deleting);
    assert!(stores[0].exists(Path::new(&fragment(f.ino))));

    svfs.register_datastore(FsKind::Ext4, "/mnt/a").unwrap();
    assert_eq!(svfs.index().state(f.ino).unwrap(), EntryState::Free);
    assert!(!stores[0].exists(Path::new(&fragment(f.ino))));
}

#[test]
fn test_from_config_registers_unverified_directories() {
    let tmp = TempDir::new().unwrap();
    let data = tmp.path().join("data");
    std::fs::create_dir(&data).unwrap();
    let image = tmp.path().join("index.img");

    let config = SvfsConfig::from_toml(&format!(
        r#"
        [[datastore]]
        fstype = "ext4"
        mountpoint = "{}"
        verify = false

        [parameter]
        backing_store = "{}"
        capacity = 64
        "#,
        data.display(),
        image.display()
    ))
    .unwrap();

    let svfs = Svfs::from_config(&config).unwrap();
    assert_eq!(svfs.registry().live_count(), 1);
    let f = svfs.create(ROOT_INO, "f", &CreateOptions::new()).unwrap();
    svfs.write(f.ino, 0, b"on disk", WriteFlags::default()).unwrap();
    svfs.unmount().unwrap();

    assert_eq!(std::fs::read(data.join(fragment(f.ino))).unwrap(), b"on disk");
    assert!(image.exists());
}

// ============================================================================
// Tier 5: concurrent namespace changes
// ============================================================================

#[test]
fn test_directory_replacement_races_creation_without_orphans() {
    let (mounts, _stores) = memory_mounts();
    let svfs = Arc::new(
        Svfs::mount(
            MountOptions::new().with_capacity(1024).with_delay_alloc(true),
            mounts,
        )
        .unwrap(),
    );

    for i in 0..100 {
        let src = format!("src{i}");
        let dst = format!("dst{i}");
        svfs.mkdir(ROOT_INO, &src, &CreateOptions::new()).unwrap();
        let target = svfs.mkdir(ROOT_INO, &dst, &CreateOptions::new()).unwrap();

        let mover = {
            let svfs = Arc::clone(&svfs);
            let (src, dst) = (src.clone(), dst.clone());
            thread::spawn(move || svfs.rename(ROOT_INO, &src, ROOT_INO, &dst))
        };
        let creator = {
            let svfs = Arc::clone(&svfs);
            thread::spawn(move || svfs.create(target.ino, "x", &CreateOptions::new()))
        };
        let renamed = mover.join().unwrap();
        let created = creator.join().unwrap();

        match (&renamed, &created) {
            (Ok(()), Err(_)) => {}
            (Err(VfsError::DirectoryNotEmpty(_)), Ok(file)) => {
                assert_eq!(svfs.resolve(&format!("/{dst}/x")).unwrap(), file.ino);
            }
            other => panic!("round {i}: unexpected outcome {other:?}"),
        }
    }

    for ino in svfs.index().entries_in_state(EntryState::Valid) {
        svfs.reconstruct_path(ino)
            .unwrap_or_else(|e| panic!("inode {ino} lost its ancestry: {e}"));
    }
}

#[test]
fn test_reused_inode_number_never_serves_the_old_file() {
    let (mounts, _stores) = memory_mounts();
    // Root, one filler and one slot that every new file must reuse.
    let svfs = Arc::new(
        Svfs::mount(
            MountOptions::new().with_capacity(3).with_delay_alloc(true),
            mounts,
        )
        .unwrap(),
    );
    svfs.create(ROOT_INO, "filler", &CreateOptions::new()).unwrap();
    let mut current = svfs.create(ROOT_INO, "f", &CreateOptions::new()).unwrap();
    let ino = current.ino;

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let reader = {
        let svfs = Arc::clone(&svfs);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                let _ = svfs.getattr(ino);
                svfs.forget(ino);
            }
        })
    };

    for round in 0..200 {
        svfs.unlink(ROOT_INO, "f").unwrap();
        let next = loop {
            match svfs.create(ROOT_INO, "f", &CreateOptions::new()) {
                Ok(attr) => break attr,
                // The reader may still pin the old inode for a moment.
                Err(VfsError::NoSpace) => thread::yield_now(),
                Err(e) => panic!("round {round}: create failed: {e}"),
            }
        };
        assert_eq!(next.ino, ino);
        assert!(next.generation > current.generation);
        assert_eq!(
            svfs.getattr(ino).unwrap().generation,
            next.generation,
            "round {round}: cached inode belongs to the unlinked file"
        );
        current = next;
    }

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    reader.join().unwrap();
}
