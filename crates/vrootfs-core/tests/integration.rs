//! End-to-end scenarios across the registry, the vnode cache and provider
//! dispatch.

mod common;

use common::TestCore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use vrootfs_core::testing::{MockVfs, RecordingProvider};
use vrootfs_core::vfs::AUTH_CACHE_TTL_DISABLED;
use vrootfs_core::{CoreConfig, Message, MessageType, RootError, RootHandle, Vfs};

#[test]
fn test_repo_registration_lifecycle() {
    let t = TestCore::new();
    let mount = t.vfs.root_mount();
    t.vfs.set_mount_ttl(mount, 30);

    let (h0, provider) = t.register("/repo", 100);
    assert_eq!(h0, RootHandle::from_raw(0));
    assert_eq!(provider.root_path().as_deref(), Some("/repo"));
    assert_eq!(t.vfs.auth_cache_ttl(mount), AUTH_CACHE_TTL_DISABLED);
    assert!(t.core.registry().pid_matches_provider(h0, 100));

    let second = t.core.register_provider_for_path(
        Arc::new(RecordingProvider::new()),
        200,
        "/repo",
    );
    assert!(matches!(second, Err(RootError::Busy { root }) if root == h0));

    t.core.disconnect(h0).unwrap();
    assert_eq!(t.vfs.auth_cache_ttl(mount), 30);
    assert!(!t.core.registry().is_online(h0));
    assert_eq!(t.aborter.aborted(), vec![h0]);

    let msg = Message::new(1, MessageType::HydrateFile, 7, "cat", Some("/repo/f")).unwrap();
    let err = t.core.send_message(h0, &msg).unwrap_err();
    assert_eq!(err.to_errno(), libc::EIO);
}

#[test]
fn test_walk_stops_at_cached_root() {
    let t = TestCore::new();
    let (h0, _provider) = t.register("/repo", 1);
    let repo = t.vfs.vnode_at("/repo").unwrap();
    let file = t.vfs.create_file("/repo/a/b.txt");
    let a = t.vfs.vnode_at("/repo/a").unwrap();

    assert_eq!(t.core.find_root(file, None, RootHandle::NONE), h0);
    assert_eq!(t.vfs.xattr_reads(repo), 0);
    assert_eq!(t.core.cache().lookup(a).unwrap().root, h0);
    assert_eq!(t.core.cache().lookup(file).unwrap().root, h0);
}

#[test]
fn test_registration_updates_cached_descendants() {
    let t = TestCore::new();
    let file = t.vfs.create_file("/repo/src/main.rs");
    let src = t.vfs.vnode_at("/repo/src").unwrap();
    assert_eq!(t.core.find_root(src, None, RootHandle::NONE), RootHandle::NONE);
    assert_eq!(t.core.cache().lookup(src).unwrap().root, RootHandle::NONE);

    let (h0, _provider) = t.register("/repo", 1);
    assert_eq!(t.core.find_root(src, None, RootHandle::NONE), h0);
    assert_eq!(t.core.find_root(file, None, RootHandle::NONE), h0);
    assert_eq!(t.core.find_root(file, Some(src), RootHandle::NONE), h0);
}

#[test]
fn test_marker_added_under_cached_chain() {
    let t = TestCore::new();
    let file = t.vfs.create_file("/proj/src/main.c");
    let src = t.vfs.vnode_at("/proj/src").unwrap();
    assert_eq!(t.core.find_root(file, None, RootHandle::NONE), RootHandle::NONE);

    // Marking alone is not noticed while the chain is cached.
    let proj = t.vfs.vnode_at("/proj").unwrap();
    t.vfs.mark_as_root(proj);
    assert_eq!(t.core.find_root(file, None, RootHandle::NONE), RootHandle::NONE);
    assert_eq!(t.core.cache().lookup(src).unwrap().root, RootHandle::NONE);

    // Any cache reset brings it in, here the registration of another root.
    t.register("/elsewhere", 1);
    let handle = t.core.find_root(file, None, RootHandle::NONE);
    assert!(handle.is_valid());
    assert!(!t.core.registry().is_online(handle));
    assert_eq!(t.core.registry().root_info(handle).unwrap().path, "/proj");
    assert_eq!(t.core.find_root(src, None, RootHandle::NONE), handle);
}

#[test]
fn test_file_outside_roots() {
    let t = TestCore::new();
    t.register("/repo", 1);
    let file = t.vfs.create_file("/tmp/x.txt");
    let tmp = t.vfs.vnode_at("/tmp").unwrap();

    assert_eq!(t.core.find_root(file, None, RootHandle::NONE), RootHandle::NONE);
    assert!(t.core.cache().lookup(file).is_none());
    assert_eq!(t.core.cache().lookup(tmp).unwrap().root, RootHandle::NONE);
}

#[test]
fn test_repeated_lookup_reads_no_xattrs() {
    let t = TestCore::new();
    let (h0, _provider) = t.register("/repo", 1);
    let dir = t.vfs.create_dir("/repo/src/deep");

    assert_eq!(t.core.find_root(dir, None, h0), h0);
    let reads = t.vfs.total_xattr_reads();
    for _ in 0..10 {
        assert_eq!(t.core.find_root(dir, None, h0), h0);
    }
    assert_eq!(t.vfs.total_xattr_reads(), reads);
    assert_eq!(t.core.cache().stats().fast_path_hits, 10);
}

#[test]
fn test_recycled_vnode_is_a_miss() {
    let t = TestCore::new();
    let (h0, _provider) = t.register("/repo", 1);
    let file = t.vfs.create_file("/repo/old.txt");
    assert_eq!(t.core.find_root(file, None, h0), h0);

    t.vfs.recycle(file, "/tmp/unrelated.txt", false);
    assert_eq!(t.core.find_root(file, None, RootHandle::NONE), RootHandle::NONE);
    assert!(t.core.cache().lookup(file).is_none());
}

#[test]
fn test_offline_root_survives_reload() {
    let t = TestCore::new();
    let proj = t.vfs.create_dir("/proj");
    t.vfs.mark_as_root(proj);
    let file = t.vfs.create_file("/proj/main.c");

    let handle = t.core.find_root(file, None, RootHandle::NONE);
    assert!(handle.is_valid());
    assert!(!t.core.registry().is_online(handle));

    let fresh = t.vfs.reload("/proj").unwrap();
    t.core.reset_cache_from_registry();
    assert_eq!(t.core.find_root(fresh, None, RootHandle::NONE), handle);
    assert_eq!(t.core.registry().root_count(), 1);

    // Attaching a provider reuses the detected slot.
    let provider = Arc::new(RecordingProvider::new());
    let attached = t
        .core
        .register_provider_for_path(provider, 42, "/proj")
        .unwrap();
    assert_eq!(attached, handle);
    assert!(t.core.registry().is_online(handle));
}

#[test]
fn test_registry_growth_keeps_handles() {
    let config = CoreConfig {
        initial_root_capacity: 2,
        ..CoreConfig::default()
    };
    let t = TestCore::with_config(config);

    let mut handles = Vec::new();
    for i in 0..5 {
        let path = format!("/roots/r{}", i);
        let (handle, _provider) = t.register(&path, 1000 + i);
        handles.push((handle, path));
    }

    assert!(t.core.registry().capacity() >= 5);
    for (i, (handle, path)) in handles.iter().enumerate() {
        let info = t.core.registry().root_info(*handle).unwrap();
        assert_eq!(&info.path, path);
        assert_eq!(info.provider_pid, 1000 + i as i32);
        assert!(info.online);
    }
}

#[test]
fn test_messages_reach_the_right_provider() {
    let t = TestCore::new();
    let (ha, pa) = t.register("/a", 1);
    let (hb, pb) = t.register("/b", 2);

    let msg = Message::new(9, MessageType::NotifyFileCreated, 77, "touch", Some("/b/new")).unwrap();
    t.core.send_message(hb, &msg).unwrap();

    assert!(pa.messages().is_empty());
    let sent = pb.messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(Message::from_bytes(&sent[0]).unwrap(), msg);

    assert_eq!(
        t.core.registry().root_relative_path(ha, "/a/x/y").unwrap(),
        "x/y"
    );
}

#[test]
fn test_cache_growth_under_memory_pressure() {
    let config = CoreConfig {
        expected_vnodes: 16,
        cache_capacity_divisor: 1,
        ..CoreConfig::default()
    };
    let t = TestCore::with_config(config);
    let (h0, _provider) = t.register("/repo", 1);
    t.allocator.set_nowait_fails(true);

    let files: Vec<_> = (0..40)
        .map(|i| t.vfs.create_file(&format!("/repo/dir{}/file.txt", i)))
        .collect();
    for file in &files {
        assert_eq!(t.core.find_root(*file, None, RootHandle::NONE), h0);
    }

    assert!(t.core.cache().capacity() >= 128);
    assert!(t.core.cache().stats().deferred_grows > 0);
    for file in &files {
        assert_eq!(t.core.cache().lookup(*file).unwrap().root, h0);
    }
}

#[test]
fn test_lookups_during_provider_churn() {
    let t = Arc::new(TestCore::new());
    let (h0, _provider) = t.register("/repo", 1);
    let files: Arc<Vec<_>> = Arc::new(
        (0..32)
            .map(|i| t.vfs.create_file(&format!("/repo/d{}/e{}/f.txt", i % 4, i)))
            .collect(),
    );
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let t = Arc::clone(&t);
            let files = Arc::clone(&files);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    for file in files.iter() {
                        assert_eq!(t.core.find_root(*file, None, h0), h0);
                    }
                }
            })
        })
        .collect();

    for round in 0..50 {
        t.core.disconnect(h0).unwrap();
        let handle = t
            .core
            .register_provider_for_path(Arc::new(RecordingProvider::new()), 2 + round, "/repo")
            .unwrap();
        assert_eq!(handle, h0);
    }
    stop.store(true, Ordering::SeqCst);
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(t.core.registry().root_count(), 1);
    assert_eq!(t.core.registry().suppressed_mount_count(files[0]), 1);
}

#[test]
fn test_teardown_releases_everything() {
    let t = TestCore::new();
    let baseline = t.vfs.total_refs();
    t.register("/a", 1);
    t.register("/b", 2);
    let file = t.vfs.create_file("/a/deep/file");
    t.core.find_root(file, None, RootHandle::NONE);

    t.core.teardown();
    assert_eq!(t.vfs.total_refs(), baseline);
    assert_eq!(
        t.vfs.auth_cache_ttl(t.vfs.root_mount()),
        MockVfs::DEFAULT_AUTH_CACHE_TTL
    );
    assert_eq!(t.core.registry().root_count(), 0);
    assert!(t.core.cache().is_empty());
}
