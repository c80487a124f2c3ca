//! Collaborator interfaces consumed by the core.
//!
//! The filesystem primitives, the allocation primitives, the provider
//! connection and the interception layer all live outside this crate. They
//! are reached only through the traits below, so the registry and the cache
//! can run against the kernel glue or against the in-memory doubles in
//! [`crate::testing`].

use crate::types::{FsidInode, MountId, RootHandle, Vid, VnodeId};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Auth-cache TTL meaning "cache forever"; restoring it clears the override.
pub const AUTH_CACHE_TTL_INFINITE: i32 = -1;
/// Auth-cache TTL that disables cached authorization decisions.
pub const AUTH_CACHE_TTL_DISABLED: i32 = 0;

/// Errno reported by [`Vfs::read_xattr`] when the attribute does not exist.
#[cfg(target_os = "macos")]
pub const ENOATTR: i32 = libc::ENOATTR;
/// Errno reported by [`Vfs::read_xattr`] when the attribute does not exist.
#[cfg(not(target_os = "macos"))]
pub const ENOATTR: i32 = libc::ENODATA;

/// Filesystem primitive layer.
///
/// Reference counting mirrors the kernel's iocount: [`Vfs::lookup`] and
/// [`Vfs::parent`] hand out a retained vnode which the caller must pass to
/// [`Vfs::release`] exactly once.
pub trait Vfs: Send + Sync {
    /// Current generation stamp of the vnode identity.
    fn vid(&self, vnode: VnodeId) -> Vid;

    fn is_dir(&self, vnode: VnodeId) -> bool;

    /// Retained parent directory, or `None` at the filesystem root.
    fn parent(&self, vnode: VnodeId) -> Option<VnodeId>;

    fn retain(&self, vnode: VnodeId);

    fn release(&self, vnode: VnodeId);

    /// Canonical absolute path of the vnode.
    fn path(&self, vnode: VnodeId) -> io::Result<String>;

    /// Resolves an absolute path to a retained vnode.
    fn lookup(&self, path: &str) -> io::Result<VnodeId>;

    /// Volume id and inode number (getattr).
    fn persistent_id(&self, vnode: VnodeId) -> io::Result<FsidInode>;

    fn read_xattr(&self, vnode: VnodeId, name: &str) -> io::Result<Vec<u8>>;

    fn mount_of(&self, vnode: VnodeId) -> MountId;

    /// Whether the vnode is the root directory of its mount.
    fn is_mount_root(&self, vnode: VnodeId) -> bool;

    /// Filesystem type name of the mount, e.g. `apfs`.
    fn fs_type_name(&self, mount: MountId) -> String;

    /// Mounted-on path, for diagnostics.
    fn mount_name(&self, mount: MountId) -> String;

    fn auth_cache_ttl(&self, mount: MountId) -> i32;

    fn set_auth_cache_ttl(&self, mount: MountId, ttl: i32);

    /// Returns the mount to the system's default auth-cache behaviour.
    fn clear_auth_cache_ttl(&self, mount: MountId);
}

/// Memory allocation primitives.
///
/// Callers pair every successful `alloc`/`alloc_nowait` with a `free` of the
/// same size.
pub trait Allocator: Send + Sync {
    /// Blocking allocation; only fails on hard exhaustion.
    fn alloc(&self, bytes: usize) -> bool;

    /// Allocation that must not sleep; may fail under memory pressure.
    fn alloc_nowait(&self, bytes: usize) -> bool;

    fn free(&self, bytes: usize);
}

/// Allocator backed by the process heap that accounts outstanding bytes.
#[derive(Debug, Default)]
pub struct SystemAllocator {
    outstanding: AtomicUsize,
}

impl SystemAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }
}

impl Allocator for SystemAllocator {
    fn alloc(&self, bytes: usize) -> bool {
        self.outstanding.fetch_add(bytes, Ordering::Relaxed);
        true
    }

    fn alloc_nowait(&self, bytes: usize) -> bool {
        self.alloc(bytes)
    }

    fn free(&self, bytes: usize) {
        self.outstanding.fetch_sub(bytes, Ordering::Relaxed);
    }
}

/// A connection to a content provider process.
///
/// Shared as `Arc<dyn Provider>`; the registry clones the `Arc` before
/// dropping its lock so a send never races with disconnection.
pub trait Provider: Send + Sync {
    fn send_message(&self, message: &[u8]) -> io::Result<()>;

    /// Informs the provider of the canonical path it was registered for.
    fn set_root_path(&self, _path: &str) {}
}

/// The access-control interception layer, as seen from the registry.
pub trait EventAborter: Send + Sync {
    /// Fails every event still waiting on the provider of `root`.
    ///
    /// Called from `RootRegistry::disconnect` with the registry held shared.
    /// Writers are kept out until this returns, and a queued writer blocks
    /// new readers, so implementations must not call back into the registry
    /// or the vnode cache.
    fn abort_outstanding_events_for_provider(&self, root: RootHandle);
}
