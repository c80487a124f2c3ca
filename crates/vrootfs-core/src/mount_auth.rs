//! Per-mount suppression of the kernel authorization cache.
//!
//! While at least one online root lives on a mount, cached authorization
//! decisions must not bypass the access checks of the interception layer,
//! so the mount's auth-cache TTL is forced to zero. The previous TTL is
//! saved on the first suppression and restored on the last release.
//!
//! The suppressor is owned by the root registry state and only touched under
//! the registry's exclusive lock.

use crate::types::MountId;
use crate::vfs::{Vfs, AUTH_CACHE_TTL_DISABLED, AUTH_CACHE_TTL_INFINITE};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsedMountPoint {
    pub mount: MountId,
    pub disable_count: u32,
    pub saved_ttl: i32,
}

#[derive(Debug)]
pub struct MountAuthCacheSuppressor {
    used: Vec<UsedMountPoint>,
    max_tracked: usize,
}

impl MountAuthCacheSuppressor {
    pub fn new(max_tracked: usize) -> Self {
        Self {
            used: Vec::new(),
            max_tracked,
        }
    }

    fn position(&self, mount: MountId) -> Option<usize> {
        self.used.iter().position(|u| u.mount == mount)
    }

    /// Current suppression count of `mount`; 0 for untracked mounts.
    pub fn disable_count(&self, mount: MountId) -> u32 {
        self.position(mount)
            .map_or(0, |index| self.used[index].disable_count)
    }

    pub fn tracked_mounts(&self) -> usize {
        self.used.len()
    }

    fn track(&mut self, mount: MountId) -> Option<usize> {
        if let Some(index) = self.position(mount) {
            return Some(index);
        }
        if self.used.len() >= self.max_tracked || self.used.try_reserve(1).is_err() {
            return None;
        }
        self.used.push(UsedMountPoint {
            mount,
            disable_count: 0,
            saved_ttl: AUTH_CACHE_TTL_DISABLED,
        });
        Some(self.used.len() - 1)
    }

    /// Adds one suppression reference for `mount`.
    ///
    /// When the mount cannot be tracked, the cache is disabled anyway and
    /// the previous TTL is lost.
    pub fn increment(&mut self, vfs: &dyn Vfs, mount: MountId) {
        let Some(index) = self.track(mount) else {
            info!(
                "mount_auth: cannot track mount '{}', disabling auth cache without saving previous value",
                vfs.mount_name(mount)
            );
            vfs.set_auth_cache_ttl(mount, AUTH_CACHE_TTL_DISABLED);
            return;
        };

        let used = &mut self.used[index];
        if used.disable_count == 0 {
            used.saved_ttl = vfs.auth_cache_ttl(mount);
            vfs.set_auth_cache_ttl(mount, AUTH_CACHE_TTL_DISABLED);
            debug!(
                "mount_auth: disabling auth cache on mount '{}', saved TTL = {}",
                vfs.mount_name(mount),
                used.saved_ttl
            );
        }
        used.disable_count += 1;
    }

    /// Drops one suppression reference; the last one restores the TTL.
    pub fn decrement(&mut self, vfs: &dyn Vfs, mount: MountId) {
        let Some(index) = self.position(mount) else {
            info!(
                "mount_auth: mount '{}' not found in table",
                vfs.mount_name(mount)
            );
            return;
        };

        let used = &mut self.used[index];
        if used.disable_count == 0 {
            info!(
                "mount_auth: mount '{}' already has use count of 0",
                vfs.mount_name(mount)
            );
            return;
        }

        used.disable_count -= 1;
        if used.disable_count == 0 {
            let saved = *used;
            self.used.swap_remove(index);
            Self::restore(vfs, &saved);
        }
    }

    fn restore(vfs: &dyn Vfs, used: &UsedMountPoint) {
        if used.saved_ttl == AUTH_CACHE_TTL_INFINITE {
            debug!(
                "mount_auth: resetting mount '{}' to default auth cache behaviour",
                vfs.mount_name(used.mount)
            );
            vfs.clear_auth_cache_ttl(used.mount);
        } else {
            debug!(
                "mount_auth: resetting mount '{}' TTL to {}",
                vfs.mount_name(used.mount),
                used.saved_ttl
            );
            vfs.set_auth_cache_ttl(used.mount, used.saved_ttl);
        }
    }

    /// Restores every tracked mount regardless of its count. Used on
    /// teardown.
    pub fn restore_all(&mut self, vfs: &dyn Vfs) {
        for used in self.used.drain(..) {
            if used.disable_count > 0 {
                Self::restore(vfs, &used);
            }
        }
    }
}
