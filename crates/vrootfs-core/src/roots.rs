//! Registry of virtualization roots.
//!
//! Every root the core has seen occupies one slot of a growable table, and
//! its [`RootHandle`] is the slot index. A root is online while a provider
//! is attached and offline otherwise. Offline roots are found lazily through
//! the root-marker xattr and are never removed, so a handle stays valid for
//! the registry's lifetime.
//!
//! Locking: one [`RwLock`] guards the table and the mount suppression map.
//! It is never held across xattr reads, path resolution, provider sends or
//! vnode releases.

use crate::config::CoreConfig;
use crate::error::{Result, RootError};
use crate::message::Message;
use crate::mount_auth::MountAuthCacheSuppressor;
use crate::sync::RwLock;
use crate::types::{FsidInode, Pid, RootHandle, RootVnode, VersionedVnode, Vid, VnodeId};
use crate::vfs::{EventAborter, Provider, Vfs, ENOATTR};
use crate::xattr::RootMarker;
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Default)]
struct VirtualizationRoot {
    in_use: bool,
    /// `None` for an offline root.
    provider: Option<Arc<dyn Provider>>,
    provider_pid: Pid,
    /// Retained while online. Offline, this may be stale and is only
    /// trusted together with `root_vid`.
    root_vnode: Option<VnodeId>,
    root_vid: Vid,
    persistent_id: FsidInode,
    path: String,
}

impl VirtualizationRoot {
    fn is_online(&self) -> bool {
        self.in_use && self.provider.is_some()
    }
}

/// Diagnostic snapshot of one registry slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootInfo {
    pub handle: RootHandle,
    pub online: bool,
    pub provider_pid: Pid,
    pub persistent_id: FsidInode,
    pub path: String,
}

enum RootMatch {
    /// The slot's vnode and generation match.
    Current(usize),
    /// Only the persistent identity matches; the slot's vnode is outdated.
    Recycled(usize),
    Missing,
}

struct RegistryState {
    roots: Vec<VirtualizationRoot>,
    mounts: MountAuthCacheSuppressor,
}

fn handle_for(index: usize) -> RootHandle {
    RootHandle::from_index(index).unwrap_or(RootHandle::NONE)
}

impl RegistryState {
    fn slot(&self, handle: RootHandle) -> Option<&VirtualizationRoot> {
        handle
            .index()
            .and_then(|index| self.roots.get(index))
            .filter(|root| root.in_use)
    }

    fn slot_mut(&mut self, handle: RootHandle) -> Option<&mut VirtualizationRoot> {
        handle
            .index()
            .and_then(|index| self.roots.get_mut(index))
            .filter(|root| root.in_use)
    }

    fn match_root(&self, vnode: VnodeId, vid: Vid, id: FsidInode) -> RootMatch {
        for (index, root) in self.roots.iter().enumerate() {
            if !root.in_use {
                continue;
            }
            if root.root_vnode == Some(vnode) && root.root_vid == vid {
                if root.persistent_id.fsid != id.fsid {
                    error!(
                        "roots: root {} matched by vnode but fsid differs ({} vs {})",
                        index, root.persistent_id, id
                    );
                }
                return RootMatch::Current(index);
            }
            if root.persistent_id == id {
                return RootMatch::Recycled(index);
            }
        }
        RootMatch::Missing
    }

    /// Points an offline slot at the live vnode of its directory. An online
    /// slot keeps its retained vnode.
    fn refresh_vnode(&mut self, index: usize, vnode: VnodeId, vid: Vid) {
        if let Some(root) = self.roots.get_mut(index) {
            if root.in_use && root.provider.is_none() {
                root.root_vnode = Some(vnode);
                root.root_vid = vid;
            }
        }
    }

    fn find_unused_or_grow(&mut self) -> Option<usize> {
        if let Some(index) = self.roots.iter().position(|root| !root.in_use) {
            return Some(index);
        }

        let old_len = self.roots.len();
        let new_len = old_len.saturating_mul(2).min(RootHandle::MAX_ROOTS);
        if new_len <= old_len {
            return None;
        }
        if self.roots.try_reserve_exact(new_len - old_len).is_err() {
            return None;
        }
        self.roots.resize_with(new_len, VirtualizationRoot::default);
        debug!("roots: grew table from {} to {} slots", old_len, new_len);
        Some(old_len)
    }

    fn insert_root(
        &mut self,
        provider: Option<Arc<dyn Provider>>,
        pid: Pid,
        vnode: VnodeId,
        vid: Vid,
        id: FsidInode,
        path: String,
    ) -> Option<RootHandle> {
        let index = self.find_unused_or_grow()?;
        self.roots[index] = VirtualizationRoot {
            in_use: true,
            provider,
            provider_pid: pid,
            root_vnode: Some(vnode),
            root_vid: vid,
            persistent_id: id,
            path,
        };
        Some(handle_for(index))
    }
}

pub struct RootRegistry {
    state: RwLock<RegistryState>,
    vfs: Arc<dyn Vfs>,
    aborter: Arc<dyn EventAborter>,
    config: CoreConfig,
}

impl RootRegistry {
    pub fn new(
        config: &CoreConfig,
        vfs: Arc<dyn Vfs>,
        aborter: Arc<dyn EventAborter>,
    ) -> Result<Self> {
        let capacity = config
            .initial_root_capacity
            .clamp(1, RootHandle::MAX_ROOTS);
        let mut roots = Vec::new();
        roots
            .try_reserve_exact(capacity)
            .map_err(|_| RootError::ResourceExhausted)?;
        roots.resize_with(capacity, VirtualizationRoot::default);

        Ok(Self {
            state: RwLock::new(RegistryState {
                roots,
                mounts: MountAuthCacheSuppressor::new(config.max_tracked_mounts),
            }),
            vfs,
            aborter,
            config: config.clone(),
        })
    }

    /// Looks `vnode` up among the known roots and, failing that, checks it
    /// for the root marker. A newly marked directory is inserted as an
    /// offline root. Returns [`RootHandle::NONE`] when `vnode` is not a root.
    pub fn find_or_detect_root(&self, vnode: VnodeId, persistent_id: FsidInode) -> RootHandle {
        let vid = self.vfs.vid(vnode);

        {
            let shared = self.state.read();
            let found = shared.match_root(vnode, vid, persistent_id);
            match found {
                RootMatch::Current(index) => return handle_for(index),
                RootMatch::Recycled(index) => {
                    // Best effort: a lost upgrade leaves the stale vnode.
                    if let Some(mut exclusive) = shared.try_upgrade() {
                        exclusive.refresh_vnode(index, vnode, vid);
                    }
                    return handle_for(index);
                }
                RootMatch::Missing => {}
            }
        }

        if !self.has_root_marker(vnode) {
            return RootHandle::NONE;
        }

        let path = match self.vfs.path(vnode) {
            Ok(path) => path,
            Err(err) => {
                info!("roots: getpath failed for detected root {}: {}", vnode, err);
                String::new()
            }
        };

        let mut state = self.state.write();
        // Another thread may have inserted the root in the meantime.
        match state.match_root(vnode, vid, persistent_id) {
            RootMatch::Current(index) => handle_for(index),
            RootMatch::Recycled(index) => {
                state.refresh_vnode(index, vnode, vid);
                handle_for(index)
            }
            RootMatch::Missing => {
                match state.insert_root(None, 0, vnode, vid, persistent_id, path.clone()) {
                    Some(handle) => {
                        info!("roots: detected offline root {} at '{}'", handle, path);
                        handle
                    }
                    None => {
                        error!("roots: no free slot for detected root at '{}'", path);
                        RootHandle::NONE
                    }
                }
            }
        }
    }

    /// [`RootRegistry::find_or_detect_root`] for a vnode whose persistent
    /// identity is not known yet.
    pub fn detect_root_at(&self, vnode: VnodeId) -> RootHandle {
        match self.vfs.persistent_id(vnode) {
            Ok(id) => self.find_or_detect_root(vnode, id),
            Err(err) => {
                crate::vnode_error!(
                    self.vfs.as_ref(),
                    vnode,
                    "roots: getattr failed during root detection: {}",
                    err
                );
                RootHandle::NONE
            }
        }
    }

    fn has_root_marker(&self, vnode: VnodeId) -> bool {
        match self.vfs.read_xattr(vnode, &self.config.root_xattr_name) {
            Ok(value) => {
                if let Err(err) = RootMarker::decode(&value) {
                    crate::vnode_info!(
                        self.vfs.as_ref(),
                        vnode,
                        "roots: root marker present but malformed ({}), treating as root",
                        err
                    );
                }
                true
            }
            Err(err) if err.raw_os_error() == Some(ENOATTR) => false,
            Err(err) => {
                crate::vnode_debug!(
                    self.vfs.as_ref(),
                    vnode,
                    "roots: root marker read failed: {}",
                    err
                );
                false
            }
        }
    }

    /// Walks from `vnode` towards the root of its mount without the vnode
    /// cache, returning the first root found.
    ///
    /// The mount root is checked but never crossed.
    pub fn find_root_for_vnode(&self, vnode: VnodeId) -> RootHandle {
        let mut current = vnode;
        self.vfs.retain(current);
        loop {
            let handle = self.detect_root_at(current);
            if handle != RootHandle::NONE || self.vfs.is_mount_root(current) {
                self.vfs.release(current);
                return handle;
            }
            let parent = self.vfs.parent(current);
            self.vfs.release(current);
            match parent {
                Some(parent) => current = parent,
                None => return RootHandle::NONE,
            }
        }
    }

    /// Attaches `provider` to the root directory at `path`, creating the
    /// root if it is not known yet.
    ///
    /// The looked-up vnode reference is kept by the slot on success and
    /// released otherwise.
    pub fn register_provider_for_path(
        &self,
        provider: Arc<dyn Provider>,
        pid: Pid,
        path: &str,
    ) -> Result<RootHandle> {
        let vnode = self
            .vfs
            .lookup(path)
            .map_err(|source| RootError::PathNotFound {
                path: path.to_string(),
                source,
            })?;

        let result = self.register_vnode(&provider, pid, vnode, path);
        if let Err(err) = &result {
            debug!("roots: registration for '{}' failed: {}", path, err);
            self.vfs.release(vnode);
        }
        result
    }

    fn register_vnode(
        &self,
        provider: &Arc<dyn Provider>,
        pid: Pid,
        vnode: VnodeId,
        requested_path: &str,
    ) -> Result<RootHandle> {
        let mount = self.vfs.mount_of(vnode);
        let fs_type = self.vfs.fs_type_name(mount);
        if !self.config.is_allowed_filesystem(&fs_type) {
            return Err(RootError::DisallowedFilesystem { fs_type });
        }
        if !self.vfs.is_dir(vnode) {
            return Err(RootError::NotDirectory {
                path: requested_path.to_string(),
            });
        }

        let canonical = self
            .vfs
            .path(vnode)
            .map_err(|source| RootError::Vfs {
                op: "getpath",
                source,
            })?;
        let id = self
            .vfs
            .persistent_id(vnode)
            .map_err(|source| RootError::Vfs {
                op: "getattr",
                source,
            })?;
        let vid = self.vfs.vid(vnode);

        let handle = {
            let mut state = self.state.write();
            let handle = match state.match_root(vnode, vid, id) {
                RootMatch::Current(index) | RootMatch::Recycled(index) => {
                    let handle = handle_for(index);
                    let root = &mut state.roots[index];
                    if root.provider.is_some() {
                        return Err(RootError::Busy { root: handle });
                    }
                    root.provider = Some(Arc::clone(provider));
                    root.provider_pid = pid;
                    root.root_vnode = Some(vnode);
                    root.root_vid = vid;
                    root.path = canonical.clone();
                    info!("roots: provider {} reattached to root {} at '{}'", pid, handle, canonical);
                    handle
                }
                RootMatch::Missing => {
                    let inserted = state.insert_root(
                        Some(Arc::clone(provider)),
                        pid,
                        vnode,
                        vid,
                        id,
                        canonical.clone(),
                    );
                    match inserted {
                        Some(handle) => {
                            info!(
                                "roots: new root {} for provider {} at '{}'",
                                handle, pid, canonical
                            );
                            handle
                        }
                        None => {
                            error!("roots: failed to insert new root at '{}'", canonical);
                            return Err(RootError::ResourceExhausted);
                        }
                    }
                }
            };
            state.mounts.increment(self.vfs.as_ref(), mount);
            handle
        };

        provider.set_root_path(&canonical);
        Ok(handle)
    }

    /// Detaches the provider of `handle`, turning the root offline.
    ///
    /// Outstanding events for the provider are aborted under the shared lock;
    /// the provider and the root vnode are released after the lock is gone.
    pub fn disconnect(&self, handle: RootHandle) -> Result<()> {
        let mut state = self.state.write();
        let Some(root) = state.slot_mut(handle) else {
            error!("roots: disconnect of invalid root handle {}", handle);
            return Err(RootError::InvalidHandle { root: handle });
        };
        let Some(provider) = root.provider.take() else {
            error!("roots: disconnect of root {} without provider", handle);
            return Err(RootError::NoProvider { root: handle });
        };
        root.provider_pid = 0;
        let root_vnode = root.root_vnode;

        if let Some(vnode) = root_vnode {
            let mount = self.vfs.mount_of(vnode);
            state.mounts.decrement(self.vfs.as_ref(), mount);
        }

        let shared = state.downgrade();
        self.aborter.abort_outstanding_events_for_provider(handle);
        drop(shared);

        if let Some(vnode) = root_vnode {
            self.vfs.release(vnode);
        }
        drop(provider);
        info!("roots: root {} is offline", handle);
        Ok(())
    }

    /// Sends `message` to the provider attached to `handle`.
    pub fn send_message(&self, handle: RootHandle, message: &Message) -> Result<()> {
        let provider = {
            let state = self.state.read();
            state.slot(handle).and_then(|root| root.provider.clone())
        };
        let Some(provider) = provider else {
            return Err(RootError::NoProvider { root: handle });
        };

        let bytes = message.to_bytes()?;
        provider.send_message(&bytes)?;
        Ok(())
    }

    pub fn is_online(&self, handle: RootHandle) -> bool {
        let state = self.state.read();
        state.slot(handle).is_some_and(VirtualizationRoot::is_online)
    }

    pub fn pid_matches_provider(&self, handle: RootHandle, pid: Pid) -> bool {
        let state = self.state.read();
        state
            .slot(handle)
            .is_some_and(|root| root.is_online() && root.provider_pid == pid)
    }

    pub fn is_valid_root_handle(&self, handle: RootHandle) -> bool {
        handle.is_valid()
    }

    pub fn vnode_is_on_allowed_filesystem(&self, vnode: VnodeId) -> bool {
        let fs_type = self.vfs.fs_type_name(self.vfs.mount_of(vnode));
        self.config.is_allowed_filesystem(&fs_type)
    }

    /// Strips the root's path from `path`. An exact match yields `""`.
    pub fn root_relative_path(&self, handle: RootHandle, path: &str) -> Result<String> {
        let state = self.state.read();
        let Some(root) = state.slot(handle) else {
            error!("roots: relative path requested for invalid root {}", handle);
            return Err(RootError::InvalidHandle { root: handle });
        };
        relative_to(&root.path, path).map(str::to_string)
    }

    pub fn root_info(&self, handle: RootHandle) -> Option<RootInfo> {
        let state = self.state.read();
        state.slot(handle).map(|root| RootInfo {
            handle,
            online: root.is_online(),
            provider_pid: root.provider_pid,
            persistent_id: root.persistent_id,
            path: root.path.clone(),
        })
    }

    /// Directory vnode of `handle` with the generation it was recorded at.
    pub fn root_vnode(&self, handle: RootHandle) -> Option<VersionedVnode> {
        let state = self.state.read();
        let root = state.slot(handle)?;
        root.root_vnode.map(|vnode| VersionedVnode::new(vnode, root.root_vid))
    }

    /// Number of slots in use.
    pub fn root_count(&self) -> usize {
        self.state.read().roots.iter().filter(|r| r.in_use).count()
    }

    pub fn capacity(&self) -> usize {
        self.state.read().roots.len()
    }

    /// Root directories of all online roots, for re-seeding the vnode cache.
    pub fn online_root_vnodes(&self) -> Vec<RootVnode> {
        let state = self.state.read();
        state
            .roots
            .iter()
            .enumerate()
            .filter(|(_, root)| root.is_online())
            .filter_map(|(index, root)| {
                root.root_vnode.map(|vnode| RootVnode {
                    vnode,
                    root: handle_for(index),
                })
            })
            .collect()
    }

    pub fn suppressed_mount_count(&self, vnode: VnodeId) -> u32 {
        let mount = self.vfs.mount_of(vnode);
        self.state.read().mounts.disable_count(mount)
    }

    /// Drops every provider and root, releasing retained vnodes and
    /// restoring all suppressed mounts.
    pub fn teardown(&self) {
        let mut retained = Vec::new();
        let mut providers = Vec::new();
        {
            let mut state = self.state.write();
            for root in state.roots.iter_mut() {
                if let Some(provider) = root.provider.take() {
                    providers.push(provider);
                    retained.extend(root.root_vnode);
                }
                *root = VirtualizationRoot::default();
            }
            state.mounts.restore_all(self.vfs.as_ref());
        }

        for vnode in retained {
            self.vfs.release(vnode);
        }
        debug!("roots: teardown dropped {} providers", providers.len());
    }
}

fn relative_to<'a>(root: &str, path: &'a str) -> Result<&'a str> {
    let Some(rest) = path.strip_prefix(root) else {
        error!("roots: root path '{}' is not a prefix of path '{}'", root, path);
        return Err(RootError::NotUnderRoot {
            root_path: root.to_string(),
            path: path.to_string(),
        });
    };

    if let Some(relative) = rest.strip_prefix('/') {
        return Ok(relative);
    }
    if !rest.is_empty() && !root.is_empty() && !root.ends_with('/') {
        error!(
            "roots: root path '{}' is only a string prefix of path '{}'",
            root, path
        );
        return Err(RootError::NotUnderRoot {
            root_path: root.to_string(),
            path: path.to_string(),
        });
    }
    Ok(rest)
}
