//! In-memory collaborators for exercising the core without a kernel.
//!
//! [`MockVfs`] models a path-addressed tree of vnodes spread over mounts,
//! with per-vnode reference counts, generation stamps that change on
//! recycling, extended attributes and injectable primitive failures.

use crate::config::DEFAULT_ROOT_XATTR_NAME;
use crate::types::{Fsid, FsidInode, MountId, RootHandle, Vid, VnodeId};
use crate::vfs::{Allocator, EventAborter, Provider, Vfs, ENOATTR};
use crate::xattr::RootMarker;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Clone)]
struct MockNode {
    path: String,
    mount: MountId,
    is_dir: bool,
    inode: u64,
    vid: Vid,
    xattrs: HashMap<String, Vec<u8>>,
    refs: i64,
    getpath_errno: Option<i32>,
    getattr_errno: Option<i32>,
    xattr_errno: Option<i32>,
}

#[derive(Debug, Clone)]
struct MockMount {
    fsid: Fsid,
    fs_type: String,
    mounted_on: String,
    ttl: Option<i32>,
    ttl_sets: usize,
    ttl_clears: usize,
}

#[derive(Debug, Default)]
struct MockState {
    nodes: HashMap<VnodeId, MockNode>,
    by_path: HashMap<String, VnodeId>,
    aliases: HashMap<String, VnodeId>,
    mounts: HashMap<MountId, MockMount>,
    lookup_errnos: HashMap<String, i32>,
    xattr_reads: HashMap<VnodeId, usize>,
    next_vnode: u64,
    next_inode: u64,
    next_mount: u64,
}

fn normalize(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

fn parent_path(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.rsplit_once('/') {
        Some(("", _)) => Some(String::from("/")),
        Some((head, _)) => Some(head.to_string()),
        None => None,
    }
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

impl MockState {
    fn alloc_vnode(&mut self) -> VnodeId {
        self.next_vnode += 1;
        // Identities are spread out so they do not look like small indices.
        VnodeId::from(NonZeroU64::MIN.saturating_add(0x1000 + self.next_vnode * 0x40))
    }

    fn alloc_inode(&mut self) -> u64 {
        self.next_inode += 1;
        self.next_inode + 1
    }

    fn add_mount(&mut self, fs_type: &str, mounted_on: &str) -> MountId {
        self.next_mount += 1;
        let id = MountId::new(self.next_mount);
        let fsid_raw = 0x0100_0000 + self.next_mount as i32;
        self.mounts.insert(
            id,
            MockMount {
                fsid: Fsid([fsid_raw, 0x1a]),
                fs_type: fs_type.to_string(),
                mounted_on: mounted_on.to_string(),
                ttl: None,
                ttl_sets: 0,
                ttl_clears: 0,
            },
        );
        id
    }

    fn mount_for_new_path(&self, path: &str, parent_mount: Option<MountId>) -> MountId {
        self.mounts
            .iter()
            .find(|(_, m)| m.mounted_on == path)
            .map(|(id, _)| *id)
            .or(parent_mount)
            .unwrap_or_else(|| MountId::new(1))
    }

    fn create(&mut self, path: &str, is_dir: bool) -> VnodeId {
        let path = normalize(path);
        if let Some(existing) = self.by_path.get(&path) {
            return *existing;
        }
        let parent_mount = parent_path(&path).and_then(|parent| {
            let parent = self.create(&parent, true);
            self.node(parent).map(|n| n.mount)
        });
        let mount = self.mount_for_new_path(&path, parent_mount);
        let vnode = self.alloc_vnode();
        let inode = self.alloc_inode();
        self.nodes.insert(
            vnode,
            MockNode {
                path: path.clone(),
                mount,
                is_dir,
                inode,
                vid: 1,
                xattrs: HashMap::new(),
                refs: 0,
                getpath_errno: None,
                getattr_errno: None,
                xattr_errno: None,
            },
        );
        self.by_path.insert(path, vnode);
        vnode
    }

    fn node(&self, vnode: VnodeId) -> Option<&MockNode> {
        self.nodes.get(&vnode)
    }

    fn node_mut(&mut self, vnode: VnodeId) -> Option<&mut MockNode> {
        self.nodes.get_mut(&vnode)
    }
}

/// In-memory filesystem primitive layer.
///
/// Starts with a single `apfs` mount holding `/`. Missing ancestors are
/// created as directories on demand.
pub struct MockVfs {
    state: Mutex<MockState>,
    root_mount: MountId,
}

impl MockVfs {
    /// Auth-cache TTL reported by mounts that have no override set.
    pub const DEFAULT_AUTH_CACHE_TTL: i32 = 2;

    pub fn new() -> Self {
        let mut state = MockState::default();
        let root_mount = state.add_mount("apfs", "/");
        state.create("/", true);
        Self {
            state: Mutex::new(state),
            root_mount,
        }
    }

    pub fn root_mount(&self) -> MountId {
        self.root_mount
    }

    /// Mounts a new volume of `fs_type` at `mounted_on`.
    pub fn add_mount(&self, fs_type: &str, mounted_on: &str) -> MountId {
        let mounted_on = normalize(mounted_on);
        let mut state = self.state.lock();
        let mount = state.add_mount(fs_type, &mounted_on);
        let vnode = state.create(&mounted_on, true);
        if let Some(node) = state.node_mut(vnode) {
            node.mount = mount;
        }
        mount
    }

    pub fn create_dir(&self, path: &str) -> VnodeId {
        self.state.lock().create(path, true)
    }

    pub fn create_file(&self, path: &str) -> VnodeId {
        self.state.lock().create(path, false)
    }

    /// Makes `alias` resolve to `target` through `lookup`, like a symlink.
    pub fn add_alias(&self, alias: &str, target: VnodeId) {
        self.state.lock().aliases.insert(normalize(alias), target);
    }

    pub fn vnode_at(&self, path: &str) -> Option<VnodeId> {
        self.state.lock().by_path.get(&normalize(path)).copied()
    }

    pub fn set_xattr(&self, vnode: VnodeId, name: &str, value: &[u8]) {
        if let Some(node) = self.state.lock().node_mut(vnode) {
            node.xattrs.insert(name.to_string(), value.to_vec());
        }
    }

    /// Writes a valid root marker under the default attribute name.
    pub fn mark_as_root(&self, vnode: VnodeId) {
        self.set_xattr(vnode, DEFAULT_ROOT_XATTR_NAME, &RootMarker::current().encode());
    }

    /// Reuses the identity of `vnode` for a different, new object at
    /// `new_path`. The generation stamp changes; attributes are dropped.
    pub fn recycle(&self, vnode: VnodeId, new_path: &str, is_dir: bool) {
        let new_path = normalize(new_path);
        let mut state = self.state.lock();
        let Some(old_path) = state.node(vnode).map(|n| n.path.clone()) else {
            return;
        };
        state.by_path.remove(&old_path);
        let parent_mount = parent_path(&new_path).and_then(|parent| {
            let parent = state.create(&parent, true);
            state.node(parent).map(|n| n.mount)
        });
        let mount = state.mount_for_new_path(&new_path, parent_mount);
        let inode = state.alloc_inode();
        if let Some(node) = state.node_mut(vnode) {
            node.path = new_path.clone();
            node.mount = mount;
            node.is_dir = is_dir;
            node.inode = inode;
            node.vid += 1;
            node.xattrs.clear();
        }
        state.by_path.insert(new_path, vnode);
    }

    /// Gives the object at `path` a fresh vnode identity, as after the old
    /// vnode was reclaimed and the object read back from disk. The old
    /// identity is recycled for an unrelated, detached object.
    pub fn reload(&self, path: &str) -> Option<VnodeId> {
        let path = normalize(path);
        let mut state = self.state.lock();
        let old = *state.by_path.get(&path)?;
        let mut fresh = state.node(old)?.clone();
        fresh.vid = 1;
        fresh.refs = 0;
        let new_id = state.alloc_vnode();
        state.nodes.insert(new_id, fresh);
        state.by_path.insert(path, new_id);

        let detached_inode = state.alloc_inode();
        if let Some(node) = state.node_mut(old) {
            node.path = format!("/.reclaimed/{}", old.as_u64());
            node.inode = detached_inode;
            node.vid += 1;
            node.xattrs.clear();
        }
        Some(new_id)
    }

    pub fn set_mount_ttl(&self, mount: MountId, ttl: i32) {
        if let Some(m) = self.state.lock().mounts.get_mut(&mount) {
            m.ttl = Some(ttl);
        }
    }

    /// TTL override in effect, or `None` when the mount uses the default.
    pub fn mount_ttl_override(&self, mount: MountId) -> Option<i32> {
        self.state.lock().mounts.get(&mount).and_then(|m| m.ttl)
    }

    pub fn ttl_set_count(&self, mount: MountId) -> usize {
        self.state.lock().mounts.get(&mount).map_or(0, |m| m.ttl_sets)
    }

    pub fn ttl_clear_count(&self, mount: MountId) -> usize {
        self.state.lock().mounts.get(&mount).map_or(0, |m| m.ttl_clears)
    }

    pub fn fail_getpath(&self, vnode: VnodeId, code: i32) {
        if let Some(node) = self.state.lock().node_mut(vnode) {
            node.getpath_errno = Some(code);
        }
    }

    pub fn fail_getattr(&self, vnode: VnodeId, code: i32) {
        if let Some(node) = self.state.lock().node_mut(vnode) {
            node.getattr_errno = Some(code);
        }
    }

    pub fn fail_xattr(&self, vnode: VnodeId, code: i32) {
        if let Some(node) = self.state.lock().node_mut(vnode) {
            node.xattr_errno = Some(code);
        }
    }

    pub fn fail_lookup(&self, path: &str, code: i32) {
        self.state.lock().lookup_errnos.insert(normalize(path), code);
    }

    /// Number of extended-attribute reads issued against `vnode`.
    pub fn xattr_reads(&self, vnode: VnodeId) -> usize {
        self.state.lock().xattr_reads.get(&vnode).copied().unwrap_or(0)
    }

    pub fn total_xattr_reads(&self) -> usize {
        self.state.lock().xattr_reads.values().sum()
    }

    /// Outstanding references handed out by `lookup`/`parent`/`retain`.
    pub fn refs(&self, vnode: VnodeId) -> i64 {
        self.state.lock().node(vnode).map_or(0, |n| n.refs)
    }

    pub fn total_refs(&self) -> i64 {
        self.state.lock().nodes.values().map(|n| n.refs).sum()
    }
}

impl Default for MockVfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs for MockVfs {
    fn vid(&self, vnode: VnodeId) -> Vid {
        self.state.lock().node(vnode).map_or(0, |n| n.vid)
    }

    fn is_dir(&self, vnode: VnodeId) -> bool {
        self.state.lock().node(vnode).is_some_and(|n| n.is_dir)
    }

    fn parent(&self, vnode: VnodeId) -> Option<VnodeId> {
        let mut state = self.state.lock();
        let parent = parent_path(&state.node(vnode)?.path)?;
        let parent = *state.by_path.get(&parent)?;
        if let Some(node) = state.node_mut(parent) {
            node.refs += 1;
        }
        Some(parent)
    }

    fn retain(&self, vnode: VnodeId) {
        if let Some(node) = self.state.lock().node_mut(vnode) {
            node.refs += 1;
        }
    }

    fn release(&self, vnode: VnodeId) {
        if let Some(node) = self.state.lock().node_mut(vnode) {
            node.refs -= 1;
        }
    }

    fn path(&self, vnode: VnodeId) -> io::Result<String> {
        let state = self.state.lock();
        let node = state.node(vnode).ok_or_else(|| errno(libc::EBADF))?;
        match node.getpath_errno {
            Some(code) => Err(errno(code)),
            None => Ok(node.path.clone()),
        }
    }

    fn lookup(&self, path: &str) -> io::Result<VnodeId> {
        let path = normalize(path);
        let mut state = self.state.lock();
        if let Some(code) = state.lookup_errnos.get(&path) {
            return Err(errno(*code));
        }
        let vnode = state
            .by_path
            .get(&path)
            .or_else(|| state.aliases.get(&path))
            .copied()
            .ok_or_else(|| errno(libc::ENOENT))?;
        if let Some(node) = state.node_mut(vnode) {
            node.refs += 1;
        }
        Ok(vnode)
    }

    fn persistent_id(&self, vnode: VnodeId) -> io::Result<FsidInode> {
        let state = self.state.lock();
        let node = state.node(vnode).ok_or_else(|| errno(libc::EBADF))?;
        if let Some(code) = node.getattr_errno {
            return Err(errno(code));
        }
        let fsid = state
            .mounts
            .get(&node.mount)
            .map(|m| m.fsid)
            .unwrap_or_default();
        Ok(FsidInode::new(fsid, node.inode))
    }

    fn read_xattr(&self, vnode: VnodeId, name: &str) -> io::Result<Vec<u8>> {
        let mut state = self.state.lock();
        *state.xattr_reads.entry(vnode).or_insert(0) += 1;
        let node = state.node(vnode).ok_or_else(|| errno(libc::EBADF))?;
        if let Some(code) = node.xattr_errno {
            return Err(errno(code));
        }
        node.xattrs
            .get(name)
            .cloned()
            .ok_or_else(|| errno(ENOATTR))
    }

    fn mount_of(&self, vnode: VnodeId) -> MountId {
        self.state
            .lock()
            .node(vnode)
            .map_or(self.root_mount, |n| n.mount)
    }

    fn is_mount_root(&self, vnode: VnodeId) -> bool {
        let state = self.state.lock();
        state.node(vnode).is_some_and(|node| {
            state
                .mounts
                .get(&node.mount)
                .is_some_and(|mount| mount.mounted_on == node.path)
        })
    }

    fn fs_type_name(&self, mount: MountId) -> String {
        self.state
            .lock()
            .mounts
            .get(&mount)
            .map(|m| m.fs_type.clone())
            .unwrap_or_default()
    }

    fn mount_name(&self, mount: MountId) -> String {
        self.state
            .lock()
            .mounts
            .get(&mount)
            .map(|m| m.mounted_on.clone())
            .unwrap_or_default()
    }

    fn auth_cache_ttl(&self, mount: MountId) -> i32 {
        self.state
            .lock()
            .mounts
            .get(&mount)
            .and_then(|m| m.ttl)
            .unwrap_or(Self::DEFAULT_AUTH_CACHE_TTL)
    }

    fn set_auth_cache_ttl(&self, mount: MountId, ttl: i32) {
        if let Some(m) = self.state.lock().mounts.get_mut(&mount) {
            m.ttl = Some(ttl);
            m.ttl_sets += 1;
        }
    }

    fn clear_auth_cache_ttl(&self, mount: MountId) {
        if let Some(m) = self.state.lock().mounts.get_mut(&mount) {
            m.ttl = None;
            m.ttl_clears += 1;
        }
    }
}

/// Allocator whose non-blocking path can be made to fail on demand.
#[derive(Debug, Default)]
pub struct PressureAllocator {
    outstanding: AtomicUsize,
    nowait_fails: AtomicBool,
    blocking_fails: AtomicBool,
    nowait_failures: AtomicUsize,
}

impl PressureAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_nowait_fails(&self, fails: bool) {
        self.nowait_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_blocking_fails(&self, fails: bool) {
        self.blocking_fails.store(fails, Ordering::SeqCst);
    }

    pub fn nowait_failures(&self) -> usize {
        self.nowait_failures.load(Ordering::SeqCst)
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

impl Allocator for PressureAllocator {
    fn alloc(&self, bytes: usize) -> bool {
        if self.blocking_fails.load(Ordering::SeqCst) {
            return false;
        }
        self.outstanding.fetch_add(bytes, Ordering::SeqCst);
        true
    }

    fn alloc_nowait(&self, bytes: usize) -> bool {
        if self.nowait_fails.load(Ordering::SeqCst) {
            self.nowait_failures.fetch_add(1, Ordering::SeqCst);
            return false;
        }
        self.outstanding.fetch_add(bytes, Ordering::SeqCst);
        true
    }

    fn free(&self, bytes: usize) {
        self.outstanding.fetch_sub(bytes, Ordering::SeqCst);
    }
}

/// Provider connection that records everything sent to it.
#[derive(Debug, Default)]
pub struct RecordingProvider {
    messages: Mutex<Vec<Vec<u8>>>,
    root_path: Mutex<Option<String>>,
    fail_sends: AtomicBool,
}

impl RecordingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.messages.lock().clone()
    }

    pub fn root_path(&self) -> Option<String> {
        self.root_path.lock().clone()
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

impl Provider for RecordingProvider {
    fn send_message(&self, message: &[u8]) -> io::Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(errno(libc::EPIPE));
        }
        self.messages.lock().push(message.to_vec());
        Ok(())
    }

    fn set_root_path(&self, path: &str) {
        *self.root_path.lock() = Some(path.to_string());
    }
}

type AbortHook = Box<dyn Fn(RootHandle) + Send + Sync>;

/// Interception-layer stand-in that records abort requests.
#[derive(Default)]
pub struct RecordingAborter {
    aborted: Mutex<Vec<RootHandle>>,
    hook: Mutex<Option<AbortHook>>,
}

impl RecordingAborter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn aborted(&self) -> Vec<RootHandle> {
        self.aborted.lock().clone()
    }

    /// Runs `hook` inside every abort callback.
    pub fn set_hook(&self, hook: impl Fn(RootHandle) + Send + Sync + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }
}

impl EventAborter for RecordingAborter {
    fn abort_outstanding_events_for_provider(&self, root: RootHandle) {
        self.aborted.lock().push(root);
        if let Some(hook) = self.hook.lock().as_ref() {
            hook(root);
        }
    }
}
