//! Vnode to virtualization-root membership cache.
//!
//! Entries are keyed by vnode identity and carry the generation stamp seen
//! when they were written; an entry whose stamp no longer matches the live
//! vnode belongs to a recycled identity and counts as a miss.
//!
//! [`VnodeCache::find_root`] answers from the table under a shared lock when
//! it can. Otherwise it walks up the parent chain, asks the registry about
//! every directory it passed with no cache lock held, and writes the results
//! back under the exclusive lock. Files outside any root are never kept.

use crate::config::CoreConfig;
use crate::error::{Result, RootError};
use crate::roots::RootRegistry;
use crate::sync::{ExclusiveGuard, RwLock};
use crate::table::{ProbeTable, SlotBlock, TableEntry};
use crate::types::{FileState, RootHandle, RootVnode, VersionedVnode, Vid, VnodeId};
use crate::vfs::{Allocator, Vfs};
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub vnode: Option<VnodeId>,
    pub vid: Vid,
    pub root: RootHandle,
    /// Hydration state, owned by the interception layer.
    pub state: FileState,
    pub flags: u8,
}

const _: () = assert!(mem::size_of::<CacheEntry>() == 16);

impl CacheEntry {
    /// Identity and generation this entry was written for.
    pub fn versioned(&self) -> Option<VersionedVnode> {
        self.vnode.map(|vnode| VersionedVnode::new(vnode, self.vid))
    }

    fn new(vnode: VnodeId, vid: Vid, root: RootHandle) -> Self {
        Self {
            vnode: Some(vnode),
            vid,
            root,
            state: FileState::Unknown,
            flags: 0,
        }
    }
}

impl TableEntry for CacheEntry {
    type Key = VnodeId;

    const VACANT: Self = CacheEntry {
        vnode: None,
        vid: 0,
        root: RootHandle::UNKNOWN,
        state: FileState::Invalid,
        flags: 0,
    };

    fn key(&self) -> Option<VnodeId> {
        self.vnode
    }

    fn hash_key(key: &VnodeId) -> u64 {
        key.as_u64().wrapping_mul(2_305_843_009_213_693_951)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub fast_path_hits: u64,
    pub slow_path_walks: u64,
    pub evictions: u64,
    pub deferred_grows: u64,
}

#[derive(Default)]
struct Counters {
    fast_path_hits: AtomicU64,
    slow_path_walks: AtomicU64,
    evictions: AtomicU64,
    deferred_grows: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// One vnode visited by the slow path. Each holds a reference.
struct WalkStep {
    at: VersionedVnode,
    root: RootHandle,
}

pub struct VnodeCache {
    table: RwLock<ProbeTable<CacheEntry>>,
    vfs: Arc<dyn Vfs>,
    registry: Arc<RootRegistry>,
    max_walk_depth: usize,
    counters: Counters,
}

fn store(table: &mut ProbeTable<CacheEntry>, vnode: VnodeId, vid: Vid, root: RootHandle) {
    match table.find_mut(&vnode) {
        Some(entry) if entry.vid == vid => entry.root = root,
        // Recycled identity: nothing of the old entry applies.
        Some(entry) => *entry = CacheEntry::new(vnode, vid, root),
        None => {
            if table.insert(CacheEntry::new(vnode, vid, root)).is_err() {
                error!(
                    "vnode_cache: table full ({}/{}), {} not cached",
                    table.len(),
                    table.capacity(),
                    vnode
                );
            }
        }
    }
}

impl VnodeCache {
    pub fn new(
        config: &CoreConfig,
        vfs: Arc<dyn Vfs>,
        registry: Arc<RootRegistry>,
        allocator: Arc<dyn Allocator>,
    ) -> Result<Self> {
        let slots = config.initial_cache_slots();
        let table =
            ProbeTable::with_capacity(allocator, slots).ok_or(RootError::ResourceExhausted)?;
        debug!("vnode_cache: created with {} slots", table.capacity());
        Ok(Self {
            table: RwLock::new(table),
            vfs,
            registry,
            max_walk_depth: config.max_walk_depth,
            counters: Counters::default(),
        })
    }

    /// Resolves the root `vnode` belongs to.
    ///
    /// `parent` may be supplied by callers that already hold the parent
    /// directory. `expected_root` is only used to report inconsistencies.
    pub fn find_root(
        &self,
        vnode: VnodeId,
        parent: Option<VnodeId>,
        expected_root: RootHandle,
    ) -> RootHandle {
        let is_dir = self.vfs.is_dir(vnode);
        if let Some(root) = self.find_root_fast(vnode, is_dir, parent, expected_root) {
            Counters::bump(&self.counters.fast_path_hits);
            return root;
        }
        Counters::bump(&self.counters.slow_path_walks);
        self.find_root_slow(vnode, is_dir, expected_root)
    }

    fn find_root_fast(
        &self,
        vnode: VnodeId,
        is_dir: bool,
        parent: Option<VnodeId>,
        expected_root: RootHandle,
    ) -> Option<RootHandle> {
        let mut answer = RootHandle::UNKNOWN;
        let mut fetched_parent = None;

        let table = self.table.read();
        let own = table.find(&vnode).copied();
        match own {
            Some(entry) if entry.vid == self.vfs.vid(vnode) => {
                answer = entry.root;
                if answer != expected_root && answer != RootHandle::UNKNOWN {
                    crate::vnode_info!(
                        self.vfs.as_ref(),
                        vnode,
                        "vnode_cache: mismatched root in fast-path cache hit: cache says {}, expected {}",
                        answer,
                        expected_root
                    );
                }
            }
            _ if !is_dir => {
                let parent = parent.or_else(|| {
                    fetched_parent = self.vfs.parent(vnode);
                    fetched_parent
                });
                if let Some(parent) = parent {
                    if let Some(entry) = table.find(&parent) {
                        if entry.vid == self.vfs.vid(parent) {
                            answer = entry.root;
                            if answer != expected_root && answer != RootHandle::UNKNOWN {
                                crate::vnode_info!(
                                    self.vfs.as_ref(),
                                    parent,
                                    "vnode_cache: mismatched root in fast-path parent cache hit: cache says {}, expected {}",
                                    answer,
                                    expected_root
                                );
                            }
                        }
                    }
                }
            }
            _ => {}
        }

        if own.is_some() && answer == RootHandle::NONE && !is_dir {
            // Files outside roots are not worth keeping.
            if let Some(mut exclusive) = table.try_upgrade() {
                exclusive.remove(&vnode);
                Counters::bump(&self.counters.evictions);
            }
        } else {
            drop(table);
        }

        if let Some(fetched) = fetched_parent {
            self.vfs.release(fetched);
        }
        (answer != RootHandle::UNKNOWN).then_some(answer)
    }

    fn find_root_slow(&self, vnode: VnodeId, is_dir: bool, expected_root: RootHandle) -> RootHandle {
        let mut walk: Vec<WalkStep> = Vec::new();
        if walk.try_reserve_exact(self.max_walk_depth).is_err() {
            error!("vnode_cache: no memory for a walk, resolving uncached");
            return self.registry.find_root_for_vnode(vnode);
        }

        let mut answer = RootHandle::NONE;
        let mut truncated = false;
        // Reference held on the ancestor that ended the walk.
        let mut stop_ref = None;

        {
            let table = self.table.read();
            self.vfs.retain(vnode);
            let mut current = Some(vnode);

            while let Some(vn) = current {
                let at = VersionedVnode::new(vn, self.vfs.vid(vn));
                if let Some(entry) = table.find(&vn) {
                    if entry.root != RootHandle::UNKNOWN && entry.versioned() == Some(at) {
                        answer = entry.root;
                        if answer != expected_root {
                            crate::vnode_debug!(
                                self.vfs.as_ref(),
                                vn,
                                "vnode_cache: slow-path cache hit says {}, expected {}, depth {}",
                                answer,
                                expected_root,
                                walk.len()
                            );
                        }
                        stop_ref = Some(vn);
                        break;
                    }
                }

                if walk.len() >= self.max_walk_depth {
                    crate::vnode_error!(
                        self.vfs.as_ref(),
                        vnode,
                        "vnode_cache: walk exceeded {} levels, aborting",
                        self.max_walk_depth
                    );
                    truncated = true;
                    stop_ref = Some(vn);
                    break;
                }

                walk.push(WalkStep { at, root: answer });
                if answer.is_valid() {
                    crate::vnode_error!(
                        self.vfs.as_ref(),
                        vn,
                        "vnode_cache: root {} recorded before any root was identified",
                        answer
                    );
                    break;
                }

                current = self.vfs.parent(vn);
                if current.is_none() && expected_root != RootHandle::NONE {
                    crate::vnode_info!(
                        self.vfs.as_ref(),
                        vnode,
                        "vnode_cache: reached filesystem root without cache hit, expected root {}",
                        expected_root
                    );
                }
            }
        }

        // Detection may read xattrs and takes the registry lock.
        let first_dir = usize::from(!is_dir);
        for step in walk.iter_mut().skip(first_dir).rev() {
            let found = self.registry.detect_root_at(step.at.vnode);
            if found.is_valid() {
                answer = found;
            }
            step.root = answer;
        }
        if !is_dir {
            if let Some(leaf) = walk.first_mut() {
                leaf.root = answer;
            }
        }

        let deferred = {
            let mut table = self.table.write();
            let mut steps = walk.iter();
            if !is_dir && !answer.is_valid() {
                table.remove(&vnode);
                steps.next();
            }
            for step in steps {
                // A truncated walk never established the answers above it.
                if truncated && !step.root.is_valid() {
                    continue;
                }
                store(&mut table, step.at.vnode, step.at.vid, step.root);
            }
            table
                .take_deferred_grow()
                .map(|slots| (slots, table.len(), table.capacity()))
        };

        for step in &walk {
            self.vfs.release(step.at.vnode);
        }
        if let Some(vn) = stop_ref {
            self.vfs.release(vn);
        }

        if let Some((slots, len, capacity)) = deferred {
            info!(
                "vnode_cache: non-blocking resize failed, {} slots requested, table items: {}/{}",
                slots, len, capacity
            );
            self.grow(slots);
        }
        answer
    }

    /// Blocking allocation of `slots` outside the lock, then resize under it.
    fn grow(&self, slots: usize) {
        Counters::bump(&self.counters.deferred_grows);
        let allocator = self.table.read().allocator();
        let Some(block) = SlotBlock::<CacheEntry>::allocate(allocator, slots) else {
            error!("vnode_cache: blocking allocation of {} slots failed", slots);
            return;
        };

        let unused = {
            let mut table = self.table.write();
            let unused = table.commit_block(block);
            if unused.is_none() {
                info!(
                    "vnode_cache: resizing appears to have succeeded, table items: {}/{}",
                    table.len(),
                    table.capacity()
                );
            }
            unused
        };
        drop(unused);
    }

    /// Takes the cache's exclusive lock for a compound update.
    pub fn lock_exclusive(&self) -> CacheExclusive<'_> {
        CacheExclusive {
            table: self.table.write(),
            cache: self,
        }
    }

    /// Empties the cache and seeds it with the given root directories.
    pub fn reset_and_register_roots(&self, roots: &[RootVnode]) {
        let mut exclusive = self.lock_exclusive();
        exclusive.table.clear();
        for root in roots {
            let vid = self.vfs.vid(root.vnode);
            exclusive.set_root_for_vnode(root.vnode, vid, root.root);
        }
        debug!("vnode_cache: reset with {} root vnodes", roots.len());
        exclusive.unlock();
    }

    /// Marks every entry that points at `root` as unknown, forcing the next
    /// lookup through detection again.
    pub fn deregister_roots_for_provider(&self, root: RootHandle) {
        let mut table = self.table.write();
        let mut marked = 0usize;
        table.for_each_mut(|entry| {
            if entry.root == root {
                entry.root = RootHandle::UNKNOWN;
                marked += 1;
            }
        });
        debug!("vnode_cache: marked {} entries of root {} unknown", marked, root);
    }

    /// The entry stored for `vnode`, regardless of its generation.
    pub fn lookup(&self, vnode: VnodeId) -> Option<CacheEntry> {
        self.table.read().find(&vnode).copied()
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.table.read().capacity()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            fast_path_hits: self.counters.fast_path_hits.load(Ordering::Relaxed),
            slow_path_walks: self.counters.slow_path_walks.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            deferred_grows: self.counters.deferred_grows.load(Ordering::Relaxed),
        }
    }
}

/// Exclusive access to the cache. Growth that could not happen during the
/// update is performed by [`CacheExclusive::unlock`].
pub struct CacheExclusive<'a> {
    table: ExclusiveGuard<'a, ProbeTable<CacheEntry>>,
    cache: &'a VnodeCache,
}

impl CacheExclusive<'_> {
    /// Records `root` for `vnode`. A generation change resets the entry's
    /// state and flags.
    pub fn set_root_for_vnode(&mut self, vnode: VnodeId, vid: Vid, root: RootHandle) {
        match self.table.find_mut(&vnode) {
            Some(entry) => {
                if entry.vid != vid {
                    entry.vid = vid;
                    entry.flags = 0;
                    entry.state = FileState::Unknown;
                }
                entry.root = root;
            }
            None => store(&mut self.table, vnode, vid, root),
        }
    }

    pub fn lookup(&self, vnode: VnodeId) -> Option<CacheEntry> {
        self.table.find(&vnode).copied()
    }

    pub fn unlock(mut self) {
        let deferred = self.table.take_deferred_grow();
        let cache = self.cache;
        drop(self);
        if let Some(slots) = deferred {
            cache.grow(slots);
        }
    }
}
