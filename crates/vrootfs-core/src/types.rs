//! Identifier types shared by the registry and the vnode cache.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU64;

/// Opaque identity of a live vnode.
///
/// This is a lookup key only and does not keep the vnode alive. The
/// filesystem layer may recycle an identity for a different file, which is
/// observable through a changed [`Vid`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VnodeId(NonZeroU64);

impl VnodeId {
    /// Creates a vnode id, returning `None` for the reserved value 0.
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(VnodeId)
    }

    /// Returns the raw identity value.
    pub fn as_u64(&self) -> u64 {
        self.0.get()
    }
}

impl From<NonZeroU64> for VnodeId {
    fn from(raw: NonZeroU64) -> Self {
        VnodeId(raw)
    }
}

impl fmt::Display for VnodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vnode#{}", self.0)
    }
}

/// Generation stamp of a vnode identity.
pub type Vid = u32;

/// A vnode identity paired with the generation it was observed at.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct VersionedVnode {
    pub vnode: VnodeId,
    pub vid: Vid,
}

impl VersionedVnode {
    pub fn new(vnode: VnodeId, vid: Vid) -> Self {
        Self { vnode, vid }
    }
}

/// Identifier of a mounted volume.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MountId(u64);

impl MountId {
    pub fn new(id: u64) -> Self {
        MountId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mount#{}", self.0)
    }
}

/// Volume id as reported by statfs.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fsid(pub [i32; 2]);

/// Persistent, on-disk identity of a filesystem object.
///
/// Survives vnode recycling, so offline roots are re-associated through it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FsidInode {
    pub fsid: Fsid,
    pub inode: u64,
}

impl FsidInode {
    pub fn new(fsid: Fsid, inode: u64) -> Self {
        Self { fsid, inode }
    }
}

impl fmt::Display for FsidInode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.fsid.0[0], self.fsid.0[1], self.inode)
    }
}

/// Process id of a provider or of an accessing process.
pub type Pid = i32;

/// Handle of a virtualization root: an index into the root registry.
///
/// Negative values are reserved. [`RootHandle::NONE`] means "not in any
/// root"; [`RootHandle::UNKNOWN`] is only ever stored in the vnode cache and
/// means membership must be detected again.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct RootHandle(i16);

impl RootHandle {
    /// Not inside any virtualization root.
    pub const NONE: RootHandle = RootHandle(-1);
    /// Membership not yet determined (cache-internal).
    pub const UNKNOWN: RootHandle = RootHandle(-2);
    /// Number of distinct valid handles.
    pub const MAX_ROOTS: usize = i16::MAX as usize + 1;

    /// Builds a handle for a registry index, if it is representable.
    pub fn from_index(index: usize) -> Option<Self> {
        i16::try_from(index).ok().map(RootHandle)
    }

    pub fn from_raw(raw: i16) -> Self {
        RootHandle(raw)
    }

    pub fn raw(&self) -> i16 {
        self.0
    }

    /// True for handles that refer to a registry slot.
    pub fn is_valid(&self) -> bool {
        self.0 >= 0
    }

    /// Registry index of a valid handle.
    pub fn index(&self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

impl fmt::Display for RootHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            RootHandle::NONE => write!(f, "none"),
            RootHandle::UNKNOWN => write!(f, "unknown"),
            RootHandle(raw) => write!(f, "{}", raw),
        }
    }
}

/// Hydration state slot kept in each cache entry.
///
/// Only initialized and stored here; transitions belong to the hydration
/// protocol of the interception layer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FileState {
    #[default]
    Invalid = 0,
    Empty = 1,
    /// File has received its contents from the provider.
    Hydrated,
    /// A write access to a hydrated file was seen.
    Modified,
    /// Waiting for a transition between two states to finish.
    Transitioning,
    Unknown,
}

/// A root directory vnode together with its registry handle, used to
/// re-seed the vnode cache.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RootVnode {
    pub vnode: VnodeId,
    pub root: RootHandle,
}
