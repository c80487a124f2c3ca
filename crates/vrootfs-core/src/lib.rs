//! vrootfs core: virtualization-root membership for a filesystem filter.
//!
//! Tracks which directory subtrees are virtualization roots, which provider
//! process serves each of them, and which root any live vnode belongs to.
//! The access-interception layer resolves membership through
//! [`VirtualizationCore::find_root`] and forwards events with
//! [`VirtualizationCore::send_message`].

pub mod config;
pub mod error;
pub mod logging;
pub mod message;
pub mod mount_auth;
pub mod roots;
pub mod sync;
pub mod table;
pub mod testing;
pub mod types;
pub mod vfs;
pub mod virtualization;
pub mod vnode_cache;
pub mod xattr;

pub use config::CoreConfig;
pub use error::{Result, RootError};
pub use message::{Message, MessageHeader, MessageType};
pub use roots::{RootInfo, RootRegistry};
pub use types::{FileState, FsidInode, MountId, Pid, RootHandle, Vid, VnodeId};
pub use vfs::{Allocator, EventAborter, Provider, SystemAllocator, Vfs};
pub use virtualization::VirtualizationCore;
pub use vnode_cache::{CacheEntry, CacheStats, VnodeCache};
