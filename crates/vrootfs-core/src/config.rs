//! Tunables for the root registry and the vnode cache.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Extended attribute that marks a directory as a virtualization root.
pub const DEFAULT_ROOT_XATTR_NAME: &str = "org.vrootfs.xattr.virtualizationroot";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Number of registry slots allocated up front.
    pub initial_root_capacity: usize,
    /// Bound on the number of vnodes recorded by one slow-path walk.
    pub max_walk_depth: usize,
    /// Expected number of live vnodes on the system.
    pub expected_vnodes: usize,
    /// The cache starts at `expected_vnodes / cache_capacity_divisor` slots.
    pub cache_capacity_divisor: usize,
    /// Filesystem type names a root may live on.
    pub allowed_filesystems: Vec<String>,
    pub root_xattr_name: String,
    /// Mounts tracked for auth-cache suppression before falling back to
    /// disabling without saving the previous TTL.
    pub max_tracked_mounts: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            initial_root_capacity: 128,
            max_walk_depth: 50,
            expected_vnodes: 262_144,
            cache_capacity_divisor: 10,
            allowed_filesystems: vec![String::from("hfs"), String::from("apfs")],
            root_xattr_name: String::from(DEFAULT_ROOT_XATTR_NAME),
            max_tracked_mounts: 1024,
        }
    }
}

impl CoreConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: CoreConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.initial_root_capacity == 0 {
            anyhow::bail!("initial_root_capacity must be at least 1");
        }
        if self.initial_root_capacity > crate::types::RootHandle::MAX_ROOTS {
            anyhow::bail!(
                "initial_root_capacity {} exceeds the handle space of {}",
                self.initial_root_capacity,
                crate::types::RootHandle::MAX_ROOTS
            );
        }
        if self.max_walk_depth == 0 {
            anyhow::bail!("max_walk_depth must be at least 1");
        }
        if self.cache_capacity_divisor == 0 {
            anyhow::bail!("cache_capacity_divisor must be at least 1");
        }
        if self.root_xattr_name.is_empty() {
            anyhow::bail!("root_xattr_name cannot be empty");
        }
        if self.allowed_filesystems.is_empty() {
            anyhow::bail!("allowed_filesystems cannot be empty");
        }
        Ok(())
    }

    /// Initial slot count of the vnode cache, rounded up to a power of two.
    pub fn initial_cache_slots(&self) -> usize {
        let wanted = (self.expected_vnodes / self.cache_capacity_divisor.max(1)).max(16);
        wanted.checked_next_power_of_two().unwrap_or(wanted)
    }

    pub fn is_allowed_filesystem(&self, fs_type: &str) -> bool {
        self.allowed_filesystems.iter().any(|allowed| allowed == fs_type)
    }
}
