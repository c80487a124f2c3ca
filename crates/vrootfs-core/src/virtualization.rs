//! The virtualization core: root registry plus vnode cache.
//!
//! Owns both tables and keeps them consistent when providers come and go.
//! The interception layer holds one `VirtualizationCore` for the lifetime of
//! the filter and calls [`VirtualizationCore::teardown`] before unloading.

use crate::config::CoreConfig;
use crate::error::{Result, RootError};
use crate::message::Message;
use crate::roots::RootRegistry;
use crate::types::{Pid, RootHandle, VnodeId};
use crate::vfs::{Allocator, EventAborter, Provider, Vfs};
use crate::vnode_cache::VnodeCache;
use std::sync::Arc;
use tracing::{debug, info};

pub struct VirtualizationCore {
    registry: Arc<RootRegistry>,
    cache: VnodeCache,
}

impl VirtualizationCore {
    pub fn new(
        config: CoreConfig,
        vfs: Arc<dyn Vfs>,
        allocator: Arc<dyn Allocator>,
        aborter: Arc<dyn EventAborter>,
    ) -> Result<Self> {
        config.validate().map_err(|e| RootError::InvalidConfig {
            msg: e.to_string(),
        })?;

        let registry = Arc::new(RootRegistry::new(&config, Arc::clone(&vfs), aborter)?);
        let cache = VnodeCache::new(&config, vfs, Arc::clone(&registry), allocator)?;
        info!(
            "virtualization: started with {} root slots and {} cache slots",
            registry.capacity(),
            cache.capacity()
        );
        Ok(Self { registry, cache })
    }

    /// See [`VnodeCache::find_root`].
    pub fn find_root(
        &self,
        vnode: VnodeId,
        parent: Option<VnodeId>,
        expected_root: RootHandle,
    ) -> RootHandle {
        self.cache.find_root(vnode, parent, expected_root)
    }

    /// Registers `provider` for the directory at `path`, then resets the
    /// cache to the online root directories.
    ///
    /// Vnodes below the new root may already be cached as outside every
    /// root, and the fast path would keep handing that answer to their
    /// children.
    pub fn register_provider_for_path(
        &self,
        provider: Arc<dyn Provider>,
        pid: Pid,
        path: &str,
    ) -> Result<RootHandle> {
        let handle = self.registry.register_provider_for_path(provider, pid, path)?;
        self.reset_cache_from_registry();
        Ok(handle)
    }

    /// Takes the root offline and makes the cache forget what it knew
    /// about it.
    pub fn disconnect(&self, handle: RootHandle) -> Result<()> {
        self.registry.disconnect(handle)?;
        self.cache.deregister_roots_for_provider(handle);
        Ok(())
    }

    pub fn send_message(&self, handle: RootHandle, message: &Message) -> Result<()> {
        self.registry.send_message(handle, message)
    }

    /// Drops every cache entry except the directories of online roots.
    pub fn reset_cache_from_registry(&self) {
        let roots = self.registry.online_root_vnodes();
        self.cache.reset_and_register_roots(&roots);
    }

    pub fn registry(&self) -> &RootRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &VnodeCache {
        &self.cache
    }

    /// Disconnects everything and empties the cache.
    pub fn teardown(&self) {
        self.registry.teardown();
        self.cache.reset_and_register_roots(&[]);
        debug!("virtualization: teardown complete");
    }
}
