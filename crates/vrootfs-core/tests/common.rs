//! Shared fixtures for the vrootfs-core integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use vrootfs_core::testing::{MockVfs, PressureAllocator, RecordingAborter, RecordingProvider};
use vrootfs_core::{CoreConfig, Pid, RootHandle, VirtualizationCore};

/// A core wired to in-memory collaborators that the test can inspect.
pub struct TestCore {
    pub vfs: Arc<MockVfs>,
    pub aborter: Arc<RecordingAborter>,
    pub allocator: Arc<PressureAllocator>,
    pub core: VirtualizationCore,
}

impl TestCore {
    pub fn new() -> Self {
        Self::with_config(CoreConfig::default())
    }

    pub fn with_config(config: CoreConfig) -> Self {
        let vfs = Arc::new(MockVfs::new());
        let aborter = Arc::new(RecordingAborter::new());
        let allocator = Arc::new(PressureAllocator::new());
        let core = VirtualizationCore::new(
            config,
            vfs.clone(),
            allocator.clone(),
            aborter.clone(),
        )
        .expect("core construction");
        Self {
            vfs,
            aborter,
            allocator,
            core,
        }
    }

    /// Creates `path` as a directory and attaches a fresh provider to it.
    pub fn register(&self, path: &str, pid: Pid) -> (RootHandle, Arc<RecordingProvider>) {
        self.vfs.create_dir(path);
        let provider = Arc::new(RecordingProvider::new());
        let handle = self
            .core
            .register_provider_for_path(provider.clone(), pid, path)
            .expect("registration");
        (handle, provider)
    }
}
