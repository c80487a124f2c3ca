//! Logging helpers.
//!
//! Severity mapping used throughout the crate: consistency errors go to
//! `error!`, notable events (new roots, deferred resizes, degraded modes) to
//! `info!`, and chatty diagnostics to `debug!`.
//!
//! The `vnode_*!` macros annotate a line with the path of a vnode. The path
//! is only resolved when the level is enabled, since getpath is not free.

use crate::types::VnodeId;
use crate::vfs::Vfs;
use std::fmt;
use tracing_subscriber::{fmt as tracing_fmt, prelude::*, EnvFilter};

/// Lazily formats the path of a vnode for a log field.
pub struct VnodePath<'a> {
    vfs: &'a dyn Vfs,
    vnode: VnodeId,
}

impl<'a> VnodePath<'a> {
    pub fn new(vfs: &'a dyn Vfs, vnode: VnodeId) -> Self {
        Self { vfs, vnode }
    }
}

impl fmt::Display for VnodePath<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.vfs.path(self.vnode) {
            Ok(path) => f.write_str(&path),
            Err(err) => write!(f, "<{} (getpath failed: {})>", self.vnode, err),
        }
    }
}

#[macro_export]
macro_rules! vnode_error {
    ($vfs:expr, $vnode:expr, $($arg:tt)+) => {
        tracing::error!(path = %$crate::logging::VnodePath::new($vfs, $vnode), $($arg)+)
    };
}

#[macro_export]
macro_rules! vnode_info {
    ($vfs:expr, $vnode:expr, $($arg:tt)+) => {
        tracing::info!(path = %$crate::logging::VnodePath::new($vfs, $vnode), $($arg)+)
    };
}

#[macro_export]
macro_rules! vnode_debug {
    ($vfs:expr, $vnode:expr, $($arg:tt)+) => {
        tracing::debug!(path = %$crate::logging::VnodePath::new($vfs, $vnode), $($arg)+)
    };
}

/// Installs a fmt subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter`. Returns false if a global subscriber already exists.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(tracing_fmt::layer())
        .with(filter)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockVfs;

    #[test]
    fn test_vnode_path_formats_path() {
        let vfs = MockVfs::new();
        let dir = vfs.create_dir("/repo/src");
        assert_eq!(VnodePath::new(&vfs, dir).to_string(), "/repo/src");
    }

    #[test]
    fn test_vnode_path_reports_getpath_failure() {
        let vfs = MockVfs::new();
        let dir = vfs.create_dir("/repo");
        vfs.fail_getpath(dir, libc::EIO);
        let text = VnodePath::new(&vfs, dir).to_string();
        assert!(text.contains("getpath failed"));
    }

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing("debug");
        assert!(!init_tracing("debug"));
    }

    #[test]
    fn test_macros_expand() {
        let vfs = MockVfs::new();
        let dir = vfs.create_dir("/repo");
        vnode_error!(&vfs, dir, "error line {}", 1);
        vnode_info!(&vfs, dir, "info line");
        vnode_debug!(&vfs, dir, "debug line {}", "x");
    }
}
