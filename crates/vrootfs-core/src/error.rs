use crate::types::RootHandle;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RootError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Path could not be resolved: {path}: {source}")]
    PathNotFound {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Not a directory: {path}")]
    NotDirectory { path: String },

    #[error("Filesystem type {fs_type} is not allowed for virtualization roots")]
    DisallowedFilesystem { fs_type: String },

    #[error("Root {root} already has an active provider")]
    Busy { root: RootHandle },

    #[error("Too many virtualization roots")]
    ResourceExhausted,

    #[error("{op} failed: {source}")]
    Vfs {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("No provider attached to root {root}")]
    NoProvider { root: RootHandle },

    #[error("Invalid root handle: {root}")]
    InvalidHandle { root: RootHandle },

    #[error("Path {path} is not inside root path {root_path}")]
    NotUnderRoot { root_path: String, path: String },

    #[error("Message encoding failed: {msg}")]
    Encoding { msg: String },

    #[error("Invalid configuration: {msg}")]
    InvalidConfig { msg: String },
}

pub type Result<T> = std::result::Result<T, RootError>;

fn errno_of(err: &std::io::Error, fallback: i32) -> i32 {
    err.raw_os_error().unwrap_or(fallback)
}

impl RootError {
    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self {
            RootError::Io(e) => errno_of(e, EIO),
            RootError::PathNotFound { source, .. } => errno_of(source, ENOENT),
            RootError::NotDirectory { .. } => ENOTDIR,
            RootError::DisallowedFilesystem { .. } => ENODEV,
            RootError::Busy { .. } => EBUSY,
            RootError::ResourceExhausted => ENOMEM,
            RootError::Vfs { source, .. } => errno_of(source, EIO),
            RootError::NoProvider { .. } => EIO,
            RootError::InvalidHandle { .. } => EINVAL,
            RootError::NotUnderRoot { .. } => EINVAL,
            RootError::Encoding { .. } => EINVAL,
            RootError::InvalidConfig { .. } => EINVAL,
        }
    }
}
