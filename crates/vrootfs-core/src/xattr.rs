//! Root-marker extended attribute.
//!
//! A directory is a virtualization root when it carries the marker xattr
//! (name configured in [`crate::config::CoreConfig::root_xattr_name`]). The
//! value has a fixed 8-byte layout: a little-endian magic followed by a
//! little-endian format version.

use thiserror::Error;

pub const ROOT_MARKER_MAGIC: u32 = 0x5652_5431; // "VRT1"
pub const ROOT_MARKER_VERSION: u32 = 1;
pub const ROOT_MARKER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootMarker {
    pub version: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MarkerError {
    #[error("marker has {found} bytes, expected {expected}")]
    BadLength { found: usize, expected: usize },
    #[error("bad marker magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported marker version {0}")]
    UnsupportedVersion(u32),
}

impl RootMarker {
    pub fn current() -> Self {
        Self {
            version: ROOT_MARKER_VERSION,
        }
    }

    pub fn encode(&self) -> [u8; ROOT_MARKER_LEN] {
        let mut out = [0u8; ROOT_MARKER_LEN];
        out[..4].copy_from_slice(&ROOT_MARKER_MAGIC.to_le_bytes());
        out[4..].copy_from_slice(&self.version.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MarkerError> {
        let raw: [u8; ROOT_MARKER_LEN] =
            bytes.try_into().map_err(|_| MarkerError::BadLength {
                found: bytes.len(),
                expected: ROOT_MARKER_LEN,
            })?;
        let magic = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        if magic != ROOT_MARKER_MAGIC {
            return Err(MarkerError::BadMagic(magic));
        }
        let version = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        if version == 0 || version > ROOT_MARKER_VERSION {
            return Err(MarkerError::UnsupportedVersion(version));
        }
        Ok(Self { version })
    }
}
