//! Event messages forwarded to a root's provider.
//!
//! Wire layout: a bincode-encoded [`MessageHeader`] immediately followed by
//! `path_size_bytes` raw path bytes (no terminator).

use crate::error::{Result, RootError};
use crate::types::Pid;
use serde::{Deserialize, Serialize};

/// Longest process name carried in a header, in bytes.
pub const MAX_PROC_NAME_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    EnumerateDirectory,
    RecursivelyEnumerateDirectory,
    HydrateFile,
    NotifyFileModified,
    NotifyFilePreDelete,
    NotifyDirectoryPreDelete,
    NotifyFileCreated,
    NotifyFileRenamed,
    NotifyDirectoryRenamed,
    NotifyFileHardLinkCreated,
    NotifyFilePreConvertToFull,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub message_id: u64,
    pub message_type: MessageType,
    /// Process whose access triggered the event.
    pub pid: Pid,
    pub proc_name: String,
    pub path_size_bytes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub path: Option<String>,
}

impl Message {
    /// Builds a message, truncating `proc_name` on a character boundary and
    /// filling in the path length.
    pub fn new(
        message_id: u64,
        message_type: MessageType,
        pid: Pid,
        proc_name: &str,
        path: Option<&str>,
    ) -> Result<Self> {
        let path_size_bytes = match path {
            Some(p) => u32::try_from(p.len()).map_err(|_| RootError::Encoding {
                msg: format!("path of {} bytes is too long", p.len()),
            })?,
            None => 0,
        };

        let mut end = proc_name.len().min(MAX_PROC_NAME_LEN);
        while !proc_name.is_char_boundary(end) {
            end -= 1;
        }

        Ok(Self {
            header: MessageHeader {
                message_id,
                message_type,
                pid,
                proc_name: proc_name[..end].to_string(),
                path_size_bytes,
            },
            path: path.map(str::to_string),
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let path = self.path.as_deref().unwrap_or_default();
        if path.len() != self.header.path_size_bytes as usize {
            return Err(RootError::Encoding {
                msg: format!(
                    "header announces {} path bytes, message carries {}",
                    self.header.path_size_bytes,
                    path.len()
                ),
            });
        }

        let mut bytes = bincode::serialize(&self.header).map_err(|e| RootError::Encoding {
            msg: e.to_string(),
        })?;
        bytes.extend_from_slice(path.as_bytes());
        Ok(bytes)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let header: MessageHeader =
            bincode::deserialize(data).map_err(|e| RootError::Encoding {
                msg: format!("message header deserialization failed: {}", e),
            })?;
        let header_len = bincode::serialized_size(&header).map_err(|e| RootError::Encoding {
            msg: e.to_string(),
        })? as usize;

        let rest = data.get(header_len..).unwrap_or_default();
        if rest.len() != header.path_size_bytes as usize {
            return Err(RootError::Encoding {
                msg: format!(
                    "expected {} path bytes, found {}",
                    header.path_size_bytes,
                    rest.len()
                ),
            });
        }

        let path = if rest.is_empty() {
            None
        } else {
            Some(
                String::from_utf8(rest.to_vec()).map_err(|e| RootError::Encoding {
                    msg: format!("path is not UTF-8: {}", e),
                })?,
            )
        };
        Ok(Self { header, path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_follows_header() {
        let msg = Message::new(
            7,
            MessageType::HydrateFile,
            412,
            "git",
            Some("/repo/a/b.txt"),
        )
        .unwrap();
        assert_eq!(msg.header.path_size_bytes, 13);

        let bytes = msg.to_bytes().unwrap();
        assert!(bytes.ends_with(b"/repo/a/b.txt"));
        assert_eq!(Message::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_message_without_path() {
        let msg = Message::new(1, MessageType::EnumerateDirectory, 9, "ls", None).unwrap();
        let bytes = msg.to_bytes().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.path, None);
        assert_eq!(decoded.header.path_size_bytes, 0);
    }

    #[test]
    fn test_proc_name_truncated_on_char_boundary() {
        let long = "é".repeat(40);
        let msg = Message::new(1, MessageType::NotifyFileCreated, 1, &long, None).unwrap();
        assert!(msg.header.proc_name.len() <= MAX_PROC_NAME_LEN);
        assert!(msg.header.proc_name.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_inconsistent_path_length_rejected() {
        let mut msg = Message::new(1, MessageType::NotifyFileRenamed, 1, "mv", Some("/a")).unwrap();
        msg.header.path_size_bytes = 10;
        assert!(matches!(msg.to_bytes(), Err(RootError::Encoding { .. })));
    }

    #[test]
    fn test_truncated_bytes_rejected() {
        let msg = Message::new(1, MessageType::HydrateFile, 1, "cat", Some("/repo/x")).unwrap();
        let bytes = msg.to_bytes().unwrap();
        assert!(Message::from_bytes(&bytes[..bytes.len() - 2]).is_err());
        assert!(Message::from_bytes(&bytes[..3]).is_err());
    }
}
