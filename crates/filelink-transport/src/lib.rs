//! Remote file catalog + retrieval for filelink.
//!
//! A transport hands out sessions; a session lists the configured directory and
//! retrieves files from it. Sessions are meant to be held for one pipeline
//! phase and closed afterwards.

use std::fmt;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

mod ftp;
mod memory;

pub use ftp::{FtpConfig, FtpTransport};
pub use memory::{MemoryTransport, TransportCounts};

pub const CRATE_NAME: &str = "filelink-transport";

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connecting to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: BoxError,
    },
    #[error("{operation} failed: {source}")]
    Protocol {
        operation: String,
        #[source]
        source: BoxError,
    },
    #[error("remote session already closed")]
    SessionClosed,
    #[error("transport worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Content of one remote file.
#[derive(Clone, PartialEq, Eq)]
pub struct FetchedFile {
    pub filename: String,
    pub content: Vec<u8>,
    pub sha256: String,
}

impl FetchedFile {
    pub fn new(filename: impl Into<String>, content: Vec<u8>) -> Self {
        let sha256 = sha256_hex(&content);
        Self {
            filename: filename.into(),
            content,
            sha256,
        }
    }

    pub fn byte_size(&self) -> usize {
        self.content.len()
    }
}

impl fmt::Debug for FetchedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchedFile")
            .field("filename", &self.filename)
            .field("byte_size", &self.content.len())
            .field("sha256", &self.sha256)
            .finish()
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Reduce raw listing entries to bare filenames.
///
/// Some servers answer NLST with paths; only the final component is kept.
pub fn normalize_listing(entries: Vec<String>) -> Vec<String> {
    entries
        .into_iter()
        .filter_map(|entry| {
            let entry = entry.trim_end_matches(['\r', '\n']);
            if entry.trim().is_empty() {
                return None;
            }
            let name = entry.rsplit('/').next().unwrap_or(entry);
            match name {
                "" | "." | ".." => None,
                _ => Some(name.to_string()),
            }
        })
        .collect()
}

#[async_trait]
pub trait RemoteSession: Send {
    /// Filenames in the configured directory, in server order.
    async fn list(&mut self) -> Result<Vec<String>, TransportError>;

    async fn retrieve(&mut self, filename: &str) -> Result<FetchedFile, TransportError>;

    /// Release the session. Later calls fail with [`TransportError::SessionClosed`].
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn open(&self) -> Result<Box<dyn RemoteSession>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetched_file_hash_is_stable() {
        let file = FetchedFile::new("greeting.txt", b"hello world".to_vec());
        assert_eq!(
            file.sha256,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(file.byte_size(), 11);
    }

    #[test]
    fn listing_entries_are_reduced_to_filenames() {
        let raw = vec![
            "1001.pdf".to_string(),
            "uploads/1002.pdf\r".to_string(),
            "./abc".to_string(),
            ".".to_string(),
            "..".to_string(),
            "   ".to_string(),
        ];
        assert_eq!(normalize_listing(raw), vec!["1001.pdf", "1002.pdf", "abc"]);
    }

    #[test]
    fn trailing_spaces_in_filenames_are_kept() {
        let raw = vec!["1001.pdf \r".to_string(), " 1002.pdf".to_string()];
        assert_eq!(normalize_listing(raw), vec!["1001.pdf ", " 1002.pdf"]);
    }
}
