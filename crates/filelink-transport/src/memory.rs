use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::{FetchedFile, RemoteSession, RemoteTransport, TransportError};

#[derive(Debug, Default)]
struct Counters {
    sessions_opened: AtomicUsize,
    sessions_closed: AtomicUsize,
    listings: AtomicUsize,
    retrievals: AtomicUsize,
}

/// Snapshot of the calls made against a [`MemoryTransport`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportCounts {
    pub sessions_opened: usize,
    pub sessions_closed: usize,
    pub listings: usize,
    pub retrievals: usize,
}

/// Remote directory held in memory, listed in insertion order.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    files: Vec<(String, Vec<u8>)>,
    broken: HashSet<String>,
    unreachable: bool,
    counters: Arc<Counters>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, filename: &str, content: &[u8]) -> Self {
        self.files.push((filename.to_string(), content.to_vec()));
        self
    }

    /// Listed normally, but retrieving it fails.
    pub fn with_broken_file(mut self, filename: &str) -> Self {
        self.files.push((filename.to_string(), Vec::new()));
        self.broken.insert(filename.to_string());
        self
    }

    /// Every `open` fails.
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn counts(&self) -> TransportCounts {
        TransportCounts {
            sessions_opened: self.counters.sessions_opened.load(Ordering::SeqCst),
            sessions_closed: self.counters.sessions_closed.load(Ordering::SeqCst),
            listings: self.counters.listings.load(Ordering::SeqCst),
            retrievals: self.counters.retrievals.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl RemoteTransport for MemoryTransport {
    async fn open(&self) -> Result<Box<dyn RemoteSession>, TransportError> {
        if self.unreachable {
            return Err(TransportError::Connect {
                endpoint: "memory".to_string(),
                source: Box::new(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "remote unreachable",
                )),
            });
        }
        self.counters.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            remote: self.clone(),
            open: true,
        }))
    }
}

struct MemorySession {
    remote: MemoryTransport,
    open: bool,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.open {
            Ok(())
        } else {
            Err(TransportError::SessionClosed)
        }
    }
}

#[async_trait]
impl RemoteSession for MemorySession {
    async fn list(&mut self) -> Result<Vec<String>, TransportError> {
        self.ensure_open()?;
        self.remote.counters.listings.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .remote
            .files
            .iter()
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn retrieve(&mut self, filename: &str) -> Result<FetchedFile, TransportError> {
        self.ensure_open()?;
        self.remote.counters.retrievals.fetch_add(1, Ordering::SeqCst);

        let missing = |reason: &str| TransportError::Protocol {
            operation: format!("retrieving {filename}"),
            source: Box::new(io::Error::new(io::ErrorKind::NotFound, reason.to_string())),
        };
        if self.remote.broken.contains(filename) {
            return Err(missing("transfer aborted"));
        }
        self.remote
            .files
            .iter()
            .find(|(name, _)| name == filename)
            .map(|(name, content)| FetchedFile::new(name.clone(), content.clone()))
            .ok_or_else(|| missing("no such file"))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.open {
            self.open = false;
            self.remote.counters.sessions_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sessions_list_retrieve_and_close() {
        let remote = MemoryTransport::new()
            .with_file("1001.pdf", b"%PDF-1001")
            .with_broken_file("1002.pdf");

        let mut session = remote.open().await.expect("open");
        assert_eq!(session.list().await.expect("list"), vec!["1001.pdf", "1002.pdf"]);

        let file = session.retrieve("1001.pdf").await.expect("retrieve");
        assert_eq!(file.content, b"%PDF-1001");
        assert!(session.retrieve("1002.pdf").await.is_err());
        assert!(session.retrieve("nope.pdf").await.is_err());

        session.close().await.expect("close");
        assert!(matches!(
            session.list().await,
            Err(TransportError::SessionClosed)
        ));

        assert_eq!(
            remote.counts(),
            TransportCounts {
                sessions_opened: 1,
                sessions_closed: 1,
                listings: 1,
                retrievals: 3,
            }
        );
    }

    #[tokio::test]
    async fn unreachable_remote_fails_to_open() {
        let remote = MemoryTransport::new().unreachable();
        assert!(matches!(
            remote.open().await,
            Err(TransportError::Connect { .. })
        ));
        assert_eq!(remote.counts().sessions_opened, 0);
    }
}
