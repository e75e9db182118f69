use std::fmt;
use std::net::ToSocketAddrs;
use std::time::Duration;

use async_trait::async_trait;
use suppaftp::types::FileType;
use suppaftp::{FtpResult, FtpStream};
use tracing::{debug, info_span, Instrument};

use crate::{normalize_listing, FetchedFile, RemoteSession, RemoteTransport, TransportError};

#[derive(Clone)]
pub struct FtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Directory to change into after login; `None` stays in the login directory.
    pub directory: Option<String>,
    pub timeout: Duration,
}

impl FtpConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for FtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("directory", &self.directory)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// FTP transport on top of the blocking `suppaftp` client.
///
/// Every protocol exchange runs on the blocking thread pool.
#[derive(Debug, Clone)]
pub struct FtpTransport {
    config: FtpConfig,
}

impl FtpTransport {
    pub fn new(config: FtpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RemoteTransport for FtpTransport {
    async fn open(&self) -> Result<Box<dyn RemoteSession>, TransportError> {
        let config = self.config.clone();
        let endpoint = config.endpoint();
        let span = info_span!("ftp_open", endpoint = %endpoint);

        let stream = tokio::task::spawn_blocking(move || connect(&config))
            .instrument(span)
            .await??;
        debug!(endpoint = %endpoint, "ftp session opened");

        Ok(Box::new(FtpSession {
            endpoint,
            stream: Some(stream),
        }))
    }
}

fn connect(config: &FtpConfig) -> Result<FtpStream, TransportError> {
    let endpoint = config.endpoint();
    let connect_err = |source: suppaftp::FtpError| TransportError::Connect {
        endpoint: endpoint.clone(),
        source: Box::new(source),
    };

    let addr = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|err| TransportError::Connect {
            endpoint: endpoint.clone(),
            source: Box::new(err),
        })?
        .next()
        .ok_or_else(|| TransportError::Connect {
            endpoint: endpoint.clone(),
            source: format!("{} did not resolve to an address", config.host).into(),
        })?;

    let mut stream = FtpStream::connect_timeout(addr, config.timeout).map_err(connect_err)?;
    stream
        .get_ref()
        .set_read_timeout(Some(config.timeout))
        .and_then(|()| stream.get_ref().set_write_timeout(Some(config.timeout)))
        .map_err(|err| TransportError::Connect {
            endpoint: endpoint.clone(),
            source: Box::new(err),
        })?;

    stream
        .login(config.user.as_str(), config.password.as_str())
        .map_err(|err| protocol("login", err))?;
    stream
        .transfer_type(FileType::Binary)
        .map_err(|err| protocol("switching to binary mode", err))?;
    if let Some(directory) = &config.directory {
        stream
            .cwd(directory.as_str())
            .map_err(|err| protocol(&format!("changing directory to {directory}"), err))?;
    }
    Ok(stream)
}

fn protocol(operation: &str, err: suppaftp::FtpError) -> TransportError {
    TransportError::Protocol {
        operation: operation.to_string(),
        source: Box::new(err),
    }
}

struct FtpSession {
    endpoint: String,
    stream: Option<FtpStream>,
}

impl FtpSession {
    /// Run one blocking exchange, handing the stream back afterwards.
    async fn exchange<T, F>(&mut self, operation: String, op: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> FtpResult<T> + Send + 'static,
    {
        let mut stream = self.stream.take().ok_or(TransportError::SessionClosed)?;
        let (stream, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut stream);
            (stream, result)
        })
        .await?;
        self.stream = Some(stream);
        result.map_err(|err| protocol(&operation, err))
    }
}

#[async_trait]
impl RemoteSession for FtpSession {
    async fn list(&mut self) -> Result<Vec<String>, TransportError> {
        let entries = self
            .exchange("listing remote directory".to_string(), |stream| stream.nlst(None))
            .await?;
        Ok(normalize_listing(entries))
    }

    async fn retrieve(&mut self, filename: &str) -> Result<FetchedFile, TransportError> {
        let name = filename.to_string();
        let content = self
            .exchange(format!("retrieving {filename}"), move |stream| {
                stream.retr_as_buffer(&name).map(|buffer| buffer.into_inner())
            })
            .await?;
        Ok(FetchedFile::new(filename, content))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        let endpoint = self.endpoint.clone();
        tokio::task::spawn_blocking(move || stream.quit())
            .await?
            .map_err(|err| protocol("closing session", err))?;
        debug!(endpoint = %endpoint, "ftp session closed");
        Ok(())
    }
}
