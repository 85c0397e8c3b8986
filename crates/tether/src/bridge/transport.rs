//! Local socket transport for sub-process → parent IPC.
//!
//! Platform-specific endpoint resolution:
//! - **Path**: a server name containing a path separator is a filesystem socket
//! - **Abstract**: Linux abstract namespace (no filesystem entry, auto-cleanup)
//! - **Named**: `{temp_dir}/{server_name}` on other Unix systems

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use crate::channel::Transport;

/// Where the parent's local server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEndpoint {
    Path(PathBuf),
    #[cfg(target_os = "linux")]
    Abstract(String),
}

impl LocalEndpoint {
    /// Map a well-known server name onto a socket address.
    pub fn resolve(server_name: &str) -> Self {
        if server_name.contains(std::path::MAIN_SEPARATOR) || server_name.contains('/') {
            return Self::Path(PathBuf::from(server_name));
        }

        #[cfg(target_os = "linux")]
        {
            Self::Abstract(server_name.to_string())
        }

        #[cfg(not(target_os = "linux"))]
        {
            Self::Path(std::env::temp_dir().join(server_name))
        }
    }

    pub async fn connect(&self) -> io::Result<UnixStream> {
        match self {
            Self::Path(path) => UnixStream::connect(path).await,
            #[cfg(target_os = "linux")]
            Self::Abstract(name) => {
                use std::os::linux::net::SocketAddrExt;
                use std::os::unix::net::SocketAddr;

                let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
                // tokio doesn't support abstract sockets directly
                let std_stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
                std_stream.set_nonblocking(true)?;
                UnixStream::from_std(std_stream)
            }
        }
    }
}

impl std::fmt::Display for LocalEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            #[cfg(target_os = "linux")]
            Self::Abstract(name) => write!(f, "@{}", name),
        }
    }
}

/// Transport over a same-host stream socket.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    endpoint: LocalEndpoint,
}

impl LocalTransport {
    pub fn new(server_name: &str) -> Self {
        Self {
            endpoint: LocalEndpoint::resolve(server_name),
        }
    }

    pub fn from_endpoint(endpoint: LocalEndpoint) -> Self {
        Self { endpoint }
    }

    pub fn local_endpoint(&self) -> &LocalEndpoint {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for LocalTransport {
    type Reader = OwnedReadHalf;
    type Writer = OwnedWriteHalf;

    async fn connect(&self) -> io::Result<(Self::Reader, Self::Writer)> {
        tracing::trace!(endpoint = %self.endpoint, "Connecting to local socket");
        let stream = self.endpoint.connect().await?;
        Ok(stream.into_split())
    }

    async fn write_data(&self, writer: &mut Self::Writer, data: &[u8]) -> io::Result<usize> {
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(data.len())
    }

    fn endpoint(&self) -> String {
        self.endpoint.to_string()
    }
}
