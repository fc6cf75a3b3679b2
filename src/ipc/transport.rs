#![expect(
    clippy::module_name_repetitions,
    reason = "Transport implementations include the module name for clarity"
)]

//! Injectable transport for the worker socket.
//!
//! The connection manager owns exactly one [`Transport`] instance and
//! creates a fresh socket through it on every attempt; there is no
//! process-wide socket state. Tests inject in-memory doubles.

use std::io;

use async_trait::async_trait;
use interprocess::local_socket::Name;
use interprocess::local_socket::tokio::prelude::*;
#[cfg(unix)]
use interprocess::local_socket::{GenericFilePath, ToFsName as _};
#[cfg(windows)]
use interprocess::local_socket::{GenericNamespaced, ToNsName as _};
use tokio::io::{AsyncRead, AsyncWrite};

/// Duplex byte stream connected to the worker.
pub trait Socket: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Socket for T {}

/// Socket handle owned exclusively by the connection task.
pub type BoxedSocket = Box<dyn Socket>;

/// Connector for the duplex channel to the worker.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish a fresh socket to the worker.
    async fn connect(&self) -> io::Result<BoxedSocket>;
}

/// Production transport for the worker's local domain socket (a filesystem
/// socket on Unix, a namespaced pipe on Windows).
#[derive(Debug, Clone)]
pub struct LocalSocketTransport {
    socket_path: String,
}

impl LocalSocketTransport {
    #[must_use]
    pub fn new<S: Into<String>>(socket_path: S) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Resolve the configured path into a platform socket name.
    fn socket_name(&self) -> io::Result<Name<'_>> {
        #[cfg(unix)]
        {
            use std::path::Path;
            Path::new(&self.socket_path)
                .to_fs_name::<GenericFilePath>()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
        }
        #[cfg(windows)]
        {
            self.socket_path
                .as_str()
                .to_ns_name::<GenericNamespaced>()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
        }
    }
}

#[async_trait]
impl Transport for LocalSocketTransport {
    async fn connect(&self) -> io::Result<BoxedSocket> {
        let name = self.socket_name()?;
        let stream = LocalSocketStream::connect(name).await?;
        Ok(Box::new(stream))
    }
}
