//! Listening sockets for the broker.
//!
//! `tcp://` endpoints bind a TCP listener; `ipc://` endpoints bind a Unix
//! socket, removing a stale socket file first when configured to, and delete
//! the file again when the listener is dropped.

#[cfg(unix)]
use std::path::{Path, PathBuf};

use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info};
#[cfg(unix)]
use tracing::warn;

use ezrpc_protocol::{Connection, Endpoint, ProtocolResult};

use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};

/// Bound listening socket.
pub(crate) enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    /// Binds the endpoint named in `config`.
    pub(crate) async fn bind(config: &BrokerConfig) -> BrokerResult<Self> {
        match &config.bind {
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str()).await?;
                info!(address = %listener.local_addr()?, "Broker listening on TCP");
                Ok(Self::Tcp(listener))
            }
            #[cfg(unix)]
            Endpoint::Ipc(path) => Self::bind_unix(path, config.cleanup_stale_socket).await,
            #[cfg(not(unix))]
            Endpoint::Ipc(_) => Err(BrokerError::config(
                "ipc endpoints require unix domain sockets",
            )),
        }
    }

    #[cfg(unix)]
    async fn bind_unix(socket_path: &Path, cleanup_stale_socket: bool) -> BrokerResult<Self> {
        if let Some(parent) = socket_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            return Err(BrokerError::socket_path_invalid(
                parent.to_string_lossy().to_string(),
            ));
        }

        if socket_path.exists() {
            if !cleanup_stale_socket {
                return Err(BrokerError::socket_in_use(
                    socket_path.to_string_lossy().to_string(),
                ));
            }
            // A live socket means another broker owns the path.
            if UnixStream::connect(socket_path).await.is_ok() {
                return Err(BrokerError::socket_in_use(
                    socket_path.to_string_lossy().to_string(),
                ));
            }
            info!(path = %socket_path.display(), "Removing stale socket");
            std::fs::remove_file(socket_path)?;
        }

        let listener = UnixListener::bind(socket_path)?;
        info!(path = %socket_path.display(), "Broker listening on Unix socket");

        Ok(Self::Unix {
            listener,
            path: socket_path.to_path_buf(),
        })
    }

    /// Endpoint peers can connect to, with any ephemeral TCP port resolved.
    pub(crate) fn local_endpoint(&self) -> BrokerResult<Endpoint> {
        match self {
            Self::Tcp(listener) => Ok(Endpoint::tcp(listener.local_addr()?)),
            #[cfg(unix)]
            Self::Unix { path, .. } => Ok(Endpoint::ipc(path)),
        }
    }

    /// Accepts one raw stream; the greeting is read later.
    pub(crate) async fn accept(&self) -> BrokerResult<PeerStream> {
        match self {
            Self::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                debug!(peer = %addr, "Accepted TCP connection");
                Ok(PeerStream::Tcp(stream))
            }
            #[cfg(unix)]
            Self::Unix { listener, .. } => {
                let (stream, _addr) = listener.accept().await?;
                debug!("Accepted Unix connection");
                Ok(PeerStream::Unix(stream))
            }
        }
    }
}

#[cfg(unix)]
impl Drop for Listener {
    fn drop(&mut self) {
        let Self::Unix { path, .. } = self else {
            return;
        };
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&*path) {
                warn!(path = %path.display(), error = %e, "Failed to remove socket file");
            } else {
                debug!(path = %path.display(), "Removed socket file");
            }
        }
    }
}

/// Accepted stream that has not sent its greeting yet.
pub(crate) enum PeerStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl PeerStream {
    /// Reads the peer's greeting and wraps the stream in a [`Connection`]
    /// queueing at most `send_queue` outbound messages.
    pub(crate) async fn handshake(self, send_queue: usize) -> ProtocolResult<Connection> {
        match self {
            Self::Tcp(stream) => {
                stream.set_nodelay(true)?;
                Connection::accept_with_capacity(stream, send_queue).await
            }
            #[cfg(unix)]
            Self::Unix(stream) => Connection::accept_with_capacity(stream, send_queue).await,
        }
    }
}
