//! Addressable duplex connection carrying multipart messages.
//!
//! A [`Connection`] owns one byte stream. Outbound messages are queued on a
//! bounded channel and written by a background task. [`Connection::send`]
//! never suspends: once the queue holds its capacity of unwritten messages it
//! fails with [`ProtocolError::SendQueueFull`], so a peer that stops reading
//! pushes back on the sender instead of growing the queue.
//! [`ConnectionSender::send_async`] waits for room instead.
//!
//! The first message a connecting peer sends is the greeting
//! `[PROTOCOL_VERSION, identity]`, which the accepting side consumes in
//! [`Connection::accept`].

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{DEFAULT_SEND_QUEUE, PROTOCOL_VERSION};
use crate::endpoint::Endpoint;
use crate::error::{ProtocolError, ProtocolResult};
use crate::framing::MultipartCodec;
use crate::types::{Frames, Identity};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One duplex multipart connection with a fixed identity.
pub struct Connection {
    sender: ConnectionSender,
    receiver: ConnectionReceiver,
}

impl Connection {
    /// Connects to `endpoint` and announces `identity` with the greeting.
    ///
    /// Transport failures are returned as-is; nothing is retried.
    pub async fn connect(endpoint: &Endpoint, identity: Identity) -> ProtocolResult<Self> {
        debug!(endpoint = %endpoint, identity = %identity, "Connecting");

        let connection = match endpoint {
            Endpoint::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                Self::handshake(stream, identity)?
            }
            #[cfg(unix)]
            Endpoint::Ipc(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Self::handshake(stream, identity)?
            }
            #[cfg(not(unix))]
            Endpoint::Ipc(_) => {
                return Err(ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "ipc endpoints require unix domain sockets",
                )));
            }
        };

        debug!(endpoint = %endpoint, "Connected");
        Ok(connection)
    }

    /// Wraps an already connected stream and queues the greeting.
    pub fn handshake<S>(stream: S, identity: Identity) -> ProtocolResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let connection = Self::from_stream(stream, identity);
        connection.send(vec![
            Bytes::from_static(PROTOCOL_VERSION),
            connection.identity().to_frame(),
        ])?;
        Ok(connection)
    }

    /// Accepts a peer on `stream`, reading its greeting to learn its identity.
    pub async fn accept<S>(stream: S) -> ProtocolResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::accept_with_capacity(stream, DEFAULT_SEND_QUEUE).await
    }

    /// Like [`Connection::accept`], queueing at most `capacity` outbound
    /// messages.
    pub async fn accept_with_capacity<S>(stream: S, capacity: usize) -> ProtocolResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FramedRead::new(Box::new(read_half) as BoxedReader, MultipartCodec);

        let greeting = match reader.next().await {
            Some(frames) => frames?,
            None => {
                return Err(ProtocolError::Handshake(
                    "peer closed before greeting".to_string(),
                ));
            }
        };
        let identity = parse_greeting(greeting)?;
        trace!(identity = %identity, "Greeting received");

        Ok(Self::assemble(reader, Box::new(write_half), identity, capacity))
    }

    /// Wraps a stream without any greeting exchange.
    pub fn from_stream<S>(stream: S, identity: Identity) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::from_stream_with_capacity(stream, identity, DEFAULT_SEND_QUEUE)
    }

    /// Like [`Connection::from_stream`], queueing at most `capacity` outbound
    /// messages.
    pub fn from_stream_with_capacity<S>(stream: S, identity: Identity, capacity: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FramedRead::new(Box::new(read_half) as BoxedReader, MultipartCodec);
        Self::assemble(reader, Box::new(write_half), identity, capacity)
    }

    fn assemble(
        reader: FramedRead<BoxedReader, MultipartCodec>,
        writer: BoxedWriter,
        identity: Identity,
        capacity: usize,
    ) -> Self {
        let closed = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity.max(1));

        tokio::spawn(write_loop(
            FramedWrite::new(writer, MultipartCodec),
            outbound_rx,
            closed.clone(),
            identity.clone(),
        ));

        Self {
            sender: ConnectionSender {
                identity: identity.clone(),
                outbound: outbound_tx,
                closed: closed.clone(),
            },
            receiver: ConnectionReceiver {
                identity,
                reader,
                closed,
            },
        }
    }

    /// Identity of this end of the connection.
    pub fn identity(&self) -> &Identity {
        &self.sender.identity
    }

    /// Queues one multipart message for transmission.
    pub fn send(&self, frames: Frames) -> ProtocolResult<()> {
        self.sender.send(frames)
    }

    /// Waits for the next multipart message.
    pub async fn receive(&mut self) -> ProtocolResult<Frames> {
        self.receiver.receive().await
    }

    /// Closes the connection. Idempotent.
    pub fn close(&self) {
        self.sender.close();
    }

    /// Splits into a cloneable sending half and the receiving half.
    pub fn into_split(self) -> (ConnectionSender, ConnectionReceiver) {
        (self.sender, self.receiver)
    }
}

/// Sending half of a [`Connection`]; cheap to clone.
#[derive(Clone)]
pub struct ConnectionSender {
    identity: Identity,
    outbound: mpsc::Sender<Frames>,
    closed: CancellationToken,
}

impl ConnectionSender {
    /// Identity of this end of the connection.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Queues one multipart message for transmission.
    ///
    /// Fails with [`ProtocolError::SendQueueFull`] while the queue is at
    /// capacity, and with [`ProtocolError::ConnectionClosed`] once the
    /// connection was closed or the writer hit a transport error.
    pub fn send(&self, frames: Frames) -> ProtocolResult<()> {
        if self.closed.is_cancelled() {
            return Err(ProtocolError::ConnectionClosed);
        }
        match self.outbound.try_send(frames) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ProtocolError::SendQueueFull {
                capacity: self.outbound.max_capacity(),
            }),
            Err(TrySendError::Closed(_)) => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Queues one multipart message, waiting while the queue is full.
    pub async fn send_async(&self, frames: Frames) -> ProtocolResult<()> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(ProtocolError::ConnectionClosed),
            sent = self.outbound.send(frames) => {
                sent.map_err(|_| ProtocolError::ConnectionClosed)
            }
        }
    }

    /// Closes the whole connection. Idempotent.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(identity = %self.identity, "Closing connection");
            self.closed.cancel();
        }
    }

    /// Returns true once the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Receiving half of a [`Connection`].
pub struct ConnectionReceiver {
    identity: Identity,
    reader: FramedRead<BoxedReader, MultipartCodec>,
    closed: CancellationToken,
}

impl ConnectionReceiver {
    /// Identity of this end of the connection.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Waits for the next multipart message.
    ///
    /// Returns [`ProtocolError::ConnectionClosed`] on EOF or after close; any
    /// framing error also ends the stream.
    pub async fn receive(&mut self) -> ProtocolResult<Frames> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(ProtocolError::ConnectionClosed),
            next = self.reader.next() => match next {
                Some(Ok(frames)) => Ok(frames),
                Some(Err(e)) => {
                    self.closed.cancel();
                    Err(e)
                }
                None => {
                    self.closed.cancel();
                    Err(ProtocolError::ConnectionClosed)
                }
            },
        }
    }
}

async fn write_loop(
    mut writer: FramedWrite<BoxedWriter, MultipartCodec>,
    mut outbound: mpsc::Receiver<Frames>,
    closed: CancellationToken,
    identity: Identity,
) {
    loop {
        tokio::select! {
            biased;
            _ = closed.cancelled() => {
                // Flush what was queued before the close.
                while let Ok(frames) = outbound.try_recv() {
                    if writer.feed(frames).await.is_err() {
                        break;
                    }
                }
                break;
            }
            next = outbound.recv() => match next {
                Some(frames) => {
                    if let Err(e) = writer.send(frames).await {
                        warn!(identity = %identity, error = %e, "Send failed, closing connection");
                        closed.cancel();
                        break;
                    }
                }
                None => break,
            },
        }
    }

    if let Err(e) = writer.close().await {
        trace!(identity = %identity, error = %e, "Error shutting down writer");
    }
    trace!(identity = %identity, "Writer stopped");
}

fn parse_greeting(greeting: Frames) -> ProtocolResult<Identity> {
    match greeting.as_slice() {
        [version, identity] if &version[..] == PROTOCOL_VERSION && !identity.is_empty() => {
            Ok(Identity::new(identity.clone()))
        }
        [version, _] if &version[..] != PROTOCOL_VERSION => Err(ProtocolError::Handshake(
            format!(
                "unsupported protocol {:?}",
                String::from_utf8_lossy(version)
            ),
        )),
        _ => Err(ProtocolError::Handshake(format!(
            "malformed greeting with {} frames",
            greeting.len()
        ))),
    }
}
