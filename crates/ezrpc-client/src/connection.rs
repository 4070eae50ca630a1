//! Client side of the broker protocol.
//!
//! One [`ClientConnection`] carries any number of concurrent requests. A single
//! listener task owns the receiving half of the connection and hands each
//! REPLY to the request waiting on its correlation id.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use ezrpc_protocol::{
    Connection, ConnectionReceiver, ConnectionSender, Endpoint, ErrorReply, Frames, Identity,
    Message, ServiceName, encode_request,
};

use crate::error::{ClientError, ClientResult};
use crate::pending::{IdSource, PendingGuard, PendingRequests, RandomIds};

/// Connection issuing correlated requests to named services.
pub struct ClientConnection {
    sender: ConnectionSender,
    pending: Arc<PendingRequests>,
    ids: Arc<dyn IdSource>,
    listener: JoinHandle<()>,
}

impl ClientConnection {
    /// Connects to the broker at `endpoint` under a fresh client identity.
    pub async fn connect(endpoint: &Endpoint) -> ClientResult<Self> {
        let connection = Connection::connect(endpoint, Identity::client()).await?;
        Ok(Self::from_connection(connection))
    }

    /// Wraps an established connection and starts the listener task.
    pub fn from_connection(connection: Connection) -> Self {
        Self::with_id_source(connection, Arc::new(RandomIds))
    }

    /// Like [`ClientConnection::from_connection`] with a custom id source.
    pub fn with_id_source(connection: Connection, ids: Arc<dyn IdSource>) -> Self {
        let (sender, receiver) = connection.into_split();
        let pending = Arc::new(PendingRequests::default());
        let listener = tokio::spawn(listen(receiver, Arc::clone(&pending)));

        Self {
            sender,
            pending,
            ids,
            listener,
        }
    }

    /// Identity this connection announced to the broker.
    pub fn identity(&self) -> &Identity {
        self.sender.identity()
    }

    /// Sends `body` to `service` and waits up to `timeout` for the reply.
    ///
    /// Returns the reply body, or `["EZ_ERR", "TIMEOUT"]` if no reply
    /// arrived in time. Errors are reserved for transport failures and a dead
    /// listener.
    pub async fn request(
        &self,
        service: &ServiceName,
        body: Frames,
        timeout: Duration,
    ) -> ClientResult<Frames> {
        let (request_id, slot) = self.pending.register(self.ids.as_ref())?;
        let _guard = PendingGuard::new(&self.pending, request_id.clone());

        debug!(
            request_id = %request_id,
            service = %service,
            frames = body.len(),
            "Sending request"
        );
        self.sender
            .send(encode_request(&request_id, service, body))?;

        match tokio::time::timeout(timeout, slot).await {
            Ok(Ok(reply)) => {
                trace!(request_id = %request_id, frames = reply.len(), "Reply received");
                Ok(reply)
            }
            Ok(Err(_)) => Err(ClientError::ListenerTerminated),
            Err(_) => {
                debug!(
                    request_id = %request_id,
                    service = %service,
                    timeout_ms = timeout.as_millis() as u64,
                    "Request timed out"
                );
                Ok(ErrorReply::Timeout.to_frames())
            }
        }
    }

    /// Number of requests currently waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Returns true while the listener task is running.
    pub fn is_listening(&self) -> bool {
        !self.listener.is_finished()
    }

    /// Closes the connection; pending and later requests fail. Idempotent.
    pub fn close(&self) {
        self.sender.close();
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.sender.close();
        self.listener.abort();
    }
}

async fn listen(mut receiver: ConnectionReceiver, pending: Arc<PendingRequests>) {
    let identity = receiver.identity().clone();

    let error = loop {
        let frames = match receiver.receive().await {
            Ok(frames) => frames,
            Err(e) => break e,
        };

        match Message::decode(frames) {
            Ok(Message::Reply { request_id, body }) => {
                if !pending.fulfill(&request_id, body) {
                    warn!(
                        request_id = %request_id,
                        "Discarding reply with no pending request"
                    );
                }
            }
            Ok(Message::Ack { request_id }) => {
                debug!(request_id = %request_id, "Request acknowledged");
            }
            Ok(other) => {
                warn!(kind = other.kind(), "Ignoring unexpected message");
            }
            Err(e) => {
                warn!(error = %e, "Discarding malformed message");
            }
        }
    };

    let failed = pending.terminate();
    error!(
        identity = %identity,
        error = %error,
        failed_requests = failed,
        "Client listener terminated"
    );
}
