//! Broker configuration.

use std::time::Duration;

use ezrpc_protocol::{DEFAULT_SEND_QUEUE, Endpoint};

use crate::error::{BrokerError, BrokerResult};

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Endpoint to listen on.
    pub bind: Endpoint,

    /// How long a worker stays routable after its last heartbeat.
    pub worker_expiry: Duration,

    /// Time a new peer has to send its greeting.
    pub handshake_timeout: Duration,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Messages queued per peer before the broker stops routing to it.
    pub send_queue: usize,

    /// Whether to remove a stale socket file before binding an `ipc://`
    /// endpoint.
    pub cleanup_stale_socket: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind: Endpoint::default(),
            worker_expiry: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(5),
            max_connections: 1024,
            send_queue: DEFAULT_SEND_QUEUE,
            cleanup_stale_socket: true,
        }
    }
}

impl BrokerConfig {
    /// Creates a broker configuration listening on `bind`.
    pub fn new(bind: Endpoint) -> Self {
        Self {
            bind,
            ..Default::default()
        }
    }

    /// Builder: set worker expiry.
    pub fn with_worker_expiry(mut self, expiry: Duration) -> Self {
        self.worker_expiry = expiry;
        self
    }

    /// Builder: set handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Builder: set max connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Builder: set the per-peer send queue length.
    pub fn with_send_queue(mut self, send_queue: usize) -> Self {
        self.send_queue = send_queue;
        self
    }

    /// Builder: set cleanup stale socket.
    pub fn with_cleanup_stale_socket(mut self, cleanup: bool) -> Self {
        self.cleanup_stale_socket = cleanup;
        self
    }

    /// Checks that the configuration can run a broker.
    pub fn validate(&self) -> BrokerResult<()> {
        if self.worker_expiry.is_zero() {
            return Err(BrokerError::config(
                "worker_expiry must be greater than zero",
            ));
        }
        if self.handshake_timeout.is_zero() {
            return Err(BrokerError::config(
                "handshake_timeout must be greater than zero",
            ));
        }
        if self.max_connections == 0 {
            return Err(BrokerError::config("max_connections must be at least 1"));
        }
        if self.send_queue == 0 {
            return Err(BrokerError::config("send_queue must be at least 1"));
        }
        Ok(())
    }
}
