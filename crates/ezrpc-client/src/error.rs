//! Client error types.

use thiserror::Error;

use ezrpc_protocol::ProtocolError;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in the client.
///
/// A request that times out is not an error: it yields the
/// `["EZ_ERR", "TIMEOUT"]` reply body instead.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connecting or sending failed at the transport layer.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The reply listener stopped; the connection cannot serve requests.
    #[error("client listener terminated")]
    ListenerTerminated,

    /// No request id free of collisions could be drawn.
    #[error("no free request id after {attempts} attempts")]
    IdSpaceExhausted { attempts: usize },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Broker failed while running from the CLI.
    #[error("broker error: {0}")]
    Broker(#[from] ezrpc_broker::BrokerError),

    /// Worker failed while running from the CLI.
    #[error("worker error: {0}")]
    Worker(#[from] ezrpc_worker::WorkerError),

    /// Tracing could not be initialized.
    #[error("tracing error: {0}")]
    Tracing(#[from] ezrpc_core::TracingError),
}
