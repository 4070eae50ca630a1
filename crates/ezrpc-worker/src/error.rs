//! Worker error types.

use thiserror::Error;

use ezrpc_protocol::ProtocolError;

/// Result type for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Errors that end a worker connection.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Transport or framing failure.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Invalid worker configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Failure reported by a request handler.
///
/// The message is sent back to the client as
/// `["EZ_ERR", "HANDLER_ERROR", message]`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    /// Creates a handler error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}
