//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while framing, decoding or transporting messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message exceeds maximum allowed size.
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Message carries more frames than allowed.
    #[error("too many frames: {count} (max: {max})")]
    TooManyFrames { count: usize, max: usize },

    /// Message with zero frames.
    #[error("empty message")]
    EmptyMessage,

    /// Frame sequence does not match any message layout.
    #[error("malformed message: {reason}")]
    Malformed { reason: String },

    /// Unknown tag or subtag byte.
    #[error("unknown {position} tag: {tag:#04x}")]
    UnknownTag { position: &'static str, tag: u8 },

    /// Endpoint string could not be parsed.
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// Peer greeting missing or invalid.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Outbound queue is at its high-water mark.
    #[error("send queue full ({capacity} messages waiting)")]
    SendQueueFull { capacity: usize },

    /// Connection closed locally or by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// IO error during read/write/connect.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Creates a malformed message error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }

    /// Creates an invalid endpoint error.
    pub fn invalid_endpoint(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEndpoint {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }
}
