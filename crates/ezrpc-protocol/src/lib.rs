//! Wire protocol for the ezrpc request/response broker.
//!
//! # Message kinds
//!
//! Every message is a multipart frame sequence whose first frame is an empty
//! routing delimiter:
//!
//! | Kind      | 0    | 1      | 2          | 3          | 4+        |
//! |-----------|------|--------|------------|------------|-----------|
//! | heartbeat | `""` | `0x01` | `0x01`     | service    |           |
//! | ack       | `""` | `0x01` | `0x03`     | request id |           |
//! | reply     | `""` | `0x01` | `0x02`     | request id | body...   |
//! | request   | `""` | `0x02` | request id | service    | body...   |
//!
//! # Transport
//!
//! Multipart messages travel over TCP or Unix sockets using
//! [`MultipartCodec`]. The first message on every stream is a greeting
//! carrying the sender's [`Identity`].
//!
//! # Example
//!
//! ```rust
//! use ezrpc_protocol::{Message, RequestId, ServiceName, encode_request};
//! use tokio_util::bytes::Bytes;
//!
//! let id = RequestId::from_static(b"\x00\x00\x00\x01");
//! let frames = encode_request(&id, &ServiceName::from("echo"), vec![Bytes::from("ping")]);
//! let decoded = Message::decode(frames).unwrap();
//! assert!(matches!(decoded, Message::Request { .. }));
//! ```

mod connection;
mod endpoint;
mod error;
mod framing;
mod types;

pub use connection::{Connection, ConnectionReceiver, ConnectionSender};
pub use endpoint::Endpoint;
pub use error::{ProtocolError, ProtocolResult};
pub use framing::MultipartCodec;
pub use types::{
    ErrorReply, Frames, Identity, Message, RequestId, ServiceName, encode_ack, encode_heartbeat,
    encode_reply, encode_request,
};

/// Protocol tag sent as the first frame of the greeting.
pub const PROTOCOL_VERSION: &[u8] = b"EZRPC/1";

/// Maximum total payload of one multipart message (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Maximum number of frames in one multipart message.
pub const MAX_FRAMES: usize = 1024;

/// Default number of outbound messages a connection queues before
/// [`Connection::send`] fails with [`ProtocolError::SendQueueFull`].
pub const DEFAULT_SEND_QUEUE: usize = 1024;

/// Tag byte for messages originating from workers.
pub const WORKER: u8 = 0x01;

/// Tag byte for messages originating from clients.
pub const CLIENT: u8 = 0x02;

/// Worker subtag: liveness announcement.
pub const HEARTBEAT: u8 = 0x01;

/// Worker subtag: result of a request.
pub const REPLY: u8 = 0x02;

/// Worker subtag: request accepted, result pending.
pub const ACK: u8 = 0x03;

/// First frame of every error reply body.
pub const EZ_ERR: &[u8] = b"EZ_ERR";
