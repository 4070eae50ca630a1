//! Client connection and the `ezrpc` command-line interface.
//!
//! [`ClientConnection`] sends requests to named services through a broker and
//! matches each reply to its request by correlation id, so any number of
//! requests may be in flight on one connection.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use ezrpc_client::ClientConnection;
//! use ezrpc_protocol::{Endpoint, ErrorReply, ServiceName};
//! use tokio_util::bytes::Bytes;
//!
//! # async fn run() -> ezrpc_client::ClientResult<()> {
//! let client = ClientConnection::connect(&Endpoint::default()).await?;
//! let reply = client
//!     .request(
//!         &ServiceName::from("echo"),
//!         vec![Bytes::from("ping")],
//!         Duration::from_secs(2),
//!     )
//!     .await?;
//! if let Some(error) = ErrorReply::from_frames(&reply) {
//!     eprintln!("request failed: {}", error);
//! }
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
mod pending;

pub use cli::Cli;
pub use connection::ClientConnection;
pub use error::{ClientError, ClientResult};
pub use pending::{IdSource, MAX_ID_ATTEMPTS, RandomIds};
