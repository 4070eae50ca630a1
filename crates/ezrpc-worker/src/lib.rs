//! Worker connection for ezrpc.
//!
//! A worker serves one named service: it heartbeats to the broker, receives
//! requests, acknowledges each one and replies with the handler's result.
//!
//! ```no_run
//! use ezrpc_protocol::{Endpoint, Frames};
//! use ezrpc_worker::{HandlerError, WorkerConfig, WorkerConnection};
//!
//! # async fn run() -> ezrpc_worker::WorkerResult<()> {
//! let config = WorkerConfig::new(Endpoint::default(), "echo");
//! let worker = WorkerConnection::connect(config).await?;
//! worker
//!     .serve(|body: Frames| async move { Ok::<_, HandlerError>(body) })
//!     .await
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;

pub use config::{DEFAULT_LIVELINESS, DEFAULT_QUEUE_LENGTH, WorkerConfig};
pub use connection::{WorkerConnection, WorkerStats};
pub use error::{HandlerError, WorkerError, WorkerResult};
