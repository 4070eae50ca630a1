//! Broker for ezrpc.
//!
//! The broker accepts client and worker connections on one endpoint. Workers
//! register a service by sending heartbeats; client requests for that service
//! are forwarded to a live worker in round-robin order, and the worker's ACK
//! and REPLY are routed back to the requesting client.
//!
//! # Example
//!
//! ```rust,no_run
//! use ezrpc_broker::{Broker, BrokerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = Broker::bind(BrokerConfig::default()).await?;
//!     println!("listening on {}", broker.local_endpoint()?);
//!     broker.run().await?;
//!     Ok(())
//! }
//! ```

mod broker;
mod config;
mod error;
mod router;
mod socket;

pub use broker::Broker;
pub use config::BrokerConfig;
pub use error::{BrokerError, BrokerResult};
pub use router::Router;
