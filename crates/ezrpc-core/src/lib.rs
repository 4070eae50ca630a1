//! Shared runtime pieces for the ezrpc crates: tracing setup and shutdown
//! signal handling.

pub mod signals;
pub mod tracing;

pub use signals::{ShutdownHandle, ShutdownSignal, SignalHandler};
pub use tracing::{TracingConfig, TracingError, TracingOutputFormat, init_tracing};
