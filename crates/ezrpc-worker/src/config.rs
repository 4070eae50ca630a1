//! Worker configuration.

use std::time::Duration;

use ezrpc_protocol::{Endpoint, ServiceName};

use crate::error::{WorkerError, WorkerResult};

/// Default number of handlers allowed to run at once.
pub const DEFAULT_QUEUE_LENGTH: usize = 50;

/// Default interval between heartbeats.
pub const DEFAULT_LIVELINESS: Duration = Duration::from_millis(1000);

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Broker to connect to.
    pub endpoint: Endpoint,

    /// Service this worker serves.
    pub service: ServiceName,

    /// Interval between heartbeats.
    pub liveliness: Duration,

    /// Maximum number of handlers running at once.
    pub queue_length: usize,
}

impl WorkerConfig {
    /// Creates a configuration for `service` behind the broker at `endpoint`.
    pub fn new(endpoint: Endpoint, service: impl Into<ServiceName>) -> Self {
        Self {
            endpoint,
            service: service.into(),
            liveliness: DEFAULT_LIVELINESS,
            queue_length: DEFAULT_QUEUE_LENGTH,
        }
    }

    /// Builder: set the heartbeat interval.
    pub fn with_liveliness(mut self, liveliness: Duration) -> Self {
        self.liveliness = liveliness;
        self
    }

    /// Builder: set the queue length.
    pub fn with_queue_length(mut self, queue_length: usize) -> Self {
        self.queue_length = queue_length;
        self
    }

    /// Checks that the configuration can run a worker.
    pub fn validate(&self) -> WorkerResult<()> {
        if self.queue_length == 0 {
            return Err(WorkerError::Config(
                "queue_length must be at least 1".to_string(),
            ));
        }
        if self.liveliness.is_zero() {
            return Err(WorkerError::Config(
                "liveliness must be greater than zero".to_string(),
            ));
        }
        if self.service.as_bytes().is_empty() {
            return Err(WorkerError::Config(
                "service name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
