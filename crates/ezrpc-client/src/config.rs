//! CLI configuration.
//!
//! All settings live in a single `config.toml` file at
//! `~/.config/ezrpc/config.toml` by default:
//!
//! ```toml
//! endpoint = "tcp://127.0.0.1:5555"
//!
//! [client]
//! timeout_ms = 5000
//!
//! [worker]
//! liveliness_ms = 1000
//! queue_length = 50
//! suffix = "-pong"
//!
//! [broker]
//! worker_expiry_ms = 3000
//! max_connections = 1024
//! send_queue = 1024
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use ezrpc_broker::BrokerConfig;
use ezrpc_protocol::{Endpoint, ServiceName};
use ezrpc_worker::{DEFAULT_LIVELINESS, DEFAULT_QUEUE_LENGTH, WorkerConfig};

/// Configuration for the ezrpc command-line tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Broker endpoint that clients and workers connect to.
    pub endpoint: Endpoint,

    /// Request settings.
    pub client: ClientSettings,

    /// Worker settings.
    pub worker: WorkerSettings,

    /// Broker settings.
    pub broker: BrokerSettings,
}

/// Request settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// How long a request waits for its reply, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self { timeout_ms: 5000 }
    }
}

/// Worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Heartbeat interval in milliseconds.
    pub liveliness_ms: u64,

    /// Maximum number of handlers running at once.
    pub queue_length: usize,

    /// Text the echo worker appends to every frame.
    pub suffix: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            liveliness_ms: DEFAULT_LIVELINESS.as_millis() as u64,
            queue_length: DEFAULT_QUEUE_LENGTH,
            suffix: "-pong".to_string(),
        }
    }
}

/// Broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// Endpoint to listen on; defaults to `endpoint`.
    pub bind: Option<Endpoint>,

    /// Milliseconds after the last heartbeat before a worker is dropped.
    pub worker_expiry_ms: u64,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Messages queued per peer before the broker stops routing to it.
    pub send_queue: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        let defaults = BrokerConfig::default();
        Self {
            bind: None,
            worker_expiry_ms: defaults.worker_expiry.as_millis() as u64,
            max_connections: defaults.max_connections,
            send_queue: defaults.send_queue,
        }
    }
}

impl ClientConfig {
    /// Loads configuration from the default path.
    pub fn load() -> Result<Self, String> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, String> {
        let content =
            std::fs::read_to_string(path).map_err(|e| format!("failed to read config: {}", e))?;
        toml::from_str(&content).map_err(|e| format!("failed to parse config: {}", e))
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Returns the default configuration directory.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ezrpc")
    }

    /// Checks values the file format cannot rule out.
    pub fn validate(&self) -> Result<(), String> {
        if self.client.timeout_ms == 0 {
            return Err("client.timeout_ms must be greater than zero".to_string());
        }
        if self.worker.liveliness_ms == 0 {
            return Err("worker.liveliness_ms must be greater than zero".to_string());
        }
        if self.worker.queue_length == 0 {
            return Err("worker.queue_length must be at least 1".to_string());
        }
        if self.broker.worker_expiry_ms <= self.worker.liveliness_ms {
            return Err(format!(
                "broker.worker_expiry_ms ({}) must exceed worker.liveliness_ms ({})",
                self.broker.worker_expiry_ms, self.worker.liveliness_ms
            ));
        }
        if self.broker.max_connections == 0 {
            return Err("broker.max_connections must be at least 1".to_string());
        }
        if self.broker.send_queue == 0 {
            return Err("broker.send_queue must be at least 1".to_string());
        }
        Ok(())
    }

    /// How long a request waits for its reply.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.client.timeout_ms)
    }

    /// Worker configuration for `service` behind `endpoint`.
    pub fn to_worker_config(&self, service: impl Into<ServiceName>) -> WorkerConfig {
        WorkerConfig::new(self.endpoint.clone(), service)
            .with_liveliness(Duration::from_millis(self.worker.liveliness_ms))
            .with_queue_length(self.worker.queue_length)
    }

    /// Broker configuration, binding `broker.bind` or else `endpoint`.
    pub fn to_broker_config(&self) -> BrokerConfig {
        let bind = self
            .broker
            .bind
            .clone()
            .unwrap_or_else(|| self.endpoint.clone());
        BrokerConfig::new(bind)
            .with_worker_expiry(Duration::from_millis(self.broker.worker_expiry_ms))
            .with_max_connections(self.broker.max_connections)
            .with_send_queue(self.broker.send_queue)
    }
}
