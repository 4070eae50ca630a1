//! Broker addresses.
//!
//! Endpoints use the familiar transport-prefixed form:
//! - `tcp://127.0.0.1:5555`
//! - `ipc:///run/user/1000/ezrpc.sock`

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Address a broker listens on and peers connect to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Endpoint {
    /// TCP `host:port`.
    Tcp(String),
    /// Unix domain socket path.
    Ipc(PathBuf),
}

impl Endpoint {
    /// Parses `tcp://host:port` or `ipc://path`.
    pub fn parse(endpoint: &str) -> Result<Self, ProtocolError> {
        let Some((scheme, rest)) = endpoint.split_once("://") else {
            return Err(ProtocolError::invalid_endpoint(
                endpoint,
                "expected <transport>://<address>",
            ));
        };

        match scheme {
            "tcp" => {
                let Some((host, port)) = rest.rsplit_once(':') else {
                    return Err(ProtocolError::invalid_endpoint(endpoint, "missing port"));
                };
                if host.is_empty() {
                    return Err(ProtocolError::invalid_endpoint(endpoint, "missing host"));
                }
                if port.parse::<u16>().is_err() {
                    return Err(ProtocolError::invalid_endpoint(
                        endpoint,
                        format!("invalid port {:?}", port),
                    ));
                }
                Ok(Self::Tcp(rest.to_string()))
            }
            "ipc" => {
                if rest.is_empty() {
                    return Err(ProtocolError::invalid_endpoint(endpoint, "missing path"));
                }
                Ok(Self::Ipc(PathBuf::from(rest)))
            }
            other => Err(ProtocolError::invalid_endpoint(
                endpoint,
                format!("unsupported transport {:?}", other),
            )),
        }
    }

    /// TCP endpoint for `addr`.
    pub fn tcp(addr: impl fmt::Display) -> Self {
        Self::Tcp(addr.to_string())
    }

    /// Unix socket endpoint for `path`.
    pub fn ipc(path: impl Into<PathBuf>) -> Self {
        Self::Ipc(path.into())
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::Tcp("127.0.0.1:5555".to_string())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{}", addr),
            Self::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Endpoint {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}
