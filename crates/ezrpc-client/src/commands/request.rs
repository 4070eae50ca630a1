//! Request command: sends one request and prints the reply.

use std::process::ExitCode;
use std::time::Duration;

use tokio_util::bytes::Bytes;
use tracing::debug;

use ezrpc_protocol::{ErrorReply, Frames, ServiceName};

use crate::config::ClientConfig;
use crate::connection::ClientConnection;
use crate::error::ClientResult;

/// Sends `frames` to `service` and prints each reply frame on its own line.
///
/// Exits with failure when the reply is an `EZ_ERR` body.
pub async fn run(
    config: &ClientConfig,
    service: String,
    frames: Vec<String>,
    timeout_ms: Option<u64>,
) -> ClientResult<ExitCode> {
    let timeout = timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.request_timeout());
    let service = ServiceName::from(service);
    let body: Frames = frames.into_iter().map(Bytes::from).collect();

    let client = ClientConnection::connect(&config.endpoint).await?;
    debug!(identity = %client.identity(), "Client connected");

    let reply = client.request(&service, body, timeout).await?;
    client.close();

    for frame in &reply {
        println!("{}", String::from_utf8_lossy(frame));
    }

    match ErrorReply::from_frames(&reply) {
        Some(error) => {
            eprintln!("error: {}", error);
            Ok(ExitCode::FAILURE)
        }
        None => Ok(ExitCode::SUCCESS),
    }
}
