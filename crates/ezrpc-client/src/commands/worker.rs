//! Worker command: runs an echo worker for one service.

use tokio_util::bytes::{BufMut, Bytes, BytesMut};
use tracing::info;

use ezrpc_core::SignalHandler;
use ezrpc_protocol::Frames;
use ezrpc_worker::{HandlerError, WorkerConnection};

use crate::config::ClientConfig;
use crate::error::ClientResult;

/// Options given on the command line.
#[derive(Debug, Default)]
pub struct WorkerOptions {
    pub suffix: Option<String>,
    pub queue_length: Option<usize>,
}

/// Runs an echo worker for `service` until SIGINT, SIGTERM or broker
/// disconnect.
pub async fn run(config: &ClientConfig, service: String, options: WorkerOptions) -> ClientResult<()> {
    let mut worker_config = config.to_worker_config(service);
    if let Some(queue_length) = options.queue_length {
        worker_config = worker_config.with_queue_length(queue_length);
    }
    let suffix = Bytes::from(options.suffix.unwrap_or_else(|| config.worker.suffix.clone()));

    let signal_handler = SignalHandler::new();
    signal_handler.spawn_listener();

    let worker = WorkerConnection::connect(worker_config).await?;
    info!(identity = %worker.identity(), "Worker connected");

    worker
        .serve_until_shutdown(
            move |body: Frames| {
                let suffix = suffix.clone();
                async move { Ok::<Frames, HandlerError>(append_suffix(body, &suffix)) }
            },
            signal_handler.shutdown().wait(),
        )
        .await?;

    info!("Worker stopped");
    Ok(())
}

/// Appends `suffix` to every frame of `body`.
pub fn append_suffix(body: Frames, suffix: &[u8]) -> Frames {
    body.into_iter()
        .map(|frame| {
            let mut out = BytesMut::with_capacity(frame.len() + suffix.len());
            out.put_slice(&frame);
            out.put_slice(suffix);
            out.freeze()
        })
        .collect()
}
