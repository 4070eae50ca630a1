//! Broker accept loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use ezrpc_protocol::{Endpoint, ProtocolError};

use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::router::Router;
use crate::socket::{Listener, PeerStream};

/// Broker relaying requests from clients to workers and replies back.
pub struct Broker {
    config: BrokerConfig,
    listener: Listener,
    router: Arc<Router>,
    connection_semaphore: Arc<Semaphore>,
}

impl Broker {
    /// Validates `config` and binds the endpoint it names.
    pub async fn bind(config: BrokerConfig) -> BrokerResult<Self> {
        config.validate()?;
        let listener = Listener::bind(&config).await?;
        let router = Arc::new(Router::new(config.worker_expiry));
        let connection_semaphore = Arc::new(Semaphore::new(config.max_connections));

        Ok(Self {
            config,
            listener,
            router,
            connection_semaphore,
        })
    }

    /// Endpoint peers can connect to.
    pub fn local_endpoint(&self) -> BrokerResult<Endpoint> {
        self.listener.local_endpoint()
    }

    /// Routing table of this broker.
    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    async fn accept(&self) -> BrokerResult<(PeerStream, OwnedSemaphorePermit)> {
        let permit = Arc::clone(&self.connection_semaphore)
            .acquire_owned()
            .await
            .map_err(|_| BrokerError::config("connection limit closed"))?;
        let stream = self.listener.accept().await?;
        Ok((stream, permit))
    }

    /// Runs the accept loop until an unrecoverable error.
    ///
    /// Accept failures are logged and the loop continues. Expired workers are
    /// pruned once per expiry period.
    pub async fn run(&self) -> BrokerResult<()> {
        let mut reaper = tokio::time::interval(self.config.worker_expiry);
        reaper.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                accepted = self.accept() => match accepted {
                    Ok((stream, permit)) => {
                        tokio::spawn(serve_peer(
                            stream,
                            Arc::clone(&self.router),
                            self.config.handshake_timeout,
                            self.config.send_queue,
                            permit,
                        ));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
                _ = reaper.tick() => {
                    let pruned = self.router.prune_expired();
                    if pruned > 0 {
                        debug!(pruned, "Pruned expired workers");
                    }
                }
            }
        }
    }

    /// Runs the accept loop until `shutdown` completes.
    pub async fn run_until_shutdown<S>(&self, shutdown: S) -> BrokerResult<()>
    where
        S: Future<Output = ()> + Send,
    {
        tokio::select! {
            result = self.run() => result,
            _ = shutdown => {
                info!("Shutdown signal received");
                Ok(())
            }
        }
    }
}

async fn serve_peer(
    stream: PeerStream,
    router: Arc<Router>,
    handshake_timeout: Duration,
    send_queue: usize,
    _permit: OwnedSemaphorePermit,
) {
    let handshake = stream.handshake(send_queue);
    let connection = match tokio::time::timeout(handshake_timeout, handshake).await {
        Ok(Ok(connection)) => connection,
        Ok(Err(e)) => {
            warn!(error = %e, "Handshake failed");
            return;
        }
        Err(_) => {
            warn!(
                timeout_ms = handshake_timeout.as_millis() as u64,
                "Peer sent no greeting in time"
            );
            return;
        }
    };

    let (sender, mut receiver) = connection.into_split();
    let identity = sender.identity().clone();
    if !router.register_peer(sender.clone()) {
        sender.close();
        return;
    }
    debug!(peer = %identity, "Peer connected");

    loop {
        match receiver.receive().await {
            Ok(frames) => router.handle(&identity, frames),
            Err(ProtocolError::ConnectionClosed) => {
                debug!(peer = %identity, "Peer disconnected");
                break;
            }
            Err(e) => {
                warn!(peer = %identity, error = %e, "Dropping peer after receive error");
                break;
            }
        }
    }

    sender.close();
    router.remove_peer(&identity);
}
