//! Broker command: runs a broker in the foreground.

use tracing::info;

use ezrpc_broker::Broker;
use ezrpc_core::SignalHandler;
use ezrpc_protocol::Endpoint;

use crate::config::ClientConfig;
use crate::error::ClientResult;

/// Runs a broker until SIGINT or SIGTERM.
pub async fn run(config: &ClientConfig, bind: Option<Endpoint>) -> ClientResult<()> {
    let mut broker_config = config.to_broker_config();
    if let Some(bind) = bind {
        broker_config.bind = bind;
    }

    let signal_handler = SignalHandler::new();
    signal_handler.spawn_listener();

    let broker = Broker::bind(broker_config).await?;
    info!(endpoint = %broker.local_endpoint()?, "Broker started");

    broker
        .run_until_shutdown(signal_handler.shutdown().wait())
        .await?;

    info!("Broker stopped");
    Ok(())
}
