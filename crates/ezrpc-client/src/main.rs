//! ezrpc CLI entry point.

use std::process::ExitCode;

use clap::Parser;
use tracing::Level;

use ezrpc_client::cli::{Cli, Command, ConfigAction};
use ezrpc_client::commands;
use ezrpc_client::commands::worker::WorkerOptions;
use ezrpc_client::config::ClientConfig;
use ezrpc_client::error::{ClientError, ClientResult};
use ezrpc_core::{TracingConfig, TracingOutputFormat, init_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(tracing_config(&cli)) {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn tracing_config(cli: &Cli) -> TracingConfig {
    let mut config = if cli.debug {
        TracingConfig::cli_debug()
    } else if cli.is_long_running() {
        if cli.log_format == Some(ezrpc_client::cli::LogFormat::Json) {
            TracingConfig::service()
        } else {
            TracingConfig::default().with_level(Level::INFO)
        }
    } else {
        TracingConfig::default()
    };

    if let Some(format) = cli.log_format {
        config = config.with_format(TracingOutputFormat::from(format));
    }
    config
}

async fn run(cli: Cli) -> ClientResult<ExitCode> {
    // Load configuration
    let mut config = if let Some(ref path) = cli.config {
        ClientConfig::load_from(path).map_err(ClientError::Config)?
    } else {
        ClientConfig::load().map_err(ClientError::Config)?
    };
    if let Some(ref endpoint) = cli.endpoint {
        config.endpoint = endpoint.clone();
    }
    if cli.needs_valid_config() {
        config.validate().map_err(ClientError::Config)?;
    }

    match cli.command {
        Command::Broker { bind } => commands::broker::run(&config, bind).await?,
        Command::Worker {
            service,
            suffix,
            queue_length,
        } => {
            let options = WorkerOptions {
                suffix,
                queue_length,
            };
            commands::worker::run(&config, service, options).await?
        }
        Command::Request {
            service,
            frames,
            timeout_ms,
        } => return commands::request::run(&config, service, frames, timeout_ms).await,
        Command::Config { action } => match action {
            ConfigAction::Dump => commands::config::dump(&config)?,
            ConfigAction::Validate => commands::config::validate(&config)?,
            ConfigAction::Path => commands::config::path()?,
        },
    }

    Ok(ExitCode::SUCCESS)
}
