//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use ezrpc_core::TracingOutputFormat;
use ezrpc_protocol::Endpoint;

/// ezrpc - brokered request/reply over multipart messages
#[derive(Debug, Parser)]
#[command(name = "ezrpc")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "EZRPC_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Broker endpoint (tcp://host:port or ipc://path)
    #[arg(long, short, env = "EZRPC_ENDPOINT", global = true)]
    pub endpoint: Option<Endpoint>,

    /// Enable debug output
    #[arg(long, short = 'v', global = true)]
    pub debug: bool,

    /// Log output format
    #[arg(long, value_enum, global = true)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Returns whether the command runs until interrupted.
    pub fn is_long_running(&self) -> bool {
        matches!(self.command, Command::Broker { .. } | Command::Worker { .. })
    }

    /// Returns whether the command must refuse an invalid configuration.
    ///
    /// `config` subcommands report problems themselves.
    pub fn needs_valid_config(&self) -> bool {
        !matches!(self.command, Command::Config { .. })
    }
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a broker in the foreground
    Broker {
        /// Endpoint to listen on (defaults to the broker endpoint)
        #[arg(long)]
        bind: Option<Endpoint>,
    },

    /// Run an echo worker for a service
    Worker {
        /// Service to serve
        service: String,

        /// Text appended to every request frame
        #[arg(long)]
        suffix: Option<String>,

        /// Maximum number of requests handled at once
        #[arg(long)]
        queue_length: Option<usize>,
    },

    /// Send one request and print the reply frames
    Request {
        /// Service to call
        service: String,

        /// Request body, one frame per argument
        frames: Vec<String>,

        /// Milliseconds to wait for the reply
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration actions.
#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Dump current configuration
    Dump,

    /// Validate configuration
    Validate,

    /// Show configuration file path
    Path,
}

/// Log output formats selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

impl From<LogFormat> for TracingOutputFormat {
    fn from(format: LogFormat) -> Self {
        match format {
            LogFormat::Pretty => TracingOutputFormat::Pretty,
            LogFormat::Compact => TracingOutputFormat::Compact,
            LogFormat::Json => TracingOutputFormat::Json,
        }
    }
}
