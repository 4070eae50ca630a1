//! Subcommand implementations.

pub mod broker;
pub mod config;
pub mod request;
pub mod worker;
