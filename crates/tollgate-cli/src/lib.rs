//! Tollgate operator CLI
//!
//! Builds admin requests, collects and combines multisig signatures offline,
//! and plans fee withdrawals against a ledger fixture.

#![deny(unsafe_code)]

pub mod commands;
pub mod config;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use commands::{execute, Command};
pub use config::TollgateConfig;

/// Tollgate CLI
#[derive(Debug, Parser)]
#[command(name = "tollgate")]
#[command(about = "Threshold-authorized admin requests", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "TOLLGATE_CONFIG")]
    pub config: Option<String>,

    /// Log level, overrides `[logging] level`
    #[arg(long, global = true, env = "TOLLGATE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, global = true, env = "TOLLGATE_LOG_JSON")]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Logs go to stderr; stdout carries command output.
pub fn init_tracing(level: &str, json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
