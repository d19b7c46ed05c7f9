//! CLI command definitions and dispatch.

pub mod config;
pub mod listen;
pub mod queue;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use ridelink_core::config::{AppConfig, LoggingConfig};
use ridelink_core::error::AppError;

/// RideLink real-time ride channel client
#[derive(Debug, Parser)]
#[command(name = "ridelink", version, about, long_about = None)]
pub struct Cli {
    /// Directory holding `default.toml` and environment overlays
    #[arg(short, long, default_value = "config")]
    pub config_dir: String,

    /// Environment overlay to apply (`{config_dir}/{env}.toml`)
    #[arg(short, long, default_value = "development")]
    pub env: String,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Connect and log every channel event until Ctrl-C
    Listen(listen::ListenArgs),
    /// Inspect the persisted offline queue
    Queue(queue::QueueArgs),
    /// Print the effective configuration
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(&self) -> Result<(), AppError> {
        let config = AppConfig::load(&self.config_dir, &self.env)?;
        init_logging(&config.logging);

        match &self.command {
            Commands::Listen(args) => listen::execute(args, config).await,
            Commands::Queue(args) => queue::execute(args, &config).await,
            Commands::Config => config::execute(&config),
        }
    }
}

/// Initialize tracing/logging
fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(true)
                .init();
        }
        _ => {
            fmt()
                .pretty()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
    }
}
