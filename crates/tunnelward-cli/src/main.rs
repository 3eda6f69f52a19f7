//! Tunnelward CLI
//!
//! Starts, stops and inspects a supervised BrowserStack Local tunnel.
//! Logs go to stderr; stdout carries only PIDs, command vectors and status.

mod tunnel_cmd;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use tunnel_cmd::TunnelAction;

#[derive(Parser, Debug)]
#[command(name = "tunnelward")]
#[command(version, about = "Local tunnel supervisor", long_about = None)]
struct Cli {
    /// Settings file (default: `<config dir>/tunnelward/settings.json`)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level used when `RUST_LOG` is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    action: TunnelAction,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    tunnelward_core::tracing_init::init_tracing(&cli.log_level, cli.log_json)
        .context("Failed to initialise logging")?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting tunnelward");

    let config = tunnelward_core::config::load_config(cli.config.as_deref())
        .context("Failed to load configuration")?;

    tunnel_cmd::run(cli.action, config).await
}
