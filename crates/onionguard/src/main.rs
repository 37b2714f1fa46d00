//! onionguard - Tor anonymity monitor and network kill switch
//!
//! Runs leak checks continuously and cuts the host off the network the
//! moment anonymity can no longer be shown to hold.

mod cli;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    // Logs go to stderr so JSON output on stdout stays clean
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async { run_command(cli).await })
}

async fn run_command(cli: Cli) -> Result<()> {
    let config = cli.config;
    let socket = cli.socket;
    match cli.command {
        Commands::Run { dry_run } => cli::cmd_run(config, socket, dry_run).await,
        Commands::Check { probe, json } => cli::cmd_check(config, probe, json).await,
        Commands::Status { json } => cli::cmd_status(socket, json).await,
        Commands::Reset => cli::cmd_reset(socket).await,
        Commands::Stop => cli::cmd_stop(socket).await,
        Commands::History {
            limit,
            failures,
            hours,
            json,
        } => cli::cmd_history(config, limit, failures, hours, json),
        Commands::Config { json } => cli::cmd_config(config, json),
    }
}
