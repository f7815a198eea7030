//! ipshard - unified CLI entrypoint.
//!
//! Usage:
//!   ipshard start --config config/ipshard.toml
//!   ipshard config validate --config config/ipshard.toml
//!   ipshard config show --format json
//!   ipshard cache list --pool <name>

use anyhow::Result;
use clap::Parser;
use ipshard::cli::commands::{init_tracing, run_cache, run_config, run_start};
use ipshard::cli::{Cli, Commands};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Determine config path - use global --config or default
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/ipshard.toml"));

    match cli.command {
        Commands::Start(args) => run_start(&config_path, args, cli.log_level).await,
        Commands::Config(args) => {
            init_tracing(cli.log_level.as_deref().unwrap_or("warn"));
            run_config(&config_path, args)
        }
        Commands::Cache(args) => {
            init_tracing(cli.log_level.as_deref().unwrap_or("warn"));
            run_cache(&config_path, args)
        }
    }
}
