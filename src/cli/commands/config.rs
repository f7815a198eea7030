//! Config command implementation.

use crate::core::config::Config;
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::Path;

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate configuration file.
    Validate,
    /// Print configuration with defaults.
    Show {
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
}

/// Run the config command.
pub fn run_config(config_path: &Path, args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommand::Validate => validate_config(config_path),
        ConfigCommand::Show { format } => show_config(config_path, &format),
    }
}

fn load(path: &Path) -> Result<Config> {
    if !path.exists() {
        anyhow::bail!("Config file not found: {:?}", path);
    }
    Config::from_file(path).with_context(|| format!("failed to load config from {:?}", path))
}

fn validate_config(path: &Path) -> Result<()> {
    let config = load(path)?;
    config.validate()?;
    let pools = config.build_pools()?;
    println!("✓ Config file is valid");
    for pool in &pools {
        println!(
            "  {} ({}): {} bounds {} granularity {}",
            pool.name(),
            pool.kind(),
            pool.network(),
            pool.bounds(),
            pool.block_size()
        );
    }
    match config.resolve_identity() {
        Ok(identity) => println!("  identity: {}", identity),
        Err(e) => println!("  ⚠ Warning: {}", e),
    }
    Ok(())
}

fn show_config(path: &Path, format: &str) -> Result<()> {
    let config = load(path)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&config)?),
        "toml" => println!("{}", toml::to_string_pretty(&config)?),
        other => anyhow::bail!("unknown format {:?} (expected toml or json)", other),
    }
    Ok(())
}
