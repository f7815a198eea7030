//! Cache command implementation.

use crate::cache::LocalCacheStore;
use crate::core::config::Config;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use std::path::Path;

/// Local cache inspection.
#[derive(Args, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// List cached ranges of one pool.
    List {
        #[arg(long)]
        pool: String,
    },
    /// List pools that have a cache file.
    Pools,
}

/// Run the cache command.
pub fn run_cache(config_path: &Path, args: CacheArgs) -> Result<()> {
    let config = Config::from_file(config_path)
        .with_context(|| format!("failed to load config from {:?}", config_path))?;
    let cache = LocalCacheStore::new(config.data_dir());

    match args.command {
        CacheCommand::List { pool } => {
            let ranges = cache.load(&pool)?;
            let modified = cache
                .modified(&pool)
                .map(|t| DateTime::<Utc>::from(t).to_rfc3339())
                .unwrap_or_else(|| "never".to_string());
            println!("pool {} ({} ranges, modified {})", pool, ranges.len(), modified);
            for range in ranges {
                println!("  {}  ({} addresses)", range, range.len());
            }
        }
        CacheCommand::Pools => {
            for pool in cache.pools()? {
                println!("{}", pool);
            }
        }
    }
    Ok(())
}
