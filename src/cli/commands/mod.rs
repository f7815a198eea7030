//! CLI command implementations.

mod cache;
mod config;
mod start;

pub use cache::{run_cache, CacheArgs};
pub use config::{run_config, ConfigArgs};
pub use start::{init_tracing, run_start, StartArgs};
