//! Configuration parsing and validation.
//!
//! ipshard configuration is loaded from a TOML file with CLI overrides.
//! Every section except `[[pools]]` has defaults, so a minimal file only
//! names the pools this node allocates from.

use crate::pool::{Pool, PoolKind};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level ipshard configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Node identity.
    #[serde(default)]
    pub node: NodeConfig,

    /// Coordination store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Node-local range cache.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Periodic reconciliation.
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Subnet lease timing.
    #[serde(default)]
    pub lease: LeaseConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Address pools.
    #[serde(default)]
    pub pools: Vec<PoolConfig>,

    /// Tunnel endpoints this node registers and watches.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

/// Node identity configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Explicit identity. Falls back to `$HOSTNAME`, then `id_file`.
    #[serde(default)]
    pub identity: Option<String>,

    /// File holding the identity on its first line.
    #[serde(default)]
    pub id_file: Option<String>,
}

/// Coordination store configuration.
///
/// Only the in-process store is built in, so an `ipshard start` process
/// coordinates with nothing outside itself: the binary runs single-node.
/// Several nodes share one store only when embedded in one process through
/// [`crate::core::runtime::Runtime::with_store`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Mode: "embedded" (in-process store, single-node).
    #[serde(default = "default_store_mode")]
    pub mode: String,

    /// Key root for every record ipshard writes.
    #[serde(default = "default_store_root")]
    pub root: String,

    /// Per-request deadline in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Revisions of change history kept for watch resumption.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Delay before a failed watch is retried, in milliseconds.
    #[serde(default = "default_watch_retry_ms")]
    pub watch_retry_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mode: default_store_mode(),
            root: default_store_root(),
            request_timeout_ms: default_request_timeout_ms(),
            history_limit: default_history_limit(),
            watch_retry_ms: default_watch_retry_ms(),
        }
    }
}

/// Local cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding one subdirectory per pool.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Reconciliation timer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Run the periodic loop. Startup reconciliation always runs.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Base interval in seconds.
    #[serde(default = "default_reconcile_interval_seconds")]
    pub interval_seconds: u64,

    /// Each delay is `interval * (1 ± rand * jitter_fraction)`.
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_reconcile_interval_seconds(),
            jitter_fraction: default_jitter_fraction(),
        }
    }
}

/// Subnet lease configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Lease TTL in seconds.
    #[serde(default = "default_lease_ttl_seconds")]
    pub ttl_seconds: u64,

    /// Retry interval after a failed renewal, in milliseconds.
    #[serde(default = "default_renew_retry_ms")]
    pub renew_retry_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_lease_ttl_seconds(),
            renew_retry_ms: default_renew_retry_ms(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// One address pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool name; used in keys and cache paths.
    pub name: String,

    /// Allocation strategy.
    pub kind: PoolKind,

    /// Enclosing network in CIDR form.
    pub subnet: String,

    /// First allocatable address (defaults to the network address).
    #[serde(default)]
    pub range_start: Option<String>,

    /// Last allocatable address (defaults to the broadcast address).
    #[serde(default)]
    pub range_end: Option<String>,

    /// Gateway, reserved from single-address allocation.
    #[serde(default)]
    pub gateway: Option<String>,

    /// Leading addresses skipped before the first candidate.
    #[serde(default)]
    pub reserved_offset: u32,

    /// Range pools: blocks of 2^block_exp addresses.
    #[serde(default)]
    pub block_exp: Option<u8>,

    /// Subnet pools: prefix length of each leased subnet.
    #[serde(default)]
    pub subnet_len: Option<u8>,

    /// Subnet pools: subnet this node held before a restart.
    #[serde(default)]
    pub previous_subnet: Option<String>,
}

/// A tunnel endpoint this node publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Tunnel device name.
    pub device: String,

    /// Local underlay address published for the device.
    pub address: String,
}

// Default value functions

fn default_store_mode() -> String {
    "embedded".to_string()
}

fn default_store_root() -> String {
    "ipshard".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_history_limit() -> usize {
    10_000
}

fn default_watch_retry_ms() -> u64 {
    1_000
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_true() -> bool {
    true
}

fn default_reconcile_interval_seconds() -> u64 {
    300
}

fn default_jitter_fraction() -> f64 {
    0.25
}

fn default_lease_ttl_seconds() -> u64 {
    24 * 60 * 60
}

fn default_renew_retry_ms() -> u64 {
    60_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref data_dir) = overrides.data_dir {
            self.cache.data_dir = data_dir.clone();
        }
        if let Some(ref identity) = overrides.identity {
            self.node.identity = Some(identity.clone());
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_store()?;
        self.validate_reconcile()?;
        self.validate_lease()?;
        self.validate_telemetry()?;
        self.validate_pools()?;
        self.validate_endpoints()?;
        Ok(())
    }

    fn validate_store(&self) -> Result<()> {
        if self.store.mode != "embedded" {
            anyhow::bail!(
                "store.mode must be 'embedded' (the only built-in store; the binary runs single-node), got: {}",
                self.store.mode
            );
        }
        if self.store.root.trim_matches('/').is_empty() {
            anyhow::bail!("store.root must not be empty");
        }
        if self.store.request_timeout_ms == 0 {
            anyhow::bail!("store.request_timeout_ms must be > 0");
        }
        if self.store.history_limit == 0 {
            anyhow::bail!("store.history_limit must be > 0");
        }
        Ok(())
    }

    fn validate_reconcile(&self) -> Result<()> {
        if self.reconcile.interval_seconds == 0 {
            anyhow::bail!("reconcile.interval_seconds must be > 0");
        }
        if !(0.0..1.0).contains(&self.reconcile.jitter_fraction) {
            anyhow::bail!(
                "reconcile.jitter_fraction must be in [0, 1), got: {}",
                self.reconcile.jitter_fraction
            );
        }
        Ok(())
    }

    fn validate_lease(&self) -> Result<()> {
        if self.lease.ttl_seconds == 0 {
            anyhow::bail!("lease.ttl_seconds must be > 0");
        }
        if self.lease.renew_retry_ms == 0 {
            anyhow::bail!("lease.renew_retry_ms must be > 0");
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }

    fn validate_pools(&self) -> Result<()> {
        let mut names = HashSet::new();
        for pool in &self.pools {
            if !names.insert(pool.name.as_str()) {
                anyhow::bail!("pools: duplicate pool name {:?}", pool.name);
            }
            Pool::from_config(pool).with_context(|| format!("pools.{}", pool.name))?;

            if pool.kind == PoolKind::Subnet && pool.subnet_len.is_none() {
                anyhow::bail!("pools.{}: subnet pools require subnet_len", pool.name);
            }
            if let Some(ref previous) = pool.previous_subnet {
                previous
                    .parse::<crate::addr::Ipv4Subnet>()
                    .with_context(|| format!("pools.{}.previous_subnet", pool.name))?;
            }
        }
        Ok(())
    }

    fn validate_endpoints(&self) -> Result<()> {
        let mut devices = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.device.is_empty() || endpoint.device.contains('/') {
                anyhow::bail!(
                    "endpoints: device {:?} must be non-empty and contain no '/'",
                    endpoint.device
                );
            }
            if !devices.insert(endpoint.device.as_str()) {
                anyhow::bail!("endpoints: duplicate device {:?}", endpoint.device);
            }
            crate::addr::parse_addr(&endpoint.address)
                .with_context(|| format!("endpoints.{}.address", endpoint.device))?;
        }
        Ok(())
    }

    /// Resolve this node's identity: explicit value, `$HOSTNAME`, then the
    /// first line of `node.id_file`.
    pub fn resolve_identity(&self) -> Result<String> {
        if let Some(ref identity) = self.node.identity {
            if !identity.trim().is_empty() {
                return Ok(identity.trim().to_string());
            }
        }
        if let Ok(hostname) = std::env::var("HOSTNAME") {
            if !hostname.trim().is_empty() {
                return Ok(hostname.trim().to_string());
            }
        }
        if let Some(ref id_file) = self.node.id_file {
            let content = std::fs::read_to_string(id_file)
                .with_context(|| format!("failed to read node id file: {}", id_file))?;
            if let Some(line) = content.lines().map(str::trim).find(|l| !l.is_empty()) {
                return Ok(line.to_string());
            }
        }
        anyhow::bail!("node identity not set: configure node.identity, HOSTNAME, or node.id_file")
    }

    /// Pools parsed from their configuration sections.
    pub fn build_pools(&self) -> Result<Vec<Pool>> {
        self.pools
            .iter()
            .map(|p| Pool::from_config(p).with_context(|| format!("pools.{}", p.name)))
            .collect()
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.cache.data_dir)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.store.request_timeout_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease.ttl_seconds)
    }

    pub fn renew_retry(&self) -> Duration {
        Duration::from_millis(self.lease.renew_retry_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile.interval_seconds)
    }

    pub fn watch_retry(&self) -> Duration {
        Duration::from_millis(self.store.watch_retry_ms)
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override cache data directory.
    pub data_dir: Option<String>,
    /// Override node identity.
    pub identity: Option<String>,
}
