//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use ipshard::addr::AddressRange;
use ipshard::alloc::{FixedAddressAllocator, RangeAllocator, RetryPolicy, SubnetAllocator};
use ipshard::core::config::Config;
use ipshard::core::time::ManualClock;
use ipshard::pool::{ClaimRecord, KeyLayout, Pool, PoolKind};
use ipshard::store::{CoordinationStore, MemoryStore, StoreClient};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

/// Fixed starting point for manual clocks.
pub const EPOCH_MS: u64 = 1_700_000_000_000;

/// Create a minimal valid configuration file.
pub fn create_minimal_config() -> NamedTempFile {
    let config_content = r#"
[node]
identity = "node-a"

[[pools]]
name = "blue"
kind = "range"
subnet = "10.0.0.0/24"
"#;

    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(config_content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Create a configuration for one node with a range and a subnet pool,
/// caching under `data_dir`.
pub fn create_node_config(identity: &str, data_dir: &str) -> NamedTempFile {
    let config_content = format!(
        r#"
[node]
identity = "{}"

[cache]
data_dir = "{}"

[reconcile]
interval_seconds = 3600

[lease]
ttl_seconds = 60
renew_retry_ms = 50

[[pools]]
name = "blue"
kind = "range"
subnet = "10.0.0.0/24"

[[pools]]
name = "overlay"
kind = "subnet"
subnet = "10.244.0.0/22"
subnet_len = 24
"#,
        identity, data_dir
    );

    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(config_content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Load a config from a temp file.
pub fn load_config(file: &NamedTempFile) -> Config {
    Config::from_file(file.path()).expect("Failed to load config")
}

/// Create a temporary directory for test data.
pub fn temp_test_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

// ===== Store =====

pub fn memory_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}

pub fn client(memory: &Arc<MemoryStore>) -> StoreClient {
    StoreClient::new(memory.clone(), Duration::from_secs(5))
}

pub fn layout() -> KeyLayout {
    KeyLayout::default()
}

/// Parse "a.b.c.d-a.b.c.d".
pub fn range(s: &str) -> AddressRange {
    s.parse().expect("invalid range literal")
}

/// Write a range claim directly, bypassing allocation.
pub async fn seed_range_claim(memory: &MemoryStore, pool: &str, r: &str, owner: &str) -> String {
    let key = layout()
        .range_key_for(pool, &range(r))
        .expect("seeded range must be a power-of-two block");
    let value = ClaimRecord::owned_by(owner).encode(&key).unwrap();
    memory.put(&key, value).await.unwrap();
    key
}

// ===== Pools and allocators =====

pub fn range_pool(name: &str, cidr: &str) -> Pool {
    Pool::new(name, PoolKind::Range, cidr.parse().unwrap())
}

pub fn subnet_pool(name: &str, cidr: &str, len: u8) -> Pool {
    Pool::new(name, PoolKind::Subnet, cidr.parse().unwrap())
        .with_subnet_len(len)
        .unwrap()
}

pub fn fixed_pool(name: &str, cidr: &str) -> Pool {
    Pool::new(name, PoolKind::Fixed, cidr.parse().unwrap())
}

fn no_backoff(attempts: u32) -> RetryPolicy {
    RetryPolicy::new(attempts, Duration::ZERO)
}

pub fn range_allocator(memory: &Arc<MemoryStore>) -> RangeAllocator {
    RangeAllocator::new(client(memory), layout()).with_retry(no_backoff(3))
}

pub fn subnet_allocator(memory: &Arc<MemoryStore>, clock: Arc<ManualClock>) -> SubnetAllocator {
    SubnetAllocator::new(client(memory), layout(), clock)
        .with_lease_ttl(Duration::from_secs(60))
        .with_retry(no_backoff(10))
}

pub fn fixed_allocator(memory: &Arc<MemoryStore>, identity: &str) -> FixedAddressAllocator {
    FixedAddressAllocator::new(client(memory), layout(), identity).with_retry(no_backoff(5))
}

/// Assert that a result is Ok and return the value.
#[track_caller]
pub fn assert_ok<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
    match result {
        Ok(v) => v,
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
}

/// Assert that a result is Err.
#[track_caller]
pub fn assert_err<T: std::fmt::Debug, E>(result: Result<T, E>) -> E {
    match result {
        Ok(v) => panic!("Expected Err, got Ok: {:?}", v),
        Err(e) => e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_minimal_config() {
        let file = create_minimal_config();
        let config = load_config(&file);
        assert_eq!(config.store.mode, "embedded");
        assert_eq!(config.pools.len(), 1);
    }

    #[test]
    fn test_create_node_config() {
        let dir = temp_test_dir();
        let file = create_node_config("node-b", &dir.path().display().to_string());
        let config = load_config(&file);
        assert_eq!(config.resolve_identity().unwrap(), "node-b");
        assert_eq!(config.build_pools().unwrap().len(), 2);
    }
}
