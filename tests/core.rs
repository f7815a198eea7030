//! Core infrastructure tests.

mod common;

use common::*;
use ipshard::core::config::{Config, ConfigOverrides};
use ipshard::core::runtime::{ComponentHealth, Runtime};
use ipshard::core::time::{Clock, ManualClock};
use ipshard::pool::{Claim, PoolKind};
use ipshard::store::{CoordinationStore, StoreError};
use ipshard::IpamError;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

// ============================================================================
// Config tests
// ============================================================================

#[test]
fn parse_minimal_config() {
    let file = create_minimal_config();
    let config = load_config(&file);
    assert_eq!(config.store.root, "ipshard");
    assert_eq!(config.reconcile.interval_seconds, 300);
    assert_eq!(config.lease.ttl_seconds, 24 * 60 * 60);
    assert_eq!(config.pools[0].kind, PoolKind::Range);
}

#[test]
fn validate_invalid_store_mode() {
    let config_content = r#"
[store]
mode = "external"
"#;

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(config_content.as_bytes()).unwrap();

    let result = Config::from_file(file.path());
    assert!(result.is_err());
    let message = result.unwrap_err().to_string();
    assert!(message.contains("store.mode"));
    assert!(message.contains("single-node"));
}

#[test]
fn validate_subnet_pool_requires_length() {
    let result = Config::from_toml(
        r#"
[[pools]]
name = "overlay"
kind = "subnet"
subnet = "10.244.0.0/16"
"#,
    );
    assert!(format!("{:#}", result.unwrap_err()).contains("subnet_len"));
}

#[test]
fn validate_duplicate_pool_names() {
    let result = Config::from_toml(
        r#"
[[pools]]
name = "blue"
kind = "range"
subnet = "10.0.0.0/24"

[[pools]]
name = "blue"
kind = "fixed"
subnet = "10.1.0.0/24"
"#,
    );
    assert!(result.unwrap_err().to_string().contains("duplicate"));
}

#[test]
fn validate_jitter_bounds() {
    let result = Config::from_toml(
        r#"
[reconcile]
jitter_fraction = 1.5
"#,
    );
    assert!(result.unwrap_err().to_string().contains("jitter_fraction"));
}

#[test]
fn validate_endpoint_device_names() {
    let result = Config::from_toml(
        r#"
[[endpoints]]
device = "vx/0"
address = "192.168.0.1"
"#,
    );
    assert!(result.is_err());
}

#[test]
fn overrides_replace_file_values() {
    let mut config = load_config(&create_minimal_config());
    config.apply_overrides(&ConfigOverrides {
        log_level: Some("debug".to_string()),
        data_dir: Some("/var/lib/ipshard".to_string()),
        identity: Some("node-z".to_string()),
    });
    assert_eq!(config.telemetry.log_level, "debug");
    assert_eq!(config.data_dir().display().to_string(), "/var/lib/ipshard");
    assert_eq!(config.resolve_identity().unwrap(), "node-z");
}

#[test]
fn explicit_identity_is_trimmed() {
    let config = Config::from_toml(
        r#"
[node]
identity = "  node-c  "
"#,
    )
    .unwrap();
    assert_eq!(config.resolve_identity().unwrap(), "node-c");
}

// ============================================================================
// Error tests
// ============================================================================

#[test]
fn store_outages_are_retriable() {
    assert!(IpamError::from(StoreError::unavailable("down")).is_retriable());
    assert!(IpamError::Collision { key: "k".into() }.is_retriable());
    assert!(!IpamError::CapacityExhausted {
        pool: "blue".into(),
        requested: 16
    }
    .is_retriable());
}

#[test]
fn revocation_is_fatal() {
    let err = IpamError::Revoked {
        pool: "overlay".into(),
        subnet: "10.244.1.0/24".into(),
    };
    assert!(err.is_fatal());
    assert!(!err.is_retriable());
    assert!(err.to_string().contains("10.244.1.0/24"));
}

// ============================================================================
// Time tests
// ============================================================================

#[test]
fn manual_clock_reports_time_until_deadline() {
    let clock = ManualClock::new(EPOCH_MS);
    assert_eq!(clock.until(EPOCH_MS + 1_500), Duration::from_millis(1_500));
    clock.advance(Duration::from_secs(2));
    assert_eq!(clock.until(EPOCH_MS + 1_500), Duration::ZERO);
}

// ============================================================================
// Runtime tests
// ============================================================================

fn node_runtime(
    identity: &str,
    dir: &tempfile::TempDir,
    memory: &std::sync::Arc<ipshard::store::MemoryStore>,
) -> Runtime {
    let file = create_node_config(identity, &dir.path().display().to_string());
    Runtime::with_store(load_config(&file), memory.clone()).unwrap()
}

#[tokio::test]
async fn runtime_leases_one_subnet_per_pool() {
    let dir = temp_test_dir();
    let memory = memory_store();
    let mut runtime = node_runtime("node-a", &dir, &memory);

    assert_ok(runtime.start_for_tests().await);
    assert!(runtime.is_running());
    assert_eq!(runtime.leases().len(), 1);
    assert_eq!(runtime.leases()[0].subnet.prefix_len(), 24);
    assert_eq!(runtime.health().leases, ComponentHealth::Healthy);
    assert_eq!(runtime.health().endpoints, ComponentHealth::Starting);

    assert_ok(runtime.shutdown_for_tests().await);
    assert!(!runtime.is_running());
    assert_eq!(runtime.health().leases, ComponentHealth::Stopped);
}

#[tokio::test]
async fn runtimes_sharing_a_store_lease_distinct_subnets() {
    let dir_a = temp_test_dir();
    let dir_b = temp_test_dir();
    let memory = memory_store();
    let mut a = node_runtime("node-a", &dir_a, &memory);
    let mut b = node_runtime("node-b", &dir_b, &memory);

    a.start_for_tests().await.unwrap();
    b.start_for_tests().await.unwrap();
    assert_ne!(a.leases()[0].subnet, b.leases()[0].subnet);

    let from_a = a.allocate_local("blue").await.unwrap();
    let from_b = b.allocate_local("blue").await.unwrap();
    assert!(!from_a.range().overlaps(&from_b.range()));
}

#[tokio::test]
async fn restart_keeps_cached_ranges() {
    let dir = temp_test_dir();
    let memory = memory_store();
    let first = node_runtime("node-a", &dir, &memory);
    let claim = first.allocate_local("blue").await.unwrap();
    assert!(matches!(claim, Claim::Range(_)));

    let mut second = node_runtime("node-a", &dir, &memory);
    let reports = second.start_for_tests().await.unwrap();
    let blue = reports.iter().find(|r| r.pool == "blue").unwrap();
    assert_eq!(blue.kept, 1);
    assert!(!blue.changed());
}

#[tokio::test]
async fn restart_on_empty_store_republishes_cache() {
    let dir = temp_test_dir();
    let claim = node_runtime("node-a", &dir, &memory_store())
        .allocate_local("blue")
        .await
        .unwrap();

    let fresh = memory_store();
    let mut runtime = node_runtime("node-a", &dir, &fresh);
    let reports = runtime.start_for_tests().await.unwrap();
    let blue = reports.iter().find(|r| r.pool == "blue").unwrap();
    assert_eq!(blue.published, 1);

    let key = layout().range_key_for("blue", &claim.range()).unwrap();
    assert!(fresh.get(&key).await.unwrap().is_some());
}

#[tokio::test]
async fn unknown_pool_is_rejected() {
    let dir = temp_test_dir();
    let runtime = node_runtime("node-a", &dir, &memory_store());
    let err = assert_err(runtime.allocate_local("missing").await);
    assert!(matches!(err, IpamError::InvalidRequest { .. }));
}

#[tokio::test]
async fn revoked_lease_stops_runtime() {
    let dir = temp_test_dir();
    let memory = memory_store();
    let mut runtime = node_runtime("node-a", &dir, &memory);
    let prefix = layout().claim_prefix(PoolKind::Subnet, "overlay");

    let revoke = async {
        loop {
            let leases = memory.range(&prefix).await.unwrap();
            if let Some(kv) = leases.kvs.first() {
                memory.delete(&kv.key).await.unwrap();
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    let (outcome, ()) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(runtime.run(), revoke)
    })
    .await
    .expect("runtime did not stop after revocation");

    assert!(outcome.is_err());
    assert_eq!(runtime.health().leases, ComponentHealth::Failed);
    assert!(!runtime.is_running());
}
