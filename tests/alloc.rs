//! Allocator integration tests.

mod common;

use common::*;
use async_trait::async_trait;
use ipshard::alloc::{AllocationRequest, AllocatorTable, FixedAddressAllocator, RetryPolicy};
use ipshard::core::time::ManualClock;
use ipshard::pool::{Claim, ClaimRecord, PoolKind};
use ipshard::store::{
    CoordinationStore, CreateOutcome, KeyValue, LockHandle, MemoryStore, RangeSnapshot,
    StoreClient, StoreResult, WatchBatch, WatchScope,
};
use ipshard::IpamError;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Range allocation
// ============================================================================

#[tokio::test]
async fn sequential_blocks_are_disjoint_and_in_bounds() {
    let memory = memory_store();
    let allocator = range_allocator(&memory);
    let pool = range_pool("blue", "10.0.0.0/24");

    let mut blocks = Vec::new();
    for n in 0..16 {
        let claim = assert_ok(allocator.allocate_block(&pool, &format!("n{n}")).await);
        assert!(pool.bounds().contains_range(&claim.range));
        assert_eq!(claim.range.len(), 16);
        blocks.push(claim.range);
    }
    for (i, a) in blocks.iter().enumerate() {
        for b in &blocks[i + 1..] {
            assert!(!a.overlaps(b), "{a} overlaps {b}");
        }
    }
}

#[tokio::test]
async fn freed_gap_is_reallocated_first() {
    let memory = memory_store();
    let allocator = range_allocator(&memory);
    let pool = range_pool("blue", "10.0.0.0/24");

    let mut claims = Vec::new();
    for _ in 0..5 {
        claims.push(allocator.allocate_block(&pool, "n1").await.unwrap());
    }
    let freed = claims.remove(2);
    allocator.release_block(&freed).await;

    let again = allocator.allocate_block(&pool, "n2").await.unwrap();
    assert_eq!(again.range, freed.range);
}

#[tokio::test]
async fn reserved_offset_shifts_first_candidate() {
    let memory = memory_store();
    let allocator = range_allocator(&memory);
    let pool = range_pool("blue", "10.0.0.0/24").with_reserved_offset(16);

    let claim = allocator.allocate_block(&pool, "n1").await.unwrap();
    assert_eq!(claim.range, range("10.0.0.16-10.0.0.31"));
}

#[tokio::test]
async fn full_pool_reports_capacity_and_leaves_claims() {
    let memory = memory_store();
    let allocator = range_allocator(&memory);
    let pool = range_pool("tiny", "10.0.0.0/27");

    allocator.allocate_block(&pool, "n1").await.unwrap();
    allocator.allocate_block(&pool, "n1").await.unwrap();
    let before = allocator.claims("tiny").await.unwrap();
    let revision = memory.current_revision();

    let err = assert_err(allocator.allocate_block(&pool, "n2").await);
    assert!(matches!(err, IpamError::CapacityExhausted { requested: 16, .. }));
    assert_eq!(allocator.claims("tiny").await.unwrap(), before);
    assert_eq!(memory.current_revision(), revision);
}

#[tokio::test]
async fn concurrent_allocations_never_overlap() {
    let memory = memory_store();
    let allocator = Arc::new(range_allocator(&memory));
    let pool = range_pool("blue", "10.0.0.0/24");

    let mut handles = Vec::new();
    for n in 0..8 {
        let allocator = allocator.clone();
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            allocator.allocate_block(&pool, &format!("n{n}")).await
        }));
    }
    let mut starts = HashSet::new();
    for handle in handles {
        let claim = handle.await.unwrap().unwrap();
        assert!(starts.insert(claim.range.start()));
    }
    assert_eq!(allocator.claims("blue").await.unwrap().len(), 8);
}

#[tokio::test]
async fn allocation_is_recorded_in_cache() {
    let dir = temp_test_dir();
    let memory = memory_store();
    let cache = Arc::new(ipshard::cache::LocalCacheStore::new(dir.path()));
    let allocator = range_allocator(&memory).with_cache(cache.clone());
    let pool = range_pool("blue", "10.0.0.0/24");

    let claim = allocator.allocate_block(&pool, "n1").await.unwrap();
    assert_eq!(cache.load("blue").unwrap(), vec![claim.range]);

    allocator.release_block(&claim).await;
    assert!(cache.load("blue").unwrap().is_empty());
}

#[tokio::test]
async fn release_while_store_down_is_not_an_error() {
    let memory = memory_store();
    let allocator = range_allocator(&memory);
    let pool = range_pool("blue", "10.0.0.0/24");
    let claim = allocator.allocate_block(&pool, "n1").await.unwrap();

    memory.set_available(false);
    allocator.release_block(&claim).await;
    memory.set_available(true);
    assert_eq!(allocator.claims("blue").await.unwrap().len(), 1);
}

// ============================================================================
// Subnet leases
// ============================================================================

#[tokio::test]
async fn nodes_lease_distinct_subnets() {
    let memory = memory_store();
    let clock = Arc::new(ManualClock::new(EPOCH_MS));
    let allocator = subnet_allocator(&memory, clock);
    let pool = subnet_pool("overlay", "10.244.0.0/20", 24);

    let mut subnets = HashSet::new();
    for n in 0..16 {
        let claim = allocator.acquire(&pool, &format!("n{n}"), None).await.unwrap();
        assert_eq!(claim.subnet.prefix_len(), 24);
        assert!(subnets.insert(claim.subnet));
    }
    let err = assert_err(allocator.acquire(&pool, "n99", None).await);
    assert!(matches!(err, IpamError::CapacityExhausted { .. }));
}

#[tokio::test]
async fn incompatible_own_lease_is_replaced() {
    let memory = memory_store();
    let clock = Arc::new(ManualClock::new(EPOCH_MS));
    let narrow = subnet_allocator(&memory, clock.clone());
    let old_pool = subnet_pool("overlay", "10.244.0.0/22", 25);
    let old = narrow.acquire(&old_pool, "n1", None).await.unwrap();

    let new_pool = subnet_pool("overlay", "10.244.0.0/22", 24);
    let fresh = narrow.acquire(&new_pool, "n1", None).await.unwrap();
    assert_eq!(fresh.subnet.prefix_len(), 24);

    let leases = narrow.claims("overlay").await.unwrap();
    assert_eq!(leases.len(), 1);
    assert_ne!(leases[0].subnet, old.subnet);
}

#[tokio::test]
async fn previous_subnet_held_by_peer_is_not_taken() {
    let memory = memory_store();
    let clock = Arc::new(ManualClock::new(EPOCH_MS));
    let allocator = subnet_allocator(&memory, clock);
    let pool = subnet_pool("overlay", "10.244.0.0/22", 24);

    let peer = allocator.acquire(&pool, "peer", None).await.unwrap();
    let mine = allocator
        .acquire(&pool, "me", Some(peer.subnet))
        .await
        .unwrap();
    assert_ne!(mine.subnet, peer.subnet);
}

// ============================================================================
// Fixed addresses
// ============================================================================

#[tokio::test]
async fn assign_stable_is_idempotent() {
    let memory = memory_store();
    let allocator = fixed_allocator(&memory, "n1");
    let pool = fixed_pool("pinned", "10.1.0.0/24");

    let first = allocator.assign_stable(&pool, "ns/web-0").await.unwrap();
    let second = allocator.assign_stable(&pool, "ns/web-0").await.unwrap();
    assert_eq!(first, second);

    let other = allocator.assign_stable(&pool, "ns/web-1").await.unwrap();
    assert_ne!(first, other);
}

#[tokio::test]
async fn assign_stable_is_shared_across_nodes() {
    let memory = memory_store();
    let a = fixed_allocator(&memory, "node-a");
    let b = fixed_allocator(&memory, "node-b");
    let pool = fixed_pool("pinned", "10.1.0.0/24");

    let from_a = a.assign_stable(&pool, "ns/db-0").await.unwrap();
    let from_b = b.assign_stable(&pool, "ns/db-0").await.unwrap();
    assert_eq!(from_a, from_b);
}

#[tokio::test]
async fn single_free_address_is_found() {
    let memory = memory_store();
    let allocator = fixed_allocator(&memory, "n1");
    // /30: network and broadcast reserved, two usable
    let pool = fixed_pool("p2p", "10.2.0.0/30");

    let a = allocator.assign_stable(&pool, "a").await.unwrap();
    let b = allocator.assign_stable(&pool, "b").await.unwrap();
    let got: HashSet<Ipv4Addr> = [a, b].into_iter().collect();
    assert_eq!(
        got,
        HashSet::from([Ipv4Addr::new(10, 2, 0, 1), Ipv4Addr::new(10, 2, 0, 2)])
    );
}

/// Lets another node's pin land between this node's scan and its create.
struct InterleavedStore {
    inner: Arc<MemoryStore>,
    competing: Mutex<Option<(String, Vec<u8>)>>,
}

#[async_trait]
impl CoordinationStore for InterleavedStore {
    async fn range(&self, prefix: &str) -> StoreResult<RangeSnapshot> {
        self.inner.range(prefix).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        self.inner.get(key).await
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> StoreResult<CreateOutcome> {
        let competing = self.competing.lock().take();
        if let Some((other_key, other_value)) = competing {
            self.inner.create(&other_key, other_value).await?;
        }
        self.inner.create(key, value).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<u64> {
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.inner.delete(key).await
    }

    async fn compare_and_delete(&self, key: &str, mod_revision: u64) -> StoreResult<bool> {
        self.inner.compare_and_delete(key, mod_revision).await
    }

    async fn lock(&self, name: &str) -> StoreResult<LockHandle> {
        self.inner.lock(name).await
    }

    async fn unlock(&self, handle: LockHandle) -> StoreResult<()> {
        self.inner.unlock(handle).await
    }

    async fn watch(&self, scope: &WatchScope, after_revision: u64) -> StoreResult<WatchBatch> {
        self.inner.watch(scope, after_revision).await
    }
}

#[tokio::test]
async fn racing_nodes_agree_on_first_pin() {
    let memory = memory_store();
    let pool = fixed_pool("pinned", "10.0.0.0/24");
    // Highest usable address, so this node's random pick is always lower.
    let first = Ipv4Addr::new(10, 0, 0, 254);
    let first_key = layout().fixed_key("pinned", first);
    let first_value = ClaimRecord::owned_by("node-a")
        .with_workload("ns/db-0")
        .encode(&first_key)
        .unwrap();

    let racing = Arc::new(InterleavedStore {
        inner: memory.clone(),
        competing: Mutex::new(Some((first_key, first_value))),
    });
    let node_b = FixedAddressAllocator::new(
        StoreClient::new(racing, Duration::from_secs(5)),
        layout(),
        "node-b",
    )
    .with_retry(RetryPolicy::new(5, Duration::ZERO));

    let from_b = node_b.assign_stable(&pool, "ns/db-0").await.unwrap();
    assert_eq!(from_b, first);

    let pins = node_b.claims("pinned").await.unwrap();
    assert_eq!(pins.len(), 1);
    assert_eq!(pins[0].address, first);

    let node_a = fixed_allocator(&memory, "node-a");
    assert_eq!(node_a.assign_stable(&pool, "ns/db-0").await.unwrap(), first);
}

// ============================================================================
// Allocator table
// ============================================================================

#[tokio::test]
async fn table_dispatches_by_pool_kind() {
    let memory = memory_store();
    let clock = Arc::new(ManualClock::new(EPOCH_MS));
    let table = AllocatorTable::new()
        .with(Arc::new(range_allocator(&memory)))
        .with(Arc::new(subnet_allocator(&memory, clock)))
        .with(Arc::new(fixed_allocator(&memory, "n1")));

    let request = AllocationRequest::for_owner("n1");
    let range_claim = table
        .allocate(&range_pool("blue", "10.0.0.0/24"), &request)
        .await
        .unwrap();
    assert_eq!(range_claim.kind(), PoolKind::Range);

    let subnet_claim = table
        .allocate(&subnet_pool("overlay", "10.244.0.0/22", 24), &request)
        .await
        .unwrap();
    assert_eq!(subnet_claim.kind(), PoolKind::Subnet);

    let fixed = fixed_pool("pinned", "10.1.0.0/24");
    let fixed_claim = table
        .allocate(&fixed, &request.clone().with_workload("ns/w"))
        .await
        .unwrap();
    assert!(matches!(&fixed_claim, Claim::Fixed(c) if c.workload == "ns/w"));

    let err = assert_err(table.release(&fixed, &range_claim).await);
    assert!(matches!(err, IpamError::InvalidRequest { .. }));
    assert_ok(table.release(&fixed, &fixed_claim).await);
}

#[tokio::test]
async fn missing_allocator_is_an_error() {
    let table = AllocatorTable::new();
    let err = assert_err(
        table
            .allocate(
                &range_pool("blue", "10.0.0.0/24"),
                &AllocationRequest::for_owner("n1"),
            )
            .await,
    );
    assert!(matches!(err, IpamError::InvalidRequest { .. }));
}
