//! Stable single-address assignment.
//!
//! A fixed claim pins one address to a workload identity. Asking again for
//! the same workload returns the same address for as long as the claim
//! exists. Two nodes racing for the same workload may both create a claim on
//! different addresses; the earliest-created claim wins and every later
//! creator deletes its own. A later creator always sees the earlier claim when
//! it re-reads, so no caller is ever handed an address that is then dropped.

use super::{AllocationRequest, PoolAllocator, RetryPolicy, FIXED_ATTEMPTS};
use crate::addr::{math, AddressRange};
use crate::error::{IpamError, IpamResult};
use crate::pool::claim::decode_claims;
use crate::pool::{search, Claim, ClaimRecord, FixedClaim, KeyLayout, Pool, PoolKind};
use crate::store::{CreateOutcome, StoreClient};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Tells the collector whether a workload still exists.
#[async_trait]
pub trait WorkloadLiveness: Send + Sync {
    async fn is_live(&self, workload: &str) -> bool;
}

/// Assigns one stable address per workload from fixed pools.
pub struct FixedAddressAllocator {
    store: StoreClient,
    layout: KeyLayout,
    identity: String,
    retry: RetryPolicy,
}

impl FixedAddressAllocator {
    pub fn new(store: StoreClient, layout: KeyLayout, identity: impl Into<String>) -> Self {
        Self {
            store,
            layout,
            identity: identity.into(),
            retry: RetryPolicy::new(FIXED_ATTEMPTS, Duration::from_millis(20)),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Address pinned to `workload`, claiming a random free one if needed.
    pub async fn assign_stable(&self, pool: &Pool, workload: &str) -> IpamResult<Ipv4Addr> {
        let claim = self.claim_stable(pool, &self.identity, workload).await?;
        Ok(claim.address)
    }

    async fn claim_stable(&self, pool: &Pool, owner: &str, workload: &str) -> IpamResult<FixedClaim> {
        if pool.kind() != PoolKind::Fixed {
            return Err(IpamError::invalid(format!(
                "pool {} is a {} pool",
                pool.name(),
                pool.kind()
            )));
        }
        if workload.is_empty() {
            return Err(IpamError::invalid("workload identity must not be empty"));
        }

        for attempt in 1..=self.retry.max_attempts {
            match self.try_claim(pool, owner, workload).await {
                Ok(Some(claim)) => return Ok(claim),
                Ok(None) => {
                    tracing::debug!(pool = %pool.name(), workload = %workload, attempt, "fixed address collided");
                }
                Err(e @ IpamError::CapacityExhausted { .. }) => return Err(e),
                Err(e) if e.is_retriable() => {
                    tracing::warn!(pool = %pool.name(), attempt, error = %e, "fixed address attempt failed");
                }
                Err(e) => return Err(e),
            }
            self.retry.pause(attempt).await;
        }
        Err(IpamError::Exhausted {
            pool: pool.name().to_string(),
            attempts: self.retry.max_attempts,
        })
    }

    async fn try_claim(
        &self,
        pool: &Pool,
        owner: &str,
        workload: &str,
    ) -> IpamResult<Option<FixedClaim>> {
        let snapshot = self.pinned(pool.name()).await?;
        if let Some(existing) = earliest_pin(&snapshot, workload) {
            return Ok(Some(existing.clone()));
        }

        let claimed: Vec<AddressRange> = snapshot
            .iter()
            .map(|(_, claim)| AddressRange::single(math::to_u32(claim.address)))
            .collect();
        let free = search::free_addresses(pool, &claimed);
        let picked = search::random_free(&mut rand::rng(), &free).ok_or_else(|| {
            IpamError::CapacityExhausted {
                pool: pool.name().to_string(),
                requested: 1,
            }
        })?;
        let address = math::from_u32(picked);

        let key = self.layout.fixed_key(pool.name(), address);
        let value = ClaimRecord::owned_by(owner)
            .with_workload(workload)
            .encode(&key)?;
        if let CreateOutcome::AlreadyExists = self.store.create(&key, value).await? {
            return Ok(None);
        }

        // A concurrent writer may have pinned the same workload elsewhere.
        let pinned = self.pinned(pool.name()).await?;
        match earliest_pin(&pinned, workload) {
            Some(winner) if winner.address != address => {
                tracing::info!(
                    pool = %pool.name(),
                    workload = %workload,
                    kept = %winner.address,
                    dropped = %address,
                    "workload pinned twice; keeping earlier claim"
                );
                self.store.delete(&key).await?;
                Ok(Some(winner.clone()))
            }
            _ => {
                tracing::info!(pool = %pool.name(), workload = %workload, address = %address, "assigned fixed address");
                Ok(Some(FixedClaim {
                    pool: pool.name().to_string(),
                    address,
                    owner: owner.to_string(),
                    workload: workload.to_string(),
                }))
            }
        }
    }

    /// Fixed claims of a pool with their create revisions.
    async fn pinned(&self, pool: &str) -> IpamResult<Vec<(u64, FixedClaim)>> {
        let snapshot = self
            .store
            .range(&self.layout.claim_prefix(PoolKind::Fixed, pool))
            .await?;
        Ok(snapshot
            .kvs
            .iter()
            .filter_map(|kv| match FixedClaim::from_kv(&self.layout, kv) {
                Ok(claim) => Some((kv.create_revision, claim)),
                Err(e) => {
                    tracing::warn!(key = %kv.key, error = %e, "skipping malformed claim");
                    None
                }
            })
            .collect())
    }

    /// Delete the claim pinned to `workload`. Returns whether one existed.
    pub async fn release_workload(&self, pool: &Pool, workload: &str) -> IpamResult<bool> {
        let mut released = false;
        for claim in self.claims(pool.name()).await? {
            if claim.workload == workload {
                let key = self.layout.fixed_key(&claim.pool, claim.address);
                released |= self.store.delete(&key).await?;
                tracing::info!(pool = %pool.name(), workload = %workload, address = %claim.address, "released fixed address");
            }
        }
        Ok(released)
    }

    /// Delete claims whose workload no longer exists. Returns how many were
    /// removed.
    pub async fn collect(&self, pool: &Pool, liveness: &dyn WorkloadLiveness) -> IpamResult<usize> {
        let mut collected = 0;
        for claim in self.claims(pool.name()).await? {
            if liveness.is_live(&claim.workload).await {
                continue;
            }
            let key = self.layout.fixed_key(&claim.pool, claim.address);
            if self.store.delete(&key).await? {
                tracing::info!(
                    pool = %pool.name(),
                    workload = %claim.workload,
                    address = %claim.address,
                    "collected fixed address of departed workload"
                );
                collected += 1;
            }
        }
        Ok(collected)
    }

    /// All fixed claims of a pool, ascending by address.
    pub async fn claims(&self, pool: &str) -> IpamResult<Vec<FixedClaim>> {
        let snapshot = self
            .store
            .range(&self.layout.claim_prefix(PoolKind::Fixed, pool))
            .await?;
        Ok(decode_claims(&self.layout, &snapshot.kvs, FixedClaim::from_kv))
    }
}

/// The first claim created for `workload`.
fn earliest_pin<'a>(pinned: &'a [(u64, FixedClaim)], workload: &str) -> Option<&'a FixedClaim> {
    pinned
        .iter()
        .filter(|(_, claim)| claim.workload == workload)
        .min_by_key(|(created, _)| *created)
        .map(|(_, claim)| claim)
}

#[async_trait]
impl PoolAllocator for FixedAddressAllocator {
    fn kind(&self) -> PoolKind {
        PoolKind::Fixed
    }

    async fn allocate(&self, pool: &Pool, request: &AllocationRequest) -> IpamResult<Claim> {
        let workload = request
            .workload
            .as_deref()
            .ok_or_else(|| IpamError::invalid("fixed pools require a workload identity"))?;
        self.claim_stable(pool, &request.owner, workload)
            .await
            .map(Claim::Fixed)
    }

    async fn release(&self, pool: &Pool, claim: &Claim) -> IpamResult<()> {
        match claim {
            Claim::Fixed(claim) => self.release_workload(pool, &claim.workload).await.map(|_| ()),
            other => Err(IpamError::invalid(format!(
                "fixed allocator cannot release a {} claim",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn setup(cidr: &str) -> (Arc<MemoryStore>, FixedAddressAllocator, Pool) {
        let memory = Arc::new(MemoryStore::new());
        let store = StoreClient::new(memory.clone(), Duration::from_secs(5));
        let allocator = FixedAddressAllocator::new(store, KeyLayout::default(), "n1")
            .with_retry(RetryPolicy::new(FIXED_ATTEMPTS, Duration::ZERO));
        let pool = Pool::new("pinned", PoolKind::Fixed, cidr.parse().unwrap());
        (memory, allocator, pool)
    }

    struct Live(HashSet<&'static str>);

    #[async_trait]
    impl WorkloadLiveness for Live {
        async fn is_live(&self, workload: &str) -> bool {
            self.0.contains(workload)
        }
    }

    #[tokio::test]
    async fn never_hands_out_reserved_addresses() {
        let (_memory, allocator, pool) = setup("10.0.0.0/29");
        let pool = pool.with_gateway(Ipv4Addr::new(10, 0, 0, 1)).unwrap();
        let mut seen = HashSet::new();
        for n in 0..5 {
            let addr = allocator.assign_stable(&pool, &format!("w{n}")).await.unwrap();
            assert!(seen.insert(addr));
        }
        for reserved in [0u8, 1, 7] {
            assert!(!seen.contains(&Ipv4Addr::new(10, 0, 0, reserved)));
        }
        let err = allocator.assign_stable(&pool, "w9").await.unwrap_err();
        assert!(matches!(err, IpamError::CapacityExhausted { requested: 1, .. }));
    }

    #[tokio::test]
    async fn collect_removes_departed_workloads() {
        let (_memory, allocator, pool) = setup("10.0.0.0/28");
        allocator.assign_stable(&pool, "keep").await.unwrap();
        allocator.assign_stable(&pool, "gone").await.unwrap();
        let live = Live(HashSet::from(["keep"]));
        assert_eq!(allocator.collect(&pool, &live).await.unwrap(), 1);
        let remaining = allocator.claims("pinned").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].workload, "keep");
    }

    #[tokio::test]
    async fn allocate_requires_workload() {
        let (_memory, allocator, pool) = setup("10.0.0.0/28");
        let err = allocator
            .allocate(&pool, &AllocationRequest::for_owner("n1"))
            .await
            .unwrap_err();
        assert!(matches!(err, IpamError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn release_workload_frees_address() {
        let (_memory, allocator, pool) = setup("10.0.0.0/28");
        allocator.assign_stable(&pool, "w").await.unwrap();
        assert!(allocator.release_workload(&pool, "w").await.unwrap());
        assert!(!allocator.release_workload(&pool, "w").await.unwrap());
        assert!(allocator.claims("pinned").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn earliest_pin_wins_over_lower_address() {
        let (memory, allocator, pool) = setup("10.0.0.0/24");
        let layout = KeyLayout::default();
        for last in [200u8, 5] {
            let key = layout.fixed_key("pinned", Ipv4Addr::new(10, 0, 0, last));
            let value = ClaimRecord::owned_by("n2").with_workload("w").encode(&key).unwrap();
            crate::store::CoordinationStore::put(memory.as_ref(), &key, value)
                .await
                .unwrap();
        }
        let addr = allocator.assign_stable(&pool, "w").await.unwrap();
        assert_eq!(addr, Ipv4Addr::new(10, 0, 0, 200));
    }
}
