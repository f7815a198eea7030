//! Leased subnet allocation.
//!
//! Subnet pools hand out one whole subnet per node identity. There is no pool
//! mutex: every attempt re-reads the pool, picks a candidate and claims it
//! with a conditional create, treating "key exists" as a collision to retry.
//! Claims carry an absolute expiration that a [`LeaseMonitor`] pushes forward
//! at half-life.

use super::{AllocationRequest, PoolAllocator, RetryPolicy, SUBNET_RACE_RETRIES};
use crate::addr::Ipv4Subnet;
use crate::core::runtime::shutdown_requested;
use crate::core::time::Clock;
use crate::error::{IpamError, IpamResult};
use crate::pool::claim::decode_claims;
use crate::pool::search::{self, SUBNET_CANDIDATE_LIMIT};
use crate::pool::{Claim, ClaimRecord, KeyLayout, Pool, PoolKind, SubnetClaim};
use crate::store::{
    watch_from, CreateOutcome, EventType, KeyValue, StoreClient, WatchCursor, WatchResult,
    WatchScope,
};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Default lease duration.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Allocates and renews subnet leases.
pub struct SubnetAllocator {
    store: StoreClient,
    layout: KeyLayout,
    clock: Arc<dyn Clock>,
    lease_ttl: Duration,
    retry: RetryPolicy,
}

impl SubnetAllocator {
    pub fn new(store: StoreClient, layout: KeyLayout, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            layout,
            clock,
            lease_ttl: DEFAULT_LEASE_TTL,
            retry: RetryPolicy::new(SUBNET_RACE_RETRIES, Duration::from_millis(50)),
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    fn expiration(&self) -> u64 {
        self.clock
            .now_ms()
            .saturating_add(self.lease_ttl.as_millis() as u64)
    }

    /// Lease a subnet for `owner`.
    ///
    /// Reuses the owner's live compatible lease first, then `previous` if it
    /// is compatible and free, and otherwise picks a random free subnet.
    pub async fn acquire(
        &self,
        pool: &Pool,
        owner: &str,
        previous: Option<Ipv4Subnet>,
    ) -> IpamResult<SubnetClaim> {
        if pool.kind() != PoolKind::Subnet {
            return Err(IpamError::invalid(format!(
                "pool {} is a {} pool",
                pool.name(),
                pool.kind()
            )));
        }
        for attempt in 1..=self.retry.max_attempts {
            match self.try_acquire(pool, owner, previous).await {
                Ok(Some(claim)) => {
                    tracing::info!(
                        pool = %pool.name(),
                        subnet = %claim.subnet,
                        owner = %owner,
                        expiration_ms = claim.expiration_ms,
                        "leased subnet"
                    );
                    return Ok(claim);
                }
                Ok(None) => {
                    tracing::debug!(pool = %pool.name(), attempt, "subnet claim collided");
                }
                Err(e @ IpamError::CapacityExhausted { .. }) => return Err(e),
                Err(e) if e.is_retriable() => {
                    tracing::warn!(pool = %pool.name(), attempt, error = %e, "subnet lease attempt failed");
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

    /// One scan-and-claim pass. `Ok(None)` means another writer won the key.
    async fn try_acquire(
        &self,
        pool: &Pool,
        owner: &str,
        previous: Option<Ipv4Subnet>,
    ) -> IpamResult<Option<SubnetClaim>> {
        let live = self.live_claims(pool, owner).await?;

        if let Some(mine) = live.iter().find(|claim| claim.owner == owner) {
            return self.write_lease(mine).await.map(Some);
        }

        if let Some(previous) = previous {
            if !pool.is_compatible_subnet(&previous) {
                tracing::info!(pool = %pool.name(), subnet = %previous, "previous subnet no longer fits pool");
            } else if live.iter().any(|claim| claim.subnet.overlaps(&previous)) {
                tracing::info!(pool = %pool.name(), subnet = %previous, "previous subnet is held by another node");
            } else if let Some(claim) = self.create_lease(pool, owner, previous).await? {
                return Ok(Some(claim));
            }
        }

        let occupied: Vec<Ipv4Subnet> = live.iter().map(|claim| claim.subnet).collect();
        let candidates = search::subnet_candidates(
            pool.bounds(),
            pool.first_candidate(),
            pool.subnet_len(),
            &occupied,
            SUBNET_CANDIDATE_LIMIT,
        );
        if candidates.is_empty() {
            return Err(IpamError::CapacityExhausted {
                pool: pool.name().to_string(),
                requested: pool.block_size(),
            });
        }
        let pick = candidates[rand::rng().random_range(0..candidates.len())];
        self.create_lease(pool, owner, pick).await
    }

    /// Claims that still count: expired leases are reaped and the owner's
    /// incompatible leases are deleted. Both deletes only go through if the
    /// lease has not been rewritten since it was read.
    async fn live_claims(&self, pool: &Pool, owner: &str) -> IpamResult<Vec<SubnetClaim>> {
        let now = self.clock.now_ms();
        let snapshot = self
            .store
            .range(&self.layout.claim_prefix(PoolKind::Subnet, pool.name()))
            .await?;
        let mut live = Vec::new();
        for kv in &snapshot.kvs {
            let claim = match SubnetClaim::from_kv(&self.layout, kv) {
                Ok(claim) => claim,
                Err(e) => {
                    tracing::warn!(key = %kv.key, error = %e, "skipping malformed claim");
                    continue;
                }
            };
            if claim.is_expired(now) {
                tracing::info!(pool = %pool.name(), subnet = %claim.subnet, owner = %claim.owner, "reaping expired lease");
                if !self.reap(&kv.key, kv.mod_revision).await? {
                    live.push(claim);
                }
            } else if claim.owner == owner && !pool.is_compatible_subnet(&claim.subnet) {
                tracing::info!(pool = %pool.name(), subnet = %claim.subnet, "deleting incompatible lease");
                self.reap(&kv.key, kv.mod_revision).await?;
            } else {
                live.push(claim);
            }
        }
        Ok(live)
    }

    /// Delete a lease read at `mod_revision` unless it was renewed since.
    async fn reap(&self, key: &str, mod_revision: u64) -> IpamResult<bool> {
        let deleted = self.store.compare_and_delete(key, mod_revision).await?;
        if !deleted {
            tracing::info!(key = %key, "lease changed since it was read; leaving it");
        }
        Ok(deleted)
    }

    async fn create_lease(
        &self,
        pool: &Pool,
        owner: &str,
        subnet: Ipv4Subnet,
    ) -> IpamResult<Option<SubnetClaim>> {
        let key = self.layout.subnet_key(pool.name(), &subnet);
        let expiration_ms = self.expiration();
        let value = ClaimRecord::owned_by(owner)
            .with_expiration(expiration_ms)
            .encode(&key)?;
        match self.store.create(&key, value).await? {
            CreateOutcome::Created { .. } => Ok(Some(SubnetClaim {
                pool: pool.name().to_string(),
                subnet,
                owner: owner.to_string(),
                expiration_ms,
            })),
            CreateOutcome::AlreadyExists => Ok(None),
        }
    }

    async fn write_lease(&self, claim: &SubnetClaim) -> IpamResult<SubnetClaim> {
        let key = self.layout.subnet_key(&claim.pool, &claim.subnet);
        let expiration_ms = self.expiration();
        let value = ClaimRecord::owned_by(&claim.owner)
            .with_expiration(expiration_ms)
            .encode(&key)?;
        self.store.put(&key, value).await?;
        Ok(SubnetClaim {
            expiration_ms,
            ..claim.clone()
        })
    }

    /// Push the lease's expiration forward.
    ///
    /// Fails with [`IpamError::Revoked`] if the key is gone or now belongs
    /// to another owner.
    pub async fn renew(&self, claim: &SubnetClaim) -> IpamResult<SubnetClaim> {
        let key = self.layout.subnet_key(&claim.pool, &claim.subnet);
        let current = self.store.get(&key).await?;
        if !held_by(current.as_ref(), &claim.owner) {
            return Err(revoked(claim));
        }
        let renewed = self.write_lease(claim).await?;
        tracing::debug!(pool = %claim.pool, subnet = %claim.subnet, expiration_ms = renewed.expiration_ms, "renewed lease");
        Ok(renewed)
    }

    /// Delete the lease if it is still held by the claim's owner.
    pub async fn release_lease(&self, claim: &SubnetClaim) -> IpamResult<()> {
        let key = self.layout.subnet_key(&claim.pool, &claim.subnet);
        let current = self.store.get(&key).await?;
        if held_by(current.as_ref(), &claim.owner) {
            self.store.delete(&key).await?;
            tracing::info!(pool = %claim.pool, subnet = %claim.subnet, "released lease");
        }
        Ok(())
    }

    /// All subnet leases of a pool, including expired ones.
    pub async fn claims(&self, pool: &str) -> IpamResult<Vec<SubnetClaim>> {
        let snapshot = self
            .store
            .range(&self.layout.claim_prefix(PoolKind::Subnet, pool))
            .await?;
        Ok(decode_claims(&self.layout, &snapshot.kvs, SubnetClaim::from_kv))
    }
}

fn held_by(kv: Option<&KeyValue>, owner: &str) -> bool {
    kv.and_then(|kv| ClaimRecord::decode(&kv.key, &kv.value).ok())
        .is_some_and(|record| record.owner == owner)
}

fn revoked(claim: &SubnetClaim) -> IpamError {
    IpamError::Revoked {
        pool: claim.pool.clone(),
        subnet: claim.subnet.to_string(),
    }
}

#[async_trait]
impl PoolAllocator for SubnetAllocator {
    fn kind(&self) -> PoolKind {
        PoolKind::Subnet
    }

    async fn allocate(&self, pool: &Pool, request: &AllocationRequest) -> IpamResult<Claim> {
        self.acquire(pool, &request.owner, request.previous)
            .await
            .map(Claim::Subnet)
    }

    async fn release(&self, _pool: &Pool, claim: &Claim) -> IpamResult<()> {
        match claim {
            Claim::Subnet(claim) => self.release_lease(claim).await,
            other => Err(IpamError::invalid(format!(
                "subnet allocator cannot release a {} claim",
                other.kind()
            ))),
        }
    }
}

/// Keeps one lease alive and watches it for revocation.
pub struct LeaseMonitor {
    allocator: Arc<SubnetAllocator>,
    claim: SubnetClaim,
    renew_retry: Duration,
}

impl LeaseMonitor {
    pub fn new(allocator: Arc<SubnetAllocator>, claim: SubnetClaim, renew_retry: Duration) -> Self {
        Self {
            allocator,
            claim,
            renew_retry,
        }
    }

    pub fn claim(&self) -> &SubnetClaim {
        &self.claim
    }

    /// Run until shutdown (`Ok`) or until the lease is lost (`Revoked`).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> IpamResult<()> {
        let key = self
            .allocator
            .layout
            .subnet_key(&self.claim.pool, &self.claim.subnet);
        let scope = WatchScope::Key(key);
        let mut cursor: Option<WatchCursor> = None;
        let mut renew_at = Instant::now() + self.half_life();

        tracing::info!(pool = %self.claim.pool, subnet = %self.claim.subnet, "lease monitor started");
        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => {
                    tracing::info!(pool = %self.claim.pool, subnet = %self.claim.subnet, "lease monitor stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep_until(renew_at) => {
                    match self.allocator.renew(&self.claim).await {
                        Ok(renewed) => {
                            self.claim = renewed;
                            renew_at = Instant::now() + self.half_life();
                        }
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => {
                            tracing::warn!(pool = %self.claim.pool, subnet = %self.claim.subnet, error = %e, "lease renewal failed; retrying");
                            renew_at = Instant::now() + self.renew_retry;
                        }
                    }
                }
                result = watch_from(&self.allocator.store, &scope, cursor) => {
                    match result {
                        Ok(result) => {
                            self.check(&result)?;
                            cursor = Some(result.cursor);
                        }
                        Err(e) => {
                            tracing::warn!(pool = %self.claim.pool, error = %e, "lease watch failed");
                            tokio::select! {
                                _ = shutdown_requested(&mut shutdown) => return Ok(()),
                                _ = tokio::time::sleep(self.renew_retry) => {}
                            }
                        }
                    }
                }
            }
        }
    }

    /// Half the remaining lease, capped at half the TTL.
    fn half_life(&self) -> Duration {
        let remaining = self.allocator.clock.until(self.claim.expiration_ms);
        remaining.min(self.allocator.lease_ttl) / 2
    }

    fn check(&self, result: &WatchResult) -> IpamResult<()> {
        if let Some(kvs) = &result.snapshot {
            if !held_by(kvs.first(), &self.claim.owner) {
                return Err(revoked(&self.claim));
            }
        }
        for event in &result.events {
            let lost = match event.event_type {
                EventType::Delete => true,
                EventType::Put => !held_by(Some(&event.kv), &self.claim.owner),
            };
            if lost {
                tracing::error!(
                    pool = %self.claim.pool,
                    subnet = %self.claim.subnet,
                    revision = event.revision,
                    "lease revoked"
                );
                return Err(revoked(&self.claim));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::ManualClock;
    use crate::store::MemoryStore;

    const NOW: u64 = 1_000_000;

    fn setup() -> (Arc<MemoryStore>, Arc<ManualClock>, SubnetAllocator, Pool) {
        let memory = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(NOW));
        let store = StoreClient::new(memory.clone(), Duration::from_secs(5));
        let allocator = SubnetAllocator::new(store, KeyLayout::default(), clock.clone())
            .with_lease_ttl(Duration::from_secs(60))
            .with_retry(RetryPolicy::new(SUBNET_RACE_RETRIES, Duration::ZERO));
        let pool = Pool::new("overlay", PoolKind::Subnet, "10.244.0.0/22".parse().unwrap())
            .with_subnet_len(24)
            .unwrap();
        (memory, clock, allocator, pool)
    }

    #[tokio::test]
    async fn owner_reuses_live_lease() {
        let (_memory, clock, allocator, pool) = setup();
        let first = allocator.acquire(&pool, "n1", None).await.unwrap();
        clock.advance(Duration::from_secs(10));
        let second = allocator.acquire(&pool, "n1", None).await.unwrap();
        assert_eq!(first.subnet, second.subnet);
        assert_eq!(second.expiration_ms, NOW + 70_000);
    }

    #[tokio::test]
    async fn previous_subnet_is_reclaimed() {
        let (_memory, _clock, allocator, pool) = setup();
        let previous: Ipv4Subnet = "10.244.2.0/24".parse().unwrap();
        let claim = allocator.acquire(&pool, "n1", Some(previous)).await.unwrap();
        assert_eq!(claim.subnet, previous);
    }

    #[tokio::test]
    async fn leases_do_not_overlap_until_exhausted() {
        let (_memory, _clock, allocator, pool) = setup();
        let mut seen = Vec::new();
        for n in 0..4 {
            let claim = allocator.acquire(&pool, &format!("n{n}"), None).await.unwrap();
            assert!(!seen.contains(&claim.subnet));
            seen.push(claim.subnet);
        }
        let err = allocator.acquire(&pool, "n9", None).await.unwrap_err();
        assert!(matches!(err, IpamError::CapacityExhausted { .. }));
    }

    #[tokio::test]
    async fn expired_leases_are_reaped() {
        let (_memory, clock, allocator, pool) = setup();
        for n in 0..4 {
            allocator.acquire(&pool, &format!("n{n}"), None).await.unwrap();
        }
        clock.advance(Duration::from_secs(61));
        allocator.acquire(&pool, "late", None).await.unwrap();
        let claims = allocator.claims("overlay").await.unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].owner, "late");
    }

    #[tokio::test]
    async fn reaper_spares_lease_renewed_after_read() {
        let (memory, clock, allocator, pool) = setup();
        let claim = allocator.acquire(&pool, "n1", None).await.unwrap();
        let key = KeyLayout::default().subnet_key("overlay", &claim.subnet);
        let stale = crate::store::CoordinationStore::get(memory.as_ref(), &key)
            .await
            .unwrap()
            .unwrap();

        clock.advance(Duration::from_secs(61));
        allocator.renew(&claim).await.unwrap();

        assert!(!allocator.reap(&key, stale.mod_revision).await.unwrap());
        let claims = allocator.claims("overlay").await.unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].expiration_ms, NOW + 121_000);
    }

    #[tokio::test]
    async fn renew_detects_foreign_owner() {
        let (memory, _clock, allocator, pool) = setup();
        let claim = allocator.acquire(&pool, "n1", None).await.unwrap();
        let key = KeyLayout::default().subnet_key("overlay", &claim.subnet);
        let value = ClaimRecord::owned_by("n2").encode(&key).unwrap();
        crate::store::CoordinationStore::put(memory.as_ref(), &key, value)
            .await
            .unwrap();
        assert!(matches!(
            allocator.renew(&claim).await,
            Err(IpamError::Revoked { .. })
        ));
    }

    #[tokio::test]
    async fn monitor_stops_on_deletion() {
        let (memory, _clock, allocator, pool) = setup();
        let allocator = Arc::new(allocator);
        let claim = allocator.acquire(&pool, "n1", None).await.unwrap();
        let key = KeyLayout::default().subnet_key("overlay", &claim.subnet);

        let (_tx, rx) = watch::channel(false);
        let monitor = LeaseMonitor::new(allocator.clone(), claim, Duration::from_millis(10));
        let task = tokio::spawn(monitor.run(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        crate::store::CoordinationStore::delete(memory.as_ref(), &key)
            .await
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(IpamError::Revoked { .. })));
    }

    #[tokio::test]
    async fn monitor_keeps_retrying_renewal_through_outage() {
        let memory = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(NOW));
        let store = StoreClient::new(memory.clone(), Duration::from_secs(5));
        let allocator = Arc::new(
            SubnetAllocator::new(store, KeyLayout::default(), clock.clone())
                .with_lease_ttl(Duration::from_millis(200))
                .with_retry(RetryPolicy::new(SUBNET_RACE_RETRIES, Duration::ZERO)),
        );
        let pool = Pool::new("overlay", PoolKind::Subnet, "10.244.0.0/22".parse().unwrap())
            .with_subnet_len(24)
            .unwrap();
        let claim = allocator.acquire(&pool, "n1", None).await.unwrap();
        let key = KeyLayout::default().subnet_key("overlay", &claim.subnet);

        // Down before the first renewal at half-life (100ms) and well past it.
        memory.set_available(false);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(LeaseMonitor::new(allocator, claim, Duration::from_millis(20)).run(rx));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!task.is_finished());

        clock.advance(Duration::from_secs(1));
        memory.set_available(true);
        let renewed_to = NOW + 1_000 + 200;
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let kv = crate::store::CoordinationStore::get(memory.as_ref(), &key)
                .await
                .unwrap()
                .unwrap();
            let record = ClaimRecord::decode(&key, &kv.value).unwrap();
            if record.expiration_ms == Some(renewed_to) {
                break;
            }
            assert!(Instant::now() < deadline, "lease was not renewed after recovery");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn monitor_exits_cleanly_on_shutdown() {
        let (_memory, _clock, allocator, pool) = setup();
        let allocator = Arc::new(allocator);
        let claim = allocator.acquire(&pool, "n1", None).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(LeaseMonitor::new(allocator, claim, Duration::from_millis(10)).run(rx));
        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
