//! First-fit block allocation.
//!
//! Each attempt holds the pool's distributed mutex while it lists the pool's
//! claims, picks the earliest gap large enough for one block, and creates the
//! block's key. The mutex is released on every path. Write failures retry the
//! whole cycle up to [`RANGE_APPLY_ATTEMPTS`] times; running out of space is
//! reported at once.

use super::{AllocationRequest, PoolAllocator, RetryPolicy, RANGE_APPLY_ATTEMPTS};
use crate::cache::LocalCacheStore;
use crate::error::{IpamError, IpamResult};
use crate::pool::claim::decode_claims;
use crate::pool::{search, Claim, ClaimRecord, KeyLayout, Pool, PoolKind, RangeClaim};
use crate::store::{CreateOutcome, StoreClient};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Allocates fixed-size blocks from range pools.
pub struct RangeAllocator {
    store: StoreClient,
    layout: KeyLayout,
    cache: Option<Arc<LocalCacheStore>>,
    retry: RetryPolicy,
}

impl RangeAllocator {
    pub fn new(store: StoreClient, layout: KeyLayout) -> Self {
        Self {
            store,
            layout,
            cache: None,
            retry: RetryPolicy::new(RANGE_APPLY_ATTEMPTS, Duration::from_millis(100)),
        }
    }

    /// Record successful claims in the local cache.
    pub fn with_cache(mut self, cache: Arc<LocalCacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Claim one block for `owner`.
    pub async fn allocate_block(&self, pool: &Pool, owner: &str) -> IpamResult<RangeClaim> {
        check_kind(pool)?;
        for attempt in 1..=self.retry.max_attempts {
            match self.try_allocate(pool, owner).await {
                Ok(claim) => {
                    tracing::info!(
                        pool = %pool.name(),
                        range = %claim.range,
                        owner = %owner,
                        "allocated block"
                    );
                    self.cache_append(&claim);
                    return Ok(claim);
                }
                Err(e @ IpamError::CapacityExhausted { .. }) => return Err(e),
                Err(e) if e.is_retriable() => {
                    tracing::warn!(pool = %pool.name(), attempt, error = %e, "block allocation attempt failed");
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

    async fn try_allocate(&self, pool: &Pool, owner: &str) -> IpamResult<RangeClaim> {
        let guard = self
            .store
            .lock(&self.layout.mutex_name(PoolKind::Range, pool.name()))
            .await?;
        let outcome = self.claim_first_fit(pool, owner).await;
        if let Err(e) = guard.release().await {
            tracing::warn!(pool = %pool.name(), error = %e, "failed to release pool mutex");
        }
        outcome
    }

    async fn claim_first_fit(&self, pool: &Pool, owner: &str) -> IpamResult<RangeClaim> {
        let claimed: Vec<_> = self
            .claims(pool.name())
            .await?
            .into_iter()
            .map(|claim| claim.range)
            .collect();

        let block = pool.block_size();
        let range = search::first_fit(pool.bounds(), pool.first_candidate(), block, &claimed)
            .ok_or_else(|| IpamError::CapacityExhausted {
                pool: pool.name().to_string(),
                requested: block,
            })?;

        let key = self
            .layout
            .range_key(pool.name(), range.start(), pool.block_exp());
        let value = ClaimRecord::owned_by(owner).encode(&key)?;
        match self.store.create(&key, value).await? {
            CreateOutcome::Created { .. } => Ok(RangeClaim {
                pool: pool.name().to_string(),
                range,
                owner: owner.to_string(),
            }),
            CreateOutcome::AlreadyExists => Err(IpamError::Collision { key }),
        }
    }

    /// All range claims of a pool, ascending by start.
    pub async fn claims(&self, pool: &str) -> IpamResult<Vec<RangeClaim>> {
        let snapshot = self
            .store
            .range(&self.layout.claim_prefix(PoolKind::Range, pool))
            .await?;
        let mut claims = decode_claims(&self.layout, &snapshot.kvs, RangeClaim::from_kv);
        claims.sort_by_key(|claim| claim.range);
        Ok(claims)
    }

    /// Delete a block's key and its cache entry under the pool mutex, so a
    /// concurrent reconcile pass cannot republish it. Store failures are
    /// logged, not returned.
    pub async fn release_block(&self, claim: &RangeClaim) {
        let mutex = self.layout.mutex_name(PoolKind::Range, &claim.pool);
        let guard = match self.store.lock(&mutex).await {
            Ok(guard) => Some(guard),
            Err(e) => {
                tracing::warn!(pool = %claim.pool, range = %claim.range, error = %e, "failed to take pool mutex for release");
                None
            }
        };
        if guard.is_some() {
            self.delete_claim(claim).await;
        }
        self.cache_delete(claim);
        if let Some(guard) = guard {
            if let Err(e) = guard.release().await {
                tracing::warn!(pool = %claim.pool, error = %e, "failed to release pool mutex");
            }
        }
    }

    async fn delete_claim(&self, claim: &RangeClaim) {
        let Some(key) = self.layout.range_key_for(&claim.pool, &claim.range) else {
            tracing::warn!(pool = %claim.pool, range = %claim.range, "block length is not a power of two");
            return;
        };
        match self.store.delete(&key).await {
            Ok(true) => {
                tracing::info!(pool = %claim.pool, range = %claim.range, "released block");
            }
            Ok(false) => {
                tracing::debug!(pool = %claim.pool, range = %claim.range, "released block was already gone");
            }
            Err(e) => {
                tracing::warn!(pool = %claim.pool, range = %claim.range, error = %e, "failed to delete block claim");
            }
        }
    }

    fn cache_append(&self, claim: &RangeClaim) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.append(&claim.pool, claim.range) {
                tracing::warn!(pool = %claim.pool, range = %claim.range, error = %e, "failed to cache block");
            }
        }
    }

    fn cache_delete(&self, claim: &RangeClaim) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.delete(&claim.pool, claim.range) {
                tracing::warn!(pool = %claim.pool, range = %claim.range, error = %e, "failed to uncache block");
            }
        }
    }
}

fn check_kind(pool: &Pool) -> IpamResult<()> {
    if pool.kind() != PoolKind::Range {
        return Err(IpamError::invalid(format!(
            "pool {} is a {} pool",
            pool.name(),
            pool.kind()
        )));
    }
    Ok(())
}

#[async_trait]
impl PoolAllocator for RangeAllocator {
    fn kind(&self) -> PoolKind {
        PoolKind::Range
    }

    async fn allocate(&self, pool: &Pool, request: &AllocationRequest) -> IpamResult<Claim> {
        self.allocate_block(pool, &request.owner)
            .await
            .map(Claim::Range)
    }

    async fn release(&self, _pool: &Pool, claim: &Claim) -> IpamResult<()> {
        match claim {
            Claim::Range(claim) => {
                self.release_block(claim).await;
                Ok(())
            }
            other => Err(IpamError::invalid(format!(
                "range allocator cannot release a {} claim",
                other.kind()
            ))),
        }
    }
}
