//! Local cache and store reconciliation.
//!
//! The cache and the store drift apart whenever a write to one side succeeds
//! and the other fails, or when a node restarts with a stale cache. A sync
//! pass repairs both directions for one pool while holding the pool mutex:
//!
//! 1. Every store claim owned by this node is made present locally, replacing
//!    any overlapping local entry that does not match it exactly.
//! 2. Every local entry without a matching owned claim is published to the
//!    store, unless another owner already holds an overlapping claim, in which
//!    case the local entry is dropped.
//!
//! - [`sweep`] - removal of every record held by a departed node

pub mod sweep;

pub use sweep::{OwnerSweeper, SweepReport};

use crate::addr::AddressRange;
use crate::cache::LocalCacheStore;
use crate::core::runtime::shutdown_requested;
use crate::error::IpamResult;
use crate::pool::claim::decode_claims;
use crate::pool::{ClaimRecord, KeyLayout, PoolKind, RangeClaim};
use crate::store::{CreateOutcome, StoreClient};
use rand::Rng;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// What one sync pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pool: String,
    /// Owned claims already cached exactly.
    pub kept: usize,
    /// Owned claims added to the cache.
    pub adopted: usize,
    /// Local entries removed because they overlapped an owned claim inexactly.
    pub replaced: usize,
    /// Local entries written to the store.
    pub published: usize,
    /// Local entries removed because another owner holds the space.
    pub dropped: usize,
}

impl SyncReport {
    fn new(pool: &str) -> Self {
        Self {
            pool: pool.to_string(),
            ..Self::default()
        }
    }

    pub fn changed(&self) -> bool {
        self.adopted + self.replaced + self.published + self.dropped > 0
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: kept={} adopted={} replaced={} published={} dropped={}",
            self.pool, self.kept, self.adopted, self.replaced, self.published, self.dropped
        )
    }
}

/// Repairs divergence between the local cache and the store.
pub struct Reconciler {
    store: StoreClient,
    cache: Arc<LocalCacheStore>,
    layout: KeyLayout,
    identity: String,
}

impl Reconciler {
    pub fn new(
        store: StoreClient,
        cache: Arc<LocalCacheStore>,
        layout: KeyLayout,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            store,
            cache,
            layout,
            identity: identity.into(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Reconcile one range pool under its mutex.
    pub async fn sync(&self, pool: &str) -> IpamResult<SyncReport> {
        let guard = self
            .store
            .lock(&self.layout.mutex_name(PoolKind::Range, pool))
            .await?;
        let outcome = self.sync_locked(pool).await;
        if let Err(e) = guard.release().await {
            tracing::warn!(pool = %pool, error = %e, "failed to release pool mutex");
        }
        let report = outcome?;
        if report.changed() {
            tracing::info!(pool = %pool, report = %report, "reconciled pool");
        } else {
            tracing::debug!(pool = %pool, kept = report.kept, "pool already consistent");
        }
        Ok(report)
    }

    async fn sync_locked(&self, pool: &str) -> IpamResult<SyncReport> {
        let mut report = SyncReport::new(pool);
        let snapshot = self
            .store
            .range(&self.layout.claim_prefix(PoolKind::Range, pool))
            .await?;
        let (owned, foreign): (Vec<RangeClaim>, Vec<RangeClaim>) =
            decode_claims(&self.layout, &snapshot.kvs, RangeClaim::from_kv)
                .into_iter()
                .partition(|claim| claim.owner == self.identity);

        let mut local = self.cache.load(pool)?;
        for claim in &owned {
            let range = claim.range;
            if local.contains(&range) {
                report.kept += 1;
                continue;
            }
            let stale: Vec<AddressRange> = local
                .iter()
                .copied()
                .filter(|entry| entry.overlaps(&range))
                .collect();
            for entry in stale {
                if self.drop_local(pool, entry) {
                    tracing::info!(pool = %pool, stale = %entry, claim = %range, "replacing stale cached range");
                    report.replaced += 1;
                }
                local.retain(|e| *e != entry);
            }
            match self.cache.append(pool, range) {
                Ok(()) => {
                    tracing::info!(pool = %pool, range = %range, "adopted store claim");
                    local.push(range);
                    report.adopted += 1;
                }
                Err(e) => {
                    tracing::warn!(pool = %pool, range = %range, error = %e, "failed to adopt claim; releasing it");
                    self.delete_claim(pool, &range).await;
                }
            }
        }

        for entry in self.cache.load(pool)? {
            if owned.iter().any(|claim| claim.range == entry) {
                continue;
            }
            if let Some(holder) = foreign.iter().find(|claim| claim.range.overlaps(&entry)) {
                tracing::info!(pool = %pool, range = %entry, owner = %holder.owner, "cached range is held by another node");
                if self.drop_local(pool, entry) {
                    report.dropped += 1;
                }
                continue;
            }
            let Some(key) = self.layout.range_key_for(pool, &entry) else {
                tracing::warn!(pool = %pool, range = %entry, "cached range is not a power-of-two block");
                if self.drop_local(pool, entry) {
                    report.dropped += 1;
                }
                continue;
            };
            let value = ClaimRecord::owned_by(&self.identity).encode(&key)?;
            match self.store.create(&key, value).await? {
                CreateOutcome::Created { .. } => {
                    tracing::info!(pool = %pool, range = %entry, "published cached range");
                    report.published += 1;
                }
                CreateOutcome::AlreadyExists => {
                    tracing::info!(pool = %pool, range = %entry, "cached range was claimed concurrently");
                    if self.drop_local(pool, entry) {
                        report.dropped += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    fn drop_local(&self, pool: &str, range: AddressRange) -> bool {
        match self.cache.delete(pool, range) {
            Ok(removed) => removed.is_some(),
            Err(e) => {
                tracing::warn!(pool = %pool, range = %range, error = %e, "failed to drop cached range");
                false
            }
        }
    }

    async fn delete_claim(&self, pool: &str, range: &AddressRange) {
        let Some(key) = self.layout.range_key_for(pool, range) else {
            return;
        };
        if let Err(e) = self.store.delete(&key).await {
            tracing::warn!(pool = %pool, range = %range, error = %e, "failed to delete claim");
        }
    }

    /// Pools worth syncing: configured ones, ones with a local cache, and
    /// ones where the store holds claims owned by this node.
    pub async fn pools_to_sync(&self, configured: &[String]) -> IpamResult<Vec<String>> {
        let mut pools: BTreeSet<String> = configured.iter().cloned().collect();
        pools.extend(self.cache.pools()?);
        let snapshot = self
            .store
            .range(&self.layout.kind_prefix(PoolKind::Range))
            .await?;
        pools.extend(
            decode_claims(&self.layout, &snapshot.kvs, RangeClaim::from_kv)
                .into_iter()
                .filter(|claim| claim.owner == self.identity)
                .map(|claim| claim.pool),
        );
        Ok(pools.into_iter().collect())
    }
}

/// Periodic reconciliation with jittered intervals.
pub struct ReconcileLoop {
    reconciler: Arc<Reconciler>,
    configured: Vec<String>,
    interval: Duration,
    jitter: f64,
}

impl ReconcileLoop {
    pub fn new(
        reconciler: Arc<Reconciler>,
        configured: Vec<String>,
        interval: Duration,
        jitter: f64,
    ) -> Self {
        Self {
            reconciler,
            configured,
            interval,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Sync every known pool. Failures are logged and skipped.
    pub async fn sync_all(&self) -> Vec<SyncReport> {
        let pools = match self.reconciler.pools_to_sync(&self.configured).await {
            Ok(pools) => pools,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list pools; syncing configured pools only");
                self.configured.clone()
            }
        };
        let mut reports = Vec::with_capacity(pools.len());
        for pool in pools {
            match self.reconciler.sync(&pool).await {
                Ok(report) => reports.push(report),
                Err(e) => tracing::warn!(pool = %pool, error = %e, "reconcile failed"),
            }
        }
        reports
    }

    /// `interval * (1 ± jitter)`.
    pub fn next_delay(&self) -> Duration {
        let factor = 1.0 + rand::rng().random_range(-self.jitter..=self.jitter);
        self.interval.mul_f64(factor)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval_secs = self.interval.as_secs(), "reconcile loop started");
        loop {
            let delay = self.next_delay();
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = tokio::time::sleep(delay) => {}
            }
            self.sync_all().await;
        }
        tracing::info!("reconcile loop stopped");
    }
}
