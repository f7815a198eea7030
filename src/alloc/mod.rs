//! Allocation strategies.
//!
//! Each pool kind has one allocator implementing [`PoolAllocator`]. The
//! runtime builds an [`AllocatorTable`] at startup and dispatches requests by
//! the pool's kind; nothing is registered globally.
//!
//! - [`range`] - first-fit blocks under the pool mutex
//! - [`subnet`] - leased subnets with optimistic conditional create
//! - [`fixed`] - stable single addresses per workload

pub mod fixed;
pub mod range;
pub mod subnet;

pub use fixed::{FixedAddressAllocator, WorkloadLiveness};
pub use range::RangeAllocator;
pub use subnet::{LeaseMonitor, SubnetAllocator};

use crate::addr::Ipv4Subnet;
use crate::error::{IpamError, IpamResult};
use crate::pool::{Claim, Pool, PoolKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Write attempts for range allocation before giving up.
pub const RANGE_APPLY_ATTEMPTS: u32 = 3;

/// Scan-and-create attempts for subnet allocation.
pub const SUBNET_RACE_RETRIES: u32 = 10;

/// Pick-and-create attempts for fixed addresses.
pub const FIXED_ATTEMPTS: u32 = 5;

/// Bounded retry budget with a fixed pause between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Pause before the next attempt, skipped after the last one.
    pub async fn pause(&self, attempt: u32) {
        if attempt < self.max_attempts && !self.backoff.is_zero() {
            tokio::time::sleep(self.backoff).await;
        }
    }
}

/// What the caller wants allocated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationRequest {
    /// Node identity that will own the claim.
    pub owner: String,
    /// Subnet pools: subnet held before a restart.
    pub previous: Option<Ipv4Subnet>,
    /// Fixed pools: workload the address is pinned to.
    pub workload: Option<String>,
}

impl AllocationRequest {
    pub fn for_owner(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            ..Self::default()
        }
    }

    pub fn with_previous(mut self, previous: Ipv4Subnet) -> Self {
        self.previous = Some(previous);
        self
    }

    pub fn with_workload(mut self, workload: impl Into<String>) -> Self {
        self.workload = Some(workload.into());
        self
    }
}

/// A strategy for claiming address space in one kind of pool.
#[async_trait]
pub trait PoolAllocator: Send + Sync {
    /// Pool kind this allocator serves.
    fn kind(&self) -> PoolKind;

    async fn allocate(&self, pool: &Pool, request: &AllocationRequest) -> IpamResult<Claim>;

    async fn release(&self, pool: &Pool, claim: &Claim) -> IpamResult<()>;
}

/// Allocators keyed by pool kind.
#[derive(Default, Clone)]
pub struct AllocatorTable {
    allocators: HashMap<PoolKind, Arc<dyn PoolAllocator>>,
}

impl AllocatorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an allocator, replacing any previous one for its kind.
    pub fn register(&mut self, allocator: Arc<dyn PoolAllocator>) {
        self.allocators.insert(allocator.kind(), allocator);
    }

    pub fn with(mut self, allocator: Arc<dyn PoolAllocator>) -> Self {
        self.register(allocator);
        self
    }

    pub fn get(&self, kind: PoolKind) -> IpamResult<Arc<dyn PoolAllocator>> {
        self.allocators
            .get(&kind)
            .cloned()
            .ok_or_else(|| IpamError::invalid(format!("no allocator registered for {} pools", kind)))
    }

    pub async fn allocate(&self, pool: &Pool, request: &AllocationRequest) -> IpamResult<Claim> {
        self.get(pool.kind())?.allocate(pool, request).await
    }

    pub async fn release(&self, pool: &Pool, claim: &Claim) -> IpamResult<()> {
        if claim.kind() != pool.kind() {
            return Err(IpamError::invalid(format!(
                "{} claim cannot be released into {} pool {}",
                claim.kind(),
                pool.kind(),
                pool.name()
            )));
        }
        self.get(pool.kind())?.release(pool, claim).await
    }
}
