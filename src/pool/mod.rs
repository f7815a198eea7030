//! Address pools.
//!
//! A pool is an immutable description of one allocatable address space: the
//! enclosing network, the inclusive bounds candidates are drawn from, a
//! reserved prefix skipped before the first candidate, individually reserved
//! addresses, and the allocation granularity for its kind.
//!
//! - [`claim`] - claim records and the store key layout
//! - [`search`] - free-slot search shared by all allocators

pub mod claim;
pub mod search;

pub use claim::{Claim, ClaimRecord, FixedClaim, KeyLayout, RangeClaim, SubnetClaim};

use crate::addr::{math, AddressRange, Ipv4Subnet};
use crate::core::config::PoolConfig;
use crate::error::{IpamError, IpamResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;

/// Default block exponent for range pools (16 addresses).
pub const DEFAULT_BLOCK_EXP: u8 = 4;

/// Allocation strategy of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    /// Fixed-size power-of-two blocks, first-fit, under the pool mutex.
    Range,
    /// One whole subnet per node identity, leased with a TTL.
    Subnet,
    /// Single stable addresses keyed by workload identity.
    Fixed,
}

impl PoolKind {
    /// Directory under the key root holding this kind's claims.
    pub fn key_dir(&self) -> &'static str {
        match self {
            Self::Range => "lease",
            Self::Subnet => "subnet",
            Self::Fixed => "fix",
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Range => write!(f, "range"),
            Self::Subnet => write!(f, "subnet"),
            Self::Fixed => write!(f, "fixed"),
        }
    }
}

/// An allocatable address pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pool {
    name: String,
    kind: PoolKind,
    network: Ipv4Subnet,
    bounds: AddressRange,
    reserved_offset: u32,
    reserved: BTreeSet<u32>,
    gateway: Option<Ipv4Addr>,
    block_exp: u8,
    subnet_len: u8,
}

impl Pool {
    /// A pool spanning the whole network with default granularity.
    ///
    /// For networks larger than /31 the network and broadcast addresses are
    /// reserved from single-address allocation.
    pub fn new(name: impl Into<String>, kind: PoolKind, network: Ipv4Subnet) -> Self {
        let mut reserved = BTreeSet::new();
        if network.prefix_len() < 31 {
            reserved.insert(network.network_u32());
            reserved.insert(network.last_u32());
        }
        let block_exp = match kind {
            PoolKind::Range => DEFAULT_BLOCK_EXP.min(32 - network.prefix_len()),
            PoolKind::Subnet | PoolKind::Fixed => 0,
        };
        Self {
            name: name.into(),
            kind,
            network,
            bounds: network.range(),
            reserved_offset: 0,
            reserved,
            gateway: None,
            block_exp,
            subnet_len: (network.prefix_len() + 8).min(32),
        }
    }

    /// Restrict candidates to `bounds`, which must lie inside the network.
    pub fn with_bounds(mut self, bounds: AddressRange) -> IpamResult<Self> {
        if !self.network.range().contains_range(&bounds) {
            return Err(IpamError::invalid(format!(
                "pool {}: range {} is outside {}",
                self.name, bounds, self.network
            )));
        }
        self.bounds = bounds;
        Ok(self)
    }

    /// Skip this many leading addresses before the first candidate.
    pub fn with_reserved_offset(mut self, offset: u32) -> Self {
        self.reserved_offset = offset;
        self
    }

    /// Range pools: blocks of `2^exp` addresses.
    pub fn with_block_exp(mut self, exp: u8) -> IpamResult<Self> {
        if u64::from(exp) > u64::from(32 - self.network.prefix_len()) {
            return Err(IpamError::invalid(format!(
                "pool {}: block of 2^{} addresses does not fit {}",
                self.name, exp, self.network
            )));
        }
        self.block_exp = exp;
        Ok(self)
    }

    /// Subnet pools: prefix length of each leased subnet.
    pub fn with_subnet_len(mut self, len: u8) -> IpamResult<Self> {
        if len < self.network.prefix_len() || len > 32 {
            return Err(IpamError::invalid(format!(
                "pool {}: subnet length /{} is not within {}",
                self.name, len, self.network
            )));
        }
        self.subnet_len = len;
        Ok(self)
    }

    /// Reserve the gateway address from single-address allocation.
    pub fn with_gateway(mut self, gateway: Ipv4Addr) -> IpamResult<Self> {
        if !self.network.contains(gateway) {
            return Err(IpamError::invalid(format!(
                "pool {}: gateway {} is outside {}",
                self.name, gateway, self.network
            )));
        }
        self.reserved.insert(math::to_u32(gateway));
        self.gateway = Some(gateway);
        Ok(self)
    }

    /// Build a pool from its configuration section.
    pub fn from_config(config: &PoolConfig) -> IpamResult<Self> {
        if config.name.is_empty() || config.name.contains('/') {
            return Err(IpamError::invalid(format!(
                "pool name {:?} must be non-empty and contain no '/'",
                config.name
            )));
        }
        let network: Ipv4Subnet = config.subnet.parse()?;
        let mut pool = Pool::new(config.name.clone(), config.kind, network)
            .with_reserved_offset(config.reserved_offset);

        if config.range_start.is_some() || config.range_end.is_some() {
            let start = match &config.range_start {
                Some(s) => math::parse_addr(s)?,
                None => network.network(),
            };
            let end = match &config.range_end {
                Some(s) => math::parse_addr(s)?,
                None => network.broadcast(),
            };
            pool = pool.with_bounds(AddressRange::new(start, end)?)?;
        }
        if let Some(exp) = config.block_exp {
            pool = pool.with_block_exp(exp)?;
        }
        if let Some(len) = config.subnet_len {
            pool = pool.with_subnet_len(len)?;
        }
        if let Some(gateway) = &config.gateway {
            pool = pool.with_gateway(math::parse_addr(gateway)?)?;
        }
        if pool.first_candidate() > u64::from(pool.bounds.end()) {
            return Err(IpamError::invalid(format!(
                "pool {}: reserved offset {} leaves no candidates in {}",
                pool.name, pool.reserved_offset, pool.bounds
            )));
        }
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn network(&self) -> Ipv4Subnet {
        self.network
    }

    pub fn bounds(&self) -> AddressRange {
        self.bounds
    }

    pub fn reserved_offset(&self) -> u32 {
        self.reserved_offset
    }

    pub fn reserved(&self) -> &BTreeSet<u32> {
        &self.reserved
    }

    pub fn gateway(&self) -> Option<Ipv4Addr> {
        self.gateway
    }

    pub fn block_exp(&self) -> u8 {
        self.block_exp
    }

    pub fn subnet_len(&self) -> u8 {
        self.subnet_len
    }

    /// Addresses per allocation for this pool's kind.
    pub fn block_size(&self) -> u64 {
        match self.kind {
            PoolKind::Range => 1u64 << self.block_exp,
            PoolKind::Subnet => math::prefix_size(self.subnet_len),
            PoolKind::Fixed => 1,
        }
    }

    /// First address a candidate may start at.
    pub fn first_candidate(&self) -> u64 {
        u64::from(self.bounds.start()) + u64::from(self.reserved_offset)
    }

    pub fn is_reserved(&self, addr: u32) -> bool {
        self.reserved.contains(&addr)
    }

    /// A subnet lease is reusable only if it has this pool's subnet length
    /// and lies inside the pool bounds.
    pub fn is_compatible_subnet(&self, subnet: &Ipv4Subnet) -> bool {
        subnet.prefix_len() == self.subnet_len && self.bounds.contains_range(&subnet.range())
    }
}
