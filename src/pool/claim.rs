//! Claims and the store key layout.
//!
//! Every claim key is derived purely from the claimed slot, so two writers
//! proposing the same slot collide on the same key and a conditional create
//! decides the winner. Range and fixed keys zero-pad the start address to ten
//! digits so lexicographic key order equals ascending address order.
//!
//! ```text
//! <root>/lease/<pool>/<start %010d>-<block exponent>   range claims
//! <root>/subnet/<pool>/<a.b.c.d>-<prefix len>          subnet leases
//! <root>/fix/<pool>/<address %010d>                    fixed addresses
//! <root>/vxlan/<device>/<a.b.c.d>                      tunnel endpoints
//! <root>/mutex/<kind dir>/<pool>                       pool locks
//! ```

use super::PoolKind;
use crate::addr::{math, AddressRange, Ipv4Subnet};
use crate::error::{IpamError, IpamResult};
use crate::store::KeyValue;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Value stored under every claim key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    /// Node identity holding the claim.
    pub owner: String,

    /// Lease deadline in epoch milliseconds (subnet claims only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_ms: Option<u64>,

    /// Workload the address is pinned to (fixed claims only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload: Option<String>,
}

impl ClaimRecord {
    pub fn owned_by(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            expiration_ms: None,
            workload: None,
        }
    }

    pub fn with_expiration(mut self, expiration_ms: u64) -> Self {
        self.expiration_ms = Some(expiration_ms);
        self
    }

    pub fn with_workload(mut self, workload: impl Into<String>) -> Self {
        self.workload = Some(workload.into());
        self
    }

    pub fn encode(&self, key: &str) -> IpamResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| IpamError::Codec {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    pub fn decode(key: &str, value: &[u8]) -> IpamResult<Self> {
        serde_json::from_slice(value).map_err(|e| IpamError::Codec {
            key: key.to_string(),
            message: e.to_string(),
        })
    }
}

/// A fixed-size block held by a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeClaim {
    pub pool: String,
    pub range: AddressRange,
    pub owner: String,
}

impl RangeClaim {
    pub fn from_kv(layout: &KeyLayout, kv: &KeyValue) -> IpamResult<Self> {
        let (pool, range) = layout.parse_range_key(&kv.key).ok_or_else(|| IpamError::Codec {
            key: kv.key.clone(),
            message: "not a range claim key".to_string(),
        })?;
        let record = ClaimRecord::decode(&kv.key, &kv.value)?;
        Ok(Self {
            pool,
            range,
            owner: record.owner,
        })
    }
}

/// A whole subnet leased to a node identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetClaim {
    pub pool: String,
    pub subnet: Ipv4Subnet,
    pub owner: String,
    pub expiration_ms: u64,
}

impl SubnetClaim {
    /// Claims written without an expiration never expire.
    pub fn from_kv(layout: &KeyLayout, kv: &KeyValue) -> IpamResult<Self> {
        let (pool, subnet) = layout.parse_subnet_key(&kv.key).ok_or_else(|| IpamError::Codec {
            key: kv.key.clone(),
            message: "not a subnet claim key".to_string(),
        })?;
        let record = ClaimRecord::decode(&kv.key, &kv.value)?;
        Ok(Self {
            pool,
            subnet,
            owner: record.owner,
            expiration_ms: record.expiration_ms.unwrap_or(u64::MAX),
        })
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expiration_ms
    }
}

/// A single address pinned to a workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedClaim {
    pub pool: String,
    pub address: Ipv4Addr,
    pub owner: String,
    pub workload: String,
}

impl FixedClaim {
    pub fn from_kv(layout: &KeyLayout, kv: &KeyValue) -> IpamResult<Self> {
        let (pool, address) = layout.parse_fixed_key(&kv.key).ok_or_else(|| IpamError::Codec {
            key: kv.key.clone(),
            message: "not a fixed claim key".to_string(),
        })?;
        let record = ClaimRecord::decode(&kv.key, &kv.value)?;
        Ok(Self {
            pool,
            address,
            owner: record.owner,
            workload: record.workload.unwrap_or_default(),
        })
    }
}

/// Any claim, as returned by the allocator table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    Range(RangeClaim),
    Subnet(SubnetClaim),
    Fixed(FixedClaim),
}

impl Claim {
    pub fn kind(&self) -> PoolKind {
        match self {
            Self::Range(_) => PoolKind::Range,
            Self::Subnet(_) => PoolKind::Subnet,
            Self::Fixed(_) => PoolKind::Fixed,
        }
    }

    pub fn pool(&self) -> &str {
        match self {
            Self::Range(c) => &c.pool,
            Self::Subnet(c) => &c.pool,
            Self::Fixed(c) => &c.pool,
        }
    }

    pub fn owner(&self) -> &str {
        match self {
            Self::Range(c) => &c.owner,
            Self::Subnet(c) => &c.owner,
            Self::Fixed(c) => &c.owner,
        }
    }

    /// Addresses covered by the claim.
    pub fn range(&self) -> AddressRange {
        match self {
            Self::Range(c) => c.range,
            Self::Subnet(c) => c.subnet.range(),
            Self::Fixed(c) => AddressRange::single(math::to_u32(c.address)),
        }
    }
}

/// Decode every well-formed claim in `kvs`, logging and skipping the rest.
pub fn decode_claims<T>(
    layout: &KeyLayout,
    kvs: &[KeyValue],
    decode: fn(&KeyLayout, &KeyValue) -> IpamResult<T>,
) -> Vec<T> {
    kvs.iter()
        .filter_map(|kv| match decode(layout, kv) {
            Ok(claim) => Some(claim),
            Err(e) => {
                tracing::warn!(key = %kv.key, error = %e, "skipping malformed claim");
                None
            }
        })
        .collect()
}

/// Builds and parses store keys under a common root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    root: String,
}

impl KeyLayout {
    pub fn new(root: impl Into<String>) -> Self {
        let root: String = root.into();
        Self {
            root: root.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Prefix covering every key this layout produces.
    pub fn root_prefix(&self) -> String {
        format!("{}/", self.root)
    }

    /// Prefix covering all claims of one kind across pools.
    pub fn kind_prefix(&self, kind: PoolKind) -> String {
        format!("{}/{}/", self.root, kind.key_dir())
    }

    /// Prefix covering all claims of one pool.
    pub fn claim_prefix(&self, kind: PoolKind, pool: &str) -> String {
        format!("{}/{}/{}/", self.root, kind.key_dir(), pool)
    }

    /// Name of the distributed mutex serializing writers of one pool.
    pub fn mutex_name(&self, kind: PoolKind, pool: &str) -> String {
        format!("{}/mutex/{}/{}", self.root, kind.key_dir(), pool)
    }

    pub fn range_key(&self, pool: &str, start: u32, block_exp: u8) -> String {
        format!(
            "{}{:010}-{}",
            self.claim_prefix(PoolKind::Range, pool),
            start,
            block_exp
        )
    }

    /// Key for a block, or `None` when its length is not a power of two.
    pub fn range_key_for(&self, pool: &str, range: &AddressRange) -> Option<String> {
        let exp = math::block_exponent(range.len())?;
        Some(self.range_key(pool, range.start(), exp))
    }

    pub fn parse_range_key(&self, key: &str) -> Option<(String, AddressRange)> {
        let (pool, tail) = self.split_claim_key(PoolKind::Range, key)?;
        let (start, exp) = tail.split_once('-')?;
        let start: u32 = start.parse().ok()?;
        let exp: u8 = exp.parse().ok()?;
        if exp > 32 {
            return None;
        }
        let end = math::checked_offset(start, (1u64 << exp) - 1)?;
        let range = AddressRange::from_u32(start, end).ok()?;
        Some((pool.to_string(), range))
    }

    pub fn subnet_key(&self, pool: &str, subnet: &Ipv4Subnet) -> String {
        format!(
            "{}{}-{}",
            self.claim_prefix(PoolKind::Subnet, pool),
            subnet.network(),
            subnet.prefix_len()
        )
    }

    pub fn parse_subnet_key(&self, key: &str) -> Option<(String, Ipv4Subnet)> {
        let (pool, tail) = self.split_claim_key(PoolKind::Subnet, key)?;
        let (addr, len) = tail.rsplit_once('-')?;
        let subnet = Ipv4Subnet::new(math::parse_addr(addr).ok()?, len.parse().ok()?).ok()?;
        Some((pool.to_string(), subnet))
    }

    pub fn fixed_key(&self, pool: &str, address: Ipv4Addr) -> String {
        format!(
            "{}{:010}",
            self.claim_prefix(PoolKind::Fixed, pool),
            math::to_u32(address)
        )
    }

    pub fn parse_fixed_key(&self, key: &str) -> Option<(String, Ipv4Addr)> {
        let (pool, tail) = self.split_claim_key(PoolKind::Fixed, key)?;
        let value: u32 = tail.parse().ok()?;
        Some((pool.to_string(), math::from_u32(value)))
    }

    pub fn endpoint_prefix(&self) -> String {
        format!("{}/vxlan/", self.root)
    }

    pub fn endpoint_device_prefix(&self, device: &str) -> String {
        format!("{}/vxlan/{}/", self.root, device)
    }

    pub fn endpoint_key(&self, device: &str, address: Ipv4Addr) -> String {
        format!("{}{}", self.endpoint_device_prefix(device), address)
    }

    pub fn parse_endpoint_key(&self, key: &str) -> Option<(String, Ipv4Addr)> {
        let rest = key.strip_prefix(&self.endpoint_prefix())?;
        let (device, addr) = rest.split_once('/')?;
        if device.is_empty() {
            return None;
        }
        Some((device.to_string(), math::parse_addr(addr).ok()?))
    }

    pub fn endpoint_mutex(&self, device: &str) -> String {
        format!("{}/mutex/vxlan/{}", self.root, device)
    }

    fn split_claim_key<'a>(&self, kind: PoolKind, key: &'a str) -> Option<(&'a str, &'a str)> {
        let rest = key.strip_prefix(&self.kind_prefix(kind))?;
        let (pool, tail) = rest.split_once('/')?;
        if pool.is_empty() || tail.is_empty() || tail.contains('/') {
            return None;
        }
        Some((pool, tail))
    }
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self::new("ipshard")
    }
}
