//! CIDR subnets.

use super::math::{checked_offset, from_u32, mask, parse_addr, prefix_size, to_u32};
use super::range::AddressRange;
use super::AddrError;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An IPv4 subnet in canonical form (host bits cleared).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ipv4Subnet {
    network: u32,
    prefix_len: u8,
}

impl Ipv4Subnet {
    /// Create a subnet, clearing any host bits of `addr`.
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Self, AddrError> {
        if prefix_len > 32 {
            return Err(AddrError::InvalidPrefix {
                input: prefix_len.to_string(),
            });
        }
        Ok(Self {
            network: to_u32(addr) & mask(prefix_len),
            prefix_len,
        })
    }

    pub fn network(&self) -> Ipv4Addr {
        from_u32(self.network)
    }

    pub fn network_u32(&self) -> u32 {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Number of addresses in the subnet.
    pub fn size(&self) -> u64 {
        prefix_size(self.prefix_len)
    }

    /// Highest address in the subnet.
    pub fn last_u32(&self) -> u32 {
        self.network | !mask(self.prefix_len)
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        from_u32(self.last_u32())
    }

    /// The subnet as an inclusive address range.
    pub fn range(&self) -> AddressRange {
        AddressRange::spanning(self.network, self.last_u32())
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        to_u32(addr) & mask(self.prefix_len) == self.network
    }

    pub fn contains_subnet(&self, other: &Ipv4Subnet) -> bool {
        other.prefix_len >= self.prefix_len && self.contains(other.network())
    }

    pub fn overlaps(&self, other: &Ipv4Subnet) -> bool {
        self.range().overlaps(&other.range())
    }

    /// The following subnet of the same size, `None` past the end of the space.
    pub fn next(&self) -> Option<Ipv4Subnet> {
        let network = checked_offset(self.network, self.size())?;
        Some(Self {
            network,
            prefix_len: self.prefix_len,
        })
    }
}

impl fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix_len)
    }
}

impl FromStr for Ipv4Subnet {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s.trim().split_once('/').ok_or_else(|| AddrError::InvalidSubnet {
            input: s.to_string(),
        })?;
        let addr = parse_addr(addr)?;
        let prefix_len: u8 = len.parse().map_err(|_| AddrError::InvalidPrefix {
            input: len.to_string(),
        })?;
        Self::new(addr, prefix_len)
    }
}
