//! Inclusive address ranges.

use super::math::{from_u32, parse_addr, to_u32};
use super::AddrError;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An inclusive range `[start, end]` of IPv4 addresses.
///
/// Text form is `"<start>-<end>"` with dotted addresses, the same form the
/// local cache file uses one entry per line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressRange {
    start: u32,
    end: u32,
}

impl AddressRange {
    /// Create a range from two addresses. Fails when `start > end`.
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self, AddrError> {
        Self::from_u32(to_u32(start), to_u32(end))
    }

    /// Create a range from integer bounds. Fails when `start > end`.
    pub fn from_u32(start: u32, end: u32) -> Result<Self, AddrError> {
        if start > end {
            return Err(AddrError::InvalidRange {
                input: format!("{}-{}", from_u32(start), from_u32(end)),
            });
        }
        Ok(Self { start, end })
    }

    /// Range between bounds already known to be ordered.
    pub(crate) fn spanning(start: u32, end: u32) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// A range holding exactly one address.
    pub fn single(addr: u32) -> Self {
        Self {
            start: addr,
            end: addr,
        }
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn start_addr(&self) -> Ipv4Addr {
        from_u32(self.start)
    }

    pub fn end_addr(&self) -> Ipv4Addr {
        from_u32(self.end)
    }

    /// Number of addresses in the range (never zero).
    pub fn len(&self) -> u64 {
        u64::from(self.end) - u64::from(self.start) + 1
    }

    /// Always false; a range holds at least one address.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.start <= addr && addr <= self.end
    }

    pub fn contains_range(&self, other: &AddressRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// The addresses shared by both ranges, if any.
    pub fn intersect(&self, other: &AddressRange) -> Option<AddressRange> {
        if !self.overlaps(other) {
            return None;
        }
        Some(AddressRange {
            start: self.start.max(other.start),
            end: self.end.min(other.end),
        })
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start_addr(), self.end_addr())
    }
}

impl FromStr for AddressRange {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s.trim().split_once('-').ok_or_else(|| AddrError::InvalidRange {
            input: s.to_string(),
        })?;
        let invalid = |_| AddrError::InvalidRange {
            input: s.to_string(),
        };
        let start = parse_addr(start).map_err(invalid)?;
        let end = parse_addr(end).map_err(invalid)?;
        Self::new(start, end)
    }
}
