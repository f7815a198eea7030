//! Integer conversions for IPv4 addresses.
//!
//! Sizes and offsets are carried as `u64` so that a full /0 space (2^32
//! addresses) and `end + 1` at 255.255.255.255 never overflow.

use super::AddrError;
use std::net::Ipv4Addr;

/// Number of addresses in the IPv4 space.
pub const ADDRESS_SPACE: u64 = 1 << 32;

/// Convert an address to its big-endian integer value.
pub fn to_u32(addr: Ipv4Addr) -> u32 {
    u32::from(addr)
}

/// Convert an integer back to an address.
pub fn from_u32(value: u32) -> Ipv4Addr {
    Ipv4Addr::from(value)
}

/// Network mask for a prefix length. Lengths above 32 saturate.
pub fn mask(prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        len if len >= 32 => u32::MAX,
        len => u32::MAX << (32 - len),
    }
}

/// Number of addresses covered by a prefix length.
pub fn prefix_size(prefix_len: u8) -> u64 {
    1u64 << (32 - u32::from(prefix_len.min(32)))
}

/// Add an offset to an address, returning `None` past 255.255.255.255.
pub fn checked_offset(base: u32, offset: u64) -> Option<u32> {
    let value = u64::from(base).checked_add(offset)?;
    u32::try_from(value).ok()
}

/// Round `value` up to the next multiple of `alignment` (a power of two).
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}

/// Log2 of a power-of-two block length, or `None` for any other length.
pub fn block_exponent(len: u64) -> Option<u8> {
    if len == 0 || !len.is_power_of_two() || len > ADDRESS_SPACE {
        return None;
    }
    Some(len.trailing_zeros() as u8)
}

/// Parse a dotted IPv4 address.
pub fn parse_addr(input: &str) -> Result<Ipv4Addr, AddrError> {
    input.trim().parse().map_err(|_| AddrError::InvalidAddress {
        input: input.to_string(),
    })
}
