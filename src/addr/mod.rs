//! IPv4 address arithmetic.
//!
//! Pure conversions between dotted addresses, integers, masks, inclusive
//! ranges and CIDR subnets. Nothing here touches the store or the disk.
//!
//! - [`math`] - integer conversions and mask helpers
//! - [`range`] - inclusive address ranges
//! - [`subnet`] - CIDR subnets

pub mod math;
pub mod range;
pub mod subnet;

pub use math::{from_u32, mask, parse_addr, prefix_size, to_u32};
pub use range::AddressRange;
pub use subnet::Ipv4Subnet;

use thiserror::Error;

/// Errors produced while parsing or constructing addresses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddrError {
    /// The text is not a dotted IPv4 address.
    #[error("invalid IPv4 address: {input}")]
    InvalidAddress { input: String },

    /// Prefix length outside 0..=32 or not a number.
    #[error("invalid prefix length: {input}")]
    InvalidPrefix { input: String },

    /// Range whose start lies after its end, or malformed range text.
    #[error("invalid address range: {input}")]
    InvalidRange { input: String },

    /// Subnet text without a '/' separator.
    #[error("invalid subnet: {input}")]
    InvalidSubnet { input: String },
}
