//! Free-slot search.
//!
//! All allocators work from the same primitive: the gaps left in a pool's
//! bounds once existing claims (and, for single addresses, reserved
//! addresses) are removed. Range allocation takes the first gap large enough
//! for a block, fixed allocation picks a uniformly random free address, and
//! subnet allocation collects aligned subnets out of the gaps.

use super::Pool;
use crate::addr::{math, AddressRange, Ipv4Subnet};
use rand::Rng;

/// Upper bound on subnet candidates gathered per scan.
pub const SUBNET_CANDIDATE_LIMIT: usize = 100;

/// Gaps inside `bounds`, starting no earlier than `first`, not covered by
/// any range in `occupied`. `occupied` need not be sorted.
pub fn gaps(bounds: AddressRange, first: u64, occupied: &[AddressRange]) -> Vec<AddressRange> {
    let mut sorted: Vec<AddressRange> = occupied.to_vec();
    sorted.sort();

    let end = u64::from(bounds.end());
    let mut cursor = first.max(u64::from(bounds.start()));
    let mut result = Vec::new();
    for claim in sorted {
        if cursor > end {
            break;
        }
        let claim_start = u64::from(claim.start());
        let claim_end = u64::from(claim.end());
        if claim_end < cursor {
            continue;
        }
        if claim_start > cursor {
            let gap_end = (claim_start - 1).min(end);
            result.push(span(cursor, gap_end));
        }
        cursor = cursor.max(claim_end + 1);
    }
    if cursor <= end {
        result.push(span(cursor, end));
    }
    result
}

fn span(start: u64, end: u64) -> AddressRange {
    AddressRange::spanning(start as u32, end as u32)
}

/// First-fit block of `block` addresses.
///
/// Scans from `first` in address order and returns the start of the
/// earliest gap holding at least `block` addresses.
pub fn first_fit(
    bounds: AddressRange,
    first: u64,
    block: u64,
    claimed: &[AddressRange],
) -> Option<AddressRange> {
    gaps(bounds, first, claimed)
        .into_iter()
        .find(|gap| gap.len() >= block)
        .map(|gap| {
            let start = u64::from(gap.start());
            span(start, start + block - 1)
        })
}

/// Free single addresses of `pool`, excluding claims and reserved addresses.
pub fn free_addresses(pool: &Pool, claimed: &[AddressRange]) -> Vec<AddressRange> {
    let mut occupied: Vec<AddressRange> = claimed.to_vec();
    occupied.extend(pool.reserved().iter().map(|addr| AddressRange::single(*addr)));
    gaps(pool.bounds(), pool.first_candidate(), &occupied)
}

/// Total addresses across `gaps`.
pub fn count_free(gaps: &[AddressRange]) -> u64 {
    gaps.iter().map(|gap| gap.len()).sum()
}

/// The `index`-th free address walking the gaps in order.
pub fn nth_free(gaps: &[AddressRange], mut index: u64) -> Option<u32> {
    for gap in gaps {
        if index < gap.len() {
            return math::checked_offset(gap.start(), index);
        }
        index -= gap.len();
    }
    None
}

/// A uniformly random free address, or `None` when the gaps are empty.
pub fn random_free<R: Rng>(rng: &mut R, gaps: &[AddressRange]) -> Option<u32> {
    let total = count_free(gaps);
    if total == 0 {
        return None;
    }
    nth_free(gaps, rng.random_range(0..total))
}

/// Up to `limit` aligned subnets of `prefix_len` inside `bounds`, starting no
/// earlier than `first`, overlapping none of `live`.
pub fn subnet_candidates(
    bounds: AddressRange,
    first: u64,
    prefix_len: u8,
    live: &[Ipv4Subnet],
    limit: usize,
) -> Vec<Ipv4Subnet> {
    let size = math::prefix_size(prefix_len);
    let occupied: Vec<AddressRange> = live.iter().map(|s| s.range()).collect();
    let mut result = Vec::new();
    for gap in gaps(bounds, first, &occupied) {
        let mut start = math::align_up(u64::from(gap.start()), size);
        while start + size - 1 <= u64::from(gap.end()) {
            if result.len() >= limit {
                return result;
            }
            if let Ok(subnet) = Ipv4Subnet::new(math::from_u32(start as u32), prefix_len) {
                result.push(subnet);
            }
            start += size;
        }
    }
    result
}
