//! ipshard - distributed IPv4 range allocation.
//!
//! ipshard hands out non-overlapping pieces of an IPv4 address space (whole
//! subnets, fixed-size address blocks, or single stable addresses) to competing
//! nodes and workloads. A shared coordination store is the single source of
//! truth; each node keeps a persisted local cache of the ranges it believes it
//! owns and reconciles that cache against the store at startup and on a timer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    CLI / Runtime orchestration                  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌───────────────────────┬─────────────────────┬───────────────────┐
//! │   Allocator table     │     Reconciler      │  Endpoint watcher │
//! │ range │ subnet │ fixed│  (cache <-> store)  │  (peer discovery) │
//! └───────────────────────┴─────────────────────┴───────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │     Coordination store contract │ watch/cursor resumption       │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │   Address math │ pool model │ claim keys │ local range cache    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - Task lifecycle and shutdown
//! - [`core::time`] - Clock abstraction for lease expiry
//! - [`core::error`] - Error taxonomy
//!
//! ## Address space
//! - [`addr`] - IPv4 integer conversions, ranges and subnets
//! - [`pool`] - Pools, claims, key layout and candidate search
//!
//! ## Coordination
//! - [`store`] - Store contract, timeouts, in-memory store, watches
//! - [`alloc`] - Range, subnet and fixed-address allocators
//! - [`cache`] - Node-local range cache
//! - [`reconcile`] - Cache/store reconciliation and owner sweep
//! - [`endpoint`] - Tunnel endpoint registry and peer watcher
//!
//! ## CLI
//! - [`cli::commands`] - CLI command implementations
//!
//! # Key Invariants
//!
//! - No two live claims within one pool overlap.
//! - A claim's key derives from its start address and size alone, so a
//!   conditional create is the only atomicity primitive needed.
//! - The local cache converges to the store's claims owned by this node.

// Core infrastructure
pub mod core;

// Address space model
pub mod addr;
pub mod pool;

// Coordination store and allocation
pub mod alloc;
pub mod store;

// Node-local state
pub mod cache;
pub mod reconcile;

// Peer discovery
pub mod endpoint;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, runtime, time};
pub use addr::{AddressRange, Ipv4Subnet};
pub use alloc::{AllocationRequest, AllocatorTable, PoolAllocator};
pub use error::{IpamError, IpamResult};
pub use pool::{Pool, PoolKind};
