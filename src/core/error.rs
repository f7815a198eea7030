//! Error types for allocation, reconciliation and local persistence.
//!
//! Failures fall into a small taxonomy: transient store errors and key
//! collisions are retried within bounded budgets, capacity and budget
//! exhaustion are returned to the caller, and revocation of a held subnet
//! lease is fatal for the holder. Local cache failures are logged by callers
//! and never block the store path.

use crate::addr::AddrError;
use crate::store::StoreError;
use thiserror::Error;

/// Common ipshard error conditions.
#[derive(Debug, Error)]
pub enum IpamError {
    /// Coordination store failure (timeout, unavailable, compacted, internal).
    #[error("coordination store: {0}")]
    Store(#[from] StoreError),

    /// Conditional create found the key already present.
    #[error("claim key {key} already exists")]
    Collision { key: String },

    /// No free slot of the requested size remains in the pool.
    #[error("pool {pool} has no free block of {requested} addresses")]
    CapacityExhausted { pool: String, requested: u64 },

    /// Retry budget used up while still colliding or failing.
    #[error("pool {pool}: allocation gave up after {attempts} attempts")]
    Exhausted { pool: String, attempts: u32 },

    /// A held subnet lease was removed or taken over by another owner.
    #[error("lease on {subnet} in pool {pool} was revoked")]
    Revoked { pool: String, subnet: String },

    /// Local cache read or write failed.
    #[error("local cache {path}: {message}")]
    LocalPersistence { path: String, message: String },

    /// A stored claim value could not be decoded or encoded.
    #[error("claim {key}: {message}")]
    Codec { key: String, message: String },

    /// Malformed address, range or subnet.
    #[error("address: {0}")]
    Address(#[from] AddrError),

    /// Invalid request.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
}

impl IpamError {
    /// Create a LocalPersistence error.
    pub fn local(path: impl AsRef<std::path::Path>, message: impl ToString) -> Self {
        Self::LocalPersistence {
            path: path.as_ref().display().to_string(),
            message: message.to_string(),
        }
    }

    /// Create an InvalidRequest error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Check if this error indicates the operation should be retried.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retriable(),
            Self::Collision { .. } => true,
            _ => false,
        }
    }

    /// Check if this error must stop the component that observed it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Revoked { .. })
    }
}

/// Result type using IpamError.
pub type IpamResult<T> = Result<T, IpamError>;
