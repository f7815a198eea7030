//! Coordination store contract.
//!
//! The allocators only need a small, etcd-shaped surface: sorted prefix reads
//! with a revision, conditional create, unconditional put and delete, named
//! session locks, and revision-based watches that report when history has
//! been compacted away.
//!
//! - [`client`] - timeout wrapper and lock guards
//! - [`memory`] - in-process MVCC implementation
//! - [`watch`] - cursor resumption and per-scope watcher tasks

pub mod client;
pub mod memory;
pub mod watch;

pub use client::{LockGuard, StoreClient};
pub use memory::MemoryStore;
pub use watch::{watch_from, PrefixWatcher, WatchCursor, WatchResult, WatchUpdate};

use async_trait::async_trait;
use thiserror::Error;

/// A key and its current value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision when this key was created.
    pub create_revision: u64,
    /// Revision of the last modification.
    pub mod_revision: u64,
}

/// Result of a prefix read.
#[derive(Debug, Clone, Default)]
pub struct RangeSnapshot {
    /// Matching keys, ascending.
    pub kvs: Vec<KeyValue>,
    /// Store revision the read observed.
    pub revision: u64,
}

/// Outcome of a conditional create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The key was absent and now holds the value.
    Created { revision: u64 },
    /// The key was already present; nothing changed.
    AlreadyExists,
}

impl CreateOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created { .. })
    }
}

/// What a watch observes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchScope {
    /// Exactly one key.
    Key(String),
    /// Every key starting with the prefix.
    Prefix(String),
}

impl WatchScope {
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Key(k) => key == k,
            Self::Prefix(p) => key.starts_with(p.as_str()),
        }
    }

    /// Prefix to read when building a snapshot of this scope.
    pub fn read_prefix(&self) -> &str {
        match self {
            Self::Key(k) => k,
            Self::Prefix(p) => p,
        }
    }
}

/// Event type for watch notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Key was created or updated.
    Put,
    /// Key was deleted.
    Delete,
}

/// A change observed by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub event_type: EventType,
    /// New state for Put; last state before removal for Delete.
    pub kv: KeyValue,
    /// Revision at which the change happened.
    pub revision: u64,
}

/// Events returned by one watch call.
#[derive(Debug, Clone, Default)]
pub struct WatchBatch {
    pub events: Vec<WatchEvent>,
    /// Highest revision covered by this batch.
    pub revision: u64,
}

/// Handle to a held named lock.
#[derive(Debug, PartialEq, Eq)]
pub struct LockHandle {
    pub name: String,
    pub token: u64,
}

/// Store failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store cannot be reached.
    #[error("store unavailable: {message}")]
    Unavailable { message: String },

    /// A request did not complete within its deadline.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Requested revision is below the retained history.
    #[error("revision {revision} has been compacted; compaction floor is {compaction_floor}")]
    Compacted { revision: u64, compaction_floor: u64 },

    /// Anything else.
    #[error("internal store error: {message}")]
    Internal { message: String },
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Timeouts and unavailability are transient.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }
}

/// Result type using StoreError.
pub type StoreResult<T> = Result<T, StoreError>;

/// The coordination store the engine runs against.
///
/// `create` is the sole atomicity primitive for claims; `lock` serializes
/// writers that need read-then-write consistency over a whole pool.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// All keys starting with `prefix`, ascending by key.
    async fn range(&self, prefix: &str) -> StoreResult<RangeSnapshot>;

    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>>;

    /// Write `value` only if `key` is absent.
    async fn create(&self, key: &str, value: Vec<u8>) -> StoreResult<CreateOutcome>;

    /// Unconditional write. Returns the new revision.
    async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<u64>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Delete `key` only if it was last written at `mod_revision`. Returns
    /// whether it was deleted.
    async fn compare_and_delete(&self, key: &str, mod_revision: u64) -> StoreResult<bool>;

    /// Block until the named lock is held by the caller.
    async fn lock(&self, name: &str) -> StoreResult<LockHandle>;

    async fn unlock(&self, handle: LockHandle) -> StoreResult<()>;

    /// Events in `scope` after `after_revision`, waiting until at least one
    /// exists. Fails with [`StoreError::Compacted`] when that history is gone.
    async fn watch(&self, scope: &WatchScope, after_revision: u64) -> StoreResult<WatchBatch>;
}
