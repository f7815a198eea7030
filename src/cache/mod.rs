//! Node-local range cache.
//!
//! - [`local`] - per-pool cache files with atomic rewrite
//! - [`lock`] - advisory file lock guarding read-modify-write cycles

pub mod local;
pub mod lock;

pub use local::LocalCacheStore;
pub use lock::FileLock;
