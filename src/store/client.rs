//! Deadline-bounded access to the coordination store.
//!
//! Every request except lock acquisition and watch receipt runs under the
//! configured request timeout. Locks are handed out as [`LockGuard`]s that
//! release on drop when the holder is cancelled mid-operation.

use super::{
    CoordinationStore, CreateOutcome, KeyValue, LockHandle, RangeSnapshot, StoreError,
    StoreResult, WatchBatch, WatchScope,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Cloneable store handle applying request deadlines.
#[derive(Clone)]
pub struct StoreClient {
    inner: Arc<dyn CoordinationStore>,
    request_timeout: Duration,
}

impl StoreClient {
    pub fn new(inner: Arc<dyn CoordinationStore>, request_timeout: Duration) -> Self {
        Self {
            inner,
            request_timeout,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                operation: operation.to_string(),
                timeout_ms: self.request_timeout.as_millis() as u64,
            }),
        }
    }

    pub async fn range(&self, prefix: &str) -> StoreResult<RangeSnapshot> {
        self.bounded("range", self.inner.range(prefix)).await
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        self.bounded("get", self.inner.get(key)).await
    }

    pub async fn create(&self, key: &str, value: Vec<u8>) -> StoreResult<CreateOutcome> {
        self.bounded("create", self.inner.create(key, value)).await
    }

    pub async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<u64> {
        self.bounded("put", self.inner.put(key, value)).await
    }

    pub async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.bounded("delete", self.inner.delete(key)).await
    }

    pub async fn compare_and_delete(&self, key: &str, mod_revision: u64) -> StoreResult<bool> {
        self.bounded(
            "compare_and_delete",
            self.inner.compare_and_delete(key, mod_revision),
        )
        .await
    }

    /// Wait for a watch batch. Not deadline-bounded.
    pub async fn watch(&self, scope: &WatchScope, after_revision: u64) -> StoreResult<WatchBatch> {
        self.inner.watch(scope, after_revision).await
    }

    /// Acquire a named lock, waiting as long as it takes.
    pub async fn lock(&self, name: &str) -> StoreResult<LockGuard> {
        let handle = self.inner.lock(name).await?;
        tracing::trace!(lock = %name, "acquired store lock");
        Ok(LockGuard {
            store: Arc::clone(&self.inner),
            handle: Some(handle),
            request_timeout: self.request_timeout,
        })
    }
}

/// A held store lock.
///
/// Call [`LockGuard::release`] on the normal path. If the guard is dropped
/// instead (error or cancellation), the unlock is spawned on the current
/// runtime.
pub struct LockGuard {
    store: Arc<dyn CoordinationStore>,
    handle: Option<LockHandle>,
    request_timeout: Duration,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        self.handle.as_ref().map(|h| h.name.as_str()).unwrap_or("")
    }

    /// Release the lock now.
    pub async fn release(mut self) -> StoreResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let name = handle.name.clone();
        match tokio::time::timeout(self.request_timeout, self.store.unlock(handle)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                operation: format!("unlock {}", name),
                timeout_ms: self.request_timeout.as_millis() as u64,
            }),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let store = Arc::clone(&self.store);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let name = handle.name.clone();
                    if let Err(e) = store.unlock(handle).await {
                        tracing::warn!(lock = %name, error = %e, "failed to release dropped lock");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(lock = %handle.name, "lock dropped outside a runtime; not released");
            }
        }
    }
}
