//! Watch resumption.
//!
//! A watch either starts from nothing (full snapshot) or resumes from a
//! [`WatchCursor`]. When the store has compacted the history behind a cursor,
//! the watch transparently falls back to a fresh snapshot so consumers can
//! reset their view instead of silently missing changes.

use super::{KeyValue, StoreClient, StoreError, StoreResult, WatchEvent, WatchScope};
use crate::core::runtime::shutdown_requested;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Position in the store's change history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WatchCursor(u64);

impl WatchCursor {
    pub fn new(revision: u64) -> Self {
        Self(revision)
    }

    /// Last revision this cursor has observed.
    pub fn revision(&self) -> u64 {
        self.0
    }
}

/// Result of one [`watch_from`] call.
#[derive(Debug, Clone)]
pub struct WatchResult {
    /// Present when the caller must replace its whole view.
    pub snapshot: Option<Vec<KeyValue>>,
    pub events: Vec<WatchEvent>,
    /// Cursor to resume from next time.
    pub cursor: WatchCursor,
}

impl WatchResult {
    pub fn is_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }
}

/// Snapshot or resume a watch on `scope`.
///
/// With no cursor, reads the current contents of the scope and returns them
/// with a cursor at the read revision. With a cursor, waits for events after
/// it; if that history has been compacted, logs and returns a snapshot.
pub async fn watch_from(
    store: &StoreClient,
    scope: &WatchScope,
    cursor: Option<WatchCursor>,
) -> StoreResult<WatchResult> {
    let Some(cursor) = cursor else {
        return snapshot(store, scope).await;
    };
    match store.watch(scope, cursor.revision()).await {
        Ok(batch) => Ok(WatchResult {
            snapshot: None,
            events: batch.events,
            cursor: WatchCursor(batch.revision.max(cursor.revision())),
        }),
        Err(StoreError::Compacted {
            revision,
            compaction_floor,
        }) => {
            tracing::warn!(
                scope = ?scope,
                revision,
                compaction_floor,
                "watch cursor compacted; resetting to snapshot"
            );
            snapshot(store, scope).await
        }
        Err(e) => Err(e),
    }
}

async fn snapshot(store: &StoreClient, scope: &WatchScope) -> StoreResult<WatchResult> {
    let read = store.range(scope.read_prefix()).await?;
    let kvs = read
        .kvs
        .into_iter()
        .filter(|kv| scope.matches(&kv.key))
        .collect();
    Ok(WatchResult {
        snapshot: Some(kvs),
        events: Vec::new(),
        cursor: WatchCursor(read.revision),
    })
}

/// Update delivered by a [`PrefixWatcher`].
#[derive(Debug, Clone)]
pub enum WatchUpdate {
    /// Replace the whole view with these entries.
    Snapshot {
        kvs: Vec<KeyValue>,
        cursor: WatchCursor,
    },
    /// Apply these changes in order.
    Events {
        events: Vec<WatchEvent>,
        cursor: WatchCursor,
    },
}

impl From<WatchResult> for WatchUpdate {
    fn from(result: WatchResult) -> Self {
        match result.snapshot {
            Some(kvs) => Self::Snapshot {
                kvs,
                cursor: result.cursor,
            },
            None => Self::Events {
                events: result.events,
                cursor: result.cursor,
            },
        }
    }
}

/// One task per watched scope, feeding a bounded channel.
pub struct PrefixWatcher;

impl PrefixWatcher {
    /// Spawn the watch task.
    ///
    /// The task stops when shutdown is signalled or the receiver is dropped.
    /// Store errors are retried after `retry_delay` from the same cursor.
    pub fn spawn(
        store: StoreClient,
        scope: WatchScope,
        capacity: usize,
        retry_delay: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> (mpsc::Receiver<WatchUpdate>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(async move {
            let mut cursor: Option<WatchCursor> = None;
            loop {
                let result = tokio::select! {
                    _ = shutdown_requested(&mut shutdown) => break,
                    result = watch_from(&store, &scope, cursor) => result,
                };
                match result {
                    Ok(result) => {
                        cursor = Some(result.cursor);
                        let update = WatchUpdate::from(result);
                        let sent = tokio::select! {
                            _ = shutdown_requested(&mut shutdown) => break,
                            sent = tx.send(update) => sent,
                        };
                        if sent.is_err() {
                            tracing::debug!(scope = ?scope, "watch receiver dropped");
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(scope = ?scope, error = %e, "watch failed; retrying");
                        tokio::select! {
                            _ = shutdown_requested(&mut shutdown) => break,
                            _ = tokio::time::sleep(retry_delay) => {}
                        }
                    }
                }
            }
            tracing::debug!(scope = ?scope, "watch task stopped");
        });
        (rx, handle)
    }
}
