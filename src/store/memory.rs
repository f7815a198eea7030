//! In-process coordination store.
//!
//! A single-node MVCC key-value index with a bounded change history, named
//! locks and change notification. It backs the daemon's `embedded` mode and
//! every test. Availability can be toggled and creates can be made to fail so
//! that retry paths are exercised without a real cluster.

use super::{
    CoordinationStore, CreateOutcome, EventType, KeyValue, LockHandle, RangeSnapshot, StoreError,
    StoreResult, WatchBatch, WatchEvent, WatchScope,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Default number of revisions kept for watch replay.
pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

struct StoreState {
    /// Revision of the last write.
    revision: u64,

    /// key → current record.
    index: BTreeMap<String, KeyValue>,

    /// revision → events written at that revision.
    history: BTreeMap<u64, Vec<WatchEvent>>,

    /// History below this revision has been discarded.
    compaction_floor: u64,

    history_limit: usize,

    /// lock name → holder token.
    locks: HashMap<String, u64>,

    next_lock_token: u64,

    /// Remaining creates to fail with `Unavailable`.
    create_failures: u32,
}

impl StoreState {
    fn new(history_limit: usize) -> Self {
        Self {
            revision: 0,
            index: BTreeMap::new(),
            history: BTreeMap::new(),
            compaction_floor: 0,
            history_limit: history_limit.max(1),
            locks: HashMap::new(),
            next_lock_token: 0,
            create_failures: 0,
        }
    }

    fn put(&mut self, key: &str, value: Vec<u8>) -> u64 {
        self.revision += 1;
        let revision = self.revision;
        let create_revision = self
            .index
            .get(key)
            .map(|kv| kv.create_revision)
            .unwrap_or(revision);
        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision,
            mod_revision: revision,
        };
        self.record(WatchEvent {
            event_type: EventType::Put,
            kv: kv.clone(),
            revision,
        });
        self.index.insert(key.to_string(), kv);
        revision
    }

    fn delete(&mut self, key: &str) -> bool {
        let Some(prev) = self.index.remove(key) else {
            return false;
        };
        self.revision += 1;
        let revision = self.revision;
        self.record(WatchEvent {
            event_type: EventType::Delete,
            kv: prev,
            revision,
        });
        true
    }

    fn record(&mut self, event: WatchEvent) {
        self.history.entry(event.revision).or_default().push(event);
        while self.history.len() > self.history_limit {
            if let Some((oldest, _)) = self.history.pop_first() {
                self.compaction_floor = oldest + 1;
            }
        }
    }

    fn compact(&mut self, revision: u64) -> usize {
        let revision = revision.min(self.revision);
        if revision <= self.compaction_floor {
            return 0;
        }
        let mut removed = 0;
        let keep = self.history.split_off(&revision);
        for events in std::mem::replace(&mut self.history, keep).into_values() {
            removed += events.len();
        }
        self.compaction_floor = revision;
        removed
    }
}

/// In-memory [`CoordinationStore`].
pub struct MemoryStore {
    state: Mutex<StoreState>,
    changed: Notify,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Keep at most `limit` revisions of change history.
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            state: Mutex::new(StoreState::new(limit)),
            changed: Notify::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate losing or regaining the store. Pending watches and lock
    /// waiters observe the change immediately.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
        self.changed.notify_waiters();
    }

    /// Fail the next `count` creates as unavailable.
    pub fn fail_next_creates(&self, count: u32) {
        self.state.lock().create_failures = count;
    }

    /// Discard history below `revision`. Returns the number of events dropped.
    pub fn compact(&self, revision: u64) -> usize {
        let removed = self.state.lock().compact(revision);
        tracing::debug!(revision, removed, "compacted store history");
        removed
    }

    pub fn current_revision(&self) -> u64 {
        self.state.lock().revision
    }

    pub fn compaction_floor(&self) -> u64 {
        self.state.lock().compaction_floor
    }

    pub fn key_count(&self) -> usize {
        self.state.lock().index.len()
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.state.lock().locks.contains_key(name)
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::unavailable("memory store marked unavailable"))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn range(&self, prefix: &str) -> StoreResult<RangeSnapshot> {
        self.check_available()?;
        let state = self.state.lock();
        let kvs = state
            .index
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();
        Ok(RangeSnapshot {
            kvs,
            revision: state.revision,
        })
    }

    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        self.check_available()?;
        Ok(self.state.lock().index.get(key).cloned())
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> StoreResult<CreateOutcome> {
        self.check_available()?;
        let outcome = {
            let mut state = self.state.lock();
            if state.create_failures > 0 {
                state.create_failures -= 1;
                return Err(StoreError::unavailable("injected create failure"));
            }
            if state.index.contains_key(key) {
                CreateOutcome::AlreadyExists
            } else {
                CreateOutcome::Created {
                    revision: state.put(key, value),
                }
            }
        };
        if outcome.is_created() {
            self.changed.notify_waiters();
        }
        Ok(outcome)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<u64> {
        self.check_available()?;
        let revision = self.state.lock().put(key, value);
        self.changed.notify_waiters();
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.check_available()?;
        let existed = self.state.lock().delete(key);
        if existed {
            self.changed.notify_waiters();
        }
        Ok(existed)
    }

    async fn compare_and_delete(&self, key: &str, mod_revision: u64) -> StoreResult<bool> {
        self.check_available()?;
        let deleted = {
            let mut state = self.state.lock();
            match state.index.get(key) {
                Some(kv) if kv.mod_revision == mod_revision => state.delete(key),
                _ => false,
            }
        };
        if deleted {
            self.changed.notify_waiters();
        }
        Ok(deleted)
    }

    async fn lock(&self, name: &str) -> StoreResult<LockHandle> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.check_available()?;
            {
                let mut state = self.state.lock();
                if !state.locks.contains_key(name) {
                    state.next_lock_token += 1;
                    let token = state.next_lock_token;
                    state.locks.insert(name.to_string(), token);
                    return Ok(LockHandle {
                        name: name.to_string(),
                        token,
                    });
                }
            }
            notified.await;
        }
    }

    async fn unlock(&self, handle: LockHandle) -> StoreResult<()> {
        // Session teardown: succeeds even while unavailable.
        {
            let mut state = self.state.lock();
            match state.locks.get(&handle.name) {
                Some(token) if *token == handle.token => {
                    state.locks.remove(&handle.name);
                }
                _ => {
                    return Err(StoreError::Internal {
                        message: format!("lock {} is not held by this session", handle.name),
                    });
                }
            }
        }
        self.changed.notify_waiters();
        Ok(())
    }

    async fn watch(&self, scope: &WatchScope, after_revision: u64) -> StoreResult<WatchBatch> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.check_available()?;
            {
                let state = self.state.lock();
                if after_revision.saturating_add(1) < state.compaction_floor {
                    return Err(StoreError::Compacted {
                        revision: after_revision,
                        compaction_floor: state.compaction_floor,
                    });
                }
                let events: Vec<WatchEvent> = state
                    .history
                    .range(after_revision.saturating_add(1)..)
                    .flat_map(|(_, events)| events.iter())
                    .filter(|e| scope.matches(&e.kv.key))
                    .cloned()
                    .collect();
                if !events.is_empty() {
                    return Ok(WatchBatch {
                        events,
                        revision: state.revision,
                    });
                }
            }
            notified.await;
        }
    }
}
