//! Peer change delivery.
//!
//! The watcher keeps a view of every peer endpoint keyed by store key and
//! turns watch updates into [`PeerChange`]s for an [`EndpointSink`]. A sink
//! may refuse changes for a device that does not exist yet; such devices are
//! remembered, and once a later change for them goes through the watcher
//! replays every known peer of that device.

use super::Endpoint;
use crate::core::runtime::shutdown_requested;
use crate::pool::KeyLayout;
use crate::store::{EventType, KeyValue, WatchUpdate};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerChange {
    Added(Endpoint),
    Removed(Endpoint),
}

impl PeerChange {
    pub fn endpoint(&self) -> &Endpoint {
        match self {
            Self::Added(endpoint) | Self::Removed(endpoint) => endpoint,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("device {device} is not ready")]
    DeviceNotReady { device: String },

    #[error("{message}")]
    Failed { message: String },
}

/// Applies peer changes to the local data plane.
#[async_trait]
pub trait EndpointSink: Send + Sync {
    async fn apply(&self, change: &PeerChange) -> Result<(), SinkError>;
}

/// Sink that only logs, used when no data plane is attached.
#[derive(Debug, Default)]
pub struct LoggingSink;

#[async_trait]
impl EndpointSink for LoggingSink {
    async fn apply(&self, change: &PeerChange) -> Result<(), SinkError> {
        let endpoint = change.endpoint();
        match change {
            PeerChange::Added(_) => {
                tracing::info!(device = %endpoint.device, peer = %endpoint.address, owner = %endpoint.owner, "peer added")
            }
            PeerChange::Removed(_) => {
                tracing::info!(device = %endpoint.device, peer = %endpoint.address, owner = %endpoint.owner, "peer removed")
            }
        }
        Ok(())
    }
}

pub struct EndpointWatcher {
    layout: KeyLayout,
    identity: String,
    sink: Arc<dyn EndpointSink>,
    pending: HashSet<String>,
    view: BTreeMap<String, Endpoint>,
}

impl EndpointWatcher {
    pub fn new(layout: KeyLayout, identity: impl Into<String>, sink: Arc<dyn EndpointSink>) -> Self {
        Self {
            layout,
            identity: identity.into(),
            sink,
            pending: HashSet::new(),
            view: BTreeMap::new(),
        }
    }

    /// Known peers on `device`.
    pub fn peers(&self, device: &str) -> Vec<Endpoint> {
        self.view
            .values()
            .filter(|endpoint| endpoint.device == device)
            .cloned()
            .collect()
    }

    pub fn is_pending(&self, device: &str) -> bool {
        self.pending.contains(device)
    }

    /// Apply one watch update.
    pub async fn handle(&mut self, update: WatchUpdate) {
        match update {
            WatchUpdate::Snapshot { kvs, .. } => self.reset(kvs).await,
            WatchUpdate::Events { events, .. } => {
                for event in events {
                    match event.event_type {
                        EventType::Put => {
                            let Some(endpoint) = self.peer(&event.kv) else {
                                continue;
                            };
                            if self.view.get(&event.kv.key) == Some(&endpoint) {
                                continue;
                            }
                            self.view.insert(event.kv.key.clone(), endpoint.clone());
                            self.deliver(PeerChange::Added(endpoint)).await;
                        }
                        EventType::Delete => {
                            if let Some(endpoint) = self.view.remove(&event.kv.key) {
                                self.deliver(PeerChange::Removed(endpoint)).await;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Replace the view, emitting the difference.
    async fn reset(&mut self, kvs: Vec<KeyValue>) {
        let fresh: BTreeMap<String, Endpoint> = kvs
            .iter()
            .filter_map(|kv| self.peer(kv).map(|endpoint| (kv.key.clone(), endpoint)))
            .collect();
        let removed: Vec<Endpoint> = self
            .view
            .iter()
            .filter(|(key, _)| !fresh.contains_key(*key))
            .map(|(_, endpoint)| endpoint.clone())
            .collect();
        let added: Vec<Endpoint> = fresh
            .iter()
            .filter(|(key, endpoint)| self.view.get(*key) != Some(*endpoint))
            .map(|(_, endpoint)| endpoint.clone())
            .collect();
        tracing::debug!(peers = fresh.len(), added = added.len(), removed = removed.len(), "endpoint snapshot");
        self.view = fresh;
        for endpoint in removed {
            self.deliver(PeerChange::Removed(endpoint)).await;
        }
        for endpoint in added {
            self.deliver(PeerChange::Added(endpoint)).await;
        }
    }

    /// Decode a peer record, skipping our own and malformed ones.
    fn peer(&self, kv: &KeyValue) -> Option<Endpoint> {
        match Endpoint::from_kv(&self.layout, kv) {
            Ok(endpoint) if endpoint.owner == self.identity => None,
            Ok(endpoint) => Some(endpoint),
            Err(e) => {
                tracing::warn!(key = %kv.key, error = %e, "skipping malformed endpoint record");
                None
            }
        }
    }

    async fn deliver(&mut self, change: PeerChange) {
        let device = change.endpoint().device.clone();
        match self.sink.apply(&change).await {
            Ok(()) => {
                if self.pending.remove(&device) {
                    tracing::info!(device = %device, "device ready; replaying peers");
                    self.replay(&device).await;
                }
            }
            Err(SinkError::DeviceNotReady { device }) => {
                tracing::debug!(device = %device, "device not ready; deferring peers");
                self.pending.insert(device);
            }
            Err(e) => {
                tracing::warn!(device = %device, error = %e, "failed to apply peer change");
            }
        }
    }

    /// Re-send every known peer of a device that was pending.
    pub async fn device_ready(&mut self, device: &str) {
        if self.pending.remove(device) {
            self.replay(device).await;
        }
    }

    async fn replay(&mut self, device: &str) {
        for endpoint in self.peers(device) {
            match self.sink.apply(&PeerChange::Added(endpoint)).await {
                Ok(()) => {}
                Err(SinkError::DeviceNotReady { device }) => {
                    self.pending.insert(device);
                    return;
                }
                Err(e) => {
                    tracing::warn!(device = %device, error = %e, "failed to replay peer");
                }
            }
        }
    }

    /// Consume updates until shutdown or the channel closes.
    pub async fn run(mut self, mut updates: mpsc::Receiver<WatchUpdate>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let update = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                update = updates.recv() => update,
            };
            match update {
                Some(update) => self.handle(update).await,
                None => break,
            }
        }
        tracing::debug!("endpoint watcher stopped");
    }
}
