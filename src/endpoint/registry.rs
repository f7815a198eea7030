//! Endpoint records in the store.

use super::Endpoint;
use crate::error::IpamResult;
use crate::pool::claim::decode_claims;
use crate::pool::{ClaimRecord, KeyLayout};
use crate::store::{CreateOutcome, StoreClient};
use std::net::Ipv4Addr;

/// Publishes this node's endpoints and lists its peers.
pub struct EndpointRegistry {
    store: StoreClient,
    layout: KeyLayout,
    identity: String,
}

impl EndpointRegistry {
    pub fn new(store: StoreClient, layout: KeyLayout, identity: impl Into<String>) -> Self {
        Self {
            store,
            layout,
            identity: identity.into(),
        }
    }

    /// Publish `address` on `device` if no record exists for it yet.
    /// Returns whether a record was written.
    pub async fn register(&self, device: &str, address: Ipv4Addr) -> IpamResult<bool> {
        let guard = self.store.lock(&self.layout.endpoint_mutex(device)).await?;
        let outcome = self.create_record(device, address).await;
        if let Err(e) = guard.release().await {
            tracing::warn!(device = %device, error = %e, "failed to release endpoint mutex");
        }
        outcome
    }

    async fn create_record(&self, device: &str, address: Ipv4Addr) -> IpamResult<bool> {
        let key = self.layout.endpoint_key(device, address);
        let value = ClaimRecord::owned_by(&self.identity).encode(&key)?;
        match self.store.create(&key, value).await? {
            CreateOutcome::Created { .. } => {
                tracing::info!(device = %device, address = %address, "registered endpoint");
                Ok(true)
            }
            CreateOutcome::AlreadyExists => {
                tracing::debug!(device = %device, address = %address, "endpoint already registered");
                Ok(false)
            }
        }
    }

    /// Remove this node's record for `address` on `device`.
    pub async fn deregister(&self, device: &str, address: Ipv4Addr) -> IpamResult<bool> {
        let key = self.layout.endpoint_key(device, address);
        let Some(kv) = self.store.get(&key).await? else {
            return Ok(false);
        };
        let record = ClaimRecord::decode(&key, &kv.value)?;
        if record.owner != self.identity {
            tracing::warn!(device = %device, address = %address, owner = %record.owner, "not deregistering foreign endpoint");
            return Ok(false);
        }
        Ok(self.store.delete(&key).await?)
    }

    /// Endpoints of other nodes on `device`.
    pub async fn peers(&self, device: &str) -> IpamResult<Vec<Endpoint>> {
        let snapshot = self
            .store
            .range(&self.layout.endpoint_device_prefix(device))
            .await?;
        Ok(decode_claims(&self.layout, &snapshot.kvs, Endpoint::from_kv)
            .into_iter()
            .filter(|endpoint| endpoint.owner != self.identity)
            .collect())
    }
}
