//! Removal of a departed node's records.

use crate::error::IpamResult;
use crate::pool::{ClaimRecord, KeyLayout};
use crate::store::StoreClient;

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub deleted: usize,
}

/// Deletes every record under the key root owned by a given identity.
pub struct OwnerSweeper {
    store: StoreClient,
    layout: KeyLayout,
}

impl OwnerSweeper {
    pub fn new(store: StoreClient, layout: KeyLayout) -> Self {
        Self { store, layout }
    }

    /// Remove range, subnet and fixed claims plus endpoint records held by
    /// `identity`. Entries that do not decode are left alone.
    pub async fn sweep(&self, identity: &str) -> IpamResult<SweepReport> {
        let snapshot = self.store.range(&self.layout.root_prefix()).await?;
        let mut report = SweepReport {
            examined: snapshot.kvs.len(),
            deleted: 0,
        };
        for kv in &snapshot.kvs {
            let Ok(record) = ClaimRecord::decode(&kv.key, &kv.value) else {
                continue;
            };
            if record.owner == identity && self.store.delete(&kv.key).await? {
                tracing::debug!(key = %kv.key, owner = %identity, "swept record");
                report.deleted += 1;
            }
        }
        tracing::info!(
            owner = %identity,
            examined = report.examined,
            deleted = report.deleted,
            "swept departed node"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CoordinationStore, MemoryStore};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn only_matching_owner_is_removed() {
        let memory = Arc::new(MemoryStore::new());
        let layout = KeyLayout::default();
        let gone = ClaimRecord::owned_by("gone").encode("k").unwrap();
        let stay = ClaimRecord::owned_by("stay").encode("k").unwrap();
        memory.put(&layout.range_key("a", 0, 4), gone.clone()).await.unwrap();
        memory.put(&layout.range_key("a", 16, 4), stay).await.unwrap();
        memory
            .put(&layout.endpoint_key("vx0", "10.0.0.1".parse().unwrap()), gone)
            .await
            .unwrap();
        memory.put("ipshard/junk", b"not json".to_vec()).await.unwrap();

        let sweeper = OwnerSweeper::new(
            StoreClient::new(memory.clone(), Duration::from_secs(5)),
            layout,
        );
        let report = sweeper.sweep("gone").await.unwrap();
        assert_eq!(report, SweepReport { examined: 4, deleted: 2 });
        assert_eq!(memory.key_count(), 2);
    }
}
