//! Consistency-level aware wrapper over a local record store.
//!
//! | level   | write                              | read                                   |
//! |---------|------------------------------------|----------------------------------------|
//! | local   | local store only                   | local store                            |
//! | cached  | local store only                   | local store, barrier refreshed async   |
//! | quorum  | propose, fail fast, then apply     | barrier first, degrade to local        |

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use cropdroid_core::error::{CropDroidError, Result};
use cropdroid_core::model::{ConsistencyLevel, EntityKind};
use cropdroid_core::traits::{Mutation, PageQuery, Record, RecordPage, RecordStore, Replicator};

pub struct ReplicatedStore {
    local: Arc<dyn RecordStore>,
    replicator: Arc<dyn Replicator>,
}

impl ReplicatedStore {
    pub fn new(local: Arc<dyn RecordStore>, replicator: Arc<dyn Replicator>) -> Self {
        Self { local, replicator }
    }

    /// Run the read barrier the level asks for.
    async fn prepare_read(&self, level: ConsistencyLevel) -> Result<()> {
        match level {
            ConsistencyLevel::Local => Ok(()),
            ConsistencyLevel::Cached => {
                let replicator = self.replicator.clone();
                tokio::spawn(async move {
                    if let Err(e) = replicator.read_barrier().await {
                        tracing::debug!("Cached read refresh failed: {e}");
                    }
                });
                Ok(())
            }
            ConsistencyLevel::Quorum => match self.replicator.read_barrier().await {
                Ok(()) => Ok(()),
                Err(CropDroidError::ReplicationUnavailable(reason)) => {
                    tracing::warn!("⚠️ Quorum read degraded to local: {reason}");
                    Ok(())
                }
                Err(e) => Err(e),
            },
        }
    }
}

#[async_trait]
impl RecordStore for ReplicatedStore {
    fn backend(&self) -> &'static str {
        "replicated"
    }

    async fn apply(&self, batch: Vec<Mutation>, level: ConsistencyLevel) -> Result<()> {
        if level == ConsistencyLevel::Quorum {
            self.replicator.propose(&batch).await?;
        }
        self.local.apply(batch, ConsistencyLevel::Local).await
    }

    async fn get(
        &self,
        kind: EntityKind,
        id: u64,
        level: ConsistencyLevel,
    ) -> Result<Option<Record>> {
        self.prepare_read(level).await?;
        self.local.get(kind, id, ConsistencyLevel::Local).await
    }

    async fn scan(
        &self,
        kind: EntityKind,
        query: &PageQuery,
        level: ConsistencyLevel,
    ) -> Result<RecordPage> {
        self.prepare_read(level).await?;
        self.local.scan(kind, query, ConsistencyLevel::Local).await
    }
}

/// Single-node replicator: this node is always the leader and every
/// proposal commits immediately. Leadership can be withdrawn to exercise
/// the degraded paths.
#[derive(Debug)]
pub struct LocalReplicator {
    leader: AtomicBool,
    commit_index: AtomicU64,
}

impl LocalReplicator {
    pub fn new() -> Self {
        Self {
            leader: AtomicBool::new(true),
            commit_index: AtomicU64::new(0),
        }
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index.load(Ordering::SeqCst)
    }

    fn require_leader(&self) -> Result<()> {
        if self.leader.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CropDroidError::ReplicationUnavailable("no leader".into()))
        }
    }
}

impl Default for LocalReplicator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Replicator for LocalReplicator {
    async fn propose(&self, batch: &[Mutation]) -> Result<()> {
        self.require_leader()?;
        if !batch.is_empty() {
            self.commit_index.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn read_barrier(&self) -> Result<()> {
        self.require_leader()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use serde_json::json;

    fn setup() -> (ReplicatedStore, Arc<LocalReplicator>, Arc<MemoryStore>) {
        let local = Arc::new(MemoryStore::new());
        let replicator = Arc::new(LocalReplicator::new());
        let store = ReplicatedStore::new(local.clone(), replicator.clone());
        (store, replicator, local)
    }

    fn farm_record(id: u64) -> Record {
        Record {
            kind: EntityKind::Farm,
            id,
            farm_id: id,
            parent_id: 1,
            body: json!({ "id": id }),
        }
    }

    #[tokio::test]
    async fn test_quorum_write_fails_fast_without_leader() {
        let (store, replicator, local) = setup();
        replicator.set_leader(false);
        let err = store
            .apply(vec![Mutation::Upsert(farm_record(1))], ConsistencyLevel::Quorum)
            .await
            .unwrap_err();
        assert!(matches!(err, CropDroidError::ReplicationUnavailable(_)));
        assert!(local.is_empty());
    }

    #[tokio::test]
    async fn test_quorum_write_commits() {
        let (store, replicator, _local) = setup();
        store
            .apply(vec![Mutation::Upsert(farm_record(1))], ConsistencyLevel::Quorum)
            .await
            .unwrap();
        assert_eq!(replicator.commit_index(), 1);
    }

    #[tokio::test]
    async fn test_quorum_read_degrades_to_local() {
        let (store, replicator, _local) = setup();
        store
            .apply(vec![Mutation::Upsert(farm_record(2))], ConsistencyLevel::Local)
            .await
            .unwrap();
        replicator.set_leader(false);
        let got = store.get(EntityKind::Farm, 2, ConsistencyLevel::Quorum).await.unwrap();
        assert!(got.is_some());
        let page = store
            .scan(EntityKind::Farm, &PageQuery::default(), ConsistencyLevel::Cached)
            .await
            .unwrap();
        assert_eq!(page.records.len(), 1);
    }
}
