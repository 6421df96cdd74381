//! Persistence contracts.
//!
//! Backends store opaque JSON records keyed by `(kind, id)` and scoped by
//! farm and parent. The typed DAO on top never branches on the backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{ConsistencyLevel, Entity, EntityKind};
use crate::types::DeviceSnapshot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub kind: EntityKind,
    pub id: u64,
    /// Owning farm, 0 for process-wide records.
    pub farm_id: u64,
    pub parent_id: u64,
    pub body: serde_json::Value,
}

impl Record {
    pub fn from_entity<E: Entity>(entity: &E, farm_id: u64) -> Result<Self> {
        Ok(Self {
            kind: E::KIND,
            id: entity.id(),
            farm_id,
            parent_id: entity.parent_id(),
            body: serde_json::to_value(entity.flat())?,
        })
    }

    pub fn decode<E: Entity>(&self) -> Result<E> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// One element of an atomic batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    /// Fails the batch with `StoreConflict` if the key exists.
    Insert(Record),
    Upsert(Record),
    /// Deleting a missing key is not an error.
    Delete { kind: EntityKind, id: u64 },
}

impl Mutation {
    pub fn key(&self) -> (EntityKind, u64) {
        match self {
            Mutation::Insert(r) | Mutation::Upsert(r) => (r.kind, r.id),
            Mutation::Delete { kind, id } => (*kind, *id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageQuery {
    pub farm_id: Option<u64>,
    pub parent_id: Option<u64>,
    pub offset: usize,
    /// 0 means unbounded.
    pub limit: usize,
    /// Order by descending ID instead of ascending.
    pub descending: bool,
}

impl Default for PageQuery {
    fn default() -> Self {
        Self {
            farm_id: None,
            parent_id: None,
            offset: 0,
            limit: 0,
            descending: false,
        }
    }
}

impl PageQuery {
    pub fn farm(farm_id: u64) -> Self {
        Self {
            farm_id: Some(farm_id),
            ..Self::default()
        }
    }

    pub fn with_page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }

    pub fn newest_first(mut self) -> Self {
        self.descending = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPage {
    pub records: Vec<Record>,
    pub has_more: bool,
}

/// Raw record backend.
#[async_trait]
pub trait RecordStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Apply every mutation or none.
    async fn apply(&self, batch: Vec<Mutation>, level: ConsistencyLevel) -> Result<()>;

    async fn get(&self, kind: EntityKind, id: u64, level: ConsistencyLevel)
    -> Result<Option<Record>>;

    async fn scan(
        &self,
        kind: EntityKind,
        query: &PageQuery,
        level: ConsistencyLevel,
    ) -> Result<RecordPage>;
}

/// Consensus layer the replicated store proposes through.
#[async_trait]
pub trait Replicator: Send + Sync {
    /// Commit a batch through the log. `ReplicationUnavailable` without a leader.
    async fn propose(&self, batch: &[Mutation]) -> Result<()>;

    /// Wait until the local replica has applied everything committed so far.
    async fn read_barrier(&self) -> Result<()>;
}

/// Historical telemetry sink.
#[async_trait]
pub trait DeviceDataStore: Send + Sync {
    async fn append(&self, device_id: u64, snapshot: &DeviceSnapshot) -> Result<()>;
}
