//! In-memory record store.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use cropdroid_core::error::{CropDroidError, Result};
use cropdroid_core::model::{ConsistencyLevel, EntityKind};
use cropdroid_core::traits::{Mutation, PageQuery, Record, RecordPage, RecordStore};

/// Records grouped by kind, ordered by ID.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<EntityKind, BTreeMap<u64, Record>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total record count across kinds.
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(BTreeMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Check inserts against existing keys and each other before anything is written.
fn check_inserts(
    current: &HashMap<EntityKind, BTreeMap<u64, Record>>,
    batch: &[Mutation],
) -> Result<()> {
    let mut pending = std::collections::HashSet::new();
    for m in batch {
        if let Mutation::Insert(r) = m {
            let exists = current
                .get(&r.kind)
                .is_some_and(|by_id| by_id.contains_key(&r.id));
            if exists || !pending.insert((r.kind, r.id)) {
                return Err(CropDroidError::StoreConflict(format!(
                    "{} {} already exists",
                    r.kind, r.id
                )));
            }
        }
    }
    Ok(())
}

pub(crate) fn page_of<'a>(
    records: impl DoubleEndedIterator<Item = &'a Record>,
    query: &PageQuery,
) -> RecordPage {
    let matches = |r: &&Record| {
        query.farm_id.is_none_or(|f| r.farm_id == f)
            && query.parent_id.is_none_or(|p| r.parent_id == p)
    };
    let ordered: Box<dyn Iterator<Item = &Record>> = if query.descending {
        Box::new(records.rev())
    } else {
        Box::new(records)
    };
    let mut selected = ordered.filter(matches).skip(query.offset);
    let mut page = Vec::new();
    let mut has_more = false;
    for r in selected.by_ref() {
        if query.limit > 0 && page.len() == query.limit {
            has_more = true;
            break;
        }
        page.push(r.clone());
    }
    RecordPage {
        records: page,
        has_more,
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn apply(&self, batch: Vec<Mutation>, _level: ConsistencyLevel) -> Result<()> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        check_inserts(&records, &batch)?;
        for m in batch {
            match m {
                Mutation::Insert(r) | Mutation::Upsert(r) => {
                    records.entry(r.kind).or_default().insert(r.id, r);
                }
                Mutation::Delete { kind, id } => {
                    if let Some(by_id) = records.get_mut(&kind) {
                        by_id.remove(&id);
                    }
                }
            }
        }
        Ok(())
    }

    async fn get(
        &self,
        kind: EntityKind,
        id: u64,
        _level: ConsistencyLevel,
    ) -> Result<Option<Record>> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(&kind).and_then(|by_id| by_id.get(&id)).cloned())
    }

    async fn scan(
        &self,
        kind: EntityKind,
        query: &PageQuery,
        _level: ConsistencyLevel,
    ) -> Result<RecordPage> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(match records.get(&kind) {
            Some(by_id) => page_of(by_id.values(), query),
            None => RecordPage::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(kind: EntityKind, id: u64, farm_id: u64) -> Record {
        Record {
            kind,
            id,
            farm_id,
            parent_id: farm_id,
            body: json!({ "id": id }),
        }
    }

    #[tokio::test]
    async fn test_insert_conflict_rolls_back_batch() {
        let store = MemoryStore::new();
        store
            .apply(vec![Mutation::Insert(rec(EntityKind::Device, 1, 9))], ConsistencyLevel::Local)
            .await
            .unwrap();

        let err = store
            .apply(
                vec![
                    Mutation::Insert(rec(EntityKind::Device, 2, 9)),
                    Mutation::Insert(rec(EntityKind::Device, 1, 9)),
                ],
                ConsistencyLevel::Local,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CropDroidError::StoreConflict(_)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_scan_pages_and_filters() {
        let store = MemoryStore::new();
        let batch = (1..=5)
            .map(|i| Mutation::Upsert(rec(EntityKind::Channel, i, if i % 2 == 0 { 7 } else { 8 })))
            .collect();
        store.apply(batch, ConsistencyLevel::Local).await.unwrap();

        let page = store
            .scan(EntityKind::Channel, &PageQuery::farm(8).with_page(0, 2), ConsistencyLevel::Local)
            .await
            .unwrap();
        assert_eq!(page.records.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 3]);
        assert!(page.has_more);

        let page = store
            .scan(
                EntityKind::Channel,
                &PageQuery::default().with_page(0, 10).newest_first(),
                ConsistencyLevel::Local,
            )
            .await
            .unwrap();
        assert_eq!(page.records.first().map(|r| r.id), Some(5));
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let store = MemoryStore::new();
        store
            .apply(
                vec![Mutation::Delete { kind: EntityKind::Farm, id: 42 }],
                ConsistencyLevel::Local,
            )
            .await
            .unwrap();
        assert!(store.is_empty());
    }
}
