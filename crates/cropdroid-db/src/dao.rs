//! Typed DAO over any [`RecordStore`].

use std::sync::Arc;

use cropdroid_core::error::{CropDroidError, Result};
use cropdroid_core::farm_config::FarmConfig;
use cropdroid_core::model::{
    Channel, Condition, ConsistencyLevel, Device, DeviceSetting, Entity, EntityKind, Farm, Metric,
    Permission, Schedule, Workflow, WorkflowStep,
};
use cropdroid_core::traits::{Mutation, PageQuery, Record, RecordStore};

/// Record kinds owned by a farm, children first.
const FARM_GRAPH_KINDS: [EntityKind; 11] = [
    EntityKind::EventLog,
    EntityKind::Permission,
    EntityKind::WorkflowStep,
    EntityKind::Schedule,
    EntityKind::Condition,
    EntityKind::Workflow,
    EntityKind::Channel,
    EntityKind::Metric,
    EntityKind::DeviceSetting,
    EntityKind::Device,
    EntityKind::Farm,
];

#[derive(Debug, Clone, PartialEq)]
pub struct Page<E> {
    pub entities: Vec<E>,
    pub has_more: bool,
}

#[derive(Clone)]
pub struct Dao {
    store: Arc<dyn RecordStore>,
    default_level: ConsistencyLevel,
}

impl Dao {
    pub fn new(store: Arc<dyn RecordStore>, default_level: ConsistencyLevel) -> Self {
        Self {
            store,
            default_level,
        }
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    pub fn default_level(&self) -> ConsistencyLevel {
        self.default_level
    }

    /// Writes use at least the process default and the farm's own level.
    pub fn write_level(&self, farm_level: ConsistencyLevel) -> ConsistencyLevel {
        farm_level.max(self.default_level)
    }

    pub async fn apply(&self, batch: Vec<Mutation>, level: ConsistencyLevel) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.store.apply(batch, level).await
    }

    /// Create; `StoreConflict` if the ID is taken.
    pub async fn insert<E: Entity>(&self, farm_id: u64, entity: &E, level: ConsistencyLevel) -> Result<()> {
        let record = Record::from_entity(entity, farm_id)?;
        self.store.apply(vec![Mutation::Insert(record)], level).await
    }

    pub async fn put<E: Entity>(&self, farm_id: u64, entity: &E, level: ConsistencyLevel) -> Result<()> {
        let record = Record::from_entity(entity, farm_id)?;
        self.store.apply(vec![Mutation::Upsert(record)], level).await
    }

    pub async fn delete<E: Entity>(&self, id: u64, level: ConsistencyLevel) -> Result<()> {
        self.store
            .apply(vec![Mutation::Delete { kind: E::KIND, id }], level)
            .await
    }

    pub async fn find<E: Entity>(&self, id: u64, level: ConsistencyLevel) -> Result<Option<E>> {
        match self.store.get(E::KIND, id, level).await? {
            Some(record) => Ok(Some(record.decode()?)),
            None => Ok(None),
        }
    }

    /// Like [`Dao::find`] but a miss is `StoreNotFound`.
    pub async fn get<E: Entity>(&self, id: u64, level: ConsistencyLevel) -> Result<E> {
        self.find(id, level)
            .await?
            .ok_or_else(|| CropDroidError::StoreNotFound {
                kind: E::KIND.to_string(),
                id,
            })
    }

    pub async fn get_page<E: Entity>(&self, query: &PageQuery, level: ConsistencyLevel) -> Result<Page<E>> {
        let page = self.store.scan(E::KIND, query, level).await?;
        let entities = page
            .records
            .iter()
            .map(Record::decode)
            .collect::<Result<Vec<E>>>()?;
        Ok(Page {
            entities,
            has_more: page.has_more,
        })
    }

    /// Every match of `query`, ignoring its paging fields.
    pub async fn list<E: Entity>(&self, query: &PageQuery, level: ConsistencyLevel) -> Result<Vec<E>> {
        let unbounded = PageQuery {
            offset: 0,
            limit: 0,
            ..query.clone()
        };
        Ok(self.get_page(&unbounded, level).await?.entities)
    }

    /// Stream `query` in pages of `page_size` through `f`. Returning `false`
    /// from the callback stops early. Returns the number of entities seen.
    pub async fn for_each_page<E, F>(
        &self,
        query: &PageQuery,
        page_size: usize,
        level: ConsistencyLevel,
        mut f: F,
    ) -> Result<usize>
    where
        E: Entity,
        F: FnMut(Vec<E>) -> bool,
    {
        let page_size = page_size.max(1);
        let mut offset = query.offset;
        let mut seen = 0;
        loop {
            let q = query.clone().with_page(offset, page_size);
            let page = self.get_page::<E>(&q, level).await?;
            let n = page.entities.len();
            seen += n;
            offset += n;
            if n == 0 || !f(page.entities) || !page.has_more {
                return Ok(seen);
            }
        }
    }

    pub async fn list_farms(&self, level: ConsistencyLevel) -> Result<Vec<Farm>> {
        self.list(&PageQuery::default(), level).await
    }

    /// One batch holding every record of a hydrated farm graph.
    pub fn farm_graph_mutations(config: &FarmConfig, insert: bool) -> Result<Vec<Mutation>> {
        let farm_id = config.farm.id;
        let wrap = |r: Record| if insert { Mutation::Insert(r) } else { Mutation::Upsert(r) };
        let mut batch = vec![wrap(Record::from_entity(&config.farm, farm_id)?)];
        for device in &config.devices {
            batch.push(wrap(Record::from_entity(device, farm_id)?));
            for s in &device.settings {
                batch.push(wrap(Record::from_entity(s, farm_id)?));
            }
            for m in &device.metrics {
                batch.push(wrap(Record::from_entity(m, farm_id)?));
            }
            for c in &device.channels {
                batch.push(wrap(Record::from_entity(c, farm_id)?));
                for cond in &c.conditions {
                    batch.push(wrap(Record::from_entity(cond, farm_id)?));
                }
                for s in &c.schedules {
                    batch.push(wrap(Record::from_entity(s, farm_id)?));
                }
            }
        }
        for w in &config.workflows {
            batch.push(wrap(Record::from_entity(w, farm_id)?));
            for cond in &w.conditions {
                batch.push(wrap(Record::from_entity(cond, farm_id)?));
            }
            for s in &w.schedules {
                batch.push(wrap(Record::from_entity(s, farm_id)?));
            }
            for step in &w.steps {
                batch.push(wrap(Record::from_entity(step, farm_id)?));
            }
        }
        for p in &config.permissions {
            batch.push(wrap(Record::from_entity(p, farm_id)?));
        }
        Ok(batch)
    }

    /// Persist the whole graph in one atomic batch at the farm's write level.
    pub async fn save_farm_graph(&self, config: &FarmConfig, insert: bool) -> Result<()> {
        let batch = Self::farm_graph_mutations(config, insert)?;
        let level = self.write_level(config.farm.consistency);
        tracing::debug!(
            "Saving farm {} graph: {} records at {:?}",
            config.farm.name,
            batch.len(),
            level
        );
        self.store.apply(batch, level).await
    }

    /// Hydrate a farm graph from its flat records.
    pub async fn load_farm_config(&self, farm_id: u64, level: ConsistencyLevel) -> Result<FarmConfig> {
        let farm: Farm = self.get(farm_id, level).await?;
        let q = PageQuery::farm(farm_id);
        let config = FarmConfig::from_records(
            farm,
            self.list::<Device>(&q, level).await?,
            self.list::<DeviceSetting>(&q, level).await?,
            self.list::<Metric>(&q, level).await?,
            self.list::<Channel>(&q, level).await?,
            self.list::<Condition>(&q, level).await?,
            self.list::<Schedule>(&q, level).await?,
            self.list::<Workflow>(&q, level).await?,
            self.list::<WorkflowStep>(&q, level).await?,
            self.list::<Permission>(&q, level).await?,
        );
        Ok(config)
    }

    /// Delete every record scoped to `farm_id` in one batch.
    pub async fn delete_farm_graph(&self, farm_id: u64, level: ConsistencyLevel) -> Result<usize> {
        let q = PageQuery::farm(farm_id);
        let mut batch = Vec::new();
        for kind in FARM_GRAPH_KINDS {
            let page = self.store.scan(kind, &q, level).await?;
            batch.extend(
                page.records
                    .into_iter()
                    .map(|r| Mutation::Delete { kind: r.kind, id: r.id }),
            );
        }
        let n = batch.len();
        self.apply(batch, level).await?;
        Ok(n)
    }
}
