//! Per-farm event log persisted through the DAO.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cropdroid_core::context::Clock;
use cropdroid_core::error::Result;
use cropdroid_core::ids::IdHasher;
use cropdroid_core::model::{ConsistencyLevel, EventLog};
use cropdroid_core::traits::PageQuery;
use cropdroid_db::dao::{Dao, Page};

const SCAN_PAGE: usize = 256;

pub struct EventLogService {
    farm_id: u64,
    dao: Dao,
    hasher: IdHasher,
    level: ConsistencyLevel,
    clock: Arc<dyn Clock>,
    seq: AtomicU64,
}

impl EventLogService {
    pub fn new(farm_id: u64, dao: Dao, hasher: IdHasher, level: ConsistencyLevel, clock: Arc<dyn Clock>) -> Self {
        Self {
            farm_id,
            dao,
            hasher,
            level,
            clock,
            seq: AtomicU64::new(0),
        }
    }

    pub fn farm_id(&self) -> u64 {
        self.farm_id
    }

    pub async fn log(&self, device: &str, event_type: &str, message: impl Into<String>) -> Result<EventLog> {
        let timestamp = self.clock.now();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let nanos = timestamp.timestamp_nanos_opt().unwrap_or_default();
        let event = EventLog {
            id: self.hasher.event_id(self.farm_id, nanos, seq),
            farm_id: self.farm_id,
            device: device.to_string(),
            event_type: event_type.to_string(),
            message: message.into(),
            timestamp,
        };
        self.dao.insert(self.farm_id, &event, self.level).await?;
        Ok(event)
    }

    /// Best effort: failures are logged, never returned.
    pub async fn record(&self, device: &str, event_type: &str, message: impl Into<String>) {
        if let Err(e) = self.log(device, event_type, message).await {
            tracing::warn!("⚠️ event log write for farm {} failed: {e}", self.farm_id);
        }
    }

    /// Newest first. `page` is zero-based.
    pub async fn list(&self, page: usize, page_size: usize) -> Result<Page<EventLog>> {
        // IDs are content hashes, so ordering needs the timestamps.
        let mut all: Vec<EventLog> = Vec::new();
        self.dao
            .for_each_page::<EventLog, _>(&PageQuery::farm(self.farm_id), SCAN_PAGE, ConsistencyLevel::Local, |batch| {
                all.extend(batch);
                true
            })
            .await?;
        all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        let size = page_size.max(1);
        let start = page.saturating_mul(size).min(all.len());
        let end = (start + size).min(all.len());
        Ok(Page {
            has_more: end < all.len(),
            entities: all.drain(start..end).collect(),
        })
    }
}
