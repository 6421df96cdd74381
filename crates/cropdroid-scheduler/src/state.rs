//! Process-local cache of each farm's latest device snapshots.
//!
//! One read-write lock per farm, under an outer map lock taken only to find
//! or create a farm. Writers are the farm's tick; readers are rules, the
//! registry and the REST collaborator.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use cropdroid_core::traits::DeviceDataStore;
use cropdroid_core::types::DeviceSnapshot;
use tokio::sync::mpsc;

/// Device type → latest snapshot.
pub type StateMap = HashMap<String, DeviceSnapshot>;

const HISTORY_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    device_id: u64,
    snapshot: DeviceSnapshot,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct FarmState {
    devices: HashMap<String, Entry>,
}

#[derive(Default)]
pub struct StateStore {
    farms: RwLock<HashMap<u64, Arc<RwLock<FarmState>>>>,
    history: Option<mpsc::Sender<(u64, DeviceSnapshot)>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append every `put` to `sink` from a background writer.
    /// Must be called inside a tokio runtime.
    pub fn with_history(sink: Arc<dyn DeviceDataStore>) -> Self {
        let (tx, mut rx) = mpsc::channel::<(u64, DeviceSnapshot)>(HISTORY_BUFFER);
        tokio::spawn(async move {
            while let Some((device_id, snapshot)) = rx.recv().await {
                if let Err(e) = sink.append(device_id, &snapshot).await {
                    tracing::warn!("⚠️ history append for device {device_id} failed: {e}");
                }
            }
            tracing::debug!("history writer stopped");
        });
        Self {
            farms: RwLock::new(HashMap::new()),
            history: Some(tx),
        }
    }

    fn farm(&self, farm_id: u64) -> Option<Arc<RwLock<FarmState>>> {
        self.farms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&farm_id)
            .cloned()
    }

    fn farm_or_insert(&self, farm_id: u64) -> Arc<RwLock<FarmState>> {
        if let Some(farm) = self.farm(farm_id) {
            return farm;
        }
        self.farms
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(farm_id)
            .or_default()
            .clone()
    }

    pub fn put(&self, farm_id: u64, device_type: &str, device_id: u64, snapshot: DeviceSnapshot) {
        if let Some(tx) = &self.history {
            if tx.try_send((device_id, snapshot.clone())).is_err() {
                tracing::warn!("⚠️ history buffer full, dropping sample for {device_type}");
            }
        }
        let farm = self.farm_or_insert(farm_id);
        let mut farm = farm.write().unwrap_or_else(|e| e.into_inner());
        let updated_at = snapshot.timestamp;
        farm.devices.insert(
            device_type.to_string(),
            Entry {
                device_id,
                snapshot,
                updated_at,
            },
        );
    }

    pub fn get(&self, farm_id: u64, device_type: &str) -> Option<DeviceSnapshot> {
        let farm = self.farm(farm_id)?;
        let farm = farm.read().unwrap_or_else(|e| e.into_inner());
        farm.devices.get(device_type).map(|e| e.snapshot.clone())
    }

    pub fn snapshot(&self, farm_id: u64) -> StateMap {
        let Some(farm) = self.farm(farm_id) else {
            return StateMap::new();
        };
        let farm = farm.read().unwrap_or_else(|e| e.into_inner());
        farm.devices
            .iter()
            .map(|(k, e)| (k.clone(), e.snapshot.clone()))
            .collect()
    }

    /// Record a successful actuation without waiting for the next poll.
    pub fn set_channel(&self, farm_id: u64, device_type: &str, index: usize, state: i32) {
        let Some(farm) = self.farm(farm_id) else {
            return;
        };
        let mut farm = farm.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = farm.devices.get_mut(device_type) {
            entry.snapshot.set_channel(index, state);
        }
    }

    /// Device IDs with a cached snapshot, keyed by device type.
    pub fn device_ids(&self, farm_id: u64) -> HashMap<String, u64> {
        let Some(farm) = self.farm(farm_id) else {
            return HashMap::new();
        };
        let farm = farm.read().unwrap_or_else(|e| e.into_inner());
        farm.devices.iter().map(|(k, e)| (k.clone(), e.device_id)).collect()
    }

    pub fn evict(&self, farm_id: u64) {
        if self
            .farms
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&farm_id)
            .is_some()
        {
            tracing::debug!("state for farm {farm_id} evicted");
        }
    }

    pub fn farm_count(&self) -> usize {
        self.farms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drop entries older than `ttl_secs`. A zero TTL never evicts.
    pub fn tick(&self, now: DateTime<Utc>, ttl_secs: u64) -> usize {
        if ttl_secs == 0 {
            return 0;
        }
        let ttl = Duration::seconds(ttl_secs as i64);
        let farms: Vec<_> = self
            .farms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let mut evicted = 0;
        for farm in farms {
            let mut farm = farm.write().unwrap_or_else(|e| e.into_inner());
            let before = farm.devices.len();
            farm.devices.retain(|_, e| now - e.updated_at <= ttl);
            evicted += before - farm.devices.len();
        }
        if evicted > 0 {
            tracing::debug!("🧹 evicted {evicted} stale device states");
        }
        evicted
    }
}
