//! Hydrated per-farm configuration graph.
//!
//! A `FarmConfig` is an immutable snapshot. Updates build a new snapshot and
//! swap it into the [`ConfigHandle`] the scheduler reads from.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{CropDroidError, Result};
use crate::model::{
    Channel, Condition, Device, DeviceSetting, Entity, Farm, Metric, Permission, Schedule,
    Workflow, WorkflowStep,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FarmConfig {
    pub farm: Farm,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub workflows: Vec<Workflow>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(skip)]
    index: GraphIndex,
}

/// Position lookups built once per hydration.
#[derive(Debug, Clone, Default)]
struct GraphIndex {
    devices: HashMap<u64, usize>,
    metrics: HashMap<u64, (usize, usize)>,
    channels: HashMap<u64, (usize, usize)>,
}

impl FarmConfig {
    pub fn new(
        farm: Farm,
        devices: Vec<Device>,
        workflows: Vec<Workflow>,
        permissions: Vec<Permission>,
    ) -> Self {
        let mut config = Self {
            farm,
            devices,
            workflows,
            permissions,
            index: GraphIndex::default(),
        };
        config.reindex();
        config
    }

    /// Assemble a graph from flat records in one pass.
    #[allow(clippy::too_many_arguments)]
    pub fn from_records(
        farm: Farm,
        devices: Vec<Device>,
        settings: Vec<DeviceSetting>,
        metrics: Vec<Metric>,
        channels: Vec<Channel>,
        conditions: Vec<Condition>,
        schedules: Vec<Schedule>,
        workflows: Vec<Workflow>,
        steps: Vec<WorkflowStep>,
        permissions: Vec<Permission>,
    ) -> Self {
        let mut devices: Vec<Device> = devices.iter().map(Entity::flat).collect();
        let mut workflows: Vec<Workflow> = workflows.iter().map(Entity::flat).collect();
        let device_pos: HashMap<u64, usize> =
            devices.iter().enumerate().map(|(i, d)| (d.id, i)).collect();
        let workflow_pos: HashMap<u64, usize> =
            workflows.iter().enumerate().map(|(i, w)| (w.id, i)).collect();

        for s in settings {
            if let Some(&i) = device_pos.get(&s.device_id) {
                devices[i].settings.push(s);
            }
        }
        for m in metrics {
            if let Some(&i) = device_pos.get(&m.device_id) {
                devices[i].metrics.push(m);
            }
        }
        let mut channel_pos: HashMap<u64, (usize, usize)> = HashMap::new();
        for c in channels {
            if let Some(&i) = device_pos.get(&c.device_id) {
                channel_pos.insert(c.id, (i, devices[i].channels.len()));
                devices[i].channels.push(c);
            }
        }
        for c in conditions {
            if let Some(&(d, ch)) = c.channel_id.and_then(|id| channel_pos.get(&id)) {
                devices[d].channels[ch].conditions.push(c);
            } else if let Some(&w) = c.workflow_id.and_then(|id| workflow_pos.get(&id)) {
                workflows[w].conditions.push(c);
            }
        }
        for s in schedules {
            if let Some(&(d, ch)) = s.channel_id.and_then(|id| channel_pos.get(&id)) {
                devices[d].channels[ch].schedules.push(s);
            } else if let Some(&w) = s.workflow_id.and_then(|id| workflow_pos.get(&id)) {
                workflows[w].schedules.push(s);
            }
        }
        for step in steps {
            if let Some(&w) = workflow_pos.get(&step.workflow_id) {
                workflows[w].steps.push(step);
            }
        }
        for d in &mut devices {
            d.channels.sort_by_key(|c| c.channel_index);
        }
        for w in &mut workflows {
            w.steps.sort_by_key(|s| s.sort_order);
        }
        Self::new(farm, devices, workflows, permissions)
    }

    /// Rebuild lookups after deserialising or mutating a clone.
    pub fn reindex(&mut self) {
        let mut index = GraphIndex::default();
        for (di, device) in self.devices.iter().enumerate() {
            index.devices.insert(device.id, di);
            for (mi, metric) in device.metrics.iter().enumerate() {
                index.metrics.insert(metric.id, (di, mi));
            }
            for (ci, channel) in device.channels.iter().enumerate() {
                index.channels.insert(channel.id, (di, ci));
            }
        }
        self.index = index;
    }

    pub fn farm_id(&self) -> u64 {
        self.farm.id
    }

    pub fn device(&self, id: u64) -> Option<&Device> {
        self.index.devices.get(&id).map(|&i| &self.devices[i])
    }

    pub fn device_by_type(&self, device_type: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.device_type == device_type)
    }

    pub fn metric(&self, id: u64) -> Option<(&Device, &Metric)> {
        self.index
            .metrics
            .get(&id)
            .map(|&(d, m)| (&self.devices[d], &self.devices[d].metrics[m]))
    }

    pub fn channel(&self, id: u64) -> Option<(&Device, &Channel)> {
        self.index
            .channels
            .get(&id)
            .map(|&(d, c)| (&self.devices[d], &self.devices[d].channels[c]))
    }

    pub fn channel_mut(&mut self, id: u64) -> Option<&mut Channel> {
        let &(d, c) = self.index.channels.get(&id)?;
        Some(&mut self.devices[d].channels[c])
    }

    pub fn workflow(&self, id: u64) -> Option<&Workflow> {
        self.workflows.iter().find(|w| w.id == id)
    }

    /// First device setting with `key` anywhere on the farm.
    pub fn farm_setting_f64(&self, key: &str) -> Option<f64> {
        self.devices.iter().find_map(|d| d.setting_f64(key))
    }

    /// Structural invariants of a graph about to be persisted or scheduled.
    pub fn validate(&self) -> Result<()> {
        if self.farm.interval < 1 {
            return Err(CropDroidError::Config(format!(
                "farm {} interval must be at least 1s",
                self.farm.name
            )));
        }
        for device in &self.devices {
            if device.farm_id != self.farm.id {
                return Err(CropDroidError::Invariant(format!(
                    "device {} belongs to farm {}",
                    device.id, device.farm_id
                )));
            }
            for metric in &device.metrics {
                if let (Some(low), Some(high)) = (metric.alarm_low, metric.alarm_high) {
                    if low > high {
                        return Err(CropDroidError::Config(format!(
                            "metric {}: alarm_low {low} > alarm_high {high}",
                            metric.key
                        )));
                    }
                }
            }
            let mut seen = std::collections::HashSet::new();
            for channel in &device.channels {
                if !seen.insert(channel.channel_index) {
                    return Err(CropDroidError::Config(format!(
                        "device {} has two channels at index {}",
                        device.device_type, channel.channel_index
                    )));
                }
                for condition in &channel.conditions {
                    if self.metric(condition.metric_id).is_none() {
                        return Err(CropDroidError::Config(format!(
                            "channel {} condition references unknown metric {}",
                            channel.name, condition.metric_id
                        )));
                    }
                }
            }
        }
        for workflow in &self.workflows {
            for step in &workflow.steps {
                match self.channel(step.channel_id) {
                    Some((device, _)) if device.id == step.device_id => {}
                    _ => {
                        return Err(CropDroidError::Config(format!(
                            "workflow {} step {} targets unknown channel {}",
                            workflow.name, step.id, step.channel_id
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Shared pointer to the current snapshot. Readers clone the `Arc`.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<FarmConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: FarmConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn load(&self) -> Arc<FarmConfig> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn store(&self, config: FarmConfig) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(config);
    }

    /// Clone, mutate, reindex and swap.
    pub fn update<F>(&self, f: F) -> Arc<FarmConfig>
    where
        F: FnOnce(&mut FarmConfig),
    {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut next = (**guard).clone();
        f(&mut next);
        next.reindex();
        let next = Arc::new(next);
        *guard = next.clone();
        next
    }
}
