//! Shared harness: a registry whose devices are scripted in-process.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cropdroid_core::config::CropDroidConfig;
use cropdroid_core::context::{Clock, ManualClock};
use cropdroid_core::error::{CropDroidError, Result};
use cropdroid_core::farm_config::FarmConfig;
use cropdroid_core::model::{
    Channel, Comparator, Condition, Device, DeviceSetting, Farm, FarmMode, Metric, Permission,
};
use cropdroid_core::session::{Role, Session};
use cropdroid_core::traits::DeviceClient;
use cropdroid_core::types::{CHANNEL_ON, DeviceSnapshot, NotificationKind};
use cropdroid_db::memory::MemoryStore;
use cropdroid_platform::{ClientFactory, ServiceRegistry};
use cropdroid_scheduler::{FarmScheduler, MemoryMailer, TickReport};

pub const FARM: u64 = 10;
pub const USER: u64 = 7;

/// A device whose readings, reachability and command log the test owns.
pub struct Scripted {
    name: String,
    metrics: Mutex<HashMap<String, f64>>,
    channels: Mutex<Vec<i32>>,
    down: AtomicBool,
    calls: Mutex<Vec<(String, u64)>>,
    started: tokio::time::Instant,
}

impl Scripted {
    pub fn new(name: &str, metrics: &[(&str, f64)], channels: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            metrics: Mutex::new(metrics.iter().map(|(k, v)| (k.to_string(), *v)).collect()),
            channels: Mutex::new(vec![0; channels]),
            down: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            started: tokio::time::Instant::now(),
        })
    }

    pub fn set(&self, key: &str, value: f64) {
        self.metrics.lock().unwrap().insert(key.to_string(), value);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Commands received, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
    }

    /// Commands with the runtime second they arrived at.
    pub fn timed_calls(&self) -> Vec<(String, u64)> {
        self.calls.lock().unwrap().clone()
    }

    fn log(&self, call: String) {
        let at = self.started.elapsed().as_secs();
        self.calls.lock().unwrap().push((call, at));
    }
}

#[async_trait]
impl DeviceClient for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    async fn poll(&self) -> Result<DeviceSnapshot> {
        if self.down.load(Ordering::SeqCst) {
            return Err(CropDroidError::unreachable(&self.name, "connection refused"));
        }
        Ok(DeviceSnapshot::new(
            self.metrics.lock().unwrap().clone(),
            self.channels.lock().unwrap().clone(),
            Utc::now(),
        ))
    }

    async fn switch(&self, channel: usize, state: i32) -> Result<()> {
        self.log(format!("switch({channel},{state})"));
        self.channels.lock().unwrap()[channel] = state;
        Ok(())
    }

    async fn timer_switch(&self, channel: usize, seconds: u64) -> Result<DateTime<Utc>> {
        self.log(format!("timer({channel},{seconds})"));
        self.channels.lock().unwrap()[channel] = CHANNEL_ON;
        Ok(Utc::now() + chrono::Duration::seconds(seconds as i64))
    }
}

pub fn farm(timezone: &str) -> Farm {
    Farm {
        id: FARM,
        org_id: 1,
        name: "scenario".into(),
        mode: FarmMode::Server,
        interval: 3600,
        consistency: Default::default(),
        timezone: timezone.into(),
        user_ids: vec![USER],
    }
}

pub fn device(id: u64, device_type: &str) -> Device {
    Device {
        id,
        farm_id: FARM,
        device_type: device_type.into(),
        description: String::new(),
        uri: format!("http://{device_type}.test"),
        enable: true,
        settings: vec![],
        metrics: vec![],
        channels: vec![],
    }
}

pub fn setting(id: u64, device_id: u64, key: &str, value: &str) -> DeviceSetting {
    DeviceSetting {
        id,
        device_id,
        key: key.into(),
        value: value.into(),
    }
}

pub fn metric(id: u64, device_id: u64, key: &str) -> Metric {
    Metric {
        id,
        device_id,
        key: key.into(),
        name: key.into(),
        data_type: Default::default(),
        unit: String::new(),
        enable: true,
        notify: false,
        alarm_low: None,
        alarm_high: None,
    }
}

pub fn channel(id: u64, device_id: u64, index: usize, name: &str) -> Channel {
    Channel {
        id,
        device_id,
        channel_index: index,
        name: name.into(),
        enable: true,
        notify: true,
        duration: 0,
        debounce: 0,
        backoff: 0,
        algorithm_id: 0,
        conditions: vec![],
        schedules: vec![],
    }
}

pub fn condition(id: u64, channel_id: u64, metric_id: u64, comparator: Comparator, threshold: f64) -> Condition {
    Condition {
        id,
        channel_id: Some(channel_id),
        workflow_id: None,
        metric_id,
        comparator,
        threshold,
    }
}

/// Graph with the test user as admin.
pub fn config(farm: Farm, devices: Vec<Device>, workflows: Vec<cropdroid_core::model::Workflow>) -> FarmConfig {
    let permission = Permission {
        id: 9_000,
        user_id: USER,
        org_id: farm.org_id,
        farm_id: farm.id,
        role_id: Role::Admin.id(),
    };
    FarmConfig::new(farm, devices, workflows, vec![permission])
}

pub struct Farmhouse {
    pub registry: Arc<ServiceRegistry>,
    pub scheduler: Arc<FarmScheduler>,
    pub clock: Arc<ManualClock>,
    pub mailer: Arc<MemoryMailer>,
    pub session: Session,
}

impl Farmhouse {
    /// Start a registry, schedule `config` and let its first tick settle.
    pub async fn open(config: FarmConfig, devices: Vec<(u64, Arc<Scripted>)>, now: DateTime<Utc>) -> Self {
        let clock = Arc::new(ManualClock::new(now));
        let mailer = Arc::new(MemoryMailer::new());
        let scripted: HashMap<u64, Arc<Scripted>> = devices.into_iter().collect();
        let factory: ClientFactory = Arc::new(
            move |_: &Farm, device: &Device, _: &CropDroidConfig, _: Arc<dyn Clock>| {
                scripted
                    .get(&device.id)
                    .map(|d| d.clone() as Arc<dyn DeviceClient>)
                    .ok_or_else(|| CropDroidError::not_found("device", device.id))
            },
        );
        let settings = CropDroidConfig {
            enable_default_farm: false,
            interval: 3600,
            ..CropDroidConfig::default()
        };
        let registry = Arc::new(
            ServiceRegistry::new(settings, Arc::new(MemoryStore::new()), mailer.clone())
                .with_clock(clock.clone())
                .with_client_factory(factory),
        );
        registry.start().await.unwrap();
        registry.dao().save_farm_graph(&config, true).await.unwrap();
        let scheduler = registry.add_farm(config).unwrap();
        while scheduler.tick_count() == 0 {
            tokio::task::yield_now().await;
        }
        // Queued behind the first interval tick; returns once it is done.
        scheduler.tick_once().await;

        Self {
            registry,
            scheduler,
            clock,
            mailer,
            session: Session {
                user_id: USER,
                org_id: 1,
                farm_id: FARM,
                role: Role::Admin,
            },
        }
    }

    pub async fn tick(&self) -> TickReport {
        self.scheduler.tick_once().await
    }

    pub fn advance(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }

    pub fn set_time(&self, at: DateTime<Utc>) {
        self.clock.set(at);
    }

    pub fn queued(&self, kind: NotificationKind) -> usize {
        self.registry
            .notifications()
            .recent()
            .iter()
            .filter(|n| n.kind == kind)
            .count()
    }

    /// Wait until the mailer has seen `n` notifications of `kind`.
    pub async fn delivered(&self, kind: NotificationKind, n: usize) -> bool {
        for _ in 0..100 {
            if self.mailer.sent().iter().filter(|m| m.kind == kind).count() >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    pub async fn close(self) {
        self.registry.shutdown().await;
    }
}
