//! In-process synthetic device for `virtual` farms.
//!
//! Readings are drawn from a `StdRng` seeded with `H(farm ‖ type ‖ tick)` so
//! a given farm replays the same telemetry on every run. Timers are honoured
//! against the farm clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cropdroid_core::context::Clock;
use cropdroid_core::error::{CropDroidError, Result};
use cropdroid_core::ids::IdHasher;
use cropdroid_core::model::{Device, DeviceKind};
use cropdroid_core::traits::DeviceClient;
use cropdroid_core::types::{CHANNEL_OFF, CHANNEL_ON, DeviceSnapshot};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Plausible band for well-known keys.
fn default_range(kind: DeviceKind, key: &str) -> (f64, f64) {
    let base = key.trim_end_matches(|c: char| c.is_ascii_digit());
    match (kind, base) {
        (_, "tempF") => (68.0, 82.0),
        (_, "tempC") => (20.0, 28.0),
        (_, "humidity") => (40.0, 70.0),
        (_, "co2") => (400.0, 1400.0),
        (_, "vpd") => (0.6, 1.6),
        (_, "light") => (0.0, 1000.0),
        (_, "pH" | "ph") => (5.6, 6.6),
        (_, "ec") => (1.0, 2.4),
        (_, "orp") => (150.0, 450.0),
        (_, "waterTemp" | "waterTempF") => (62.0, 72.0),
        (_, "waterLevel") => (40.0, 100.0),
        (DeviceKind::Server, _) => (0.0, 1.0),
        _ => (0.0, 100.0),
    }
}

struct VirtualState {
    channels: Vec<i32>,
    /// Per-slot auto-off deadline.
    timers: Vec<Option<DateTime<Utc>>>,
    pinned: HashMap<String, f64>,
}

pub struct VirtualDevice {
    name: String,
    kind: DeviceKind,
    farm_id: u64,
    metrics: Vec<(String, (f64, f64))>,
    hasher: IdHasher,
    clock: Arc<dyn Clock>,
    tick: AtomicU64,
    state: Mutex<VirtualState>,
}

impl VirtualDevice {
    /// Mirror a configured device: its metric keys and channel slots.
    pub fn from_device(farm_id: u64, device: &Device, hasher: IdHasher, clock: Arc<dyn Clock>) -> Self {
        let kind = device.kind();
        let metrics = device
            .metrics
            .iter()
            .map(|m| {
                let range = match (m.alarm_low, m.alarm_high) {
                    // Wander a little past the alarm window so alarms can fire.
                    (Some(lo), Some(hi)) if hi > lo => {
                        let pad = (hi - lo) * 0.15;
                        (lo - pad, hi + pad)
                    }
                    _ => default_range(kind, &m.key),
                };
                (m.key.clone(), range)
            })
            .collect();
        let slots = device
            .channels
            .iter()
            .map(|c| c.channel_index + 1)
            .max()
            .unwrap_or(0);
        Self::new(&device.device_type, farm_id, metrics, slots, hasher, clock)
    }

    pub fn new(
        device_type: &str,
        farm_id: u64,
        metrics: Vec<(String, (f64, f64))>,
        channel_slots: usize,
        hasher: IdHasher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: device_type.to_string(),
            kind: DeviceKind::from_type(device_type),
            farm_id,
            metrics,
            hasher,
            clock,
            tick: AtomicU64::new(0),
            state: Mutex::new(VirtualState {
                channels: vec![CHANNEL_OFF; channel_slots],
                timers: vec![None; channel_slots],
                pinned: HashMap::new(),
            }),
        }
    }

    /// Fix a metric to `value` for every following poll.
    pub fn pin(&self, key: &str, value: f64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pinned.insert(key.to_string(), value);
    }

    pub fn unpin(&self, key: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pinned.remove(key);
    }

    pub fn channel(&self, index: usize) -> i32 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.channels.get(index).copied().unwrap_or(CHANNEL_OFF)
    }

    fn check_slot(&self, state: &VirtualState, channel: usize) -> Result<()> {
        if channel >= state.channels.len() {
            return Err(CropDroidError::protocol(
                &self.name,
                format!("no channel {channel} (device has {})", state.channels.len()),
            ));
        }
        Ok(())
    }

    /// Turn off slots whose timer has elapsed.
    fn expire_timers(state: &mut VirtualState, now: DateTime<Utc>) {
        for (slot, timer) in state.timers.iter_mut().enumerate() {
            if timer.is_some_and(|until| until <= now) {
                *timer = None;
                state.channels[slot] = CHANNEL_OFF;
            }
        }
    }
}

#[async_trait]
impl DeviceClient for VirtualDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn poll(&self) -> Result<DeviceSnapshot> {
        let tick = self.tick.fetch_add(1, Ordering::SeqCst);
        let seed = self.hasher.hash(&[&self.farm_id, &self.name, &tick]);
        let mut rng = StdRng::seed_from_u64(seed);
        let now = self.clock.now();

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::expire_timers(&mut state, now);

        let metrics = self
            .metrics
            .iter()
            .map(|(key, (lo, hi))| {
                let drawn = if hi > lo { rng.gen_range(*lo..*hi) } else { *lo };
                let value = state.pinned.get(key).copied().unwrap_or(drawn);
                (key.clone(), (value * 100.0).round() / 100.0)
            })
            .collect();
        Ok(DeviceSnapshot::new(metrics, state.channels.clone(), now))
    }

    async fn switch(&self, channel: usize, state_value: i32) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.check_slot(&state, channel)?;
        state.channels[channel] = if state_value == CHANNEL_OFF { CHANNEL_OFF } else { CHANNEL_ON };
        state.timers[channel] = None;
        Ok(())
    }

    async fn timer_switch(&self, channel: usize, seconds: u64) -> Result<DateTime<Utc>> {
        let until = self.clock.now() + chrono::Duration::seconds(seconds as i64);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.check_slot(&state, channel)?;
        state.channels[channel] = CHANNEL_ON;
        state.timers[channel] = Some(until);
        Ok(until)
    }
}
