//! Per-device worker.
//!
//! Owns the device client plus everything remembered between ticks: the
//! per-channel transition tracker, poll health and the actuation lock that
//! serialises rule-engine commands with workflow steps on the same device.
//! Callers hold [`DeviceWorker::actuation_lock`] around `switch` and
//! `timer_switch`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cropdroid_core::error::{CropDroidError, Result};
use cropdroid_core::model::Channel;
use cropdroid_core::traits::DeviceClient;
use cropdroid_core::types::{CHANNEL_OFF, CHANNEL_ON, DeviceSnapshot};

use crate::health::{DeviceHealth, HealthTransition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// Command sent and acknowledged.
    Applied,
    /// Nothing to do.
    AlreadyInState,
    /// Held back by debounce/backoff; the next tick re-evaluates.
    Deferred { remaining_secs: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelTracker {
    pub current_state: i32,
    pub last_transition_at: Option<DateTime<Utc>>,
    pub last_on_at: Option<DateTime<Utc>>,
    pub last_off_at: Option<DateTime<Utc>>,
}

impl ChannelTracker {
    fn record(&mut self, state: i32, at: DateTime<Utc>) {
        if state == self.current_state && self.last_transition_at.is_some() {
            return;
        }
        self.current_state = state;
        self.last_transition_at = Some(at);
        if state == CHANNEL_ON {
            self.last_on_at = Some(at);
        } else {
            self.last_off_at = Some(at);
        }
    }

    /// Debounce holds an OFF after an ON; backoff holds an ON after an OFF.
    pub fn gate(&self, desired: i32, debounce: u64, backoff: u64, now: DateTime<Utc>) -> SwitchOutcome {
        if desired == self.current_state {
            return SwitchOutcome::AlreadyInState;
        }
        let (since, hold) = if desired == CHANNEL_OFF {
            (self.last_on_at, debounce)
        } else {
            (self.last_off_at, backoff)
        };
        if let Some(at) = since {
            let elapsed = (now - at).num_seconds().max(0) as u64;
            if elapsed < hold {
                return SwitchOutcome::Deferred {
                    remaining_secs: hold - elapsed,
                };
            }
        }
        SwitchOutcome::Applied
    }
}

pub struct PollOutcome {
    pub result: Result<DeviceSnapshot>,
    pub transition: Option<HealthTransition>,
}

pub struct DeviceWorker {
    device_id: u64,
    name: String,
    client: Arc<dyn DeviceClient>,
    timeout: Duration,
    trackers: Mutex<HashMap<usize, ChannelTracker>>,
    health: Mutex<DeviceHealth>,
    actuation: Arc<tokio::sync::Mutex<()>>,
}

impl DeviceWorker {
    pub fn new(
        device_id: u64,
        client: Arc<dyn DeviceClient>,
        timeout: Duration,
        unreachable_after: u32,
    ) -> Self {
        Self {
            device_id,
            name: client.name().to_string(),
            client,
            timeout,
            trackers: Mutex::new(HashMap::new()),
            health: Mutex::new(DeviceHealth::new(unreachable_after)),
            actuation: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn device_id(&self) -> u64 {
        self.device_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &Arc<dyn DeviceClient> {
        &self.client
    }

    pub fn health(&self) -> DeviceHealth {
        self.health.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_reachable(&self) -> bool {
        !self.health.lock().unwrap_or_else(|e| e.into_inner()).is_unreachable()
    }

    pub fn actuation_lock(&self) -> Arc<tokio::sync::Mutex<()>> {
        self.actuation.clone()
    }

    pub fn tracker(&self, channel_index: usize) -> ChannelTracker {
        self.trackers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&channel_index)
            .cloned()
            .unwrap_or_default()
    }

    /// Poll with the per-request timeout and fold the result into health and
    /// the channel trackers.
    pub async fn poll(&self, now: DateTime<Utc>) -> PollOutcome {
        let result = match tokio::time::timeout(self.timeout, self.client.poll()).await {
            Ok(r) => r,
            Err(_) => Err(CropDroidError::unreachable(
                &self.name,
                format!("poll timed out after {:?}", self.timeout),
            )),
        };
        let result = result.map(|mut snap| {
            snap.timestamp = now;
            snap
        });

        let transition = {
            let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
            match &result {
                Ok(_) => health.record_success(now),
                Err(e) => {
                    let protocol = matches!(e, CropDroidError::DeviceProtocol { .. });
                    tracing::warn!(
                        "⚠️ Poll of {} failed ({} in a row): {e}",
                        self.name,
                        health.consecutive_failures + 1
                    );
                    health.record_failure(now, protocol)
                }
            }
        };

        if let Ok(snap) = &result {
            let mut trackers = self.trackers.lock().unwrap_or_else(|e| e.into_inner());
            for (index, &state) in snap.channels.iter().enumerate() {
                match trackers.get_mut(&index) {
                    // A device-side change (e.g. an expired timer) is a transition.
                    Some(t) => {
                        if t.current_state != state {
                            t.record(state, now);
                        }
                    }
                    None => {
                        trackers.insert(
                            index,
                            ChannelTracker {
                                current_state: state,
                                ..ChannelTracker::default()
                            },
                        );
                    }
                }
            }
        }
        PollOutcome { result, transition }
    }

    /// A poll abandoned by the caller's deadline counts as a failed poll.
    pub fn record_missed(&self, now: DateTime<Utc>) -> Option<HealthTransition> {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        tracing::warn!(
            "⚠️ Poll of {} missed the tick deadline ({} in a row)",
            self.name,
            health.consecutive_failures + 1
        );
        health.record_failure(now, false)
    }

    pub fn gate(&self, channel: &Channel, desired: i32, now: DateTime<Utc>) -> SwitchOutcome {
        self.tracker(channel.channel_index)
            .gate(desired, channel.debounce, channel.backoff, now)
    }

    pub fn ensure_reachable(&self) -> Result<()> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(CropDroidError::unreachable(&self.name, "actuation suppressed while unreachable"))
        }
    }

    fn record(&self, channel_index: usize, state: i32, now: DateTime<Utc>) {
        let mut trackers = self.trackers.lock().unwrap_or_else(|e| e.into_inner());
        trackers.entry(channel_index).or_default().record(state, now);
    }

    /// Gated sustained switch.
    pub async fn switch(&self, channel: &Channel, state: i32, now: DateTime<Utc>) -> Result<SwitchOutcome> {
        self.ensure_reachable()?;
        let outcome = self.gate(channel, state, now);
        if outcome != SwitchOutcome::Applied {
            if let SwitchOutcome::Deferred { remaining_secs } = outcome {
                tracing::info!(
                    "⏸️ {} ch{} → {state} deferred {remaining_secs}s",
                    self.name,
                    channel.channel_index
                );
            }
            return Ok(outcome);
        }
        self.call(self.client.switch(channel.channel_index, state)).await?;
        self.record(channel.channel_index, state, now);
        Ok(SwitchOutcome::Applied)
    }

    /// Gated timed ON. Returns the device's off deadline when applied.
    pub async fn timer_switch(
        &self,
        channel: &Channel,
        seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<(SwitchOutcome, Option<DateTime<Utc>>)> {
        self.ensure_reachable()?;
        let outcome = self.gate(channel, CHANNEL_ON, now);
        if outcome != SwitchOutcome::Applied {
            return Ok((outcome, None));
        }
        let until = self
            .call(self.client.timer_switch(channel.channel_index, seconds))
            .await?;
        self.record(channel.channel_index, CHANNEL_ON, now);
        Ok((SwitchOutcome::Applied, Some(until)))
    }

    /// Timed ON that skips the gate; used by workflow steps.
    pub async fn run_timer(&self, channel_index: usize, seconds: u64, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.ensure_reachable()?;
        let until = self.call(self.client.timer_switch(channel_index, seconds)).await?;
        self.record(channel_index, CHANNEL_ON, now);
        Ok(until)
    }

    /// Ungated switch for shutdown and cancellation.
    pub async fn force_switch(&self, channel_index: usize, state: i32, now: DateTime<Utc>) -> Result<()> {
        self.call(self.client.switch(channel_index, state)).await?;
        self.record(channel_index, state, now);
        Ok(())
    }

    async fn call<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(CropDroidError::unreachable(
                &self.name,
                format!("request timed out after {:?}", self.timeout),
            )),
        }
    }
}
