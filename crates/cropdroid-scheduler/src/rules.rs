//! Rule engine: decide each channel's desired state for one tick.
//!
//! `desired = scheduled(now) || conditions_hold(state)`, then the channel's
//! algorithm turns the decision into a command. The engine remembers the
//! previous decision per channel (for the one-shot oxidizer edge) and which
//! broken schedules it has already reported. An oxidizer edge only counts
//! once the scheduler [`RuleEngine::confirm`]s that its timer was applied.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cropdroid_core::error::CropDroidError;
use cropdroid_core::farm_config::FarmConfig;
use cropdroid_core::model::{AlgorithmKind, Channel, Condition, Device};
use cropdroid_core::types::{CHANNEL_OFF, CHANNEL_ON};

use crate::schedule;
use crate::state::StateMap;

pub const PH_DOSE_FACTOR_KEY: &str = "ph.dose_factor";
pub const RESERVOIR_GALLONS_KEY: &str = "reservoir.gallons";
pub const OXIDIZER_SECONDS_KEY: &str = "oxidizer.seconds";

const DEFAULT_PH_DOSE_FACTOR: f64 = 0.6;
const DEFAULT_RESERVOIR_GALLONS: f64 = 50.0;
const DEFAULT_OXIDIZER_SECONDS: u64 = 60;
const MAX_DOSE_SECONDS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAction {
    Switch(i32),
    Timer(u64),
}

/// One actuation the scheduler should issue this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub device_id: u64,
    pub device_type: String,
    pub channel_id: u64,
    pub channel_index: usize,
    pub action: CommandAction,
    pub reason: String,
}

/// A schedule that could not be interpreted, reported once per process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidSchedule {
    pub device_type: String,
    pub channel_id: u64,
    pub schedule_id: u64,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct Evaluation {
    pub commands: Vec<Command>,
    pub invalid: Vec<InvalidSchedule>,
}

/// Does every condition hold against the current readings?
/// An empty set never holds; a missing or disabled metric fails its condition.
pub fn conditions_hold(conditions: &[Condition], config: &FarmConfig, state: &StateMap) -> bool {
    if conditions.is_empty() {
        return false;
    }
    conditions.iter().all(|c| {
        condition_value(c, config, state).is_some_and(|v| c.comparator.compare(v, c.threshold))
    })
}

fn condition_value(condition: &Condition, config: &FarmConfig, state: &StateMap) -> Option<f64> {
    let (device, metric) = config.metric(condition.metric_id)?;
    if !metric.enable {
        return None;
    }
    state.get(&device.device_type)?.metric(&metric.key)
}

/// `clamp(round(|value − threshold| × k × gallons), 1, 60)`.
pub fn ph_dose_seconds(value: f64, threshold: f64, factor: f64, gallons: f64) -> u64 {
    let raw = ((value - threshold).abs() * factor * gallons).round();
    if raw.is_finite() && raw > 0.0 {
        (raw as u64).clamp(1, MAX_DOSE_SECONDS)
    } else {
        1
    }
}

#[derive(Debug, Default)]
pub struct RuleEngine {
    last_desired: HashMap<u64, i32>,
    invalid_reported: HashSet<u64>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate every enabled channel of every enabled device whose ID is not
    /// in `skip` (unreachable devices).
    pub fn evaluate(
        &mut self,
        config: &FarmConfig,
        state: &StateMap,
        skip: &HashSet<u64>,
        now: DateTime<Utc>,
        tz: Tz,
    ) -> Evaluation {
        let mut eval = Evaluation::default();
        for device in &config.devices {
            if !device.enable || skip.contains(&device.id) {
                continue;
            }
            // Without a snapshot there is nothing to compare against.
            let Some(snapshot) = state.get(&device.device_type) else {
                continue;
            };
            for channel in &device.channels {
                if !channel.enable {
                    continue;
                }
                let scheduled = match self.scheduled(device, channel, now, tz, &mut eval) {
                    Some(s) => s,
                    None => continue,
                };
                let holds = conditions_hold(&channel.conditions, config, state);
                let desired = if scheduled || holds { CHANNEL_ON } else { CHANNEL_OFF };
                let previous = self.last_desired.get(&channel.id).copied();
                let mut pending_edge = false;
                let current = snapshot.channel(channel.channel_index);
                let reason = if scheduled { "schedule" } else if holds { "conditions" } else { "idle" };

                let action = match channel.algorithm() {
                    AlgorithmKind::BangBang => {
                        (desired != current).then_some(CommandAction::Switch(desired))
                    }
                    AlgorithmKind::Ph => (desired == CHANNEL_ON && current == CHANNEL_OFF)
                        .then(|| CommandAction::Timer(self.dose(config, device, channel, state))),
                    AlgorithmKind::Oxidizer => {
                        let rising = desired == CHANNEL_ON && previous != Some(CHANNEL_ON);
                        pending_edge = rising && current == CHANNEL_OFF;
                        pending_edge.then(|| CommandAction::Timer(oxidizer_seconds(device, channel)))
                    }
                };
                if !pending_edge {
                    self.last_desired.insert(channel.id, desired);
                }
                if let Some(action) = action {
                    eval.commands.push(Command {
                        device_id: device.id,
                        device_type: device.device_type.clone(),
                        channel_id: channel.id,
                        channel_index: channel.channel_index,
                        action,
                        reason: reason.to_string(),
                    });
                }
            }
        }
        eval
    }

    /// `None` when any schedule on the channel is broken: the channel is
    /// skipped for the tick.
    fn scheduled(
        &mut self,
        device: &Device,
        channel: &Channel,
        now: DateTime<Utc>,
        tz: Tz,
        eval: &mut Evaluation,
    ) -> Option<bool> {
        let mut any = false;
        for s in &channel.schedules {
            match schedule::is_active(s, channel.duration, now, tz) {
                Ok(active) => any |= active,
                Err(CropDroidError::ScheduleInvalid { schedule_id, reason }) => {
                    if self.invalid_reported.insert(schedule_id) {
                        eval.invalid.push(InvalidSchedule {
                            device_type: device.device_type.clone(),
                            channel_id: channel.id,
                            schedule_id,
                            reason,
                        });
                    }
                    return None;
                }
                Err(e) => {
                    tracing::warn!("⚠️ schedule {} on channel {}: {e}", s.id, channel.name);
                    return None;
                }
            }
        }
        Some(any)
    }

    fn dose(&self, config: &FarmConfig, device: &Device, channel: &Channel, state: &StateMap) -> u64 {
        let factor = device
            .setting_f64(PH_DOSE_FACTOR_KEY)
            .or_else(|| config.farm_setting_f64(PH_DOSE_FACTOR_KEY))
            .unwrap_or(DEFAULT_PH_DOSE_FACTOR);
        let gallons = config
            .farm_setting_f64(RESERVOIR_GALLONS_KEY)
            .unwrap_or(DEFAULT_RESERVOIR_GALLONS);
        let reading = channel
            .conditions
            .iter()
            .find_map(|c| condition_value(c, config, state).map(|v| (v, c.threshold)));
        match reading {
            Some((value, threshold)) => ph_dose_seconds(value, threshold, factor, gallons),
            // Schedule-driven dose with no reading: fall back to the channel duration.
            None => channel.duration.clamp(1, MAX_DOSE_SECONDS),
        }
    }

    /// Record that a command for `channel_id` reached the device.
    pub fn confirm(&mut self, channel_id: u64, state: i32) {
        self.last_desired.insert(channel_id, state);
    }

    /// Forget everything about a channel, e.g. after it was reconfigured.
    pub fn forget(&mut self, channel_id: u64) {
        self.last_desired.remove(&channel_id);
    }
}

fn oxidizer_seconds(device: &Device, channel: &Channel) -> u64 {
    if channel.duration > 0 {
        return channel.duration;
    }
    device
        .setting_f64(OXIDIZER_SECONDS_KEY)
        .filter(|s| *s >= 1.0)
        .map(|s| s as u64)
        .unwrap_or(DEFAULT_OXIDIZER_SECONDS)
}
