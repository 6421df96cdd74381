//! Runtime value types exchanged between workers, the store and sinks.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CHANNEL_OFF: i32 = 0;
pub const CHANNEL_ON: i32 = 1;

/// Latest readings of one device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSnapshot {
    pub metrics: HashMap<String, f64>,
    pub channels: Vec<i32>,
    pub timestamp: DateTime<Utc>,
}

impl DeviceSnapshot {
    pub fn new(
        metrics: HashMap<String, f64>,
        channels: Vec<i32>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            metrics,
            channels,
            timestamp,
        }
    }

    pub fn metric(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).copied()
    }

    /// Channel slot state; missing slots read as OFF.
    pub fn channel(&self, index: usize) -> i32 {
        self.channels.get(index).copied().unwrap_or(CHANNEL_OFF)
    }

    pub fn set_channel(&mut self, index: usize, state: i32) {
        if self.channels.len() <= index {
            self.channels.resize(index + 1, CHANNEL_OFF);
        }
        self.channels[index] = state;
    }
}

/// `GET /state` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateReport {
    pub metrics: HashMap<String, f64>,
    pub channels: Vec<i32>,
}

/// `POST /switch` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchReport {
    pub ch: usize,
    pub state: i32,
}

/// `POST /timer` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerReport {
    pub ch: usize,
    pub until: i64,
}

/// Notification priority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NotifyPriority {
    Low,
    Normal,
    High,
    Urgent,
}

/// Type code carried by every notification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Alarm,
    AlarmCleared,
    ChannelSwitched,
    DeviceUnreachable,
    DeviceRecovered,
    ScheduleInvalid,
    Workflow,
}

impl NotificationKind {
    pub fn code(&self) -> &'static str {
        match self {
            NotificationKind::Alarm => "alarm",
            NotificationKind::AlarmCleared => "alarm_cleared",
            NotificationKind::ChannelSwitched => "channel",
            NotificationKind::DeviceUnreachable => "device_unreachable",
            NotificationKind::DeviceRecovered => "device_recovered",
            NotificationKind::ScheduleInvalid => "schedule_invalid",
            NotificationKind::Workflow => "workflow",
        }
    }

    pub fn priority(&self) -> NotifyPriority {
        match self {
            NotificationKind::Alarm | NotificationKind::DeviceUnreachable => NotifyPriority::High,
            NotificationKind::ScheduleInvalid => NotifyPriority::Urgent,
            NotificationKind::ChannelSwitched | NotificationKind::Workflow => {
                NotifyPriority::Normal
            }
            NotificationKind::AlarmCleared | NotificationKind::DeviceRecovered => {
                NotifyPriority::Low
            }
        }
    }
}

/// A message for the operator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub farm_id: u64,
    /// Device name (its type string).
    pub device: String,
    pub kind: NotificationKind,
    pub priority: NotifyPriority,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        farm_id: u64,
        device: &str,
        kind: NotificationKind,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            farm_id,
            device: device.to_string(),
            kind,
            priority: kind.priority(),
            message: message.into(),
            timestamp,
        }
    }

    pub fn title(&self) -> String {
        format!("[{}] {} {}", self.farm_id, self.device, self.kind.code())
    }
}
