//! Poll health of one device.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// Last poll failed; readings are from an earlier tick.
    Stale,
    /// Actuation suppressed until the next successful poll.
    Unreachable,
}

/// Emitted only on the edge, never while a status persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    BecameUnreachable,
    Recovered,
}

#[derive(Debug, Clone)]
pub struct DeviceHealth {
    threshold: u32,
    status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl DeviceHealth {
    /// `threshold` consecutive failures flip the device to unreachable.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            last_success: None,
            last_failure: None,
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn is_unreachable(&self) -> bool {
        self.status == HealthStatus::Unreachable
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) -> Option<HealthTransition> {
        let was_unreachable = self.is_unreachable();
        self.consecutive_failures = 0;
        self.last_success = Some(now);
        self.status = HealthStatus::Healthy;
        was_unreachable.then_some(HealthTransition::Recovered)
    }

    /// `protocol` errors skip the counter and flip immediately.
    pub fn record_failure(&mut self, now: DateTime<Utc>, protocol: bool) -> Option<HealthTransition> {
        self.consecutive_failures += 1;
        self.last_failure = Some(now);
        if self.is_unreachable() {
            return None;
        }
        if protocol || self.consecutive_failures >= self.threshold {
            self.status = HealthStatus::Unreachable;
            Some(HealthTransition::BecameUnreachable)
        } else {
            self.status = HealthStatus::Stale;
            None
        }
    }
}
