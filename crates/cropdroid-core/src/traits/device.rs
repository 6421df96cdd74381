//! Device capability: Poll, Switch, TimerSwitch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::DeviceSnapshot;

/// One remote (or synthetic) controller speaking the device contract.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Device name used in logs and notifications.
    fn name(&self) -> &str;

    /// Read metrics and channel vector.
    async fn poll(&self) -> Result<DeviceSnapshot>;

    /// Set a relay to 0 or 1.
    async fn switch(&self, channel: usize, state: i32) -> Result<()>;

    /// Turn a relay ON for `seconds`; the device owns the timer.
    /// Returns when the device says the timer ends.
    async fn timer_switch(&self, channel: usize, seconds: u64) -> Result<DateTime<Utc>>;
}
