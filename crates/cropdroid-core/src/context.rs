//! Explicit per-farm context passed down the task tree.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio_util::sync::CancellationToken;

use crate::error::{CropDroidError, Result};
use crate::model::{Farm, FarmMode};

/// Source of "now" for everything time-dependent.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock for tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|e| CropDroidError::Config(format!("unknown timezone '{name}': {e}")))
}

/// Everything a farm's tasks need without reaching for globals.
#[derive(Debug, Clone)]
pub struct FarmContext {
    pub farm_id: u64,
    pub name: String,
    pub mode: FarmMode,
    pub timezone: Tz,
    pub interval: Duration,
    pub clock: Arc<dyn Clock>,
    pub cancel: CancellationToken,
    pub span: tracing::Span,
}

impl FarmContext {
    /// Child of `parent`: cancelling the registry cancels every farm.
    pub fn new(farm: &Farm, clock: Arc<dyn Clock>, parent: &CancellationToken) -> Result<Self> {
        let timezone = parse_timezone(&farm.timezone)?;
        Ok(Self {
            farm_id: farm.id,
            name: farm.name.clone(),
            mode: farm.mode,
            timezone,
            interval: Duration::from_secs(farm.interval.max(1)),
            clock,
            cancel: parent.child_token(),
            span: tracing::info_span!("farm", id = farm.id, name = %farm.name),
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Bound on shutdown wind-down.
    pub fn grace_period(&self) -> Duration {
        self.interval * 2
    }
}
