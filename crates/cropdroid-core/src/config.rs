//! CropDroid configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CropDroidError, Result};
use crate::ids::IdWidth;
use crate::model::{ConsistencyLevel, FarmMode};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CropDroidConfig {
    #[serde(default)]
    pub mode: FarmMode,
    /// Poll cadence in seconds.
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// Seconds before an unrefreshed device state is evicted; 0 disables.
    #[serde(default)]
    pub state_ttl: u64,
    /// Seconds between eviction sweeps.
    #[serde(default = "default_state_tick")]
    pub state_tick: u64,
    #[serde(default)]
    pub data_store: DataStoreKind,
    #[serde(default)]
    pub default_consistency_level: ConsistencyLevel,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "bool_true")]
    pub enable_default_farm: bool,
    #[serde(default)]
    pub enable_registrations: bool,
    #[serde(default)]
    pub id_width: IdWidth,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

/// Persistence backend selected at process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataStoreKind {
    /// Relational store (SQLite).
    #[serde(alias = "sqlite")]
    Gorm,
    /// Relational store behind the replication layer.
    Raft,
    Redis,
    #[default]
    Memory,
}

fn default_interval() -> u64 { 60 }
fn default_state_tick() -> u64 { 60 }
fn default_timezone() -> String { "UTC".into() }
fn default_database_path() -> String { "~/.cropdroid/cropdroid.db".into() }
fn bool_true() -> bool { true }

impl Default for CropDroidConfig {
    fn default() -> Self {
        Self {
            mode: FarmMode::default(),
            interval: default_interval(),
            state_ttl: 0,
            state_tick: default_state_tick(),
            data_store: DataStoreKind::default(),
            default_consistency_level: ConsistencyLevel::default(),
            timezone: default_timezone(),
            enable_default_farm: true,
            enable_registrations: false,
            id_width: IdWidth::default(),
            database_path: default_database_path(),
            device: DeviceConfig::default(),
            notification: NotificationConfig::default(),
            workflow: WorkflowConfig::default(),
        }
    }
}

impl CropDroidConfig {
    /// Load config from the default path (~/.cropdroid/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CropDroidError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| CropDroidError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| CropDroidError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the CropDroid home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cropdroid")
    }

    /// `state_ttl = 0` with a non-zero `state_tick` is accepted: the sweep
    /// simply never evicts anything.
    pub fn validate(&self) -> Result<()> {
        if self.interval < 1 {
            return Err(CropDroidError::Config("interval must be at least 1s".into()));
        }
        crate::context::parse_timezone(&self.timezone)?;
        if self.data_store == DataStoreKind::Redis {
            return Err(CropDroidError::Config(
                "data_store 'redis' is not supported by this build".into(),
            ));
        }
        if self.default_consistency_level == ConsistencyLevel::Cached {
            return Err(CropDroidError::Config(
                "default_consistency_level must be 'local' or 'quorum'".into(),
            ));
        }
        if self.notification.capacity == 0 {
            return Err(CropDroidError::Config("notification.capacity must be > 0".into()));
        }
        Ok(())
    }

    /// Per-request device timeout, never more than half the poll interval.
    pub fn device_timeout(&self, interval: u64) -> std::time::Duration {
        let half = (interval / 2).max(1);
        std::time::Duration::from_secs(self.device.timeout_secs.min(half).max(1))
    }
}

/// Device I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_device_timeout")]
    pub timeout_secs: u64,
    /// Consecutive poll failures before a device is unreachable.
    #[serde(default = "default_unreachable_after")]
    pub unreachable_after: u32,
    /// Poll deadline is `interval - margin`.
    #[serde(default = "default_deadline_margin")]
    pub tick_deadline_margin_secs: u64,
}

fn default_device_timeout() -> u64 { 10 }
fn default_unreachable_after() -> u32 { 3 }
fn default_deadline_margin() -> u64 { 5 }

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_device_timeout(),
            unreachable_after: default_unreachable_after(),
            tick_deadline_margin_secs: default_deadline_margin(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotificationSink {
    #[default]
    Log,
    Smtp,
    Webhook,
}

/// Notification queue and sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,
    #[serde(default)]
    pub sink: NotificationSink,
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
}

fn default_queue_capacity() -> usize { 256 }
fn default_dispatch_timeout() -> u64 { 15 }

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            dispatch_timeout_secs: default_dispatch_timeout(),
            sink: NotificationSink::default(),
            smtp: None,
            webhook: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    /// Plain text or `enc:<base64>`.
    pub password: String,
    pub from: String,
    pub to: Vec<String>,
}

fn default_smtp_port() -> u16 { 587 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Upper bound on a single device call made by a step.
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,
}

fn default_step_timeout() -> u64 { 10 }

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout(),
        }
    }
}
