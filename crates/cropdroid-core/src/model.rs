//! Persistent entities of the farm configuration graph.
//!
//! Relationships are ID references. Children are nested for convenience when
//! a farm is hydrated, but every entity is persisted as its own record with
//! the nested vectors emptied (see [`Entity::flat`]).

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Record kinds known to the DAO layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Organization,
    Farm,
    Device,
    DeviceSetting,
    Metric,
    Channel,
    Condition,
    Schedule,
    Workflow,
    WorkflowStep,
    User,
    Permission,
    Registration,
    EventLog,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Organization => "organization",
            EntityKind::Farm => "farm",
            EntityKind::Device => "device",
            EntityKind::DeviceSetting => "device_setting",
            EntityKind::Metric => "metric",
            EntityKind::Channel => "channel",
            EntityKind::Condition => "condition",
            EntityKind::Schedule => "schedule",
            EntityKind::Workflow => "workflow",
            EntityKind::WorkflowStep => "workflow_step",
            EntityKind::User => "user",
            EntityKind::Permission => "permission",
            EntityKind::Registration => "registration",
            EntityKind::EventLog => "event_log",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "organization" => EntityKind::Organization,
            "farm" => EntityKind::Farm,
            "device" => EntityKind::Device,
            "device_setting" => EntityKind::DeviceSetting,
            "metric" => EntityKind::Metric,
            "channel" => EntityKind::Channel,
            "condition" => EntityKind::Condition,
            "schedule" => EntityKind::Schedule,
            "workflow" => EntityKind::Workflow,
            "workflow_step" => EntityKind::WorkflowStep,
            "user" => EntityKind::User,
            "permission" => EntityKind::Permission,
            "registration" => EntityKind::Registration,
            "event_log" => EntityKind::EventLog,
            _ => return None,
        })
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persistable record type.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> u64;

    /// Owning record's ID, or 0 for roots.
    fn parent_id(&self) -> u64;

    /// Copy without nested children, as stored in its own record.
    fn flat(&self) -> Self {
        self.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FarmMode {
    /// In-process synthetic devices.
    #[default]
    Virtual,
    Server,
    Cloud,
    /// Polling continues; channels are left alone on shutdown.
    Maintenance,
}

impl FarmMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FarmMode::Virtual => "virtual",
            FarmMode::Server => "server",
            FarmMode::Cloud => "cloud",
            FarmMode::Maintenance => "maintenance",
        }
    }
}

/// Read/write freshness requested from the storage layer, weakest first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyLevel {
    #[default]
    Local,
    Cached,
    Quorum,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Organization {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub farm_ids: Vec<u64>,
    /// Created by provisioning rather than by a signup or an operator; such
    /// an organization goes away with its last farm.
    #[serde(default)]
    pub auto_created: bool,
}

impl Entity for Organization {
    const KIND: EntityKind = EntityKind::Organization;
    fn id(&self) -> u64 {
        self.id
    }
    fn parent_id(&self) -> u64 {
        0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Farm {
    pub id: u64,
    pub org_id: u64,
    pub name: String,
    #[serde(default)]
    pub mode: FarmMode,
    /// Poll cadence in seconds, at least 1.
    pub interval: u64,
    #[serde(default)]
    pub consistency: ConsistencyLevel,
    /// IANA zone used for schedule evaluation.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub user_ids: Vec<u64>,
}

fn default_timezone() -> String {
    "UTC".into()
}

impl Entity for Farm {
    const KIND: EntityKind = EntityKind::Farm;
    fn id(&self) -> u64 {
        self.id
    }
    fn parent_id(&self) -> u64 {
        self.org_id
    }
}

/// Telemetry schema family a device type string maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Server,
    Room,
    Reservoir,
    Doser,
    Generic,
}

impl DeviceKind {
    pub fn from_type(device_type: &str) -> Self {
        match device_type {
            "server" => DeviceKind::Server,
            "room" => DeviceKind::Room,
            "reservoir" => DeviceKind::Reservoir,
            "doser" => DeviceKind::Doser,
            _ => DeviceKind::Generic,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub id: u64,
    pub farm_id: u64,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub description: String,
    /// Base URI of the device HTTP contract; ignored in virtual mode.
    #[serde(default)]
    pub uri: String,
    #[serde(default = "bool_true")]
    pub enable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub settings: Vec<DeviceSetting>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<Metric>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<Channel>,
}

fn bool_true() -> bool {
    true
}

impl Device {
    pub fn kind(&self) -> DeviceKind {
        DeviceKind::from_type(&self.device_type)
    }

    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings
            .iter()
            .find(|s| s.key == key)
            .map(|s| s.value.as_str())
    }

    pub fn setting_f64(&self, key: &str) -> Option<f64> {
        self.setting(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn metric_by_key(&self, key: &str) -> Option<&Metric> {
        self.metrics.iter().find(|m| m.key == key)
    }

    pub fn channel_by_index(&self, index: usize) -> Option<&Channel> {
        self.channels.iter().find(|c| c.channel_index == index)
    }
}

impl Entity for Device {
    const KIND: EntityKind = EntityKind::Device;
    fn id(&self) -> u64 {
        self.id
    }
    fn parent_id(&self) -> u64 {
        self.farm_id
    }
    fn flat(&self) -> Self {
        Self {
            settings: Vec::new(),
            metrics: Vec::new(),
            channels: Vec::new(),
            ..self.clone()
        }
    }
}

/// Dotted key/value, unique per (device, key).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSetting {
    pub id: u64,
    pub device_id: u64,
    pub key: String,
    pub value: String,
}

impl Entity for DeviceSetting {
    const KIND: EntityKind = EntityKind::DeviceSetting;
    fn id(&self) -> u64 {
        self.id
    }
    fn parent_id(&self) -> u64 {
        self.device_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int,
    #[default]
    Float,
}

/// One sensor reading key. Live values are kept in the state store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metric {
    pub id: u64,
    pub device_id: u64,
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub unit: String,
    #[serde(default = "bool_true")]
    pub enable: bool,
    #[serde(default)]
    pub notify: bool,
    #[serde(default)]
    pub alarm_low: Option<f64>,
    #[serde(default)]
    pub alarm_high: Option<f64>,
}

impl Entity for Metric {
    const KIND: EntityKind = EntityKind::Metric;
    fn id(&self) -> u64 {
        self.id
    }
    fn parent_id(&self) -> u64 {
        self.device_id
    }
}

/// Built-in actuation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AlgorithmKind {
    /// Plain on/off switching.
    #[default]
    BangBang,
    /// Timed dose proportional to the deviation.
    Ph,
    /// One timed shot on each OFF→ON decision.
    Oxidizer,
}

impl AlgorithmKind {
    pub fn from_id(id: u64) -> Self {
        match id {
            1 => AlgorithmKind::Ph,
            2 => AlgorithmKind::Oxidizer,
            _ => AlgorithmKind::BangBang,
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            AlgorithmKind::BangBang => 0,
            AlgorithmKind::Ph => 1,
            AlgorithmKind::Oxidizer => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Algorithm {
    pub id: u64,
    pub name: String,
}

impl Algorithm {
    pub fn builtins() -> Vec<Algorithm> {
        vec![
            Algorithm { id: 0, name: "default".into() },
            Algorithm { id: 1, name: "pH".into() },
            Algorithm { id: 2, name: "Oxidizer".into() },
        ]
    }
}

/// One relay on a device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    pub id: u64,
    pub device_id: u64,
    /// 0-based slot on the device.
    pub channel_index: usize,
    pub name: String,
    #[serde(default = "bool_true")]
    pub enable: bool,
    #[serde(default)]
    pub notify: bool,
    /// Auto-off after this many seconds when > 0.
    #[serde(default)]
    pub duration: u64,
    /// Minimum on-time before an OFF is allowed.
    #[serde(default)]
    pub debounce: u64,
    /// Minimum off-time before an ON is allowed.
    #[serde(default)]
    pub backoff: u64,
    #[serde(default)]
    pub algorithm_id: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schedules: Vec<Schedule>,
}

impl Channel {
    pub fn algorithm(&self) -> AlgorithmKind {
        AlgorithmKind::from_id(self.algorithm_id)
    }
}

impl Entity for Channel {
    const KIND: EntityKind = EntityKind::Channel;
    fn id(&self) -> u64 {
        self.id
    }
    fn parent_id(&self) -> u64 {
        self.device_id
    }
    fn flat(&self) -> Self {
        Self {
            conditions: Vec::new(),
            schedules: Vec::new(),
            ..self.clone()
        }
    }
}

/// Tolerance for the `=` comparator.
pub const EQ_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "=")]
    Eq,
}

impl Comparator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Eq => "=",
        }
    }

    pub fn compare(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::Gt => value > threshold,
            Comparator::Ge => value >= threshold,
            Comparator::Lt => value < threshold,
            Comparator::Le => value <= threshold,
            Comparator::Eq => (value - threshold).abs() <= EQ_EPSILON,
        }
    }
}

/// `(metric, comparator, threshold)`. All conditions of an owner are ANDed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    pub id: u64,
    #[serde(default)]
    pub channel_id: Option<u64>,
    #[serde(default)]
    pub workflow_id: Option<u64>,
    pub metric_id: u64,
    pub comparator: Comparator,
    pub threshold: f64,
}

impl Entity for Condition {
    const KIND: EntityKind = EntityKind::Condition;
    fn id(&self) -> u64 {
        self.id
    }
    fn parent_id(&self) -> u64 {
        self.channel_id.or(self.workflow_id).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Once,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Once => "once",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
            Frequency::Yearly => "yearly",
        }
    }
}

/// Day-mask bits, Sunday first.
pub mod days {
    pub const SU: u8 = 1 << 0;
    pub const MO: u8 = 1 << 1;
    pub const TU: u8 = 1 << 2;
    pub const WE: u8 = 1 << 3;
    pub const TH: u8 = 1 << 4;
    pub const FR: u8 = 1 << 5;
    pub const SA: u8 = 1 << 6;
    pub const ALL: u8 = 0x7f;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schedule {
    pub id: u64,
    #[serde(default)]
    pub channel_id: Option<u64>,
    #[serde(default)]
    pub workflow_id: Option<u64>,
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    pub frequency: Frequency,
    /// Repeat every N units; 0 is read as 1.
    #[serde(default = "default_interval")]
    pub interval: u32,
    /// Caps total occurrences when > 0.
    #[serde(default)]
    pub count: u32,
    /// See [`days`].
    #[serde(default)]
    pub days: u8,
}

fn default_interval() -> u32 {
    1
}

impl Entity for Schedule {
    const KIND: EntityKind = EntityKind::Schedule;
    fn id(&self) -> u64 {
        self.id
    }
    fn parent_id(&self) -> u64 {
        self.channel_id.or(self.workflow_id).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    pub id: u64,
    pub farm_id: u64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schedules: Vec<Schedule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<WorkflowStep>,
}

impl Workflow {
    /// Steps in execution order.
    pub fn ordered_steps(&self) -> Vec<WorkflowStep> {
        let mut steps = self.steps.clone();
        steps.sort_by_key(|s| s.sort_order);
        steps
    }
}

impl Entity for Workflow {
    const KIND: EntityKind = EntityKind::Workflow;
    fn id(&self) -> u64 {
        self.id
    }
    fn parent_id(&self) -> u64 {
        self.farm_id
    }
    fn flat(&self) -> Self {
        Self {
            conditions: Vec::new(),
            schedules: Vec::new(),
            steps: Vec::new(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    #[default]
    Idle,
    Running,
    Waiting,
    Done,
    Failed,
}

impl StepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::Idle => "idle",
            StepState::Running => "running",
            StepState::Waiting => "waiting",
            StepState::Done => "done",
            StepState::Failed => "failed",
        }
    }

    /// idle→running→waiting→done, or →failed from running/waiting.
    pub fn can_transition(&self, next: StepState) -> bool {
        matches!(
            (self, next),
            (StepState::Idle, StepState::Running)
                | (StepState::Running, StepState::Waiting)
                | (StepState::Waiting, StepState::Done)
                | (StepState::Running, StepState::Failed)
                | (StepState::Waiting, StepState::Failed)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStep {
    pub id: u64,
    pub workflow_id: u64,
    pub device_id: u64,
    /// Channel record ID on `device_id`.
    pub channel_id: u64,
    #[serde(default)]
    pub webhook: Option<String>,
    pub duration: u64,
    #[serde(default)]
    pub wait: u64,
    #[serde(default)]
    pub sort_order: u32,
    #[serde(default)]
    pub state: StepState,
}

impl Entity for WorkflowStep {
    const KIND: EntityKind = EntityKind::WorkflowStep;
    fn id(&self) -> u64 {
        self.id
    }
    fn parent_id(&self) -> u64 {
        self.workflow_id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: u64,
    pub email: String,
}

impl Entity for User {
    const KIND: EntityKind = EntityKind::User;
    fn id(&self) -> u64 {
        self.id
    }
    fn parent_id(&self) -> u64 {
        0
    }
}

/// `(user, farm, role)` tuple the core authorises against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Permission {
    pub id: u64,
    pub user_id: u64,
    pub org_id: u64,
    pub farm_id: u64,
    pub role_id: u64,
}

impl Entity for Permission {
    const KIND: EntityKind = EntityKind::Permission;
    fn id(&self) -> u64 {
        self.id
    }
    fn parent_id(&self) -> u64 {
        self.farm_id
    }
}

/// Pending signup, consumed by the provisioner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Registration {
    pub id: u64,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

impl Entity for Registration {
    const KIND: EntityKind = EntityKind::Registration;
    fn id(&self) -> u64 {
        self.id
    }
    fn parent_id(&self) -> u64 {
        0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventLog {
    pub id: u64,
    pub farm_id: u64,
    pub device: String,
    pub event_type: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Entity for EventLog {
    const KIND: EntityKind = EntityKind::EventLog;
    fn id(&self) -> u64 {
        self.id
    }
    fn parent_id(&self) -> u64 {
        self.farm_id
    }
}
