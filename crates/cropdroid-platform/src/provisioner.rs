//! Farm provisioner: materialise a farm graph from the template and persist
//! it in one batch.
//!
//! Every ID is a content hash of its parents and defining fields, so two
//! nodes provisioning the same template for the same org converge on the
//! same records. A write conflict retries with the farm name salted `#n`,
//! which moves the whole graph to fresh IDs.

use chrono::{NaiveDate, TimeZone, Utc};
use cropdroid_core::config::CropDroidConfig;
use cropdroid_core::context::parse_timezone;
use cropdroid_core::error::{CropDroidError, Result};
use cropdroid_core::farm_config::FarmConfig;
use cropdroid_core::ids::IdHasher;
use cropdroid_core::model::{
    AlgorithmKind, Channel, Comparator, Condition, ConsistencyLevel, Device, DeviceSetting, Farm,
    FarmMode, Frequency, Metric, Organization, Permission, Registration, Schedule, StepState, User,
    Workflow, WorkflowStep, days,
};
use cropdroid_core::session::Role;
use cropdroid_core::traits::{Mutation, PageQuery, Record};
use cropdroid_db::dao::Dao;
use tokio::sync::mpsc;

const MAX_ATTEMPTS: u32 = 3;

/// Farm-level choices; everything below the farm comes from the template.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionParams {
    pub org_id: u64,
    pub farm_name: String,
    pub mode: FarmMode,
    pub interval: u64,
    pub timezone: String,
    pub consistency: ConsistencyLevel,
}

impl ProvisionParams {
    /// Farm defaults taken from the process configuration.
    pub fn from_config(org_id: u64, farm_name: &str, config: &CropDroidConfig) -> Self {
        Self {
            org_id,
            farm_name: farm_name.to_string(),
            mode: config.mode,
            interval: config.interval,
            timezone: config.timezone.clone(),
            consistency: config.default_consistency_level,
        }
    }
}

/// Builds one device of the template with derived IDs.
struct DeviceBuilder<'a> {
    hasher: &'a IdHasher,
    device: Device,
}

impl<'a> DeviceBuilder<'a> {
    fn new(hasher: &'a IdHasher, farm_id: u64, device_type: &str, description: &str) -> Self {
        Self {
            hasher,
            device: Device {
                id: hasher.device_id(farm_id, device_type),
                farm_id,
                device_type: device_type.to_string(),
                description: description.to_string(),
                uri: String::new(),
                enable: true,
                settings: vec![],
                metrics: vec![],
                channels: vec![],
            },
        }
    }

    fn setting(mut self, key: &str, value: &str) -> Self {
        self.device.settings.push(DeviceSetting {
            id: self.hasher.setting_id(self.device.id, key),
            device_id: self.device.id,
            key: key.to_string(),
            value: value.to_string(),
        });
        self
    }

    fn metric(mut self, key: &str, name: &str, unit: &str, alarm: Option<(f64, f64)>) -> Self {
        self.device.metrics.push(Metric {
            id: self.hasher.metric_id(self.device.id, key),
            device_id: self.device.id,
            key: key.to_string(),
            name: name.to_string(),
            data_type: Default::default(),
            unit: unit.to_string(),
            enable: true,
            notify: alarm.is_some(),
            alarm_low: alarm.map(|a| a.0),
            alarm_high: alarm.map(|a| a.1),
        });
        self
    }

    fn channel(mut self, index: usize, name: &str, algorithm: AlgorithmKind, duration: u64) -> Self {
        self.device.channels.push(Channel {
            id: self.hasher.channel_id(self.device.id, name),
            device_id: self.device.id,
            channel_index: index,
            name: name.to_string(),
            enable: true,
            notify: true,
            duration,
            debounce: 0,
            backoff: 0,
            algorithm_id: algorithm.id(),
            conditions: vec![],
            schedules: vec![],
        });
        self
    }

    fn metric_id(&self, key: &str) -> u64 {
        self.hasher.metric_id(self.device.id, key)
    }

    fn channel_id(&self, name: &str) -> u64 {
        self.hasher.channel_id(self.device.id, name)
    }

    fn build(self) -> Device {
        self.device
    }
}

fn condition(hasher: &IdHasher, device_id: u64, channel_id: u64, metric_id: u64, comparator: Comparator, threshold: f64) -> Condition {
    Condition {
        id: hasher.condition_id(device_id, 0, channel_id, metric_id, comparator.as_str(), threshold),
        channel_id: Some(channel_id),
        workflow_id: None,
        metric_id,
        comparator,
        threshold,
    }
}

fn attach_condition(devices: &mut [Device], c: Condition) {
    let Some(channel_id) = c.channel_id else {
        return;
    };
    for device in devices.iter_mut() {
        if let Some(ch) = device.channels.iter_mut().find(|ch| ch.id == channel_id) {
            ch.conditions.push(c);
            return;
        }
    }
}

/// The stock farm: a flower room, a reservoir and a doser.
pub fn default_template(hasher: &IdHasher, farm: Farm, user_id: u64) -> Result<FarmConfig> {
    let tz = parse_timezone(&farm.timezone)?;
    let farm_id = farm.id;

    let room = DeviceBuilder::new(hasher, farm_id, "room", "Flower room")
        .metric("tempF0", "Temperature", "°F", Some((60.0, 85.0)))
        .metric("humidity0", "Humidity", "%", Some((30.0, 70.0)))
        .metric("co2", "CO2", "ppm", None)
        .channel(0, "light", AlgorithmKind::BangBang, 64_800)
        .channel(1, "dehumidifier", AlgorithmKind::BangBang, 0)
        .channel(2, "heater", AlgorithmKind::BangBang, 0)
        .channel(3, "exhaust", AlgorithmKind::BangBang, 0);
    let reservoir = DeviceBuilder::new(hasher, farm_id, "reservoir", "Nutrient reservoir")
        .setting("reservoir.gallons", "50")
        .metric("pH0", "pH", "", Some((5.4, 6.6)))
        .metric("ec0", "EC", "mS/cm", None)
        .metric("orp0", "ORP", "mV", None)
        .metric("waterTemp0", "Water temperature", "°F", Some((60.0, 75.0)))
        .channel(0, "drain", AlgorithmKind::BangBang, 0)
        .channel(1, "fill", AlgorithmKind::BangBang, 0)
        .channel(2, "aerator", AlgorithmKind::BangBang, 0);
    let doser = DeviceBuilder::new(hasher, farm_id, "doser", "Dosing pumps")
        .setting("ph.dose_factor", "0.6")
        .setting("oxidizer.seconds", "30")
        .channel(0, "phDown", AlgorithmKind::Ph, 0)
        .channel(1, "phUp", AlgorithmKind::Ph, 0)
        .channel(2, "oxidizer", AlgorithmKind::Oxidizer, 0);

    let conditions = vec![
        condition(hasher, room.device.id, room.channel_id("dehumidifier"), room.metric_id("humidity0"), Comparator::Gt, 55.0),
        condition(hasher, room.device.id, room.channel_id("heater"), room.metric_id("tempF0"), Comparator::Lt, 65.0),
        condition(hasher, room.device.id, room.channel_id("exhaust"), room.metric_id("tempF0"), Comparator::Gt, 82.0),
        condition(hasher, doser.device.id, doser.channel_id("phDown"), reservoir.metric_id("pH0"), Comparator::Gt, 6.2),
        condition(hasher, doser.device.id, doser.channel_id("phUp"), reservoir.metric_id("pH0"), Comparator::Lt, 5.6),
        condition(hasher, doser.device.id, doser.channel_id("oxidizer"), reservoir.metric_id("orp0"), Comparator::Lt, 250.0),
    ];

    // Lights on at 06:00 farm time for 18h, every day.
    let naive = NaiveDate::from_ymd_opt(2024, 1, 1)
        .and_then(|d| d.and_hms_opt(6, 0, 0))
        .ok_or_else(|| CropDroidError::Invariant("bad template start date".into()))?;
    let start = tz
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| CropDroidError::Invariant("template start not representable".into()))?
        .with_timezone(&Utc);
    let light_id = room.channel_id("light");
    let light_schedule = Schedule {
        id: hasher.schedule_id(
            farm_id,
            room.device.id,
            light_id,
            &start.to_rfc3339(),
            "",
            Frequency::Daily.as_str(),
            0,
        ),
        channel_id: Some(light_id),
        workflow_id: None,
        start_date: start,
        end_date: None,
        frequency: Frequency::Daily,
        interval: 1,
        count: 0,
        days: days::ALL,
    };

    let workflow_id = hasher.workflow_id(farm_id, "reservoir change");
    let step = |order: u32, device: &DeviceBuilder, channel: &str, duration: u64, wait: u64| {
        let channel_id = device.channel_id(channel);
        WorkflowStep {
            id: hasher.workflow_step_id(
                workflow_id,
                device.device.id,
                channel_id,
                duration as u32,
                StepState::Idle.as_str(),
            ),
            workflow_id,
            device_id: device.device.id,
            channel_id,
            webhook: None,
            duration,
            wait,
            sort_order: order,
            state: Default::default(),
        }
    };
    let workflow = Workflow {
        id: workflow_id,
        farm_id,
        name: "reservoir change".into(),
        conditions: vec![],
        schedules: vec![],
        steps: vec![
            step(1, &reservoir, "drain", 300, 30),
            step(2, &reservoir, "fill", 600, 60),
            step(3, &doser, "phDown", 5, 0),
        ],
    };

    let mut devices = vec![room.build(), reservoir.build(), doser.build()];
    for c in conditions {
        attach_condition(&mut devices, c);
    }
    if let Some(light) = devices[0].channels.iter_mut().find(|c| c.id == light_id) {
        light.schedules.push(light_schedule);
    }

    let role = Role::Admin.id();
    let permission = Permission {
        id: hasher.permission_id(user_id, farm_id, role),
        user_id,
        org_id: farm.org_id,
        farm_id,
        role_id: role,
    };
    let mut farm = farm;
    farm.user_ids = vec![user_id];
    let config = FarmConfig::new(farm, devices, vec![workflow], vec![permission]);
    config.validate()?;
    Ok(config)
}

pub struct Provisioner {
    dao: Dao,
    hasher: IdHasher,
    provisioned: mpsc::Sender<FarmConfig>,
    deprovisioned: mpsc::Sender<u64>,
}

impl Provisioner {
    pub fn new(
        dao: Dao,
        hasher: IdHasher,
        provisioned: mpsc::Sender<FarmConfig>,
        deprovisioned: mpsc::Sender<u64>,
    ) -> Self {
        Self {
            dao,
            hasher,
            provisioned,
            deprovisioned,
        }
    }

    pub fn hasher(&self) -> &IdHasher {
        &self.hasher
    }

    /// Farm ID for `name`, salted for retry `attempt`.
    fn farm_id(&self, org_id: u64, name: &str, attempt: u32) -> u64 {
        if attempt == 0 {
            self.hasher.farm_id(org_id, name)
        } else {
            self.hasher.farm_id(org_id, &format!("{name}#{attempt}"))
        }
    }

    pub fn build(&self, user: &User, params: &ProvisionParams, attempt: u32) -> Result<FarmConfig> {
        let farm = Farm {
            id: self.farm_id(params.org_id, &params.farm_name, attempt),
            org_id: params.org_id,
            name: params.farm_name.clone(),
            mode: params.mode,
            interval: params.interval.max(1),
            consistency: params.consistency,
            timezone: params.timezone.clone(),
            user_ids: vec![],
        };
        default_template(&self.hasher, farm, user.id)
    }

    /// Persist a template farm for `user` and hand it to the registry.
    pub async fn provision(&self, user: &User, params: &ProvisionParams) -> Result<FarmConfig> {
        let org = self.dao.find::<Organization>(params.org_id, ConsistencyLevel::Local).await?;
        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            let config = self.build(user, params, attempt)?;
            let mut batch = Dao::farm_graph_mutations(&config, true)?;
            let mut org = org.clone().unwrap_or_else(|| Organization {
                id: params.org_id,
                name: params.farm_name.clone(),
                farm_ids: vec![],
                auto_created: true,
            });
            if !org.farm_ids.contains(&config.farm.id) {
                org.farm_ids.push(config.farm.id);
            }
            batch.push(Mutation::Upsert(Record::from_entity(&org, 0)?));
            let records = batch.len();

            let level = self.dao.write_level(params.consistency);
            match self.dao.apply(batch, level).await {
                Ok(()) => {
                    tracing::info!(
                        "🌱 Provisioned farm '{}' ({}) for org {} in {records} records",
                        config.farm.name,
                        config.farm.id,
                        params.org_id
                    );
                    if self.provisioned.send(config.clone()).await.is_err() {
                        tracing::warn!("⚠️ provisioned channel closed; farm {} not scheduled", config.farm.id);
                    }
                    return Ok(config);
                }
                Err(CropDroidError::StoreConflict(reason)) => {
                    tracing::warn!(
                        "⚠️ provision attempt {} for '{}' conflicted: {reason}",
                        attempt + 1,
                        params.farm_name
                    );
                    last_err = Some(CropDroidError::StoreConflict(reason));
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| CropDroidError::StoreConflict(params.farm_name.clone())))
    }

    /// Delete every record of the farm and its permissions. An organization
    /// that provisioning created is dropped with its last farm; any other
    /// organization only loses the farm ID.
    pub async fn deprovision(&self, farm_id: u64) -> Result<usize> {
        let farm = self.dao.get::<Farm>(farm_id, ConsistencyLevel::Local).await?;
        let level = self.dao.write_level(farm.consistency);
        let deleted = self.dao.delete_farm_graph(farm_id, level).await?;

        if let Some(mut org) = self.dao.find::<Organization>(farm.org_id, ConsistencyLevel::Local).await? {
            org.farm_ids.retain(|id| *id != farm_id);
            if org.farm_ids.is_empty() && org.auto_created {
                self.dao.delete::<Organization>(org.id, level).await?;
            } else {
                self.dao.put(0, &org, level).await?;
            }
        }
        tracing::info!("🗑️ Deprovisioned farm '{}' ({deleted} records)", farm.name);
        if self.deprovisioned.send(farm_id).await.is_err() {
            tracing::warn!("⚠️ deprovisioned channel closed");
        }
        Ok(deleted)
    }

    pub fn user_for_email(&self, email: &str) -> User {
        User {
            id: self.hasher.hash(&[&"user", &email]),
            email: email.to_string(),
        }
    }

    /// Consume a pending signup: user, organization, default farm.
    pub async fn provision_registration(&self, registration_id: u64, config: &CropDroidConfig) -> Result<FarmConfig> {
        let registration = self
            .dao
            .get::<Registration>(registration_id, ConsistencyLevel::Local)
            .await?;
        let user = self.user_for_email(&registration.email);
        let level = self.dao.write_level(config.default_consistency_level);
        self.dao.put(0, &user, level).await?;

        let org_id = self.hasher.organization_id(&registration.email);
        if self.dao.find::<Organization>(org_id, ConsistencyLevel::Local).await?.is_none() {
            let org = Organization {
                id: org_id,
                name: registration.email.clone(),
                farm_ids: vec![],
                auto_created: false,
            };
            self.dao.insert(0, &org, level).await?;
        }
        let params = ProvisionParams::from_config(org_id, "default", config);
        let farm = self.provision(&user, &params).await?;
        self.dao.delete::<Registration>(registration_id, level).await?;
        tracing::info!("✅ Registration {} → farm {}", registration.email, farm.farm.id);
        Ok(farm)
    }

    /// Provision the template once on an empty store.
    pub async fn seed_default_farm(&self, config: &CropDroidConfig) -> Result<Option<FarmConfig>> {
        if !config.enable_default_farm {
            return Ok(None);
        }
        let any = self
            .dao
            .get_page::<Farm>(&PageQuery::default().with_page(0, 1), ConsistencyLevel::Local)
            .await?;
        if !any.entities.is_empty() {
            return Ok(None);
        }
        let user = self.user_for_email("admin@localhost");
        let level = self.dao.write_level(config.default_consistency_level);
        self.dao.put(0, &user, level).await?;
        let org_id = self.hasher.organization_id("cropdroid");
        let org = Organization {
            id: org_id,
            name: "cropdroid".into(),
            farm_ids: vec![],
            auto_created: false,
        };
        self.dao.put(0, &org, level).await?;
        tracing::info!("🌾 Empty store: seeding the default farm");
        let params = ProvisionParams::from_config(org_id, "default", config);
        self.provision(&user, &params).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cropdroid_core::model::EntityKind;
    use cropdroid_core::traits::RecordStore;
    use cropdroid_db::memory::MemoryStore;
    use std::sync::Arc;

    struct Setup {
        provisioner: Provisioner,
        store: Arc<MemoryStore>,
        provisioned: mpsc::Receiver<FarmConfig>,
        deprovisioned: mpsc::Receiver<u64>,
    }

    fn setup() -> Setup {
        let store = Arc::new(MemoryStore::new());
        let dao = Dao::new(store.clone(), ConsistencyLevel::Local);
        let (ptx, prx) = mpsc::channel(8);
        let (dtx, drx) = mpsc::channel(8);
        Setup {
            provisioner: Provisioner::new(dao, IdHasher::default(), ptx, dtx),
            store,
            provisioned: prx,
            deprovisioned: drx,
        }
    }

    fn params() -> ProvisionParams {
        ProvisionParams::from_config(42, "greenhouse", &CropDroidConfig::default())
    }

    fn user() -> User {
        User {
            id: 7,
            email: "grower@example.com".into(),
        }
    }

    #[test]
    fn test_template_ids_are_deterministic() {
        let s = setup();
        let a = s.provisioner.build(&user(), &params(), 0).unwrap();
        let b = s.provisioner.build(&user(), &params(), 0).unwrap();
        assert_eq!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&b).unwrap());
        let salted = s.provisioner.build(&user(), &params(), 1).unwrap();
        assert_ne!(a.farm.id, salted.farm.id);
        assert_ne!(a.devices[0].id, salted.devices[0].id);
        assert_eq!(a.devices.len(), 3);
        assert_eq!(a.permissions[0].role_id, Role::Admin.id());
        assert!(a.validate().is_ok());
    }

    #[tokio::test]
    async fn test_provision_emits_and_persists() {
        let mut s = setup();
        let config = s.provisioner.provision(&user(), &params()).await.unwrap();
        let emitted = s.provisioned.recv().await.unwrap();
        assert_eq!(emitted.farm.id, config.farm.id);
        let org = s
            .store
            .get(EntityKind::Organization, 42, ConsistencyLevel::Local)
            .await
            .unwrap()
            .unwrap()
            .decode::<Organization>()
            .unwrap();
        assert_eq!(org.farm_ids, vec![config.farm.id]);
    }

    #[tokio::test]
    async fn test_conflict_retries_with_fresh_ids() {
        let mut s = setup();
        let first = s.provisioner.provision(&user(), &params()).await.unwrap();
        let second = s.provisioner.provision(&user(), &params()).await.unwrap();
        assert_ne!(first.farm.id, second.farm.id);
        assert_eq!(second.farm.id, s.provisioner.build(&user(), &params(), 1).unwrap().farm.id);
        s.provisioned.recv().await.unwrap();
        s.provisioned.recv().await.unwrap();
    }

    #[tokio::test]
    async fn test_provision_deprovision_round_trip() {
        let mut s = setup();
        assert!(s.store.is_empty());
        let config = s.provisioner.provision(&user(), &params()).await.unwrap();
        s.provisioner.deprovision(config.farm.id).await.unwrap();
        assert_eq!(s.deprovisioned.recv().await, Some(config.farm.id));
        assert!(s.store.is_empty());
        let missing = s.provisioner.deprovision(config.farm.id).await.unwrap_err();
        assert_eq!(missing.http_status(), 404);
    }

    #[tokio::test]
    async fn test_round_trip_keeps_existing_org() {
        let mut s = setup();
        let existing = Organization {
            id: 42,
            name: "acme".into(),
            farm_ids: vec![],
            auto_created: false,
        };
        s.provisioner
            .dao
            .put(0, &existing, ConsistencyLevel::Local)
            .await
            .unwrap();
        let config = s.provisioner.provision(&user(), &params()).await.unwrap();
        s.provisioner.deprovision(config.farm.id).await.unwrap();
        assert_eq!(s.deprovisioned.recv().await, Some(config.farm.id));

        let org = s
            .store
            .get(EntityKind::Organization, 42, ConsistencyLevel::Local)
            .await
            .unwrap()
            .unwrap()
            .decode::<Organization>()
            .unwrap();
        assert_eq!(org, existing);
        assert_eq!(s.store.len(), 1);
    }

    #[tokio::test]
    async fn test_registration_consumed() {
        let s = setup();
        let registration = Registration {
            id: 555,
            email: "new@farm.io".into(),
            created_at: Utc::now(),
        };
        s.provisioner
            .dao
            .insert(0, &registration, ConsistencyLevel::Local)
            .await
            .unwrap();
        let farm = s
            .provisioner
            .provision_registration(555, &CropDroidConfig::default())
            .await
            .unwrap();
        let user = s.provisioner.user_for_email("new@farm.io");
        assert_eq!(farm.farm.user_ids, vec![user.id]);
        assert!(
            s.provisioner
                .dao
                .find::<Registration>(555, ConsistencyLevel::Local)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_seed_only_on_empty_store() {
        let s = setup();
        let config = CropDroidConfig::default();
        assert!(s.provisioner.seed_default_farm(&config).await.unwrap().is_some());
        assert!(s.provisioner.seed_default_farm(&config).await.unwrap().is_none());
    }
}
