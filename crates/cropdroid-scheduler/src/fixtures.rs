//! Small farm graphs shared by the unit tests.

use chrono::{DateTime, Utc};
use cropdroid_core::farm_config::FarmConfig;
use cropdroid_core::model::{
    Channel, Comparator, Condition, Device, DeviceSetting, Farm, FarmMode, Metric,
};
use cropdroid_core::types::DeviceSnapshot;
use std::collections::HashMap;

pub const FARM: u64 = 10;
pub const ROOM: u64 = 1;
pub const HUMIDITY: u64 = 100;
pub const TEMP: u64 = 101;
pub const DEHUMIDIFIER: u64 = 200;
pub const DOSER: u64 = 2;
pub const PH: u64 = 110;
pub const PH_DOWN: u64 = 210;

pub fn farm(tz: &str) -> Farm {
    Farm {
        id: FARM,
        org_id: 1,
        name: "greenhouse".into(),
        mode: FarmMode::Virtual,
        interval: 60,
        consistency: Default::default(),
        timezone: tz.into(),
        user_ids: vec![],
    }
}

pub fn metric(id: u64, device_id: u64, key: &str) -> Metric {
    Metric {
        id,
        device_id,
        key: key.into(),
        name: key.into(),
        data_type: Default::default(),
        unit: String::new(),
        enable: true,
        notify: true,
        alarm_low: None,
        alarm_high: None,
    }
}

pub fn channel(id: u64, device_id: u64, index: usize, name: &str) -> Channel {
    Channel {
        id,
        device_id,
        channel_index: index,
        name: name.into(),
        enable: true,
        notify: true,
        duration: 0,
        debounce: 0,
        backoff: 0,
        algorithm_id: 0,
        conditions: vec![],
        schedules: vec![],
    }
}

pub fn condition(id: u64, channel_id: u64, metric_id: u64, comparator: Comparator, threshold: f64) -> Condition {
    Condition {
        id,
        channel_id: Some(channel_id),
        workflow_id: None,
        metric_id,
        comparator,
        threshold,
    }
}

fn device(id: u64, ty: &str) -> Device {
    Device {
        id,
        farm_id: FARM,
        device_type: ty.into(),
        description: String::new(),
        uri: String::new(),
        enable: true,
        settings: vec![],
        metrics: vec![],
        channels: vec![],
    }
}

/// Room with humidity/temperature and a dehumidifier on `humidity0 > 55`,
/// doser with a pH-down pump on `pH > 6.1` (pH algorithm, 50 gallons).
pub fn graph() -> FarmConfig {
    let mut room = device(ROOM, "room");
    room.metrics = vec![metric(HUMIDITY, ROOM, "humidity0"), metric(TEMP, ROOM, "tempF0")];
    let mut dehu = channel(DEHUMIDIFIER, ROOM, 0, "dehumidifier");
    dehu.conditions = vec![condition(500, DEHUMIDIFIER, HUMIDITY, Comparator::Gt, 55.0)];
    room.channels = vec![dehu];

    let mut doser = device(DOSER, "doser");
    doser.metrics = vec![metric(PH, DOSER, "pH")];
    doser.settings = vec![DeviceSetting {
        id: 900,
        device_id: DOSER,
        key: "reservoir.gallons".into(),
        value: "50".into(),
    }];
    let mut down = channel(PH_DOWN, DOSER, 0, "phDown");
    down.algorithm_id = 1;
    down.conditions = vec![condition(501, PH_DOWN, PH, Comparator::Gt, 6.1)];
    doser.channels = vec![down];

    FarmConfig::new(farm("UTC"), vec![room, doser], vec![], vec![])
}

pub fn snapshot(metrics: &[(&str, f64)], channels: Vec<i32>, at: DateTime<Utc>) -> DeviceSnapshot {
    DeviceSnapshot::new(
        metrics.iter().map(|(k, v)| (k.to_string(), *v)).collect::<HashMap<_, _>>(),
        channels,
        at,
    )
}
