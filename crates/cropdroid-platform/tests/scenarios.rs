//! Whole-system scenarios: registry, scheduler, workers and notifications
//! running together against scripted devices.

mod common;

use std::time::Duration;

use chrono::{TimeZone, Utc};
use chrono_tz::America::New_York;
use common::*;
use cropdroid_core::model::{
    AlgorithmKind, Comparator, Frequency, Schedule, StepState, Workflow, WorkflowStep, days,
};
use cropdroid_core::types::NotificationKind;

const ROOM: u64 = 1;
const DOSER: u64 = 2;
const RESERVOIR: u64 = 3;
const HUMIDITY: u64 = 100;
const PH: u64 = 110;
const DEHUMIDIFIER: u64 = 200;
const LIGHT: u64 = 201;
const PH_DOWN: u64 = 210;
const DRAIN: u64 = 220;

fn room_with_dehumidifier(debounce: u64) -> cropdroid_core::model::Device {
    let mut room = device(ROOM, "room");
    room.metrics.push(metric(HUMIDITY, ROOM, "humidity0"));
    let mut dehumidifier = channel(DEHUMIDIFIER, ROOM, 0, "dehumidifier");
    dehumidifier.debounce = debounce;
    dehumidifier
        .conditions
        .push(condition(300, DEHUMIDIFIER, HUMIDITY, Comparator::Gt, 55.0));
    room.channels.push(dehumidifier);
    room
}

fn doser_with_ph_down() -> cropdroid_core::model::Device {
    let mut doser = device(DOSER, "doser");
    doser.settings.push(setting(400, DOSER, "reservoir.gallons", "50"));
    doser.metrics.push(metric(PH, DOSER, "pH0"));
    let mut ph_down = channel(PH_DOWN, DOSER, 0, "phDown");
    ph_down.algorithm_id = AlgorithmKind::Ph.id();
    ph_down
        .conditions
        .push(condition(310, PH_DOWN, PH, Comparator::Gt, 6.1));
    doser.channels.push(ph_down);
    doser
}

fn noon() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
}

#[tokio::test]
async fn threshold_crossing_switches_once_and_notifies() {
    let room = Scripted::new("room", &[("humidity0", 40.0)], 1);
    let house = Farmhouse::open(
        config(farm("UTC"), vec![room_with_dehumidifier(0)], vec![]),
        vec![(ROOM, room.clone())],
        noon(),
    )
    .await;
    assert!(room.calls().is_empty());

    room.set("humidity0", 75.0);
    let report = house.tick().await;
    assert_eq!(report.commands.len(), 1);
    assert_eq!(room.calls(), vec!["switch(0,1)"]);
    assert_eq!(house.queued(NotificationKind::ChannelSwitched), 1);
    assert!(house.delivered(NotificationKind::ChannelSwitched, 1).await);

    // Same readings: nothing new.
    house.tick().await;
    assert_eq!(room.calls().len(), 1);
    assert_eq!(house.queued(NotificationKind::ChannelSwitched), 1);

    // Shutdown turns the dehumidifier back off.
    house.close().await;
    assert_eq!(room.calls(), vec!["switch(0,1)", "switch(0,0)"]);
}

#[tokio::test]
async fn debounce_holds_off_until_elapsed() {
    let room = Scripted::new("room", &[("humidity0", 40.0)], 1);
    let house = Farmhouse::open(
        config(farm("UTC"), vec![room_with_dehumidifier(10)], vec![]),
        vec![(ROOM, room.clone())],
        noon(),
    )
    .await;

    room.set("humidity0", 75.0);
    house.tick().await;
    assert_eq!(room.calls(), vec!["switch(0,1)"]);

    room.set("humidity0", 40.0);
    house.advance(3);
    let report = house.tick().await;
    assert_eq!(report.deferred, 1);
    house.advance(6);
    house.tick().await;
    assert_eq!(room.calls(), vec!["switch(0,1)"]);

    house.advance(1);
    house.tick().await;
    assert_eq!(room.calls(), vec!["switch(0,1)", "switch(0,0)"]);
    house.close().await;
}

#[tokio::test]
async fn daily_light_cycle_in_farm_timezone() {
    let start = New_York
        .with_ymd_and_hms(2026, 6, 1, 19, 0, 0)
        .unwrap()
        .with_timezone(&Utc);
    let mut room = device(ROOM, "room");
    let mut light = channel(LIGHT, ROOM, 0, "light");
    light.duration = 64_800;
    light.schedules.push(Schedule {
        id: 500,
        channel_id: Some(LIGHT),
        workflow_id: None,
        start_date: start,
        end_date: None,
        frequency: Frequency::Daily,
        interval: 1,
        count: 0,
        days: days::ALL,
    });
    room.channels.push(light);

    let client = Scripted::new("room", &[], 1);
    let house = Farmhouse::open(
        config(farm("America/New_York"), vec![room], vec![]),
        vec![(ROOM, client.clone())],
        start - chrono::Duration::hours(1),
    )
    .await;
    assert!(client.calls().is_empty());

    house.set_time(start);
    house.tick().await;
    assert_eq!(client.calls(), vec!["switch(0,1)"]);

    let last_second = New_York
        .with_ymd_and_hms(2026, 6, 2, 12, 59, 59)
        .unwrap()
        .with_timezone(&Utc);
    house.set_time(last_second);
    house.tick().await;
    assert_eq!(client.calls().len(), 1);

    house.set_time(last_second + chrono::Duration::seconds(1));
    house.tick().await;
    assert_eq!(client.calls(), vec!["switch(0,1)", "switch(0,0)"]);
    house.close().await;
}

#[tokio::test]
async fn ph_algorithm_doses_with_a_timer() {
    let doser = Scripted::new("doser", &[("pH0", 6.0)], 1);
    let house = Farmhouse::open(
        config(farm("UTC"), vec![doser_with_ph_down()], vec![]),
        vec![(DOSER, doser.clone())],
        noon(),
    )
    .await;

    doser.set("pH0", 6.4);
    house.tick().await;
    // 0.3 pH × 0.6 × 50 gal
    assert_eq!(doser.calls(), vec!["timer(0,9)"]);

    house.tick().await;
    assert_eq!(doser.calls(), vec!["timer(0,9)"]);
    assert!(!doser.calls().iter().any(|c| c.starts_with("switch(0,1")));
    house.close().await;
}

#[tokio::test(start_paused = true)]
async fn workflow_runs_steps_in_order_and_rejects_second_trigger() {
    let mut reservoir = device(RESERVOIR, "reservoir");
    reservoir.channels.push(channel(DRAIN, RESERVOIR, 0, "drain"));
    let mut doser = device(DOSER, "doser");
    doser.channels.push(channel(PH_DOWN, DOSER, 0, "phDown"));
    let step = |id, device_id, channel_id, duration, wait, sort_order| WorkflowStep {
        id,
        workflow_id: 900,
        device_id,
        channel_id,
        webhook: None,
        duration,
        wait,
        sort_order,
        state: StepState::Idle,
    };
    let workflow = Workflow {
        id: 900,
        farm_id: FARM,
        name: "reservoir change".into(),
        conditions: vec![],
        schedules: vec![],
        steps: vec![
            step(901, RESERVOIR, DRAIN, 5, 2, 1),
            step(902, DOSER, PH_DOWN, 3, 0, 2),
        ],
    };

    let reservoir_client = Scripted::new("reservoir", &[], 1);
    let doser_client = Scripted::new("doser", &[], 1);
    let house = Farmhouse::open(
        config(farm("UTC"), vec![reservoir, doser], vec![workflow]),
        vec![
            (RESERVOIR, reservoir_client.clone()),
            (DOSER, doser_client.clone()),
        ],
        noon(),
    )
    .await;

    let workflows = house.registry.workflows();
    let handle = workflows.trigger(&house.session, FARM, 900).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let busy = workflows.trigger(&house.session, FARM, 900).await.unwrap_err();
    assert_eq!(busy.http_status(), 423);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(doser_client.calls().is_empty());

    let run = handle.await.unwrap();
    assert!(run.completed());
    assert!(run.steps.iter().all(|s| s.state == StepState::Done));
    assert_eq!(reservoir_client.timed_calls(), vec![("timer(0,5)".to_string(), 0)]);
    assert_eq!(doser_client.timed_calls(), vec![("timer(0,3)".to_string(), 7)]);
    assert!(house.delivered(NotificationKind::Workflow, 1).await);
    house.close().await;
}

#[tokio::test]
async fn unreachable_device_is_isolated_and_recovers() {
    let room = Scripted::new("room", &[("humidity0", 40.0)], 1);
    let doser = Scripted::new("doser", &[("pH0", 6.0)], 1);
    let house = Farmhouse::open(
        config(
            farm("UTC"),
            vec![room_with_dehumidifier(0), doser_with_ph_down()],
            vec![],
        ),
        vec![(ROOM, room.clone()), (DOSER, doser.clone())],
        noon(),
    )
    .await;

    doser.set_down(true);
    house.tick().await;
    house.tick().await;
    assert_eq!(house.queued(NotificationKind::DeviceUnreachable), 0);

    room.set("humidity0", 75.0);
    let report = house.tick().await;
    assert_eq!(report.failed, vec!["doser".to_string()]);
    assert_eq!(house.queued(NotificationKind::DeviceUnreachable), 1);
    assert_eq!(room.calls(), vec!["switch(0,1)"]);

    // Still down with a reading that would dose: nothing reaches it.
    doser.set("pH0", 6.4);
    house.tick().await;
    assert!(doser.calls().is_empty());
    assert_eq!(house.queued(NotificationKind::DeviceUnreachable), 1);

    doser.set_down(false);
    house.tick().await;
    assert_eq!(house.queued(NotificationKind::DeviceRecovered), 1);
    assert!(house.delivered(NotificationKind::DeviceRecovered, 1).await);

    let events = house
        .registry
        .events()
        .list(&house.session, FARM, 0, 50)
        .await
        .unwrap();
    let types: Vec<&str> = events.entities.iter().map(|e| e.event_type.as_str()).collect();
    assert!(types.contains(&"unreachable"));
    assert!(types.contains(&"recovered"));
    house.close().await;
}
