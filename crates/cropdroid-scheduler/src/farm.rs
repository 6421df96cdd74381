//! Per-farm supervisor: the poll → evaluate → actuate loop.
//!
//! One tick:
//! 1. poll every enabled device in parallel, bounded by `interval - margin`
//! 2. fold results into the state store and device health
//! 3. alarms, then the rule engine over the assembled state map
//! 4. actuate, serially per device, under the device's actuation lock
//! 5. start workflows whose schedule or conditions just became true
//!
//! The next tick never starts before the previous one has finished.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cropdroid_core::config::CropDroidConfig;
use cropdroid_core::context::FarmContext;
use cropdroid_core::error::{CropDroidError, Result};
use cropdroid_core::farm_config::{ConfigHandle, FarmConfig};
use cropdroid_core::model::{FarmMode, Workflow};
use cropdroid_core::types::{CHANNEL_OFF, CHANNEL_ON, Notification, NotificationKind};
use cropdroid_devices::{DeviceWorker, HealthTransition, SwitchOutcome};
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::alarms::AlarmTracker;
use crate::events::EventLogService;
use crate::notify::NotificationQueue;
use crate::rules::{self, Command, CommandAction, RuleEngine};
use crate::schedule;
use crate::state::{StateMap, StateStore};
use crate::workflow::{WorkerMap, WorkflowExecutor, WorkflowRun};

/// What one tick did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub tick: u64,
    pub polled: usize,
    /// Device types whose poll failed or missed the deadline.
    pub failed: Vec<String>,
    pub commands: Vec<Command>,
    pub applied: usize,
    pub deferred: usize,
    /// Devices left alone because a workflow step holds them.
    pub busy: Vec<String>,
    pub workflows_started: Vec<u64>,
}

pub struct FarmScheduler {
    ctx: FarmContext,
    config: ConfigHandle,
    workers: WorkerMap,
    state: Arc<StateStore>,
    queue: NotificationQueue,
    events: Arc<EventLogService>,
    workflows: WorkflowExecutor,
    rules: Mutex<RuleEngine>,
    alarms: Mutex<AlarmTracker>,
    workflow_edges: Mutex<HashMap<u64, bool>>,
    tick_lock: tokio::sync::Mutex<()>,
    ticks: AtomicU64,
    running: AtomicBool,
    deadline_margin: Duration,
}

impl FarmScheduler {
    pub fn new(
        ctx: FarmContext,
        config: ConfigHandle,
        workers: WorkerMap,
        state: Arc<StateStore>,
        queue: NotificationQueue,
        events: Arc<EventLogService>,
        settings: &CropDroidConfig,
    ) -> Self {
        let workflows = WorkflowExecutor::new(Duration::from_secs(settings.workflow.step_timeout_secs))
            .with_notifications(queue.clone())
            .with_events(events.clone());
        Self {
            ctx,
            config,
            workers,
            state,
            queue,
            events,
            workflows,
            rules: Mutex::new(RuleEngine::new()),
            alarms: Mutex::new(AlarmTracker::new()),
            workflow_edges: Mutex::new(HashMap::new()),
            tick_lock: tokio::sync::Mutex::new(()),
            ticks: AtomicU64::new(0),
            running: AtomicBool::new(false),
            deadline_margin: Duration::from_secs(settings.device.tick_deadline_margin_secs),
        }
    }

    pub fn farm_id(&self) -> u64 {
        self.ctx.farm_id
    }

    pub fn context(&self) -> &FarmContext {
        &self.ctx
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn workers(&self) -> &WorkerMap {
        &self.workers
    }

    pub fn worker(&self, device_id: u64) -> Option<&Arc<DeviceWorker>> {
        self.workers.get(&device_id)
    }

    pub fn workflows(&self) -> &WorkflowExecutor {
        &self.workflows
    }

    pub fn events(&self) -> &Arc<EventLogService> {
        &self.events
    }

    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Drop remembered decisions for a reconfigured channel.
    pub fn channel_changed(&self, channel_id: u64) {
        self.rules.lock().unwrap_or_else(|e| e.into_inner()).forget(channel_id);
    }

    fn poll_deadline(&self) -> Duration {
        self.ctx
            .interval
            .saturating_sub(self.deadline_margin)
            .max(Duration::from_secs(1))
    }

    fn notify(&self, device: &str, kind: NotificationKind, message: String, now: DateTime<Utc>) {
        self.queue.offer(Notification::new(self.ctx.farm_id, device, kind, message, now));
    }

    /// Loop until the farm's token is cancelled, then wind down.
    /// A second call while running returns immediately.
    pub async fn run(self: Arc<Self>, mut tick_rx: mpsc::Receiver<()>) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("farm {} already running", self.ctx.farm_id);
            return;
        }
        tracing::info!("🌱 farm '{}' scheduler started ({:?} interval)", self.ctx.name, self.ctx.interval);

        let mut interval = tokio::time::interval(self.ctx.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.tick_once().await;
                }
                Some(()) = tick_rx.recv() => {
                    tracing::debug!("external tick requested");
                    self.tick_once().await;
                }
            }
        }
        self.shutdown().await;
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("🛑 farm '{}' scheduler stopped", self.ctx.name);
    }

    /// Spawn [`FarmScheduler::run`] inside the farm's span.
    pub fn spawn(self: &Arc<Self>, tick_rx: mpsc::Receiver<()>) -> JoinHandle<()> {
        use tracing::Instrument;
        let span = self.ctx.span.clone();
        tokio::spawn(self.clone().run(tick_rx).instrument(span))
    }

    pub async fn tick_once(&self) -> TickReport {
        let _serial = self.tick_lock.lock().await;
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        let config = self.config.load();
        let now = self.ctx.now();
        let mut report = TickReport {
            tick,
            ..TickReport::default()
        };

        self.poll_all(&config, now, &mut report).await;

        let state = self.state.snapshot(self.ctx.farm_id);
        let alarms = self
            .alarms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .evaluate(&config, &state, now);
        for alarm in alarms {
            self.queue.offer(alarm);
        }

        let skip: HashSet<u64> = config
            .devices
            .iter()
            .filter(|d| self.workers.get(&d.id).is_none_or(|w| !w.is_reachable()))
            .map(|d| d.id)
            .collect();
        let evaluation = self
            .rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .evaluate(&config, &state, &skip, now, self.ctx.timezone);
        for invalid in evaluation.invalid {
            let message = format!(
                "schedule {} on channel {} is invalid: {}",
                invalid.schedule_id, invalid.channel_id, invalid.reason
            );
            tracing::error!("❌ {message}");
            self.notify(&invalid.device_type, NotificationKind::ScheduleInvalid, message.clone(), now);
            self.events.record(&invalid.device_type, "schedule_invalid", message).await;
        }

        self.actuate(&config, &evaluation.commands, now, &mut report).await;
        report.commands = evaluation.commands;

        self.advance_workflows(&config, &state, now, &mut report);
        tracing::debug!(
            "tick {tick}: {} polled, {} failed, {} commands, {} applied",
            report.polled,
            report.failed.len(),
            report.commands.len(),
            report.applied
        );
        report
    }

    async fn poll_all(&self, config: &FarmConfig, now: DateTime<Utc>, report: &mut TickReport) {
        let deadline = self.poll_deadline();
        let polls = config
            .devices
            .iter()
            .filter(|d| d.enable)
            .filter_map(|d| self.workers.get(&d.id).map(|w| (d, w.clone())))
            .map(|(device, worker)| async move {
                let outcome = tokio::time::timeout(deadline, worker.poll(now)).await;
                (device, worker, outcome)
            });

        for (device, worker, outcome) in join_all(polls).await {
            let transition = match outcome {
                Ok(outcome) => {
                    match outcome.result {
                        Ok(snapshot) => {
                            report.polled += 1;
                            self.state
                                .put(self.ctx.farm_id, &device.device_type, device.id, snapshot);
                        }
                        Err(_) => report.failed.push(device.device_type.clone()),
                    }
                    outcome.transition
                }
                Err(_) => {
                    tracing::warn!("⚠️ {} missed the {deadline:?} poll deadline", device.device_type);
                    report.failed.push(device.device_type.clone());
                    worker.record_missed(now)
                }
            };
            match transition {
                Some(HealthTransition::BecameUnreachable) => {
                    let health = worker.health();
                    let message = format!(
                        "{} unreachable after {} failed polls",
                        device.device_type, health.consecutive_failures
                    );
                    tracing::error!("🔌 {message}");
                    self.notify(&device.device_type, NotificationKind::DeviceUnreachable, message.clone(), now);
                    self.events.record(&device.device_type, "unreachable", message).await;
                }
                Some(HealthTransition::Recovered) => {
                    let message = format!("{} is reachable again", device.device_type);
                    tracing::info!("✅ {message}");
                    self.notify(&device.device_type, NotificationKind::DeviceRecovered, message.clone(), now);
                    self.events.record(&device.device_type, "recovered", message).await;
                }
                None => {}
            }
        }
    }

    /// Commands grouped per device; devices run in parallel, commands on one
    /// device run in order.
    async fn actuate(&self, config: &FarmConfig, commands: &[Command], now: DateTime<Utc>, report: &mut TickReport) {
        let mut by_device: Vec<(u64, Vec<&Command>)> = Vec::new();
        for cmd in commands {
            match by_device.iter_mut().find(|(id, _)| *id == cmd.device_id) {
                Some((_, cmds)) => cmds.push(cmd),
                None => by_device.push((cmd.device_id, vec![cmd])),
            }
        }

        let runs = by_device.into_iter().filter_map(|(device_id, cmds)| {
            let worker = self.workers.get(&device_id)?.clone();
            Some(async move { self.actuate_device(config, worker, cmds, now).await })
        });
        for outcome in join_all(runs).await {
            report.applied += outcome.applied;
            report.deferred += outcome.deferred;
            if let Some(busy) = outcome.busy {
                report.busy.push(busy);
            }
        }
    }

    async fn actuate_device(
        &self,
        config: &FarmConfig,
        worker: Arc<DeviceWorker>,
        commands: Vec<&Command>,
        now: DateTime<Utc>,
    ) -> DeviceOutcome {
        let mut outcome = DeviceOutcome::default();
        let lock = worker.actuation_lock();
        let Ok(_guard) = lock.try_lock() else {
            tracing::debug!("{} is held by a workflow step, skipping", worker.name());
            outcome.busy = Some(worker.name().to_string());
            return outcome;
        };

        for cmd in commands {
            let Some((_, channel)) = config.channel(cmd.channel_id) else {
                continue;
            };
            let result = match cmd.action {
                CommandAction::Switch(state) => worker
                    .switch(channel, state, now)
                    .await
                    .map(|o| (o, state, format!("switched {}", on_off(state)))),
                CommandAction::Timer(secs) => worker
                    .timer_switch(channel, secs, now)
                    .await
                    .map(|(o, _)| (o, CHANNEL_ON, format!("timed on for {secs}s"))),
            };
            match result {
                Ok((SwitchOutcome::Applied, state, what)) => {
                    outcome.applied += 1;
                    self.rules
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .confirm(cmd.channel_id, state);
                    self.state
                        .set_channel(self.ctx.farm_id, &cmd.device_type, cmd.channel_index, state);
                    let message = format!("{} {what} ({})", channel.name, cmd.reason);
                    tracing::info!("🔀 {}: {message}", cmd.device_type);
                    if channel.notify {
                        self.notify(&cmd.device_type, NotificationKind::ChannelSwitched, message.clone(), now);
                    }
                    self.events.record(&cmd.device_type, "switch", message).await;
                }
                Ok((SwitchOutcome::Deferred { remaining_secs }, _, _)) => {
                    outcome.deferred += 1;
                    self.events
                        .record(
                            &cmd.device_type,
                            "deferred",
                            format!("{} held for another {remaining_secs}s", channel.name),
                        )
                        .await;
                }
                Ok((SwitchOutcome::AlreadyInState, _, _)) => {}
                Err(e) => {
                    tracing::warn!("⚠️ {} {}: {e}", cmd.device_type, channel.name);
                    self.events
                        .record(&cmd.device_type, "error", format!("{}: {e}", channel.name))
                        .await;
                }
            }
        }
        outcome
    }

    fn workflow_due(&self, workflow: &Workflow, config: &FarmConfig, state: &StateMap, now: DateTime<Utc>) -> bool {
        let span: u64 = workflow.steps.iter().map(|s| s.duration + s.wait).sum();
        let scheduled = workflow.schedules.iter().any(|s| {
            match schedule::is_active(s, span, now, self.ctx.timezone) {
                Ok(active) => active,
                Err(e) => {
                    tracing::warn!("⚠️ workflow '{}': {e}", workflow.name);
                    false
                }
            }
        });
        scheduled || rules::conditions_hold(&workflow.conditions, config, state)
    }

    /// Edge-triggered: a workflow starts when its trigger goes false → true.
    fn advance_workflows(
        &self,
        config: &Arc<FarmConfig>,
        state: &StateMap,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        let mut edges = self.workflow_edges.lock().unwrap_or_else(|e| e.into_inner());
        for workflow in &config.workflows {
            let due = self.workflow_due(workflow, config, state, now);
            let was = edges.insert(workflow.id, due).unwrap_or(false);
            if !due || was {
                continue;
            }
            match self
                .workflows
                .trigger(&self.ctx, config.clone(), workflow.id, self.workers.clone())
            {
                Ok(_) => report.workflows_started.push(workflow.id),
                Err(CropDroidError::WorkflowBusy(_)) => {
                    tracing::debug!("workflow '{}' already running", workflow.name)
                }
                Err(e) => tracing::warn!("⚠️ workflow '{}' not started: {e}", workflow.name),
            }
        }
    }

    /// External trigger (REST).
    pub fn trigger_workflow(&self, workflow_id: u64) -> Result<JoinHandle<WorkflowRun>> {
        if self.ctx.is_cancelled() {
            return Err(CropDroidError::Shutdown);
        }
        self.workflows
            .trigger(&self.ctx, self.config.load(), workflow_id, self.workers.clone())
    }

    pub fn cancel_workflow(&self, workflow_id: u64) -> bool {
        self.workflows.cancel(workflow_id)
    }

    /// Bounded by the grace period. State is evicted either way.
    pub async fn shutdown(&self) {
        let grace = self.ctx.grace_period();
        if tokio::time::timeout(grace, self.wind_down()).await.is_err() {
            tracing::warn!("⚠️ farm '{}' wind-down exceeded {grace:?}", self.ctx.name);
        }
        self.state.evict(self.ctx.farm_id);
    }

    async fn wind_down(&self) {
        self.workflows.cancel_all();
        self.workflows.wait_idle(self.ctx.grace_period()).await;
        if self.ctx.mode == FarmMode::Maintenance {
            tracing::info!("🔧 maintenance mode: leaving channels as they are");
            return;
        }
        let config = self.config.load();
        let state = self.state.snapshot(self.ctx.farm_id);
        let now = self.ctx.now();
        let offs = config.devices.iter().filter_map(|device| {
            let worker = self.workers.get(&device.id)?.clone();
            let snapshot = state.get(&device.device_type)?;
            let on: Vec<usize> = device
                .channels
                .iter()
                .filter(|c| c.enable)
                .map(|c| c.channel_index)
                .filter(|&i| snapshot.channel(i) == CHANNEL_ON)
                .collect();
            Some(async move {
                let lock = worker.actuation_lock();
                let _guard = lock.lock().await;
                for index in on {
                    match worker.force_switch(index, CHANNEL_OFF, now).await {
                        Ok(()) => tracing::info!("⏻ {} ch{index} off for shutdown", worker.name()),
                        Err(e) => tracing::warn!("⚠️ {} ch{index} left on: {e}", worker.name()),
                    }
                }
            })
        });
        join_all(offs).await;
    }
}

#[derive(Debug, Default)]
struct DeviceOutcome {
    applied: usize,
    deferred: usize,
    busy: Option<String>,
}

fn on_off(state: i32) -> &'static str {
    if state == CHANNEL_ON { "ON" } else { "OFF" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{DEHUMIDIFIER, DOSER, ROOM, graph};
    use async_trait::async_trait;
    use cropdroid_core::context::{Clock, ManualClock};
    use cropdroid_core::ids::IdHasher;
    use cropdroid_core::model::ConsistencyLevel;
    use cropdroid_core::traits::DeviceClient;
    use cropdroid_core::types::DeviceSnapshot;
    use cropdroid_db::dao::Dao;
    use cropdroid_db::memory::MemoryStore;
    use tokio_util::sync::CancellationToken;

    /// A device whose readings and availability the test controls.
    struct Fake {
        name: &'static str,
        metrics: Mutex<HashMap<String, f64>>,
        channels: Mutex<Vec<i32>>,
        down: AtomicBool,
        hang: AtomicBool,
        commands: Mutex<Vec<String>>,
    }

    impl Fake {
        fn new(name: &'static str, metrics: &[(&str, f64)], channels: Vec<i32>) -> Arc<Self> {
            Arc::new(Self {
                name,
                metrics: Mutex::new(metrics.iter().map(|(k, v)| (k.to_string(), *v)).collect()),
                channels: Mutex::new(channels),
                down: AtomicBool::new(false),
                hang: AtomicBool::new(false),
                commands: Mutex::new(Vec::new()),
            })
        }

        fn set(&self, key: &str, value: f64) {
            self.metrics.lock().unwrap().insert(key.into(), value);
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeviceClient for Fake {
        fn name(&self) -> &str {
            self.name
        }
        async fn poll(&self) -> Result<DeviceSnapshot> {
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.down.load(Ordering::SeqCst) {
                return Err(CropDroidError::unreachable(self.name, "connection refused"));
            }
            Ok(DeviceSnapshot::new(
                self.metrics.lock().unwrap().clone(),
                self.channels.lock().unwrap().clone(),
                Utc::now(),
            ))
        }
        async fn switch(&self, channel: usize, state: i32) -> Result<()> {
            self.commands.lock().unwrap().push(format!("switch({channel},{state})"));
            self.channels.lock().unwrap()[channel] = state;
            Ok(())
        }
        async fn timer_switch(&self, channel: usize, seconds: u64) -> Result<DateTime<Utc>> {
            self.commands.lock().unwrap().push(format!("timer({channel},{seconds})"));
            self.channels.lock().unwrap()[channel] = CHANNEL_ON;
            Ok(Utc::now() + chrono::Duration::seconds(seconds as i64))
        }
    }

    struct Harness {
        scheduler: Arc<FarmScheduler>,
        room: Arc<Fake>,
        doser: Arc<Fake>,
        clock: Arc<ManualClock>,
        queue: NotificationQueue,
        state: Arc<StateStore>,
        _rx: mpsc::Receiver<Notification>,
    }

    fn harness(config: FarmConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let room = Fake::new("room", &[("humidity0", 40.0), ("tempF0", 72.0)], vec![0]);
        let doser = Fake::new("doser", &[("pH", 6.0)], vec![0]);
        let mut workers = WorkerMap::new();
        workers.insert(ROOM, Arc::new(DeviceWorker::new(ROOM, room.clone(), Duration::from_secs(5), 3)));
        workers.insert(DOSER, Arc::new(DeviceWorker::new(DOSER, doser.clone(), Duration::from_secs(5), 3)));
        let (queue, rx) = NotificationQueue::new(64);
        let state = Arc::new(StateStore::new());
        let dao = Dao::new(Arc::new(MemoryStore::new()), ConsistencyLevel::Local);
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let events = Arc::new(EventLogService::new(
            config.farm.id,
            dao,
            IdHasher::default(),
            ConsistencyLevel::Local,
            dyn_clock.clone(),
        ));
        let ctx = FarmContext::new(&config.farm, dyn_clock, &CancellationToken::new()).unwrap();
        let scheduler = Arc::new(FarmScheduler::new(
            ctx,
            ConfigHandle::new(config),
            workers,
            state.clone(),
            queue.clone(),
            events,
            &CropDroidConfig::default(),
        ));
        Harness {
            scheduler,
            room,
            doser,
            clock,
            queue,
            state,
            _rx: rx,
        }
    }

    fn kinds(queue: &NotificationQueue) -> Vec<NotificationKind> {
        queue.recent().into_iter().map(|n| n.kind).collect()
    }

    #[tokio::test]
    async fn test_threshold_tick_switches_and_notifies() {
        let h = harness(graph());
        h.room.set("humidity0", 75.0);
        let report = h.scheduler.tick_once().await;
        assert_eq!(report.polled, 2);
        assert_eq!(report.applied, 1);
        assert_eq!(h.room.commands(), vec!["switch(0,1)"]);
        assert_eq!(kinds(&h.queue), vec![NotificationKind::ChannelSwitched]);
        assert_eq!(h.state.get(h.scheduler.farm_id(), "room").unwrap().channel(0), CHANNEL_ON);

        // Same readings next tick: nothing new.
        let report = h.scheduler.tick_once().await;
        assert!(report.commands.is_empty());
        assert_eq!(h.room.commands().len(), 1);
    }

    #[tokio::test]
    async fn test_debounce_defers_off() {
        let mut config = graph();
        config.channel_mut(DEHUMIDIFIER).unwrap().debounce = 10;
        let h = harness(config);
        h.room.set("humidity0", 75.0);
        h.scheduler.tick_once().await;

        h.clock.advance(chrono::Duration::seconds(3));
        h.room.set("humidity0", 40.0);
        let report = h.scheduler.tick_once().await;
        assert_eq!(report.deferred, 1);
        assert_eq!(h.room.commands(), vec!["switch(0,1)"]);

        h.clock.advance(chrono::Duration::seconds(7));
        let report = h.scheduler.tick_once().await;
        assert_eq!(report.applied, 1);
        assert_eq!(h.room.commands(), vec!["switch(0,1)", "switch(0,0)"]);
    }

    #[tokio::test]
    async fn test_unreachable_suppresses_only_that_device() {
        let h = harness(graph());
        h.room.down.store(true, Ordering::SeqCst);
        h.doser.set("pH", 6.4);
        for _ in 0..3 {
            h.scheduler.tick_once().await;
        }
        let unreachable: Vec<_> = kinds(&h.queue)
            .into_iter()
            .filter(|k| *k == NotificationKind::DeviceUnreachable)
            .collect();
        assert_eq!(unreachable.len(), 1);
        assert_eq!(h.doser.commands(), vec!["timer(0,9)"]);

        h.room.down.store(false, Ordering::SeqCst);
        h.room.set("humidity0", 75.0);
        let report = h.scheduler.tick_once().await;
        assert!(report.failed.is_empty());
        assert!(kinds(&h.queue).contains(&NotificationKind::DeviceRecovered));
        assert_eq!(h.room.commands(), vec!["switch(0,1)"]);
    }

    #[tokio::test]
    async fn test_busy_device_is_skipped() {
        let h = harness(graph());
        h.room.set("humidity0", 75.0);
        let worker = h.scheduler.worker(ROOM).unwrap().clone();
        let lock = worker.actuation_lock();
        let guard = lock.lock().await;
        let report = h.scheduler.tick_once().await;
        assert_eq!(report.busy, vec!["room".to_string()]);
        assert!(h.room.commands().is_empty());
        drop(guard);
        h.scheduler.tick_once().await;
        assert_eq!(h.room.commands(), vec!["switch(0,1)"]);
    }

    #[tokio::test]
    async fn test_shutdown_switches_on_channels_off() {
        let h = harness(graph());
        h.room.set("humidity0", 75.0);
        h.scheduler.tick_once().await;
        h.scheduler.shutdown().await;
        assert_eq!(h.room.commands(), vec!["switch(0,1)", "switch(0,0)"]);
        assert!(h.state.snapshot(h.scheduler.farm_id()).is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_leaves_disabled_channels_alone() {
        let mut config = graph();
        config.channel_mut(DEHUMIDIFIER).unwrap().enable = false;
        let h = harness(config);
        h.room.channels.lock().unwrap()[0] = CHANNEL_ON;
        h.room.set("humidity0", 40.0);
        let report = h.scheduler.tick_once().await;
        assert!(report.commands.is_empty());
        h.scheduler.shutdown().await;
        assert!(h.room.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_poll_counts_toward_unreachable() {
        let mut config = graph();
        // Deadline 3s, shorter than the worker's 5s request timeout.
        config.farm.interval = 8;
        let h = harness(config);
        h.room.hang.store(true, Ordering::SeqCst);
        h.room.set("humidity0", 75.0);
        for _ in 0..3 {
            let report = h.scheduler.tick_once().await;
            assert_eq!(report.failed, vec!["room".to_string()]);
        }
        let worker = h.scheduler.worker(ROOM).unwrap().clone();
        assert_eq!(worker.health().consecutive_failures, 3);
        assert!(!worker.is_reachable());
        let unreachable = kinds(&h.queue)
            .into_iter()
            .filter(|k| *k == NotificationKind::DeviceUnreachable)
            .count();
        assert_eq!(unreachable, 1);
        assert!(h.room.commands().is_empty());
    }

    #[tokio::test]
    async fn test_maintenance_leaves_channels() {
        let mut config = graph();
        config.farm.mode = FarmMode::Maintenance;
        let h = harness(config);
        h.room.set("humidity0", 75.0);
        h.scheduler.tick_once().await;
        h.scheduler.shutdown().await;
        assert_eq!(h.room.commands(), vec!["switch(0,1)"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_until_cancelled() {
        let h = harness(graph());
        let (tick_tx, tick_rx) = mpsc::channel(4);
        let handle = h.scheduler.spawn(tick_rx);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.scheduler.tick_count(), 1);
        tick_tx.send(()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.scheduler.tick_count(), 2);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.scheduler.tick_count(), 3);
        h.scheduler.context().cancel.cancel();
        handle.await.unwrap();
        assert!(!h.scheduler.is_running());
    }
}
