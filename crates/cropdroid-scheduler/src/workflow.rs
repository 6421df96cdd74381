//! Workflow executor: ordered multi-step actuation.
//!
//! ## Step protocol
//! ```text
//! idle → running   take the device's actuation lock, TimerSwitch(channel, duration)
//!      → waiting   sleep duration + wait (cancellable)
//!      → done      release the lock, POST the step webhook
//!      ↘ failed    any error or cancellation; remaining steps stay idle
//! ```
//! One instance per workflow at a time. A cancelled step switches its channel
//! OFF before the instance ends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cropdroid_core::context::FarmContext;
use cropdroid_core::error::{CropDroidError, Result};
use cropdroid_core::farm_config::FarmConfig;
use cropdroid_core::model::{StepState, WorkflowStep};
use cropdroid_core::types::{CHANNEL_OFF, Notification, NotificationKind};
use cropdroid_devices::DeviceWorker;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::events::EventLogService;
use crate::notify::NotificationQueue;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    pub step_id: u64,
    pub device_id: u64,
    pub channel_id: u64,
    pub state: StepState,
    pub error: Option<String>,
}

impl StepReport {
    fn advance(&mut self, next: StepState) {
        debug_assert!(
            self.state.can_transition(next),
            "step {} cannot go {:?} → {:?}",
            self.step_id,
            self.state,
            next
        );
        self.state = next;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowRun {
    pub workflow_id: u64,
    pub name: String,
    pub steps: Vec<StepReport>,
}

impl WorkflowRun {
    pub fn completed(&self) -> bool {
        self.steps.iter().all(|s| s.state == StepState::Done)
    }

    pub fn failed_step(&self) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.state == StepState::Failed)
    }
}

/// Device workers of one farm, keyed by device ID.
pub type WorkerMap = HashMap<u64, Arc<DeviceWorker>>;

#[derive(Default)]
struct Shared {
    active: Mutex<HashMap<u64, CancellationToken>>,
    last_runs: Mutex<HashMap<u64, WorkflowRun>>,
    idle: Notify,
}

#[derive(Clone)]
pub struct WorkflowExecutor {
    shared: Arc<Shared>,
    http: reqwest::Client,
    request_timeout: Duration,
    queue: Option<NotificationQueue>,
    events: Option<Arc<EventLogService>>,
}

impl WorkflowExecutor {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            http: reqwest::Client::new(),
            request_timeout,
            queue: None,
            events: None,
        }
    }

    pub fn with_notifications(mut self, queue: NotificationQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_events(mut self, events: Arc<EventLogService>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn is_active(&self, workflow_id: u64) -> bool {
        self.shared
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&workflow_id)
    }

    pub fn active_count(&self) -> usize {
        self.shared.active.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn last_run(&self, workflow_id: u64) -> Option<WorkflowRun> {
        self.shared
            .last_runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&workflow_id)
            .cloned()
    }

    /// Start an instance. `WorkflowBusy` if one is already running.
    pub fn trigger(
        &self,
        ctx: &FarmContext,
        config: Arc<FarmConfig>,
        workflow_id: u64,
        workers: WorkerMap,
    ) -> Result<JoinHandle<WorkflowRun>> {
        let workflow = config
            .workflow(workflow_id)
            .ok_or_else(|| CropDroidError::not_found("workflow", workflow_id))?
            .clone();
        let token = {
            let mut active = self.shared.active.lock().unwrap_or_else(|e| e.into_inner());
            if active.contains_key(&workflow_id) {
                return Err(CropDroidError::WorkflowBusy(workflow_id));
            }
            let token = ctx.cancel.child_token();
            active.insert(workflow_id, token.clone());
            token
        };

        tracing::info!("▶️ workflow '{}' triggered", workflow.name);
        let this = self.clone();
        let ctx = ctx.clone();
        let span = tracing::info_span!(parent: &ctx.span, "workflow", id = workflow_id);
        let handle = tokio::spawn(
            async move {
                let steps = workflow.ordered_steps();
                let mut run = WorkflowRun {
                    workflow_id,
                    name: workflow.name.clone(),
                    steps: steps
                        .iter()
                        .map(|s| StepReport {
                            step_id: s.id,
                            device_id: s.device_id,
                            channel_id: s.channel_id,
                            state: StepState::Idle,
                            error: None,
                        })
                        .collect(),
                };
                for (i, step) in steps.iter().enumerate() {
                    let ok = this
                        .run_step(&ctx, &config, step, &workers, &token, &mut run.steps[i])
                        .await;
                    this.post_webhook(workflow_id, step, &run.steps[i]).await;
                    if !ok {
                        break;
                    }
                }
                this.finish(&ctx, &run).await;
                run
            }
            .instrument(span),
        );
        Ok(handle)
    }

    async fn run_step(
        &self,
        ctx: &FarmContext,
        config: &FarmConfig,
        step: &WorkflowStep,
        workers: &WorkerMap,
        token: &CancellationToken,
        report: &mut StepReport,
    ) -> bool {
        report.advance(StepState::Running);
        let fail = |report: &mut StepReport, reason: String| {
            tracing::warn!("❌ step {} failed: {reason}", report.step_id);
            report.advance(StepState::Failed);
            report.error = Some(reason);
            false
        };

        let Some(worker) = workers.get(&step.device_id) else {
            return fail(report, format!("no worker for device {}", step.device_id));
        };
        let Some((_, channel)) = config.channel(step.channel_id) else {
            return fail(report, format!("unknown channel {}", step.channel_id));
        };
        if !channel.enable {
            return fail(report, format!("channel {} is disabled", channel.name));
        }
        let index = channel.channel_index;

        let lock = worker.actuation_lock();
        let _guard = tokio::select! {
            guard = lock.lock_owned() => guard,
            _ = token.cancelled() => return fail(report, "cancelled".into()),
        };

        if let Err(e) = worker.run_timer(index, step.duration, ctx.now()).await {
            return fail(report, e.to_string());
        }
        tracing::info!("⏱️ {} ch{index} on for {}s", worker.name(), step.duration);
        report.advance(StepState::Waiting);

        let hold = Duration::from_secs(step.duration + step.wait);
        tokio::select! {
            _ = tokio::time::sleep(hold) => {}
            _ = token.cancelled() => {
                if let Err(e) = worker.force_switch(index, CHANNEL_OFF, ctx.now()).await {
                    tracing::error!("❌ could not switch {} ch{index} off: {e}", worker.name());
                }
                return fail(report, "cancelled".into());
            }
        }
        report.advance(StepState::Done);
        true
    }

    async fn post_webhook(&self, workflow_id: u64, step: &WorkflowStep, report: &StepReport) {
        let Some(url) = step.webhook.as_deref().filter(|u| !u.is_empty()) else {
            return;
        };
        let body = serde_json::json!({
            "workflow_id": workflow_id,
            "step_id": step.id,
            "state": report.state.as_str(),
            "error": report.error,
        });
        let result = self
            .http
            .post(url)
            .json(&body)
            .timeout(self.request_timeout)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!("📤 step {} webhook delivered", step.id)
            }
            Ok(resp) => tracing::warn!("⚠️ step {} webhook returned {}", step.id, resp.status()),
            Err(e) => tracing::warn!("⚠️ step {} webhook failed: {e}", step.id),
        }
    }

    async fn finish(&self, ctx: &FarmContext, run: &WorkflowRun) {
        let message = match run.failed_step() {
            None => format!("workflow '{}' completed", run.name),
            Some(step) => format!(
                "workflow '{}' failed at step {}: {}",
                run.name,
                step.step_id,
                step.error.as_deref().unwrap_or("unknown")
            ),
        };
        tracing::info!("🏁 {message}");
        if let Some(queue) = &self.queue {
            queue.offer(Notification::new(
                ctx.farm_id,
                "workflow",
                NotificationKind::Workflow,
                message.clone(),
                ctx.now(),
            ));
        }
        if let Some(events) = &self.events {
            let event_type = if run.completed() { "workflow_done" } else { "workflow_failed" };
            events.record("workflow", event_type, message).await;
        }

        self.shared
            .last_runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run.workflow_id, run.clone());
        let now_idle = {
            let mut active = self.shared.active.lock().unwrap_or_else(|e| e.into_inner());
            active.remove(&run.workflow_id);
            active.is_empty()
        };
        if now_idle {
            self.shared.idle.notify_waiters();
        }
    }

    /// Interrupt an instance. Returns whether one was running.
    pub fn cancel(&self, workflow_id: u64) -> bool {
        match self
            .shared
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&workflow_id)
        {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for token in self.shared.active.lock().unwrap_or_else(|e| e.into_inner()).values() {
            token.cancel();
        }
    }

    /// Wait until no instance is running, up to `timeout`.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.shared.idle.notified();
                if self.active_count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, FARM};
    use async_trait::async_trait;
    use cropdroid_core::context::SystemClock;
    use cropdroid_core::model::{Channel, Device, Workflow};
    use cropdroid_core::traits::DeviceClient;
    use cropdroid_core::types::DeviceSnapshot;
    use tokio::time::Instant;

    /// Records `(device, command, t)` with paused-clock offsets in seconds.
    struct Recorder {
        name: &'static str,
        start: Instant,
        log: Arc<Mutex<Vec<(String, String, u64)>>>,
    }

    #[async_trait]
    impl DeviceClient for Recorder {
        fn name(&self) -> &str {
            self.name
        }
        async fn poll(&self) -> Result<DeviceSnapshot> {
            Ok(DeviceSnapshot::new(Default::default(), vec![0, 0], chrono::Utc::now()))
        }
        async fn switch(&self, channel: usize, state: i32) -> Result<()> {
            self.push(format!("switch({channel},{state})"));
            Ok(())
        }
        async fn timer_switch(&self, channel: usize, seconds: u64) -> Result<chrono::DateTime<chrono::Utc>> {
            self.push(format!("timer({channel},{seconds})"));
            Ok(chrono::Utc::now() + chrono::Duration::seconds(seconds as i64))
        }
    }

    impl Recorder {
        fn push(&self, cmd: String) {
            let t = self.start.elapsed().as_secs();
            self.log.lock().unwrap().push((self.name.to_string(), cmd, t));
        }
    }

    fn device(id: u64, ty: &str, channels: Vec<Channel>) -> Device {
        Device {
            id,
            farm_id: FARM,
            device_type: ty.into(),
            description: String::new(),
            uri: String::new(),
            enable: true,
            settings: vec![],
            metrics: vec![],
            channels,
        }
    }

    fn step(id: u64, device_id: u64, channel_id: u64, duration: u64, wait: u64, order: u32) -> WorkflowStep {
        WorkflowStep {
            id,
            workflow_id: 900,
            device_id,
            channel_id,
            webhook: None,
            duration,
            wait,
            sort_order: order,
            state: StepState::Idle,
        }
    }

    /// reservoir/drain (5s, wait 2) then doser/phDown (3s).
    fn setup() -> (FarmContext, Arc<FarmConfig>, WorkerMap, Arc<Mutex<Vec<(String, String, u64)>>>) {
        let reservoir = device(3, "reservoir", vec![fixtures::channel(300, 3, 1, "drain")]);
        let doser = device(4, "doser", vec![fixtures::channel(400, 4, 0, "phDown")]);
        let workflow = Workflow {
            id: 900,
            farm_id: FARM,
            name: "drain-and-dose".into(),
            conditions: vec![],
            schedules: vec![],
            // Out of order on purpose.
            steps: vec![step(2, 4, 400, 3, 0, 2), step(1, 3, 300, 5, 2, 1)],
        };
        let config = Arc::new(FarmConfig::new(
            fixtures::farm("UTC"),
            vec![reservoir, doser],
            vec![workflow],
            vec![],
        ));
        let log = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();
        let mut workers = WorkerMap::new();
        for (id, name) in [(3u64, "reservoir"), (4, "doser")] {
            let client = Arc::new(Recorder {
                name,
                start,
                log: log.clone(),
            });
            workers.insert(id, Arc::new(DeviceWorker::new(id, client, Duration::from_secs(5), 3)));
        }
        let ctx = FarmContext::new(&config.farm, Arc::new(SystemClock), &CancellationToken::new()).unwrap();
        (ctx, config, workers, log)
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_step_run_and_busy() {
        let (ctx, config, workers, log) = setup();
        let executor = WorkflowExecutor::new(Duration::from_secs(5));
        let handle = executor.trigger(&ctx, config.clone(), 900, workers.clone()).unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        let busy = executor.trigger(&ctx, config.clone(), 900, workers.clone());
        assert!(matches!(busy, Err(CropDroidError::WorkflowBusy(900))));

        let run = handle.await.unwrap();
        assert!(run.completed());
        assert_eq!(run.steps[0].step_id, 1);
        let log = log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                ("reservoir".to_string(), "timer(1,5)".to_string(), 0),
                ("doser".to_string(), "timer(0,3)".to_string(), 7),
            ]
        );
        assert!(!executor.is_active(900));
        assert!(executor.last_run(900).unwrap().completed());
        // Free again once finished.
        assert!(executor.trigger(&ctx, config, 900, workers).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_switches_channel_off() {
        let (ctx, config, workers, log) = setup();
        let executor = WorkflowExecutor::new(Duration::from_secs(5));
        let handle = executor.trigger(&ctx, config, 900, workers).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(executor.cancel(900));

        let run = handle.await.unwrap();
        assert_eq!(run.steps[0].state, StepState::Failed);
        assert_eq!(run.steps[0].error.as_deref(), Some("cancelled"));
        assert_eq!(run.steps[1].state, StepState::Idle);
        let cmds: Vec<String> = log.lock().unwrap().iter().map(|(_, c, _)| c.clone()).collect();
        assert_eq!(cmds, vec!["timer(1,5)", "switch(1,0)"]);
        assert!(executor.wait_idle(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_worker_fails_fast() {
        let (ctx, config, mut workers, log) = setup();
        workers.remove(&3);
        let executor = WorkflowExecutor::new(Duration::from_secs(5));
        let run = executor.trigger(&ctx, config, 900, workers).unwrap().await.unwrap();
        assert_eq!(run.steps[0].state, StepState::Failed);
        assert_eq!(run.steps[1].state, StepState::Idle);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_channel_fails_step() {
        let (ctx, config, workers, log) = setup();
        let mut config = (*config).clone();
        config.channel_mut(300).unwrap().enable = false;
        config.reindex();
        let executor = WorkflowExecutor::new(Duration::from_secs(5));
        let run = executor
            .trigger(&ctx, Arc::new(config), 900, workers)
            .unwrap()
            .await
            .unwrap();
        assert_eq!(run.steps[0].state, StepState::Failed);
        assert_eq!(run.steps[0].error.as_deref(), Some("channel drain is disabled"));
        assert_eq!(run.steps[1].state, StepState::Idle);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_workflow_is_not_found() {
        let (ctx, config, workers, _) = setup();
        let executor = WorkflowExecutor::new(Duration::from_secs(5));
        let err = executor.trigger(&ctx, config, 1, workers).unwrap_err();
        assert_eq!(err.http_status(), 404);
    }
}
