//! Service registry: the single entry point into the running control plane.
//!
//! Holds, per farm, the supervisor task, its device workers and its event
//! log; plus the process-wide notification consumer, provisioning consumer
//! and state-eviction task. Each kind of service sits behind its own lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use cropdroid_core::config::CropDroidConfig;
use cropdroid_core::context::{Clock, FarmContext, SystemClock};
use cropdroid_core::error::{CropDroidError, Result};
use cropdroid_core::farm_config::{ConfigHandle, FarmConfig};
use cropdroid_core::ids::IdHasher;
use cropdroid_core::model::{Device, Farm, User};
use cropdroid_core::session::{Action, Session};
use cropdroid_core::traits::{DeviceClient, DeviceDataStore, Mailer, RecordStore};
use cropdroid_core::types::Notification;
use cropdroid_db::dao::Dao;
use cropdroid_devices::{DeviceWorker, build_client};
use cropdroid_scheduler::{
    EventLogService, FarmScheduler, NotificationQueue, StateStore, WorkerMap, run_consumer,
};
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::provisioner::{ProvisionParams, Provisioner};
use crate::services::{AuthService, ChannelService, ConditionService, EventService, WorkflowService};

/// Builds the client a device worker talks through.
pub type ClientFactory = Arc<
    dyn Fn(&Farm, &Device, &CropDroidConfig, Arc<dyn Clock>) -> Result<Arc<dyn DeviceClient>>
        + Send
        + Sync,
>;

const CHANNEL_CAPACITY: usize = 64;

/// A scheduled farm.
struct FarmService {
    scheduler: Arc<FarmScheduler>,
    tick_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Receivers handed to the background tasks on [`ServiceRegistry::start`].
struct Pending {
    provisioned: mpsc::Receiver<FarmConfig>,
    deprovisioned: mpsc::Receiver<u64>,
    ticks: mpsc::Receiver<u64>,
    notifications: mpsc::Receiver<Notification>,
}

pub struct ServiceRegistry {
    settings: CropDroidConfig,
    dao: Dao,
    hasher: IdHasher,
    clock: Arc<dyn Clock>,
    clients: ClientFactory,
    mailer: Arc<dyn Mailer>,
    state: Arc<StateStore>,
    queue: NotificationQueue,
    provisioner: Provisioner,
    tick_tx: mpsc::Sender<u64>,
    /// Farms, provisioning consumer and state ticker.
    cancel: CancellationToken,
    /// Notification consumer; cancelled last so shutdown notices are delivered.
    notifier_cancel: CancellationToken,
    farms: RwLock<HashMap<u64, FarmService>>,
    devices: RwLock<HashMap<u64, WorkerMap>>,
    event_logs: RwLock<HashMap<u64, Arc<EventLogService>>>,
    pending: Mutex<Option<Pending>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceRegistry {
    pub fn new(settings: CropDroidConfig, store: Arc<dyn RecordStore>, mailer: Arc<dyn Mailer>) -> Self {
        let dao = Dao::new(store, settings.default_consistency_level);
        let hasher = IdHasher::new(settings.id_width);
        let (queue, notifications) = NotificationQueue::new(settings.notification.capacity);
        let (provisioned_tx, provisioned) = mpsc::channel(CHANNEL_CAPACITY);
        let (deprovisioned_tx, deprovisioned) = mpsc::channel(CHANNEL_CAPACITY);
        let (tick_tx, ticks) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            provisioner: Provisioner::new(dao.clone(), hasher, provisioned_tx, deprovisioned_tx),
            settings,
            dao,
            hasher,
            clock: Arc::new(SystemClock),
            clients: Arc::new(build_client),
            mailer,
            state: Arc::new(StateStore::new()),
            queue,
            tick_tx,
            cancel: CancellationToken::new(),
            notifier_cancel: CancellationToken::new(),
            farms: RwLock::new(HashMap::new()),
            devices: RwLock::new(HashMap::new()),
            event_logs: RwLock::new(HashMap::new()),
            pending: Mutex::new(Some(Pending {
                provisioned,
                deprovisioned,
                ticks,
                notifications,
            })),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_client_factory(mut self, clients: ClientFactory) -> Self {
        self.clients = clients;
        self
    }

    /// Record every poll into `sink`. Must be called inside a runtime.
    pub fn with_history(mut self, sink: Arc<dyn DeviceDataStore>) -> Self {
        self.state = Arc::new(StateStore::with_history(sink));
        self
    }

    pub fn settings(&self) -> &CropDroidConfig {
        &self.settings
    }

    pub fn dao(&self) -> &Dao {
        &self.dao
    }

    pub fn hasher(&self) -> &IdHasher {
        &self.hasher
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn notifications(&self) -> &NotificationQueue {
        &self.queue
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    pub fn auth(&self) -> AuthService<'_> {
        AuthService::new(&self.dao, &self.hasher)
    }

    pub fn channels(&self) -> ChannelService<'_> {
        ChannelService::new(self)
    }

    pub fn conditions(&self) -> ConditionService<'_> {
        ConditionService::new(self)
    }

    pub fn workflows(&self) -> WorkflowService<'_> {
        WorkflowService::new(self)
    }

    pub fn events(&self) -> EventService<'_> {
        EventService::new(self)
    }

    /// Sender for external "run once now" requests.
    pub fn tick_sender(&self) -> mpsc::Sender<u64> {
        self.tick_tx.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Spawn the background tasks, schedule every stored farm and seed the
    /// default farm on an empty store. Returns the number of farms loaded.
    pub async fn start(self: &Arc<Self>) -> Result<usize> {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| CropDroidError::Invariant("registry started twice".into()))?;

        let consumer = tokio::spawn(run_consumer(
            pending.notifications,
            self.mailer.clone(),
            Duration::from_secs(self.settings.notification.dispatch_timeout_secs),
            self.notifier_cancel.clone(),
        ));
        let provisioning = tokio::spawn(self.clone().run_provisioning(
            pending.provisioned,
            pending.deprovisioned,
            pending.ticks,
        ));
        let ticker = tokio::spawn(self.clone().run_state_ticker());
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([provisioning, ticker, consumer]);

        let mut loaded = 0;
        for farm in self.dao.list_farms(self.dao.default_level()).await? {
            let config = match self.dao.load_farm_config(farm.id, self.dao.default_level()).await {
                Ok(config) => config,
                Err(e) => {
                    tracing::error!("❌ farm '{}' failed to load: {e}", farm.name);
                    continue;
                }
            };
            match self.add_farm(config) {
                Ok(_) => loaded += 1,
                Err(e) => tracing::error!("❌ farm '{}' not scheduled: {e}", farm.name),
            }
        }
        if loaded == 0 {
            self.provisioner.seed_default_farm(&self.settings).await?;
        }
        tracing::info!(
            "🚀 registry started: {loaded} farm(s) on the {} backend",
            self.dao.backend()
        );
        Ok(loaded)
    }

    /// Create workers, event log and supervisor for `config` and start it.
    /// Adding a farm that is already scheduled returns the running one.
    pub fn add_farm(&self, config: FarmConfig) -> Result<Arc<FarmScheduler>> {
        if self.is_shutdown() {
            return Err(CropDroidError::Shutdown);
        }
        config.validate()?;
        let farm_id = config.farm.id;
        if let Some(existing) = self.scheduler(farm_id) {
            return Ok(existing);
        }

        let ctx = FarmContext::new(&config.farm, self.clock.clone(), &self.cancel)?;
        let timeout = self.settings.device_timeout(config.farm.interval);
        let mut workers = WorkerMap::new();
        for device in config.devices.iter().filter(|d| d.enable) {
            match (self.clients)(&config.farm, device, &self.settings, self.clock.clone()) {
                Ok(client) => {
                    let worker = DeviceWorker::new(
                        device.id,
                        client,
                        timeout,
                        self.settings.device.unreachable_after,
                    );
                    workers.insert(device.id, Arc::new(worker));
                }
                Err(e) => tracing::warn!("⚠️ device {} skipped: {e}", device.device_type),
            }
        }

        let events = Arc::new(EventLogService::new(
            farm_id,
            self.dao.clone(),
            self.hasher,
            self.dao.write_level(config.farm.consistency),
            self.clock.clone(),
        ));
        let name = config.farm.name.clone();
        let device_count = workers.len();
        let scheduler = Arc::new(FarmScheduler::new(
            ctx,
            ConfigHandle::new(config),
            workers.clone(),
            self.state.clone(),
            self.queue.clone(),
            events.clone(),
            &self.settings,
        ));

        let mut farms = self.farms.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = farms.get(&farm_id) {
            scheduler.context().cancel.cancel();
            return Ok(existing.scheduler.clone());
        }
        let (tick_tx, tick_rx) = mpsc::channel(4);
        let handle = scheduler.spawn(tick_rx);
        farms.insert(
            farm_id,
            FarmService {
                scheduler: scheduler.clone(),
                tick_tx,
                handle,
            },
        );
        drop(farms);
        self.devices
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(farm_id, workers);
        self.event_logs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(farm_id, events);
        tracing::info!("🏡 farm '{name}' ({farm_id}) scheduled with {device_count} device(s)");
        Ok(scheduler)
    }

    /// Stop the farm's supervisor and wait for its wind-down.
    pub async fn remove_farm(&self, farm_id: u64) -> bool {
        let service = self
            .farms
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&farm_id);
        self.devices
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&farm_id);
        self.event_logs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&farm_id);
        let Some(service) = service else {
            return false;
        };
        service.scheduler.context().cancel.cancel();
        if let Err(e) = service.handle.await {
            tracing::error!("❌ farm {farm_id} supervisor ended abnormally: {e}");
        }
        tracing::info!("🗑️ farm {farm_id} unscheduled");
        true
    }

    pub fn scheduler(&self, farm_id: u64) -> Option<Arc<FarmScheduler>> {
        self.farms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&farm_id)
            .map(|s| s.scheduler.clone())
    }

    /// Scheduler lookup that answers 404 on a miss.
    pub fn require_scheduler(&self, farm_id: u64) -> Result<Arc<FarmScheduler>> {
        self.scheduler(farm_id)
            .ok_or_else(|| CropDroidError::not_found("farm", farm_id))
    }

    pub fn farm_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .farms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn workers(&self, farm_id: u64) -> Option<WorkerMap> {
        self.devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&farm_id)
            .cloned()
    }

    pub fn event_log(&self, farm_id: u64) -> Option<Arc<EventLogService>> {
        self.event_logs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&farm_id)
            .cloned()
    }

    /// Ask a farm to tick now. A tick already queued absorbs the request.
    pub fn tick(&self, farm_id: u64) -> Result<()> {
        let tx = self
            .farms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&farm_id)
            .map(|s| s.tick_tx.clone())
            .ok_or_else(|| CropDroidError::not_found("farm", farm_id))?;
        match tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(())) => Err(CropDroidError::Shutdown),
        }
    }

    /// Provision a template farm in the caller's organization.
    pub async fn provision(&self, session: &Session, farm_name: &str) -> Result<FarmConfig> {
        if !session.role.permits(Action::Provision) {
            return Err(CropDroidError::Unauthorized {
                user_id: session.user_id,
                farm_id: 0,
                action: Action::Provision.to_string(),
            });
        }
        let user = self
            .dao
            .find(session.user_id, self.dao.default_level())
            .await?
            .unwrap_or_else(|| User {
                id: session.user_id,
                email: String::new(),
            });
        let params = ProvisionParams::from_config(session.org_id, farm_name, &self.settings);
        self.provisioner.provision(&user, &params).await
    }

    /// Stop, evict and delete a farm.
    pub async fn deprovision(&self, session: &Session, farm_id: u64) -> Result<usize> {
        self.auth().authorize(session, farm_id, Action::Provision).await?;
        self.remove_farm(farm_id).await;
        self.provisioner.deprovision(farm_id).await
    }

    async fn run_provisioning(
        self: Arc<Self>,
        mut provisioned: mpsc::Receiver<FarmConfig>,
        mut deprovisioned: mpsc::Receiver<u64>,
        mut ticks: mpsc::Receiver<u64>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                // Removals first: a farm deprovisioned and provisioned again
                // must end up scheduled.
                Some(farm_id) = deprovisioned.recv() => {
                    self.remove_farm(farm_id).await;
                }
                Some(config) = provisioned.recv() => {
                    let name = config.farm.name.clone();
                    if let Err(e) = self.add_farm(config) {
                        tracing::error!("❌ provisioned farm '{name}' not scheduled: {e}");
                    }
                }
                Some(farm_id) = ticks.recv() => {
                    if let Err(e) = self.tick(farm_id) {
                        tracing::debug!("tick for farm {farm_id} dropped: {e}");
                    }
                }
                else => break,
            }
        }
        tracing::debug!("provisioning consumer stopped");
    }

    async fn run_state_ticker(self: Arc<Self>) {
        let ttl = self.settings.state_ttl;
        let mut interval = tokio::time::interval(Duration::from_secs(self.settings.state_tick.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    let evicted = self.state.tick(self.clock.now(), ttl);
                    if evicted > 0 {
                        tracing::info!("🧹 evicted {evicted} stale device state(s)");
                    }
                }
            }
        }
    }

    /// Cancel every farm, wait for their wind-down, then flush notifications.
    pub async fn shutdown(&self) {
        tracing::info!("🛑 registry shutting down");
        self.cancel.cancel();
        let farms: Vec<FarmService> = self
            .farms
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, s)| s)
            .collect();
        join_all(farms.into_iter().map(|s| s.handle)).await;
        self.devices.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.event_logs.write().unwrap_or_else(|e| e.into_inner()).clear();

        self.notifier_cancel.cancel();
        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        join_all(tasks).await;
        tracing::info!("👋 registry stopped");
    }
}
