//! Per-request services the REST surface calls through the registry.
//!
//! Every call takes the caller's [`Session`] and is checked against the
//! stored `Permission` for the farm before anything is read or changed.
//! Configuration changes are persisted first, then swapped into the running
//! scheduler as a new snapshot.

use std::sync::Arc;

use cropdroid_core::error::{CropDroidError, Result};
use cropdroid_core::ids::IdHasher;
use cropdroid_core::model::{Channel, Comparator, Condition, EventLog, Farm, Permission};
use cropdroid_core::session::{Action, Role, Session};
use cropdroid_core::traits::PageQuery;
use cropdroid_core::types::{CHANNEL_OFF, CHANNEL_ON};
use cropdroid_db::dao::{Dao, Page};
use cropdroid_scheduler::{FarmScheduler, WorkflowRun};
use tokio::task::JoinHandle;

use crate::registry::ServiceRegistry;

/// Role resolution and permission grants.
pub struct AuthService<'a> {
    dao: &'a Dao,
    hasher: &'a IdHasher,
}

impl<'a> AuthService<'a> {
    pub fn new(dao: &'a Dao, hasher: &'a IdHasher) -> Self {
        Self { dao, hasher }
    }

    /// Most privileged role `user_id` holds on the farm.
    pub async fn role(&self, user_id: u64, farm_id: u64) -> Result<Option<Role>> {
        let permissions: Vec<Permission> = self
            .dao
            .list(&PageQuery::farm(farm_id), self.dao.default_level())
            .await?;
        Ok(permissions
            .iter()
            .filter(|p| p.user_id == user_id)
            .filter_map(|p| Role::from_id(p.role_id))
            .min_by_key(|r| r.id()))
    }

    pub async fn authorize(&self, session: &Session, farm_id: u64, action: Action) -> Result<Role> {
        match self.role(session.user_id, farm_id).await? {
            Some(role) if role.permits(action) => Ok(role),
            _ => {
                tracing::warn!(
                    "🚫 user {} denied {action} on farm {farm_id}",
                    session.user_id
                );
                Err(CropDroidError::Unauthorized {
                    user_id: session.user_id,
                    farm_id,
                    action: action.to_string(),
                })
            }
        }
    }

    /// Give `user_id` a role on the farm. Admins only.
    pub async fn grant(&self, session: &Session, farm_id: u64, user_id: u64, role: Role) -> Result<Permission> {
        self.authorize(session, farm_id, Action::Provision).await?;
        let farm: Farm = self.dao.get(farm_id, self.dao.default_level()).await?;
        let permission = Permission {
            id: self.hasher.permission_id(user_id, farm_id, role.id()),
            user_id,
            org_id: farm.org_id,
            farm_id,
            role_id: role.id(),
        };
        let level = self.dao.write_level(farm.consistency);
        self.dao.put(farm_id, &permission, level).await?;
        tracing::info!("🔑 user {user_id} granted {role:?} on farm '{}'", farm.name);
        Ok(permission)
    }

    /// Drop every role `user_id` holds on the farm.
    pub async fn revoke(&self, session: &Session, farm_id: u64, user_id: u64) -> Result<usize> {
        self.authorize(session, farm_id, Action::Provision).await?;
        let farm: Farm = self.dao.get(farm_id, self.dao.default_level()).await?;
        let level = self.dao.write_level(farm.consistency);
        let permissions: Vec<Permission> = self
            .dao
            .list(&PageQuery::farm(farm_id), self.dao.default_level())
            .await?;
        let mut removed = 0;
        for p in permissions.iter().filter(|p| p.user_id == user_id) {
            self.dao.delete::<Permission>(p.id, level).await?;
            removed += 1;
        }
        Ok(removed)
    }
}

/// Authorize, then resolve the running scheduler.
async fn authorized(
    registry: &ServiceRegistry,
    session: &Session,
    farm_id: u64,
    action: Action,
) -> Result<Arc<FarmScheduler>> {
    registry.auth().authorize(session, farm_id, action).await?;
    registry.require_scheduler(farm_id)
}

pub struct ChannelService<'a> {
    registry: &'a ServiceRegistry,
}

impl<'a> ChannelService<'a> {
    pub fn new(registry: &'a ServiceRegistry) -> Self {
        Self { registry }
    }

    pub async fn get(&self, session: &Session, farm_id: u64, channel_id: u64) -> Result<Channel> {
        let scheduler = authorized(self.registry, session, farm_id, Action::View).await?;
        let config = scheduler.config().load();
        config
            .channel(channel_id)
            .map(|(_, c)| c.clone())
            .ok_or_else(|| CropDroidError::not_found("channel", channel_id))
    }

    /// Replace a channel's own fields. Its device, slot, conditions and
    /// schedules are kept; those change through their own services.
    pub async fn update(&self, session: &Session, farm_id: u64, channel: Channel) -> Result<Channel> {
        let scheduler = authorized(self.registry, session, farm_id, Action::Configure).await?;
        let config = scheduler.config().load();
        let (_, existing) = config
            .channel(channel.id)
            .ok_or_else(|| CropDroidError::not_found("channel", channel.id))?;
        let updated = Channel {
            id: existing.id,
            device_id: existing.device_id,
            channel_index: existing.channel_index,
            conditions: existing.conditions.clone(),
            schedules: existing.schedules.clone(),
            ..channel
        };

        let dao = self.registry.dao();
        dao.put(farm_id, &updated, dao.write_level(config.farm.consistency))
            .await?;
        let swapped = updated.clone();
        scheduler.config().update(move |c| {
            if let Some(ch) = c.channel_mut(swapped.id) {
                *ch = swapped;
            }
        });
        scheduler.channel_changed(updated.id);
        tracing::info!("🔧 channel '{}' updated on farm {farm_id}", updated.name);
        Ok(updated)
    }

    /// Manual override. The rule engine may reverse it on a later tick.
    /// Disabled channels and unreachable devices are never actuated.
    pub async fn switch(&self, session: &Session, farm_id: u64, channel_id: u64, state: i32) -> Result<()> {
        if state != CHANNEL_ON && state != CHANNEL_OFF {
            return Err(CropDroidError::InvalidRequest(format!(
                "channel state must be {CHANNEL_OFF} or {CHANNEL_ON}, got {state}"
            )));
        }
        let scheduler = authorized(self.registry, session, farm_id, Action::Actuate).await?;
        let config = scheduler.config().load();
        let (device, channel) = config
            .channel(channel_id)
            .ok_or_else(|| CropDroidError::not_found("channel", channel_id))?;
        if !channel.enable {
            return Err(CropDroidError::InvalidRequest(format!(
                "channel {} is disabled",
                channel.name
            )));
        }
        let worker = scheduler
            .worker(device.id)
            .ok_or_else(|| CropDroidError::not_found("device", device.id))?;

        let lock = worker.actuation_lock();
        let _guard = lock.lock().await;
        worker.ensure_reachable()?;
        worker
            .force_switch(channel.channel_index, state, self.registry.clock().now())
            .await?;
        self.registry
            .state()
            .set_channel(farm_id, &device.device_type, channel.channel_index, state);
        scheduler
            .events()
            .record(
                &device.device_type,
                "manual",
                format!("{} set to {state} by user {}", channel.name, session.user_id),
            )
            .await;
        Ok(())
    }
}

pub struct ConditionService<'a> {
    registry: &'a ServiceRegistry,
}

impl<'a> ConditionService<'a> {
    pub fn new(registry: &'a ServiceRegistry) -> Self {
        Self { registry }
    }

    pub async fn list(&self, session: &Session, farm_id: u64, channel_id: u64) -> Result<Vec<Condition>> {
        let scheduler = authorized(self.registry, session, farm_id, Action::View).await?;
        let config = scheduler.config().load();
        config
            .channel(channel_id)
            .map(|(_, c)| c.conditions.clone())
            .ok_or_else(|| CropDroidError::not_found("channel", channel_id))
    }

    pub async fn create(
        &self,
        session: &Session,
        farm_id: u64,
        channel_id: u64,
        metric_id: u64,
        comparator: Comparator,
        threshold: f64,
    ) -> Result<Condition> {
        let scheduler = authorized(self.registry, session, farm_id, Action::Configure).await?;
        let config = scheduler.config().load();
        let (device, _) = config
            .channel(channel_id)
            .ok_or_else(|| CropDroidError::not_found("channel", channel_id))?;
        if config.metric(metric_id).is_none() {
            return Err(CropDroidError::not_found("metric", metric_id));
        }
        let condition = Condition {
            id: self.registry.hasher().condition_id(
                device.id,
                0,
                channel_id,
                metric_id,
                comparator.as_str(),
                threshold,
            ),
            channel_id: Some(channel_id),
            workflow_id: None,
            metric_id,
            comparator,
            threshold,
        };

        let dao = self.registry.dao();
        dao.insert(farm_id, &condition, dao.write_level(config.farm.consistency))
            .await?;
        let added = condition.clone();
        scheduler.config().update(move |c| {
            if let Some(ch) = c.channel_mut(channel_id) {
                ch.conditions.push(added);
            }
        });
        scheduler.channel_changed(channel_id);
        Ok(condition)
    }

    pub async fn delete(&self, session: &Session, farm_id: u64, condition_id: u64) -> Result<()> {
        let scheduler = authorized(self.registry, session, farm_id, Action::Configure).await?;
        let config = scheduler.config().load();
        let channel_id = config
            .devices
            .iter()
            .flat_map(|d| d.channels.iter())
            .find(|ch| ch.conditions.iter().any(|c| c.id == condition_id))
            .map(|ch| ch.id)
            .ok_or_else(|| CropDroidError::not_found("condition", condition_id))?;

        let dao = self.registry.dao();
        dao.delete::<Condition>(condition_id, dao.write_level(config.farm.consistency))
            .await?;
        scheduler.config().update(|c| {
            if let Some(ch) = c.channel_mut(channel_id) {
                ch.conditions.retain(|cond| cond.id != condition_id);
            }
        });
        scheduler.channel_changed(channel_id);
        Ok(())
    }
}

pub struct WorkflowService<'a> {
    registry: &'a ServiceRegistry,
}

impl<'a> WorkflowService<'a> {
    pub fn new(registry: &'a ServiceRegistry) -> Self {
        Self { registry }
    }

    pub async fn trigger(
        &self,
        session: &Session,
        farm_id: u64,
        workflow_id: u64,
    ) -> Result<JoinHandle<WorkflowRun>> {
        let scheduler = authorized(self.registry, session, farm_id, Action::Actuate).await?;
        scheduler.trigger_workflow(workflow_id)
    }

    pub async fn cancel(&self, session: &Session, farm_id: u64, workflow_id: u64) -> Result<bool> {
        let scheduler = authorized(self.registry, session, farm_id, Action::Actuate).await?;
        Ok(scheduler.cancel_workflow(workflow_id))
    }

    pub async fn last_run(&self, session: &Session, farm_id: u64, workflow_id: u64) -> Result<Option<WorkflowRun>> {
        let scheduler = authorized(self.registry, session, farm_id, Action::View).await?;
        Ok(scheduler.workflows().last_run(workflow_id))
    }
}

pub struct EventService<'a> {
    registry: &'a ServiceRegistry,
}

impl<'a> EventService<'a> {
    pub fn new(registry: &'a ServiceRegistry) -> Self {
        Self { registry }
    }

    pub async fn list(&self, session: &Session, farm_id: u64, page: usize, page_size: usize) -> Result<Page<EventLog>> {
        self.registry.auth().authorize(session, farm_id, Action::View).await?;
        let events = self
            .registry
            .event_log(farm_id)
            .ok_or_else(|| CropDroidError::not_found("farm", farm_id))?;
        events.list(page, page_size).await
    }
}
