use crate::types::{AgentDescriptor, AgentStatus};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{SwitchboardError, SwitchboardResult};
use switchboard_store::{cas_json, get_json, scan_json, StateStore};
use tracing::{debug, info, warn};
use uuid::Uuid;

const AGENT_PREFIX: &str = "agent:";
const MAX_CAS_RETRIES: usize = 16;
const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

fn agent_key(agent_id: &str) -> String {
    format!("{AGENT_PREFIX}{agent_id}")
}

/// Shared view of the worker agents and their availability.
///
/// Claims go through compare-and-swap on the agent record, so at most one
/// task can move an agent from Idle to Busy.
pub struct AgentRegistry {
    store: Arc<dyn StateStore>,
    heartbeat_timeout: Duration,
}

impl AgentRegistry {
    /// Create a registry over `store` with a 30 second heartbeat timeout.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }

    /// Heartbeats older than `timeout` never bring an agent back.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Add or refresh an agent. A re-registered agent keeps its assignment
    /// history and any task it is still running.
    pub async fn register(&self, descriptor: AgentDescriptor) -> SwitchboardResult<()> {
        let key = agent_key(&descriptor.agent_id);
        for _ in 0..MAX_CAS_RETRIES {
            let existing = get_json::<AgentDescriptor>(self.store.as_ref(), &key).await?;
            let (record, expected) = match existing {
                Some(current) => {
                    let mut merged = descriptor.clone();
                    merged.registered_at = current.value.registered_at;
                    merged.last_assigned_at = current.value.last_assigned_at;
                    if current.value.status == AgentStatus::Busy {
                        merged.status = AgentStatus::Busy;
                        merged.current_task = current.value.current_task;
                    }
                    (merged, Some(current.version))
                }
                None => (descriptor.clone(), None),
            };
            match cas_json(self.store.as_ref(), &key, expected, &record).await {
                Ok(_) => {
                    info!(
                        agent_id = %record.agent_id,
                        capabilities = ?record.capabilities,
                        "Agent registered"
                    );
                    return Ok(());
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(SwitchboardError::Conflict(format!(
            "agent {} kept changing during registration",
            descriptor.agent_id
        )))
    }

    /// Look up one agent.
    pub async fn get(&self, agent_id: &str) -> SwitchboardResult<Option<AgentDescriptor>> {
        Ok(get_json::<AgentDescriptor>(self.store.as_ref(), &agent_key(agent_id))
            .await?
            .map(|v| v.value))
    }

    /// Every registered agent, Offline ones included, in id order.
    pub async fn list(&self) -> SwitchboardResult<Vec<AgentDescriptor>> {
        Ok(scan_json::<AgentDescriptor>(self.store.as_ref(), AGENT_PREFIX)
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }

    /// Record a heartbeat now.
    pub async fn heartbeat(&self, agent_id: &str) -> SwitchboardResult<()> {
        self.heartbeat_at(agent_id, Utc::now()).await
    }

    /// Record a heartbeat sent at `at`.
    ///
    /// Only a fresh heartbeat brings an Unhealthy or Offline agent back: it
    /// must be newer than the last one recorded and younger than the
    /// heartbeat timeout. Late or redelivered heartbeats are recorded but
    /// leave the status alone.
    pub async fn heartbeat_at(&self, agent_id: &str, at: DateTime<Utc>) -> SwitchboardResult<()> {
        let max_age = max_age(self.heartbeat_timeout);
        let updated = self
            .update(agent_id, |agent| {
                let newer = at > agent.last_heartbeat_at;
                let fresh = newer && Utc::now() - at <= max_age;
                let unavailable =
                    matches!(agent.status, AgentStatus::Unhealthy | AgentStatus::Offline);
                if !newer {
                    if unavailable {
                        debug!(agent_id = %agent.agent_id, sent_at = %at, "Ignoring stale heartbeat");
                    }
                    return false;
                }
                agent.last_heartbeat_at = at;
                if unavailable && fresh {
                    agent.status = if agent.current_task.is_some() {
                        AgentStatus::Busy
                    } else {
                        AgentStatus::Idle
                    };
                    info!(agent_id = %agent.agent_id, status = %agent.status, "Agent recovered");
                } else if unavailable {
                    debug!(agent_id = %agent.agent_id, sent_at = %at, "Heartbeat too old to restore agent");
                }
                true
            })
            .await?;
        match updated {
            Some(_) => Ok(()),
            None => Err(SwitchboardError::UnknownAgent(agent_id.to_string())),
        }
    }

    /// Idle agents advertising `capability`, best candidate first.
    ///
    /// Agents that were never assigned come first, then the least recently
    /// assigned, then the oldest heartbeat, then by id.
    pub async fn find_capable(&self, capability: &str) -> SwitchboardResult<Vec<AgentDescriptor>> {
        let mut candidates: Vec<AgentDescriptor> = self
            .list()
            .await?
            .into_iter()
            .filter(|a| a.status == AgentStatus::Idle && a.has_capability(capability))
            .collect();
        candidates.sort_by(|a, b| {
            a.last_assigned_at
                .cmp(&b.last_assigned_at)
                .then(a.last_heartbeat_at.cmp(&b.last_heartbeat_at))
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        Ok(candidates)
    }

    /// Move an Idle agent to Busy on `task_id`. Returns `false` when the
    /// agent is not Idle or another claim won the race.
    pub async fn try_claim(&self, agent_id: &str, task_id: Uuid) -> SwitchboardResult<bool> {
        let key = agent_key(agent_id);
        let Some(current) = get_json::<AgentDescriptor>(self.store.as_ref(), &key).await? else {
            return Ok(false);
        };
        if current.value.status != AgentStatus::Idle {
            return Ok(false);
        }
        let mut agent = current.value;
        agent.status = AgentStatus::Busy;
        agent.current_task = Some(task_id);
        agent.last_assigned_at = Some(Utc::now());
        match cas_json(self.store.as_ref(), &key, Some(current.version), &agent).await {
            Ok(_) => {
                debug!(agent_id = %agent_id, task_id = %task_id, "Agent claimed");
                Ok(true)
            }
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Free an agent held by `task_id`. Returns `false` if the agent was not
    /// holding that task.
    pub async fn release(&self, agent_id: &str, task_id: Uuid) -> SwitchboardResult<bool> {
        let mut released = false;
        self.update(agent_id, |agent| {
            if agent.current_task != Some(task_id) {
                return false;
            }
            agent.current_task = None;
            if agent.status == AgentStatus::Busy {
                agent.status = AgentStatus::Idle;
            }
            released = true;
            true
        })
        .await?;
        if released {
            debug!(agent_id = %agent_id, task_id = %task_id, "Agent released");
        }
        Ok(released)
    }

    /// Exclude an agent from routing until it heartbeats again.
    pub async fn mark_unhealthy(&self, agent_id: &str) -> SwitchboardResult<()> {
        self.set_unavailable(agent_id, AgentStatus::Unhealthy).await
    }

    /// Take an agent out of service. Its record is kept.
    pub async fn mark_offline(&self, agent_id: &str) -> SwitchboardResult<()> {
        self.set_unavailable(agent_id, AgentStatus::Offline).await
    }

    /// Same as [`AgentRegistry::mark_offline`].
    pub async fn deregister(&self, agent_id: &str) -> SwitchboardResult<()> {
        self.mark_offline(agent_id).await
    }

    async fn set_unavailable(&self, agent_id: &str, status: AgentStatus) -> SwitchboardResult<()> {
        let updated = self
            .update(agent_id, |agent| {
                if agent.status == status && agent.current_task.is_none() {
                    return false;
                }
                agent.status = status;
                agent.current_task = None;
                true
            })
            .await?;
        match updated {
            Some(_) => {
                warn!(agent_id = %agent_id, status = %status, "Agent marked unavailable");
                Ok(())
            }
            None => Err(SwitchboardError::UnknownAgent(agent_id.to_string())),
        }
    }

    /// Idle or Busy agents whose last heartbeat is older than `timeout`.
    pub async fn expired(
        &self,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> SwitchboardResult<Vec<AgentDescriptor>> {
        let timeout = max_age(timeout);
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|a| matches!(a.status, AgentStatus::Idle | AgentStatus::Busy))
            .filter(|a| now - a.last_heartbeat_at > timeout)
            .collect())
    }

    /// Capabilities advertised by agents that are not Offline.
    pub async fn known_capabilities(&self) -> SwitchboardResult<BTreeSet<String>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|a| a.status != AgentStatus::Offline)
            .flat_map(|a| a.capabilities)
            .collect())
    }

    /// Read-modify-write with conflict retry. `f` returns `false` to skip
    /// the write. Returns `None` if the agent is unknown.
    async fn update<F>(&self, agent_id: &str, mut f: F) -> SwitchboardResult<Option<AgentDescriptor>>
    where
        F: FnMut(&mut AgentDescriptor) -> bool,
    {
        let key = agent_key(agent_id);
        for _ in 0..MAX_CAS_RETRIES {
            let Some(current) = get_json::<AgentDescriptor>(self.store.as_ref(), &key).await? else {
                return Ok(None);
            };
            let mut agent = current.value;
            if !f(&mut agent) {
                return Ok(Some(agent));
            }
            match cas_json(self.store.as_ref(), &key, Some(current.version), &agent).await {
                Ok(_) => return Ok(Some(agent)),
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(SwitchboardError::Conflict(format!(
            "agent {agent_id} kept changing"
        )))
    }
}

/// Timeouts beyond chrono's range never expire.
fn max_age(timeout: Duration) -> chrono::Duration {
    chrono::Duration::from_std(timeout).unwrap_or(chrono::TimeDelta::MAX)
}
