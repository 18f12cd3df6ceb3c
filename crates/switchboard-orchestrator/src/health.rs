use crate::types::{AgentDescriptor, AgentStatus, Task, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use switchboard_core::SwitchboardResult;

/// Overall condition of an orchestrator instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every dependency answered.
    Healthy,
    /// Running, but some optional dependency is down.
    Degraded,
    /// A dependency every operation needs is down.
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Result of pinging one dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Dependency name.
    pub name: String,
    /// Whether the ping succeeded.
    pub healthy: bool,
    /// Whether the orchestrator can make progress without this component.
    pub critical: bool,
    /// Error text of a failed ping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ComponentHealth {
    /// Summarize one ping result.
    pub fn from_ping(name: impl Into<String>, critical: bool, ping: SwitchboardResult<()>) -> Self {
        let (healthy, detail) = match ping {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };
        Self {
            name: name.into(),
            healthy,
            critical,
            detail,
        }
    }
}

/// Agent counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSummary {
    /// Registered agents.
    pub total: usize,
    /// Agents ready for work.
    pub idle: usize,
    /// Agents holding a task.
    pub busy: usize,
    /// Agents that missed their heartbeats.
    pub unhealthy: usize,
    /// Deregistered agents.
    pub offline: usize,
}

impl AgentSummary {
    /// Count `agents` by status.
    pub fn from_agents(agents: &[AgentDescriptor]) -> Self {
        let mut summary = Self {
            total: agents.len(),
            ..Self::default()
        };
        for agent in agents {
            match agent.status {
                AgentStatus::Idle => summary.idle += 1,
                AgentStatus::Busy => summary.busy += 1,
                AgentStatus::Unhealthy => summary.unhealthy += 1,
                AgentStatus::Offline => summary.offline += 1,
            }
        }
        summary
    }
}

/// Snapshot returned by `Orchestrator::health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    /// Overall verdict.
    pub status: HealthStatus,
    /// Instance that took the snapshot.
    pub instance_id: String,
    /// One entry per dependency.
    pub components: Vec<ComponentHealth>,
    /// Agent counts.
    pub agents: AgentSummary,
    /// Task counts keyed by status name. Empty when the store is down.
    pub tasks: BTreeMap<String, usize>,
    /// When the snapshot was taken.
    pub checked_at: DateTime<Utc>,
}

impl SystemHealth {
    /// Create a new snapshot; the status follows the components.
    pub fn new(instance_id: impl Into<String>, components: Vec<ComponentHealth>) -> Self {
        Self {
            status: overall_status(&components),
            instance_id: instance_id.into(),
            components,
            agents: AgentSummary::default(),
            tasks: BTreeMap::new(),
            checked_at: Utc::now(),
        }
    }

    /// Attach agent counts.
    pub fn with_agents(mut self, agents: &[AgentDescriptor]) -> Self {
        self.agents = AgentSummary::from_agents(agents);
        self
    }

    /// Attach task counts.
    pub fn with_tasks(mut self, tasks: &[Task]) -> Self {
        self.tasks = task_counts(tasks);
        self
    }

    /// Look up a component by name.
    pub fn component(&self, name: &str) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.name == name)
    }
}

/// Unhealthy if a critical component is down, Degraded if any other is.
pub fn overall_status(components: &[ComponentHealth]) -> HealthStatus {
    if components.iter().any(|c| c.critical && !c.healthy) {
        HealthStatus::Unhealthy
    } else if components.iter().any(|c| !c.healthy) {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

fn task_counts(tasks: &[Task]) -> BTreeMap<String, usize> {
    let mut counts: BTreeMap<String, usize> = TaskStatus::ALL
        .iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect();
    for task in tasks {
        *counts.entry(task.status.as_str().to_string()).or_default() += 1;
    }
    counts
}
