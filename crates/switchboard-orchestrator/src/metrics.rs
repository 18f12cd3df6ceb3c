use crate::types::VelocityRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use switchboard_core::SwitchboardResult;
use switchboard_store::{cas_json, scan_json, StateStore};
use tracing::debug;
use uuid::Uuid;

const VELOCITY_PREFIX: &str = "velocity:";

/// Per-agent totals over the recorded attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentVelocity {
    /// Attempts recorded for the agent.
    pub attempts: u64,
    /// Attempts that succeeded.
    pub succeeded: u64,
    /// Sum of reported durations.
    pub total_duration_ms: u64,
}

impl AgentVelocity {
    /// Mean reported duration, 0 when nothing was recorded.
    pub fn mean_duration_ms(&self) -> u64 {
        self.total_duration_ms
            .checked_div(self.attempts)
            .unwrap_or_default()
    }

    /// Share of attempts that succeeded, 1.0 when nothing was recorded.
    pub fn success_rate(&self) -> f32 {
        if self.attempts == 0 {
            return 1.0;
        }
        self.succeeded as f32 / self.attempts as f32
    }
}

/// Velocity records, one per finished dispatch attempt.
///
/// Keyed by task and attempt, so a redelivered report cannot count twice.
pub struct VelocityLog {
    store: Arc<dyn StateStore>,
}

impl VelocityLog {
    /// Create a velocity log over `store`.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    fn key(task_id: Uuid, attempt: u32) -> String {
        format!("{VELOCITY_PREFIX}{task_id}:{attempt:06}")
    }

    /// Store `record`. Returns `false` if that attempt was already recorded.
    pub async fn record(&self, record: &VelocityRecord) -> SwitchboardResult<bool> {
        let key = Self::key(record.task_id, record.attempt);
        match cas_json(self.store.as_ref(), &key, None, record).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_conflict() => {
                debug!(task_id = %record.task_id, attempt = record.attempt, "Velocity already recorded");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Records for `task_id`, oldest attempt first.
    pub async fn entries_for(&self, task_id: Uuid) -> SwitchboardResult<Vec<VelocityRecord>> {
        let prefix = format!("{VELOCITY_PREFIX}{task_id}:");
        Ok(scan_json::<VelocityRecord>(self.store.as_ref(), &prefix)
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }

    /// Totals per agent over every record.
    pub async fn summary(&self) -> SwitchboardResult<BTreeMap<String, AgentVelocity>> {
        let mut by_agent: BTreeMap<String, AgentVelocity> = BTreeMap::new();
        for record in scan_json::<VelocityRecord>(self.store.as_ref(), VELOCITY_PREFIX).await? {
            let record = record.value;
            let entry = by_agent.entry(record.agent_id).or_default();
            entry.attempts += 1;
            if record.success {
                entry.succeeded += 1;
            }
            entry.total_duration_ms = entry.total_duration_ms.saturating_add(record.duration_ms);
        }
        Ok(by_agent)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use switchboard_store::MemoryStateStore;

    fn record(task_id: Uuid, agent: &str, attempt: u32, duration_ms: u64, success: bool) -> VelocityRecord {
        VelocityRecord {
            task_id,
            agent_id: agent.to_string(),
            capability: "code_gen".to_string(),
            attempt,
            duration_ms,
            success,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_record_once_per_attempt() {
        let log = VelocityLog::new(Arc::new(MemoryStateStore::new()));
        let task = Uuid::new_v4();
        assert!(log.record(&record(task, "coder-1", 1, 40, false)).await.unwrap());
        assert!(!log.record(&record(task, "coder-1", 1, 40, false)).await.unwrap());
        assert!(log.record(&record(task, "coder-2", 2, 60, true)).await.unwrap());

        let entries = log.entries_for(task).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].attempt, 1);
        assert!(entries[1].success);
        assert!(log.entries_for(Uuid::new_v4()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_summary_by_agent() {
        let log = VelocityLog::new(Arc::new(MemoryStateStore::new()));
        log.record(&record(Uuid::new_v4(), "coder-1", 1, 100, true)).await.unwrap();
        log.record(&record(Uuid::new_v4(), "coder-1", 1, 300, false)).await.unwrap();
        log.record(&record(Uuid::new_v4(), "reviewer-1", 1, 50, true)).await.unwrap();

        let summary = log.summary().await.unwrap();
        let coder = &summary["coder-1"];
        assert_eq!(coder.attempts, 2);
        assert_eq!(coder.mean_duration_ms(), 200);
        assert!((coder.success_rate() - 0.5).abs() < f32::EPSILON);
        assert_eq!(summary["reviewer-1"].succeeded, 1);
        assert_eq!(AgentVelocity::default().mean_duration_ms(), 0);
    }
}
