use serde::{Deserialize, Serialize};
use std::time::Duration;
use switchboard_agent::RetryPolicy;
use switchboard_core::{SwitchboardError, SwitchboardResult};
use switchboard_security::RateLimitConfig;

/// Tunables of one orchestrator instance.
///
/// Every field has a default, so an empty `[orchestrator]` table is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Identifies this instance in lock holders and decision log entries.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    /// Dispatch retry ceiling and backoff curve.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Seconds between expected agent heartbeats.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Heartbeats an agent may miss before it is marked unhealthy.
    #[serde(default = "default_missed_heartbeats")]
    pub missed_heartbeats: u32,
    /// Budget for one reasoning call before the catalog fallback applies.
    #[serde(default = "default_reasoning_timeout_ms")]
    pub reasoning_timeout_ms: u64,
    /// How long a task may wait in the queue before it is reported stalled.
    #[serde(default = "default_stale_queued_after_secs")]
    pub stale_queued_after_secs: u64,
    /// Lease of the per-parent aggregation lock.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// Messages handled concurrently by this instance.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Deepest subtask nesting a decomposition may produce.
    #[serde(default = "default_max_decomposition_depth")]
    pub max_decomposition_depth: u32,
    /// Capabilities known even when no agent advertises them.
    #[serde(default)]
    pub capability_catalog: Vec<String>,
    /// Token bucket in front of the reasoning backend.
    #[serde(default)]
    pub reasoning_rate_limit: RateLimitConfig,
    /// Secret store path of the reasoning credential, if one is required.
    #[serde(default)]
    pub reasoning_secret_path: Option<String>,
    /// Period of the maintenance sweep in the run loop.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Base delay before re-routing a task that found no capable agent.
    #[serde(default = "default_routing_backoff_ms")]
    pub routing_backoff_ms: u64,
    /// Pause before a message is redelivered after a dependency outage.
    #[serde(default = "default_outage_backoff_ms")]
    pub outage_backoff_ms: u64,
}

fn default_instance_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("switchboard-{}", &id[..8])
}
fn default_heartbeat_interval_secs() -> u64 {
    10
}
fn default_missed_heartbeats() -> u32 {
    3
}
fn default_reasoning_timeout_ms() -> u64 {
    5_000
}
fn default_stale_queued_after_secs() -> u64 {
    300
}
fn default_lock_ttl_secs() -> u64 {
    30
}
fn default_max_in_flight() -> usize {
    10
}
fn default_max_decomposition_depth() -> u32 {
    2
}
fn default_sweep_interval_ms() -> u64 {
    1_000
}
fn default_routing_backoff_ms() -> u64 {
    1_000
}
fn default_outage_backoff_ms() -> u64 {
    1_000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            retry: RetryPolicy::default(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            missed_heartbeats: default_missed_heartbeats(),
            reasoning_timeout_ms: default_reasoning_timeout_ms(),
            stale_queued_after_secs: default_stale_queued_after_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
            max_in_flight: default_max_in_flight(),
            max_decomposition_depth: default_max_decomposition_depth(),
            capability_catalog: Vec::new(),
            reasoning_rate_limit: RateLimitConfig::default(),
            reasoning_secret_path: None,
            sweep_interval_ms: default_sweep_interval_ms(),
            routing_backoff_ms: default_routing_backoff_ms(),
            outage_backoff_ms: default_outage_backoff_ms(),
        }
    }
}

impl OrchestratorConfig {
    /// Silence after which an agent is considered dead.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(
            self.heartbeat_interval_secs
                .saturating_mul(u64::from(self.missed_heartbeats)),
        )
    }

    /// `reasoning_timeout_ms` as a duration.
    pub fn reasoning_timeout(&self) -> Duration {
        Duration::from_millis(self.reasoning_timeout_ms)
    }

    /// `stale_queued_after_secs` as a duration.
    pub fn stale_queued_after(&self) -> Duration {
        Duration::from_secs(self.stale_queued_after_secs)
    }

    /// `lock_ttl_secs` as a duration.
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    /// `sweep_interval_ms` as a duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// `outage_backoff_ms` as a duration.
    pub fn outage_backoff(&self) -> Duration {
        Duration::from_millis(self.outage_backoff_ms)
    }

    /// Delay before the next routing attempt after `misses` consecutive
    /// misses, on the same curve as dispatch retries.
    pub fn routing_backoff(&self, misses: u32) -> Duration {
        let policy = RetryPolicy {
            backoff_base_ms: self.routing_backoff_ms,
            ..self.retry.clone()
        };
        policy.backoff(misses.saturating_sub(1))
    }

    /// Reject settings the orchestrator cannot run with.
    pub fn validate(&self) -> SwitchboardResult<()> {
        if self.instance_id.trim().is_empty() {
            return Err(SwitchboardError::Config("instance_id must not be empty".into()));
        }
        if self.max_in_flight == 0 {
            return Err(SwitchboardError::Config("max_in_flight must be at least 1".into()));
        }
        if self.heartbeat_interval_secs == 0 || self.missed_heartbeats == 0 {
            return Err(SwitchboardError::Config(
                "heartbeat_interval_secs and missed_heartbeats must be positive".into(),
            ));
        }
        if self.reasoning_timeout_ms == 0 {
            return Err(SwitchboardError::Config("reasoning_timeout_ms must be positive".into()));
        }
        if self.lock_ttl_secs == 0 {
            return Err(SwitchboardError::Config("lock_ttl_secs must be positive".into()));
        }
        if self.retry.backoff_base_ms > self.retry.backoff_max_ms {
            return Err(SwitchboardError::Config(
                "retry.backoff_base_ms exceeds retry.backoff_max_ms".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert!(config.instance_id.starts_with("switchboard-"));
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(30));
        assert_eq!(config.reasoning_timeout(), Duration::from_secs(5));
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.max_in_flight, 10);
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: OrchestratorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.missed_heartbeats, 3);
        assert_eq!(config.max_decomposition_depth, 2);
        assert!(config.reasoning_secret_path.is_none());
    }

    #[test]
    fn test_routing_backoff_grows_and_caps() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.routing_backoff(1), Duration::from_millis(1_000));
        assert_eq!(config.routing_backoff(2), Duration::from_millis(2_000));
        assert_eq!(config.routing_backoff(20), Duration::from_millis(30_000));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = OrchestratorConfig {
            max_in_flight: 0,
            ..OrchestratorConfig::default()
        };
        assert!(matches!(config.validate(), Err(SwitchboardError::Config(_))));

        let config = OrchestratorConfig {
            missed_heartbeats: 0,
            ..OrchestratorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heartbeat_timeout_saturates() {
        let config = OrchestratorConfig {
            heartbeat_interval_secs: u64::MAX,
            missed_heartbeats: 4,
            ..OrchestratorConfig::default()
        };
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(u64::MAX));
        config.validate().unwrap();
    }
}
