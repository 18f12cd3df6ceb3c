//! `switchboard.toml` loading and adapter wiring.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use switchboard_agent::LoopbackAgent;
use switchboard_channels::MessageChannel;
use switchboard_orchestrator::OrchestratorConfig;
use switchboard_security::EnvSecretStore;
use switchboard_store::{MemoryStateStore, StateStore};

/// Contents of `switchboard.toml`.
#[derive(Debug, Deserialize)]
pub struct SwitchboardConfig {
    /// Root of the SQLite file and the journals.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Orchestrator tunables.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// State store backend.
    #[serde(default)]
    pub store: StoreConfig,
    /// Where reasoning credentials come from.
    #[serde(default)]
    pub secrets: SecretsConfig,
    /// In-process worker agents started with the orchestrator.
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

/// State store implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process, lost on exit.
    #[default]
    Memory,
    /// SQLite file under `data_dir`.
    Sqlite,
}

/// The `[store]` table.
#[derive(Debug, Default, Deserialize)]
pub struct StoreConfig {
    /// Which store to open.
    #[serde(default)]
    pub backend: StoreBackend,
    /// SQLite file. Defaults to `<data_dir>/state.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// The `[secrets]` table.
#[derive(Debug, Deserialize)]
pub struct SecretsConfig {
    /// Prefix of secret environment variables.
    #[serde(default = "default_env_prefix")]
    pub env_prefix: String,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            env_prefix: default_env_prefix(),
        }
    }
}

/// A loopback agent that echoes each payload back, optionally after a delay.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Agent id, unique per config.
    pub id: String,
    /// Capabilities the agent advertises.
    pub capabilities: Vec<String>,
    /// Delay before each report.
    #[serde(default)]
    pub delay_ms: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_env_prefix() -> String {
    "SWITCHBOARD_SECRET_".to_string()
}

impl SwitchboardConfig {
    /// Read and validate the config at `path`.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        Self::parse(&raw)
    }

    /// Parse and validate TOML text.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let config: SwitchboardConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject duplicate or empty agents and invalid orchestrator settings.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.orchestrator.validate()?;

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                anyhow::bail!("agent id must not be empty");
            }
            if !seen.insert(agent.id.as_str()) {
                anyhow::bail!("agent '{}' is declared twice", agent.id);
            }
            if agent.capabilities.is_empty() {
                anyhow::bail!("agent '{}' advertises no capabilities", agent.id);
            }
        }

        if self.store.backend == StoreBackend::Sqlite && !cfg!(feature = "sqlite") {
            anyhow::bail!("store backend 'sqlite' needs the 'sqlite' feature");
        }
        Ok(())
    }

    /// Directory of the degraded-mode journals.
    pub fn journal_dir(&self) -> PathBuf {
        self.data_dir.join("journal")
    }

    /// SQLite file, defaulting to `<data_dir>/state.db`.
    pub fn sqlite_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("state.db"))
    }

    /// Open the configured state store.
    pub fn open_store(&self) -> anyhow::Result<Arc<dyn StateStore>> {
        match self.store.backend {
            StoreBackend::Memory => Ok(Arc::new(MemoryStateStore::new())),
            #[cfg(feature = "sqlite")]
            StoreBackend::Sqlite => {
                let path = self.sqlite_path();
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Ok(Arc::new(switchboard_store::SqliteStateStore::open(&path)?))
            }
            #[cfg(not(feature = "sqlite"))]
            StoreBackend::Sqlite => anyhow::bail!("store backend 'sqlite' needs the 'sqlite' feature"),
        }
    }

    /// Environment-backed secret store with the configured prefix.
    pub fn secret_store(&self) -> EnvSecretStore {
        EnvSecretStore::with_prefix(self.secrets.env_prefix.clone())
    }
}

impl AgentConfig {
    /// Create the loopback agent.
    pub fn build(&self, channel: Arc<dyn MessageChannel>) -> LoopbackAgent {
        LoopbackAgent::echo(self.id.clone(), self.capabilities.clone(), channel)
            .with_delay(Duration::from_millis(self.delay_ms))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use switchboard_agent::Agent;
    use switchboard_channels::MemoryChannel;

    const SAMPLE: &str = r#"
data_dir = "/var/lib/switchboard"

[orchestrator]
instance_id = "orch-a"
capability_catalog = ["deploy"]
max_in_flight = 4

[orchestrator.retry]
max_retries = 5

[store]
backend = "sqlite"

[[agents]]
id = "coder-1"
capabilities = ["code_gen"]

[[agents]]
id = "reviewer-1"
capabilities = ["review"]
delay_ms = 250
"#;

    #[test]
    fn test_parse_sample() {
        let config = SwitchboardConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.orchestrator.instance_id, "orch-a");
        assert_eq!(config.orchestrator.max_in_flight, 4);
        assert_eq!(config.orchestrator.retry.max_retries, 5);
        assert_eq!(config.orchestrator.retry.backoff_base_ms, 500);
        assert_eq!(config.orchestrator.missed_heartbeats, 3);
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.sqlite_path(), PathBuf::from("/var/lib/switchboard/state.db"));
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents[1].delay_ms, 250);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = SwitchboardConfig::parse("").unwrap();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.secrets.env_prefix, "SWITCHBOARD_SECRET_");
        assert!(config.agents.is_empty());
        assert_eq!(config.journal_dir(), PathBuf::from("./data/journal"));
    }

    #[test]
    fn test_rejects_duplicate_agents() {
        let raw = r#"
[[agents]]
id = "a"
capabilities = ["x"]

[[agents]]
id = "a"
capabilities = ["y"]
"#;
        let err = SwitchboardConfig::parse(raw).unwrap_err();
        assert!(err.to_string().contains("declared twice"));
    }

    #[test]
    fn test_rejects_agent_without_capabilities() {
        let raw = r#"
[[agents]]
id = "idle"
capabilities = []
"#;
        assert!(SwitchboardConfig::parse(raw).is_err());
    }

    #[test]
    fn test_rejects_invalid_orchestrator_settings() {
        let raw = r#"
[orchestrator]
max_in_flight = 0
"#;
        let err = SwitchboardConfig::parse(raw).unwrap_err();
        assert!(err.to_string().contains("max_in_flight"));
    }

    #[test]
    fn test_unknown_backend_is_a_parse_error() {
        let raw = r#"
[store]
backend = "etcd"
"#;
        assert!(SwitchboardConfig::parse(raw).is_err());
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = SwitchboardConfig::load(Path::new("/nonexistent/switchboard.toml"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_open_sqlite_store_in_data_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let raw = format!(
            "data_dir = {:?}\n[store]\nbackend = \"sqlite\"\n",
            tmp.path().join("nested").display().to_string()
        );
        let config = SwitchboardConfig::parse(&raw).unwrap();
        let store = config.open_store().unwrap();
        store.ping().await.unwrap();
        assert!(tmp.path().join("nested").join("state.db").exists());
    }

    #[test]
    fn test_agent_build() {
        let config = AgentConfig {
            id: "coder-1".into(),
            capabilities: vec!["code_gen".into()],
            delay_ms: 0,
        };
        let agent = config.build(Arc::new(MemoryChannel::default()));
        assert_eq!(agent.id(), "coder-1");
        assert_eq!(agent.capabilities(), vec!["code_gen".to_string()]);
    }
}
