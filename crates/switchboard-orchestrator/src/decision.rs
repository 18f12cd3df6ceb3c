//! Decision engine and decision log.
//!
//! Every task passes through [`DecisionEngine::evaluate`] exactly once per
//! processing attempt. The engine asks the reasoning capability whether to
//! route the task as-is, split it, or reject it, and falls back to a
//! capability-catalog lookup whenever reasoning is slow, throttled, missing
//! credentials, or answers with something unusable. Each evaluation leaves
//! one [`DecisionLogEntry`] behind, fallbacks included.

use crate::registry::AgentRegistry;
use crate::types::{Decision, DecisionLogEntry, SubtaskSpec, Task};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use switchboard_agent::{ReasoningBackend, ReasoningPrompt};
use switchboard_core::{SwitchboardError, SwitchboardResult};
use switchboard_security::{RateLimiter, SecretStore};
use switchboard_store::{cas_json, scan_json, Journal, StateStore};
use tracing::{info, warn};
use uuid::Uuid;

/// Reason recorded when no decision could be reached without reasoning.
pub const REASONING_UNAVAILABLE: &str = "reasoning_unavailable";

const RATE_LIMIT_KEY: &str = "reasoning";

/// Append-only log of decisions, one entry per evaluation.
pub struct DecisionLog {
    store: Arc<dyn StateStore>,
    journal: Option<Arc<Journal>>,
}

impl DecisionLog {
    /// Create a new decision log over `store`.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            journal: None,
        }
    }

    /// Journal entries while the store is unavailable.
    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    fn key(entry: &DecisionLogEntry) -> String {
        format!(
            "decision:{}:{:020}:{}",
            entry.task_id,
            entry.timestamp.timestamp_micros().max(0),
            entry.entry_id
        )
    }

    /// Store `entry`. Appending the same entry twice is a no-op.
    pub async fn append(&self, entry: &DecisionLogEntry) -> SwitchboardResult<()> {
        let key = Self::key(entry);
        match cas_json(self.store.as_ref(), &key, None, entry).await {
            Ok(_) => Ok(()),
            Err(SwitchboardError::StoreUnavailable(reason)) => match &self.journal {
                Some(journal) => {
                    journal.append(&key, &serde_json::to_string(entry)?).await?;
                    warn!(task_id = %entry.task_id, reason = %reason, "Decision journaled while store is down");
                    Ok(())
                }
                None => Err(SwitchboardError::StoreUnavailable(reason)),
            },
            Err(e) => Err(e),
        }
    }

    /// Entries for `task_id` in the order they were appended.
    pub async fn entries_for(&self, task_id: Uuid) -> SwitchboardResult<Vec<DecisionLogEntry>> {
        let prefix = format!("decision:{task_id}:");
        Ok(scan_json::<DecisionLogEntry>(self.store.as_ref(), &prefix)
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }
}

/// Catalog entries a capability tag maps to: the tag itself, or entries
/// namespaced under it (`code` matches `code.fix`).
pub fn catalog_matches(tag: &str, catalog: &BTreeSet<String>) -> Vec<String> {
    let namespace = format!("{tag}.");
    catalog
        .iter()
        .filter(|c| c.as_str() == tag || c.starts_with(&namespace))
        .cloned()
        .collect()
}

/// Settings the engine needs from the orchestrator config.
#[derive(Debug, Clone)]
pub struct DecisionSettings {
    /// Recorded on every entry.
    pub instance_id: String,
    /// Budget for one reasoning call.
    pub timeout: Duration,
    /// Deepest nesting a decomposition may reach.
    pub max_depth: u32,
    /// Capabilities known without an advertising agent.
    pub catalog: Vec<String>,
    /// Secret store path of the reasoning credential.
    pub secret_path: Option<String>,
}

/// Decides whether a task is routed, decomposed or rejected.
pub struct DecisionEngine {
    reasoning: Option<Arc<dyn ReasoningBackend>>,
    registry: Arc<AgentRegistry>,
    secrets: Arc<dyn SecretStore>,
    limiter: RateLimiter,
    log: Arc<DecisionLog>,
    settings: DecisionSettings,
}

impl DecisionEngine {
    /// Create a new engine. Without a backend every decision uses the catalog fallback.
    pub fn new(
        reasoning: Option<Arc<dyn ReasoningBackend>>,
        registry: Arc<AgentRegistry>,
        secrets: Arc<dyn SecretStore>,
        limiter: RateLimiter,
        log: Arc<DecisionLog>,
        settings: DecisionSettings,
    ) -> Self {
        Self {
            reasoning,
            registry,
            secrets,
            limiter,
            log,
            settings,
        }
    }

    /// The decision log.
    pub fn log(&self) -> &Arc<DecisionLog> {
        &self.log
    }

    /// Decide what to do with `task` and record the decision.
    ///
    /// Only a failure to record the decision is returned as an error;
    /// reasoning failures take the fallback path.
    pub async fn evaluate(&self, task: &Task) -> SwitchboardResult<Decision> {
        let (decision, rationale, fallback) = match self.consult(task).await {
            Ok((decision, rationale)) => (decision, rationale, false),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Reasoning unavailable, using fallback");
                let decision = self.fallback(task).await;
                (decision, format!("fallback: {e}"), true)
            }
        };

        let entry = DecisionLogEntry {
            entry_id: Uuid::new_v4(),
            task_id: task.id,
            decision_kind: decision.kind(),
            rationale,
            timestamp: Utc::now(),
            fallback,
            instance_id: self.settings.instance_id.clone(),
        };
        self.log.append(&entry).await?;
        info!(
            task_id = %task.id,
            decision = ?entry.decision_kind,
            fallback,
            "Task evaluated"
        );
        Ok(decision)
    }

    /// Known capabilities: the configured catalog plus whatever registered
    /// agents advertise.
    pub async fn catalog(&self) -> BTreeSet<String> {
        let mut catalog: BTreeSet<String> = self.settings.catalog.iter().cloned().collect();
        match self.registry.known_capabilities().await {
            Ok(advertised) => catalog.extend(advertised),
            Err(e) => warn!(error = %e, "Could not read advertised capabilities"),
        }
        catalog
    }

    /// Decision reached without reasoning: route directly iff the tag maps
    /// to exactly one known capability.
    pub async fn fallback(&self, task: &Task) -> Decision {
        let catalog = self.catalog().await;
        let mut matches = catalog_matches(&task.capability_required, &catalog);
        if matches.len() == 1 {
            Decision::RouteDirect {
                capability: matches.remove(0),
            }
        } else {
            Decision::Reject {
                reason: REASONING_UNAVAILABLE.to_string(),
            }
        }
    }

    async fn consult(&self, task: &Task) -> SwitchboardResult<(Decision, String)> {
        let backend = self
            .reasoning
            .as_ref()
            .ok_or_else(|| SwitchboardError::Reasoning("no reasoning backend configured".into()))?;

        if !self.limiter.check(RATE_LIMIT_KEY).await {
            return Err(SwitchboardError::RateLimited(
                "reasoning call budget exhausted".into(),
            ));
        }

        let mut prompt = ReasoningPrompt::new(self.prompt_for(task).await);
        if let Some(path) = &self.settings.secret_path {
            prompt = prompt.with_credential(self.secrets.get_secret(path).await?);
        }

        let timeout = self.settings.timeout;
        let response = tokio::time::timeout(timeout, backend.infer(&prompt, timeout))
            .await
            .map_err(|_| {
                SwitchboardError::Timeout(format!("reasoning exceeded {}ms", timeout.as_millis()))
            })??;
        self.interpret(task, &response.body)
    }

    async fn prompt_for(&self, task: &Task) -> String {
        let catalog: Vec<String> = self.catalog().await.into_iter().collect();
        let request = serde_json::json!({
            "task": {
                "id": task.id,
                "capability_required": task.capability_required,
                "payload": task.payload,
                "depth": task.depth,
            },
            "known_capabilities": catalog,
            "may_decompose": task.depth < self.settings.max_depth,
        });
        format!(
            "Decide how to handle the task below. Answer with a JSON object \
             {{\"decision\": \"route_direct\" | \"decompose\" | \"reject\", \
             \"capability\": string (optional), \
             \"subtasks\": [{{\"capability\": string, \"payload\": any}}], \
             \"reason\": string}}.\n{request}"
        )
    }

    fn interpret(
        &self,
        task: &Task,
        body: &serde_json::Value,
    ) -> SwitchboardResult<(Decision, String)> {
        let kind = body
            .get("decision")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| SwitchboardError::Reasoning("answer has no 'decision' field".into()))?;
        let reason = body
            .get("reason")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();

        match kind {
            "route_direct" => {
                let capability = body
                    .get("capability")
                    .and_then(serde_json::Value::as_str)
                    .filter(|c| !c.trim().is_empty())
                    .unwrap_or(&task.capability_required)
                    .to_string();
                Ok((Decision::RouteDirect { capability }, reason))
            }
            "decompose" => {
                let subtasks: Vec<SubtaskSpec> = match body.get("subtasks") {
                    Some(raw) => serde_json::from_value(raw.clone()).map_err(|e| {
                        SwitchboardError::Reasoning(format!("malformed subtasks: {e}"))
                    })?,
                    None => Vec::new(),
                };
                if subtasks.iter().any(|s| s.capability.trim().is_empty()) {
                    return Err(SwitchboardError::Reasoning(
                        "subtask without capability".into(),
                    ));
                }
                let route_direct = Decision::RouteDirect {
                    capability: task.capability_required.clone(),
                };
                if subtasks.is_empty() {
                    Ok((route_direct, "decomposition proposed no subtasks".into()))
                } else if task.depth >= self.settings.max_depth {
                    Ok((
                        route_direct,
                        format!("decomposition depth limit {} reached", self.settings.max_depth),
                    ))
                } else {
                    Ok((Decision::Decompose { subtasks }, reason))
                }
            }
            "reject" => {
                let reason = if reason.is_empty() {
                    "rejected by reasoning".to_string()
                } else {
                    reason
                };
                Ok((
                    Decision::Reject {
                        reason: reason.clone(),
                    },
                    reason,
                ))
            }
            other => Err(SwitchboardError::Reasoning(format!(
                "unknown decision '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{AgentDescriptor, DecisionKind};
    use async_trait::async_trait;
    use switchboard_agent::ReasoningResponse;
    use switchboard_security::StaticSecretStore;
    use switchboard_store::MemoryStateStore;

    /// Answers every call with the same body after an optional delay.
    struct FixedReasoning {
        body: serde_json::Value,
        delay: Duration,
    }

    #[async_trait]
    impl ReasoningBackend for FixedReasoning {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn infer(
            &self,
            prompt: &ReasoningPrompt,
            _timeout: Duration,
        ) -> SwitchboardResult<ReasoningResponse> {
            assert!(prompt.text.contains("known_capabilities"));
            tokio::time::sleep(self.delay).await;
            Ok(ReasoningResponse::new(self.body.clone()))
        }
    }

    struct Harness {
        engine: DecisionEngine,
        secrets: Arc<StaticSecretStore>,
    }

    async fn harness(
        body: Option<serde_json::Value>,
        delay: Duration,
        catalog: &[&str],
        secret_path: Option<&str>,
    ) -> Harness {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let registry = Arc::new(AgentRegistry::new(store.clone()));
        registry
            .register(AgentDescriptor::new("coder-1", vec!["code_gen".into()]))
            .await
            .unwrap();
        let secrets = Arc::new(StaticSecretStore::new());
        let reasoning = body.map(|body| {
            Arc::new(FixedReasoning { body, delay }) as Arc<dyn ReasoningBackend>
        });
        let engine = DecisionEngine::new(
            reasoning,
            registry,
            secrets.clone(),
            RateLimiter::new(100.0, 100.0),
            Arc::new(DecisionLog::new(store)),
            DecisionSettings {
                instance_id: "test".into(),
                timeout: Duration::from_millis(100),
                max_depth: 1,
                catalog: catalog.iter().map(|c| c.to_string()).collect(),
                secret_path: secret_path.map(String::from),
            },
        );
        Harness { engine, secrets }
    }

    #[test]
    fn test_catalog_matches_namespaces() {
        let catalog: BTreeSet<String> = ["code.fix", "code.generate", "codex", "research"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(catalog_matches("code", &catalog).len(), 2);
        assert_eq!(catalog_matches("research", &catalog), vec!["research".to_string()]);
        assert!(catalog_matches("deploy", &catalog).is_empty());
        assert_eq!(catalog_matches("code.fix", &catalog), vec!["code.fix".to_string()]);
    }

    #[tokio::test]
    async fn test_reasoning_route_direct() {
        let h = harness(
            Some(serde_json::json!({"decision": "route_direct", "reason": "simple"})),
            Duration::ZERO,
            &[],
            None,
        )
        .await;
        let task = Task::new("code_gen", serde_json::Value::Null);
        let decision = h.engine.evaluate(&task).await.unwrap();
        assert_eq!(
            decision,
            Decision::RouteDirect {
                capability: "code_gen".into()
            }
        );
        let entries = h.engine.log().entries_for(task.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].fallback);
        assert_eq!(entries[0].rationale, "simple");
    }

    #[tokio::test]
    async fn test_reasoning_decompose_and_depth_limit() {
        let body = serde_json::json!({
            "decision": "decompose",
            "subtasks": [
                {"capability": "research", "payload": {"q": 1}},
                {"capability": "code_gen", "payload": {"q": 2}}
            ]
        });
        let h = harness(Some(body), Duration::ZERO, &[], None).await;

        let root = Task::new("feature", serde_json::Value::Null);
        match h.engine.evaluate(&root).await.unwrap() {
            Decision::Decompose { subtasks } => assert_eq!(subtasks.len(), 2),
            other => panic!("expected decompose, got {other:?}"),
        }

        let mut deep = Task::new("feature", serde_json::Value::Null);
        deep.depth = 1;
        assert_eq!(h.engine.evaluate(&deep).await.unwrap().kind(), DecisionKind::RouteDirect);
    }

    #[tokio::test]
    async fn test_empty_decomposition_routes_direct() {
        let h = harness(
            Some(serde_json::json!({"decision": "decompose", "subtasks": []})),
            Duration::ZERO,
            &[],
            None,
        )
        .await;
        let task = Task::new("code_gen", serde_json::Value::Null);
        assert_eq!(h.engine.evaluate(&task).await.unwrap().kind(), DecisionKind::RouteDirect);
    }

    #[tokio::test]
    async fn test_timeout_falls_back_to_unique_catalog_match() {
        let h = harness(
            Some(serde_json::json!({"decision": "reject"})),
            Duration::from_secs(5),
            &["code.generate"],
            None,
        )
        .await;
        let task = Task::new("code", serde_json::Value::Null);
        let decision = h.engine.evaluate(&task).await.unwrap();
        assert_eq!(
            decision,
            Decision::RouteDirect {
                capability: "code.generate".into()
            }
        );
        let entries = h.engine.log().entries_for(task.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].fallback);
        assert!(entries[0].rationale.contains("Timeout"));
    }

    #[tokio::test]
    async fn test_fallback_rejects_ambiguous_or_unknown() {
        let h = harness(None, Duration::ZERO, &["code.fix", "code.generate"], None).await;
        let ambiguous = Task::new("code", serde_json::Value::Null);
        assert_eq!(
            h.engine.evaluate(&ambiguous).await.unwrap(),
            Decision::Reject {
                reason: REASONING_UNAVAILABLE.into()
            }
        );
        let unknown = Task::new("deploy", serde_json::Value::Null);
        assert_eq!(h.engine.evaluate(&unknown).await.unwrap().kind(), DecisionKind::Reject);
    }

    #[tokio::test]
    async fn test_malformed_answer_falls_back() {
        let h = harness(
            Some(serde_json::json!({"verdict": "yes"})),
            Duration::ZERO,
            &[],
            None,
        )
        .await;
        // code_gen is advertised by the registered agent.
        let task = Task::new("code_gen", serde_json::Value::Null);
        assert_eq!(h.engine.evaluate(&task).await.unwrap().kind(), DecisionKind::RouteDirect);
        assert!(h.engine.log().entries_for(task.id).await.unwrap()[0].fallback);
    }

    #[tokio::test]
    async fn test_missing_secret_skips_reasoning() {
        let h = harness(
            Some(serde_json::json!({"decision": "reject", "reason": "never seen"})),
            Duration::ZERO,
            &[],
            Some("reasoning/key"),
        )
        .await;
        let task = Task::new("code_gen", serde_json::Value::Null);
        assert_eq!(h.engine.evaluate(&task).await.unwrap().kind(), DecisionKind::RouteDirect);

        h.secrets.insert("reasoning/key", "k");
        let task = Task::new("code_gen", serde_json::Value::Null);
        assert_eq!(h.engine.evaluate(&task).await.unwrap().kind(), DecisionKind::Reject);
    }

    #[tokio::test]
    async fn test_rate_limited_reasoning_falls_back() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let registry = Arc::new(AgentRegistry::new(store.clone()));
        let engine = DecisionEngine::new(
            Some(Arc::new(FixedReasoning {
                body: serde_json::json!({"decision": "reject"}),
                delay: Duration::ZERO,
            })),
            registry,
            Arc::new(StaticSecretStore::new()),
            RateLimiter::new(1.0, 0.001),
            Arc::new(DecisionLog::new(store)),
            DecisionSettings {
                instance_id: "test".into(),
                timeout: Duration::from_secs(1),
                max_depth: 2,
                catalog: vec!["research".into()],
                secret_path: None,
            },
        );
        let first = Task::new("research", serde_json::Value::Null);
        assert_eq!(engine.evaluate(&first).await.unwrap().kind(), DecisionKind::Reject);
        let second = Task::new("research", serde_json::Value::Null);
        assert_eq!(engine.evaluate(&second).await.unwrap().kind(), DecisionKind::RouteDirect);
        let entries = engine.log().entries_for(second.id).await.unwrap();
        assert!(entries[0].rationale.contains("Rate limited"));
    }

    #[tokio::test]
    async fn test_decision_log_order_and_journal() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryStateStore::new());
        let journal = Arc::new(Journal::new(tmp.path().join("decisions.jsonl")));
        let log = DecisionLog::new(backend.clone()).with_journal(journal.clone());
        let task_id = Uuid::new_v4();

        let entry = |rationale: &str| DecisionLogEntry {
            entry_id: Uuid::new_v4(),
            task_id,
            decision_kind: DecisionKind::RouteDirect,
            rationale: rationale.into(),
            timestamp: Utc::now(),
            fallback: false,
            instance_id: "test".into(),
        };
        log.append(&entry("first")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        backend.set_available(false);
        log.append(&entry("second")).await.unwrap();
        backend.set_available(true);

        assert_eq!(log.entries_for(task_id).await.unwrap().len(), 1);
        journal.replay_into(backend.as_ref()).await.unwrap();
        let entries = log.entries_for(task_id).await.unwrap();
        let rationales: Vec<&str> = entries.iter().map(|e| e.rationale.as_str()).collect();
        assert_eq!(rationales, vec!["first", "second"]);
    }
}
