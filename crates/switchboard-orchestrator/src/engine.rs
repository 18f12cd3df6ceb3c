use crate::config::OrchestratorConfig;
use crate::decision::{DecisionEngine, DecisionLog, DecisionSettings};
use crate::health::{ComponentHealth, SystemHealth};
use crate::metrics::VelocityLog;
use crate::registry::AgentRegistry;
use crate::router::TaskRouter;
use crate::task_store::{CreateOutcome, TaskStore};
use crate::types::{
    AgentAssignment, AgentDescriptor, AgentStatus, Decision, DecisionLogEntry, Task, TaskEvent,
    TaskPatch, TaskStatus, VelocityRecord,
};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use switchboard_agent::{Agent, ReasoningBackend};
use switchboard_channels::{topics, Delivery, MessageChannel};
use switchboard_core::{
    AgentReport, CancelNotice, DispatchRequest, Envelope, HeartbeatSignal, ProgressUpdate,
    SwitchboardError, SwitchboardResult, TaskSubmission,
};
use switchboard_security::{EnvSecretStore, RateLimiter, SecretStore};
use switchboard_store::{Journal, ReplayReport, ScopedLock, StateStore};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MAX_CAS_RETRIES: usize = 8;
const LOCK_ATTEMPTS: usize = 5;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(10);

fn lock_key(task_id: Uuid) -> String {
    format!("lock:task:{task_id}")
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

/// What one [`Orchestrator::sweep`] pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Journal records written back once the store answered again.
    pub replayed: usize,
    /// Local agents that answered the liveness check.
    pub checked: usize,
    /// Agents newly marked unhealthy for missing heartbeats.
    pub expired_agents: usize,
    /// Tasks taken back from unresponsive agents.
    pub reconciled: usize,
    /// Failed tasks put back in the queue.
    pub requeued: usize,
    /// Received tasks picked up again.
    pub resumed: usize,
    /// Missing subtasks recreated from a parent's plan.
    pub respawned: usize,
    /// Parents whose subtasks all settled during this pass.
    pub aggregated: usize,
    /// Queued tasks handed to an agent.
    pub dispatched: usize,
    /// Queued tasks newly reported as stalled.
    pub stalled: usize,
    /// Busy agents freed because their task had moved on.
    pub released: usize,
}

/// Journal records applied by [`Orchestrator::recover_from_journal`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Replay of `tasks.jsonl`.
    pub tasks: ReplayReport,
    /// Replay of `decisions.jsonl`.
    pub decisions: ReplayReport,
}

impl RecoveryReport {
    /// Records written to the store across both journals.
    pub fn applied(&self) -> usize {
        self.tasks.applied + self.decisions.applied
    }
}

#[derive(Debug, Clone, Copy)]
enum Inbound {
    Submission,
    Report,
    Heartbeat,
    Progress,
}

/// Builds an [`Orchestrator`] from its adapters.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    store: Option<Arc<dyn StateStore>>,
    channel: Option<Arc<dyn MessageChannel>>,
    secrets: Option<Arc<dyn SecretStore>>,
    reasoning: Option<Arc<dyn ReasoningBackend>>,
    journal_dir: Option<PathBuf>,
}

impl OrchestratorBuilder {
    /// Shared state store. Required.
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Message channel. Required.
    pub fn channel(mut self, channel: Arc<dyn MessageChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Defaults to an [`EnvSecretStore`].
    pub fn secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Without a reasoning backend every task takes the catalog fallback.
    pub fn reasoning(mut self, reasoning: Arc<dyn ReasoningBackend>) -> Self {
        self.reasoning = Some(reasoning);
        self
    }

    /// Directory for the degraded-mode journals (`tasks.jsonl`,
    /// `decisions.jsonl`).
    pub fn journal_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.journal_dir = Some(dir.into());
        self
    }

    /// Validate the config and assemble the orchestrator.
    pub fn build(self) -> SwitchboardResult<Orchestrator> {
        self.config.validate()?;
        let store = self
            .store
            .ok_or_else(|| SwitchboardError::Config("a state store is required".into()))?;
        let channel = self
            .channel
            .ok_or_else(|| SwitchboardError::Config("a message channel is required".into()))?;
        let secrets = self
            .secrets
            .unwrap_or_else(|| Arc::new(EnvSecretStore::new()) as Arc<dyn SecretStore>);

        let task_journal = self
            .journal_dir
            .as_ref()
            .map(|dir| Arc::new(Journal::new(dir.join("tasks.jsonl"))));
        let decision_journal = self
            .journal_dir
            .as_ref()
            .map(|dir| Arc::new(Journal::new(dir.join("decisions.jsonl"))));

        let mut tasks = TaskStore::new(store.clone());
        if let Some(journal) = &task_journal {
            tasks = tasks.with_journal(journal.clone());
        }
        let mut log = DecisionLog::new(store.clone());
        if let Some(journal) = &decision_journal {
            log = log.with_journal(journal.clone());
        }

        let registry = Arc::new(
            AgentRegistry::new(store.clone()).with_heartbeat_timeout(self.config.heartbeat_timeout()),
        );
        let decisions = DecisionEngine::new(
            self.reasoning,
            registry.clone(),
            secrets.clone(),
            RateLimiter::from_config(self.config.reasoning_rate_limit),
            Arc::new(log),
            DecisionSettings {
                instance_id: self.config.instance_id.clone(),
                timeout: self.config.reasoning_timeout(),
                max_depth: self.config.max_decomposition_depth,
                catalog: self.config.capability_catalog.clone(),
                secret_path: self.config.reasoning_secret_path.clone(),
            },
        );

        Ok(Orchestrator {
            router: TaskRouter::new(registry.clone()),
            velocity: VelocityLog::new(store.clone()),
            tasks: Arc::new(tasks),
            registry,
            decisions,
            agents: RwLock::new(HashMap::new()),
            store,
            channel,
            secrets,
            task_journal,
            decision_journal,
            config: self.config,
        })
    }
}

/// The orchestrator core.
///
/// Owns no state of its own beyond the directory of in-process agents:
/// tasks, agents and decisions live in the shared state store, so any number
/// of instances can consume the same topics. Every handler is safe to run
/// twice for the same message.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn StateStore>,
    channel: Arc<dyn MessageChannel>,
    secrets: Arc<dyn SecretStore>,
    tasks: Arc<TaskStore>,
    registry: Arc<AgentRegistry>,
    router: TaskRouter,
    decisions: DecisionEngine,
    velocity: VelocityLog,
    agents: RwLock<HashMap<String, Arc<dyn Agent>>>,
    task_journal: Option<Arc<Journal>>,
    decision_journal: Option<Arc<Journal>>,
}

impl Orchestrator {
    /// Start building an orchestrator with `config`.
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            store: None,
            channel: None,
            secrets: None,
            reasoning: None,
            journal_dir: None,
        }
    }

    /// The config this instance was built with.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// The task records.
    pub fn tasks(&self) -> &Arc<TaskStore> {
        &self.tasks
    }

    /// The agent registry.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Per-attempt timings reported by agents.
    pub fn velocity(&self) -> &VelocityLog {
        &self.velocity
    }

    // --- Agents ---

    /// Register an in-process agent. Dispatches to it are direct calls and
    /// each sweep checks its liveness.
    pub async fn register_agent(&self, agent: Arc<dyn Agent>) -> SwitchboardResult<()> {
        let descriptor = AgentDescriptor::new(agent.id(), agent.capabilities());
        self.registry.register(descriptor).await?;
        self.agents.write().insert(agent.id().to_string(), agent);
        Ok(())
    }

    /// Register an out-of-process agent. It receives work on its dispatch
    /// topic and must push heartbeats itself.
    pub async fn register_remote(&self, descriptor: AgentDescriptor) -> SwitchboardResult<()> {
        self.registry.register(descriptor).await
    }

    /// Take an agent out of service. Tasks it held are requeued by the next
    /// sweep.
    pub async fn deregister_agent(&self, agent_id: &str) -> SwitchboardResult<()> {
        self.agents.write().remove(agent_id);
        self.registry.deregister(agent_id).await
    }

    fn local_agent(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.read().get(agent_id).cloned()
    }

    // --- Intake ---

    /// Publish a submission to its priority queue. Returns the task id.
    pub async fn submit(&self, submission: TaskSubmission) -> SwitchboardResult<Uuid> {
        let topic = topics::submission_topic(submission.priority);
        let envelope = Envelope::encode(topic, &submission)?.with_correlation(submission.task_id);
        self.channel.publish(topic, envelope).await?;
        debug!(task_id = %submission.task_id, topic, "Task submitted");
        Ok(submission.task_id)
    }

    /// Persist a submission and process it. A redelivered submission finds
    /// the task already stored and only resumes it.
    pub async fn handle_submission(&self, submission: &TaskSubmission) -> SwitchboardResult<()> {
        let task = Task::from_submission(submission);
        match self.tasks.create_with_outcome(&task).await {
            Ok(CreateOutcome::Stored) => {
                info!(
                    task_id = %task.id,
                    capability = %task.capability_required,
                    priority = ?task.priority,
                    "Task received"
                );
            }
            Ok(CreateOutcome::Journaled) => return Ok(()),
            Err(e) if e.is_conflict() => {
                debug!(task_id = %task.id, "Submission already stored");
            }
            Err(e) => return Err(e),
        }
        self.process_received(task.id).await
    }

    /// Evaluate a Received task and act on the decision. Subtasks created by
    /// a decomposition are processed in the same call.
    pub async fn process_received(&self, task_id: Uuid) -> SwitchboardResult<()> {
        let mut pending = VecDeque::from([task_id]);
        while let Some(id) = pending.pop_front() {
            pending.extend(self.process_one(id).await?);
        }
        Ok(())
    }

    async fn process_one(&self, task_id: Uuid) -> SwitchboardResult<Vec<Uuid>> {
        let Some(lock) = ScopedLock::acquire(
            self.store.clone(),
            &lock_key(task_id),
            &self.config.instance_id,
            self.config.lock_ttl(),
        )
        .await?
        else {
            debug!(task_id = %task_id, "Task is being processed elsewhere");
            return Ok(Vec::new());
        };
        let outcome = self.decide(task_id).await;
        if let Err(e) = lock.release().await {
            debug!(task_id = %task_id, error = %e, "Lock release failed; lease will expire");
        }
        outcome
    }

    async fn decide(&self, task_id: Uuid) -> SwitchboardResult<Vec<Uuid>> {
        let task = match self.tasks.get(task_id).await {
            Ok(task) => task,
            Err(SwitchboardError::NotFound(_)) => {
                debug!(task_id = %task_id, "Task not stored yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        if task.status != TaskStatus::Received {
            return Ok(Vec::new());
        }

        match self.decisions.evaluate(&task).await? {
            Decision::RouteDirect { capability } => {
                let mut patch = TaskPatch::new();
                if capability != task.capability_required {
                    patch = patch.capability(capability);
                }
                let queued = self.transition(&task, TaskStatus::Queued, patch).await?;
                self.dispatch_queued(queued).await?;
                Ok(Vec::new())
            }
            Decision::Decompose { subtasks } => {
                let count = subtasks.len();
                let parent = self
                    .transition(&task, TaskStatus::Decomposing, TaskPatch::new().plan(subtasks))
                    .await?;
                info!(task_id = %parent.id, subtasks = count, "Task decomposed");
                self.spawn_children(&parent, &[]).await
            }
            Decision::Reject { reason } => {
                let failed = self
                    .transition(&task, TaskStatus::Failed, TaskPatch::new().error(reason.clone()))
                    .await?;
                info!(task_id = %failed.id, reason = %reason, "Task rejected");
                self.settle(&failed).await?;
                Ok(Vec::new())
            }
        }
    }

    /// Create the planned subtasks of `parent` missing from `existing`.
    /// Returns the ids of every child it stored.
    async fn spawn_children(&self, parent: &Task, existing: &[Task]) -> SwitchboardResult<Vec<Uuid>> {
        let mut created = Vec::new();
        for (index, spec) in parent.subtasks.iter().enumerate() {
            let index = index as u32;
            if existing.iter().any(|c| c.child_index == Some(index)) {
                continue;
            }
            let child = Task::child_of(parent, index, spec);
            match self.tasks.create_with_outcome(&child).await {
                Ok(CreateOutcome::Stored) => created.push(child.id),
                Ok(CreateOutcome::Journaled) => {}
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(created)
    }

    // --- Dispatch ---

    /// Route a Queued task to an agent and hand it over. Ignores the routing
    /// backoff. Returns `None` when the task is not Queued or no agent could
    /// take it.
    pub async fn try_dispatch(&self, task_id: Uuid) -> SwitchboardResult<Option<AgentAssignment>> {
        let task = self.tasks.get(task_id).await?;
        if task.status != TaskStatus::Queued {
            return Ok(None);
        }
        self.dispatch_queued(task).await
    }

    async fn dispatch_queued(&self, task: Task) -> SwitchboardResult<Option<AgentAssignment>> {
        let assignment = match self.router.route(&task).await {
            Ok(assignment) => assignment,
            Err(SwitchboardError::NoCapableAgent(capability)) => {
                let misses = task.routing_misses.saturating_add(1);
                let retry_at = Utc::now() + chrono_duration(self.config.routing_backoff(misses));
                let patch = TaskPatch::new().routing_misses(misses).next_attempt_at(retry_at);
                match self.tasks.touch(task.id, TaskStatus::Queued, patch).await {
                    Ok(_) => {}
                    Err(e) if e.is_conflict() => {}
                    Err(e) => return Err(e),
                }
                info!(
                    task_id = %task.id,
                    capability = %capability,
                    misses,
                    "No capable agent; task stays queued"
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let patch = TaskPatch::new()
            .assign(assignment.agent_id.clone())
            .bump_attempt()
            .clear_backoff();
        let dispatched = match self.transition(&task, TaskStatus::Dispatched, patch).await {
            Ok(task) => task,
            Err(e) => {
                self.release_agent(&assignment.agent_id, task.id).await;
                return if e.is_conflict() { Ok(None) } else { Err(e) };
            }
        };

        let request = DispatchRequest {
            task_id: dispatched.id,
            agent_id: assignment.agent_id.clone(),
            capability: dispatched.capability_required.clone(),
            payload: dispatched.payload.clone(),
            attempt: dispatched.attempt_count,
        };
        match self.deliver(&request).await {
            Ok(()) => {
                info!(
                    task_id = %dispatched.id,
                    agent_id = %assignment.agent_id,
                    attempt = dispatched.attempt_count,
                    "Task dispatched"
                );
                match self.transition(&dispatched, TaskStatus::Running, TaskPatch::new()).await {
                    Ok(_) => {}
                    // The agent's report got there first.
                    Err(e) if e.is_conflict() => {}
                    Err(e) => return Err(e),
                }
                Ok(Some(assignment))
            }
            Err(e) => {
                warn!(
                    task_id = %dispatched.id,
                    agent_id = %assignment.agent_id,
                    error = %e,
                    "Dispatch refused"
                );
                self.release_agent(&assignment.agent_id, dispatched.id).await;
                self.retry_or_fail(&dispatched, &e.to_string()).await?;
                Ok(None)
            }
        }
    }

    async fn deliver(&self, request: &DispatchRequest) -> SwitchboardResult<()> {
        if let Some(agent) = self.local_agent(&request.agent_id) {
            return agent.dispatch(request.clone()).await;
        }
        let topic = topics::agent_dispatch(&request.agent_id);
        let envelope = Envelope::encode(&topic, request)?.with_correlation(request.task_id);
        self.channel.publish(&topic, envelope).await.map(|_| ())
    }

    async fn release_agent(&self, agent_id: &str, task_id: Uuid) {
        if let Err(e) = self.registry.release(agent_id, task_id).await {
            warn!(agent_id = %agent_id, task_id = %task_id, error = %e, "Agent release failed");
        }
    }

    /// Requeue a Dispatched or Running task with backoff, or fail it for good
    /// once its attempts are used up.
    async fn retry_or_fail(&self, task: &Task, reason: &str) -> SwitchboardResult<()> {
        let ceiling = self.config.retry.max_attempts();
        if task.attempt_count >= ceiling {
            let failed = self
                .transition(task, TaskStatus::Failed, TaskPatch::new().error(reason))
                .await?;
            warn!(
                task_id = %task.id,
                attempts = task.attempt_count,
                error = %reason,
                "Task failed; no attempts left"
            );
            return self.settle(&failed).await;
        }

        let backoff = self.config.retry.backoff(task.attempt_count.saturating_sub(1));
        let retry_at = Utc::now() + chrono_duration(backoff);
        let requeue = TaskPatch::new().unassign().error(reason).next_attempt_at(retry_at);
        if task.status == TaskStatus::Running {
            let failed = self
                .transition(
                    task,
                    TaskStatus::Failed,
                    TaskPatch::new()
                        .error(reason)
                        .retry_pending(true)
                        .next_attempt_at(retry_at),
                )
                .await?;
            self.transition(&failed, TaskStatus::Queued, requeue).await?;
        } else {
            self.transition(task, TaskStatus::Queued, requeue).await?;
        }
        info!(
            task_id = %task.id,
            attempt = task.attempt_count,
            backoff_ms = backoff.as_millis() as u64,
            "Task requeued for retry"
        );
        Ok(())
    }

    // --- Agent traffic ---

    /// Apply an agent's outcome report. Reports for tasks the agent no
    /// longer holds are discarded.
    pub async fn handle_report(&self, report: &AgentReport) -> SwitchboardResult<()> {
        for _ in 0..MAX_CAS_RETRIES {
            match self.apply_report(report).await {
                Err(e) if e.is_conflict() => continue,
                other => return other,
            }
        }
        Err(SwitchboardError::Conflict(format!(
            "task {} kept changing while applying a report",
            report.task_id
        )))
    }

    async fn apply_report(&self, report: &AgentReport) -> SwitchboardResult<()> {
        let task = match self.tasks.get(report.task_id).await {
            Ok(task) => task,
            Err(SwitchboardError::NotFound(_)) => {
                warn!(task_id = %report.task_id, agent_id = %report.agent_id, "Report for unknown task");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let holds_task = task.assigned_agent.as_deref() == Some(report.agent_id.as_str());
        if !holds_task || !task.status.is_assigned() {
            info!(
                task_id = %task.id,
                agent_id = %report.agent_id,
                status = %task.status,
                "Discarding stale agent report"
            );
            self.release_agent(&report.agent_id, task.id).await;
            return Ok(());
        }

        let task = if task.status == TaskStatus::Dispatched {
            self.transition(&task, TaskStatus::Running, TaskPatch::new()).await?
        } else {
            task
        };

        if report.ok {
            let done = self
                .transition(
                    &task,
                    TaskStatus::Succeeded,
                    TaskPatch::new().result(report.output.clone()).clear_error(),
                )
                .await?;
            self.release_agent(&report.agent_id, task.id).await;
            info!(
                task_id = %task.id,
                agent_id = %report.agent_id,
                duration_ms = report.duration_ms,
                "Task succeeded"
            );
            self.record_velocity(&task, report).await;
            self.settle(&done).await
        } else {
            let reason = report
                .error
                .clone()
                .unwrap_or_else(|| "agent reported failure".to_string());
            self.retry_or_fail(&task, &reason).await?;
            self.release_agent(&report.agent_id, task.id).await;
            self.record_velocity(&task, report).await;
            Ok(())
        }
    }

    /// Metrics never hold up a report: a failed write is logged and dropped.
    async fn record_velocity(&self, task: &Task, report: &AgentReport) {
        let record = VelocityRecord {
            task_id: task.id,
            agent_id: report.agent_id.clone(),
            capability: task.capability_required.clone(),
            attempt: task.attempt_count,
            duration_ms: report.duration_ms,
            success: report.ok,
            recorded_at: Utc::now(),
        };
        if let Err(e) = self.velocity.record(&record).await {
            warn!(task_id = %task.id, error = %e, "Velocity not recorded");
        }
    }

    /// Record an agent heartbeat. Unknown agents are an error.
    pub async fn handle_heartbeat(&self, signal: &HeartbeatSignal) -> SwitchboardResult<()> {
        self.registry.heartbeat_at(&signal.agent_id, signal.at).await
    }

    /// Apply a progress update from the agent holding the task. Updates
    /// from other agents, for tasks no longer assigned, or that do not move
    /// the percentage forward are ignored.
    pub async fn handle_progress(&self, update: &ProgressUpdate) -> SwitchboardResult<()> {
        for _ in 0..MAX_CAS_RETRIES {
            match self.apply_progress(update).await {
                Err(e) if e.is_conflict() => continue,
                other => return other,
            }
        }
        Err(SwitchboardError::Conflict(format!(
            "task {} kept changing while applying progress",
            update.task_id
        )))
    }

    async fn apply_progress(&self, update: &ProgressUpdate) -> SwitchboardResult<()> {
        let task = match self.tasks.get(update.task_id).await {
            Ok(task) => task,
            Err(SwitchboardError::NotFound(_)) => {
                debug!(task_id = %update.task_id, "Progress for unknown task");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let holds_task = task.assigned_agent.as_deref() == Some(update.agent_id.as_str());
        if !holds_task || !task.status.is_assigned() {
            debug!(
                task_id = %task.id,
                agent_id = %update.agent_id,
                status = %task.status,
                "Discarding stale progress update"
            );
            return Ok(());
        }
        let percent = update.percent.min(100);
        if task.progress.is_some_and(|current| percent <= current) {
            return Ok(());
        }

        let task = if task.status == TaskStatus::Dispatched {
            self.transition(&task, TaskStatus::Running, TaskPatch::new()).await?
        } else {
            task
        };
        let updated = self
            .tasks
            .touch(
                task.id,
                TaskStatus::Running,
                TaskPatch::new().progress(percent, update.note.clone()),
            )
            .await?;
        debug!(task_id = %updated.id, agent_id = %update.agent_id, percent, "Task progress");
        self.emit(TaskEvent::progress(&updated)).await;
        Ok(())
    }

    // --- Cancellation ---

    /// Cancel a task and, for a decomposed task, its unsettled subtasks.
    /// Cancelling a Succeeded or Cancelled task changes nothing.
    pub async fn cancel(&self, task_id: Uuid) -> SwitchboardResult<Task> {
        let (root, changed, children) = self.cancel_one(task_id).await?;
        let mut pending: VecDeque<Uuid> = children.into();
        while let Some(id) = pending.pop_front() {
            let (_, _, grandchildren) = self.cancel_one(id).await?;
            pending.extend(grandchildren);
        }
        if changed {
            self.settle(&root).await?;
        }
        Ok(root)
    }

    async fn cancel_one(&self, task_id: Uuid) -> SwitchboardResult<(Task, bool, Vec<Uuid>)> {
        for _ in 0..MAX_CAS_RETRIES {
            let task = self.tasks.get(task_id).await?;
            if matches!(task.status, TaskStatus::Succeeded | TaskStatus::Cancelled) {
                return Ok((task, false, Vec::new()));
            }
            let cancelled = match self
                .transition(&task, TaskStatus::Cancelled, TaskPatch::new())
                .await
            {
                Ok(cancelled) => cancelled,
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            };
            info!(task_id = %task_id, from = %task.status, "Task cancelled");

            if task.status.is_assigned() {
                if let Some(agent_id) = &task.assigned_agent {
                    self.notify_cancel(agent_id, task_id).await;
                    self.release_agent(agent_id, task_id).await;
                }
            }
            let children = if task.status == TaskStatus::Decomposing {
                self.tasks
                    .children_of(task_id)
                    .await?
                    .into_iter()
                    .filter(|c| !c.is_settled())
                    .map(|c| c.id)
                    .collect()
            } else {
                Vec::new()
            };
            return Ok((cancelled, true, children));
        }
        Err(SwitchboardError::Conflict(format!(
            "task {task_id} kept changing while cancelling"
        )))
    }

    async fn notify_cancel(&self, agent_id: &str, task_id: Uuid) {
        if let Some(agent) = self.local_agent(agent_id) {
            let agent_id = agent_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = agent.cancel(task_id).await {
                    warn!(task_id = %task_id, agent_id = %agent_id, error = %e, "Cancel notice failed");
                }
            });
            return;
        }
        let notice = CancelNotice {
            task_id,
            agent_id: agent_id.to_string(),
        };
        let published = match Envelope::encode(topics::AGENT_CANCEL, &notice) {
            Ok(envelope) => self
                .channel
                .publish(topics::AGENT_CANCEL, envelope.with_correlation(task_id))
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            warn!(task_id = %task_id, agent_id = %agent_id, error = %e, "Cancel notice failed");
        }
    }

    // --- Aggregation ---

    async fn settle(&self, task: &Task) -> SwitchboardResult<()> {
        match task.parent_id {
            Some(parent_id) => self.aggregate_parent(parent_id).await.map(|_| ()),
            None => Ok(()),
        }
    }

    /// Settle a Decomposing parent once every subtask has settled, then do
    /// the same for its own parent. Returns whether `parent_id` settled.
    pub async fn aggregate_parent(&self, parent_id: Uuid) -> SwitchboardResult<bool> {
        let mut current = self.aggregate_one(parent_id).await?;
        let settled = current.is_some();
        while let Some(grandparent) = current.and_then(|p| p.parent_id) {
            current = self.aggregate_one(grandparent).await?;
        }
        Ok(settled)
    }

    async fn aggregate_one(&self, parent_id: Uuid) -> SwitchboardResult<Option<Task>> {
        let mut lock = None;
        for attempt in 0..LOCK_ATTEMPTS {
            lock = ScopedLock::acquire(
                self.store.clone(),
                &lock_key(parent_id),
                &self.config.instance_id,
                self.config.lock_ttl(),
            )
            .await?;
            if lock.is_some() || attempt + 1 == LOCK_ATTEMPTS {
                break;
            }
            tokio::time::sleep(LOCK_RETRY_DELAY).await;
        }
        let Some(lock) = lock else {
            debug!(task_id = %parent_id, "Parent locked elsewhere; aggregation left to sweep");
            return Ok(None);
        };
        let outcome = self.aggregate_locked(parent_id).await;
        if let Err(e) = lock.release().await {
            debug!(task_id = %parent_id, error = %e, "Lock release failed; lease will expire");
        }
        match outcome {
            Err(e) if e.is_conflict() => Ok(None),
            other => other,
        }
    }

    async fn aggregate_locked(&self, parent_id: Uuid) -> SwitchboardResult<Option<Task>> {
        let parent = match self.tasks.get(parent_id).await {
            Ok(parent) => parent,
            Err(SwitchboardError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if parent.status != TaskStatus::Decomposing {
            return Ok(None);
        }
        let children = self.tasks.children_of(parent_id).await?;
        if (children.len() as u32) < parent.child_count || !children.iter().all(Task::is_settled) {
            return Ok(None);
        }

        let settled = match children.iter().find(|c| c.status != TaskStatus::Succeeded) {
            None => {
                let results: Vec<serde_json::Value> = children
                    .iter()
                    .map(|c| c.result.clone().unwrap_or(serde_json::Value::Null))
                    .collect();
                let done = self
                    .transition(
                        &parent,
                        TaskStatus::Succeeded,
                        TaskPatch::new().result(serde_json::Value::Array(results)),
                    )
                    .await?;
                info!(task_id = %parent_id, subtasks = children.len(), "Subtasks aggregated");
                done
            }
            Some(culprit) => {
                let reason = format!(
                    "subtask {} ({}) {}",
                    culprit.child_index.unwrap_or_default(),
                    culprit.capability_required,
                    culprit.status
                );
                let failed = self
                    .transition(&parent, TaskStatus::Failed, TaskPatch::new().error(reason.clone()))
                    .await?;
                warn!(task_id = %parent_id, reason = %reason, "Decomposed task failed");
                failed
            }
        };
        Ok(Some(settled))
    }

    // --- Maintenance ---

    /// One maintenance pass at `now`: journal replay, liveness,
    /// reconciliation, retries, resumption, aggregation, routing, stall
    /// reports, agent cleanup.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SwitchboardResult<SweepReport> {
        let mut report = SweepReport::default();

        if let Some(replayed) = tolerate_value(self.replay_journals().await, "journal replay")? {
            report.replayed = replayed.applied();
        }

        let local: Vec<Arc<dyn Agent>> = self.agents.read().values().cloned().collect();
        for agent in local {
            match agent.heartbeat().await {
                Ok(()) => {
                    tolerate(self.registry.heartbeat_at(agent.id(), now).await, "heartbeat")?;
                    report.checked += 1;
                }
                Err(e) => debug!(agent_id = %agent.id(), error = %e, "Liveness check failed"),
            }
        }

        for agent in self.registry.expired(now, self.config.heartbeat_timeout()).await? {
            warn!(
                agent_id = %agent.agent_id,
                last_heartbeat_at = %agent.last_heartbeat_at,
                "Agent missed its heartbeats"
            );
            tolerate(self.registry.mark_unhealthy(&agent.agent_id).await, "mark unhealthy")?;
            report.expired_agents += 1;
        }

        // Tasks before agents: a task seen as assigned was claimed before
        // the agent snapshot.
        let all = self.tasks.list_all().await?;
        let agents: HashMap<String, AgentDescriptor> = self
            .registry
            .list()
            .await?
            .into_iter()
            .map(|a| (a.agent_id.clone(), a))
            .collect();

        for task in all.iter().filter(|t| t.status.is_assigned()) {
            let held = task
                .assigned_agent
                .as_ref()
                .and_then(|id| agents.get(id))
                .is_some_and(|a| a.status == AgentStatus::Busy && a.current_task == Some(task.id));
            if held {
                continue;
            }
            if tolerate(self.reconcile(task).await, "reconcile")? {
                report.reconciled += 1;
            }
        }

        for task in all.iter().filter(|t| t.status == TaskStatus::Failed && t.retry_pending) {
            let requeued = self
                .transition(task, TaskStatus::Queued, TaskPatch::new().unassign())
                .await
                .map(|_| ());
            if tolerate(requeued, "requeue")? {
                report.requeued += 1;
            }
        }

        for task in all.iter().filter(|t| t.status == TaskStatus::Received) {
            if tolerate(self.process_received(task.id).await, "resume")? {
                report.resumed += 1;
            }
        }

        let mut children_by_parent: HashMap<Uuid, Vec<Task>> = HashMap::new();
        for task in &all {
            if let Some(parent_id) = task.parent_id {
                children_by_parent.entry(parent_id).or_default().push(task.clone());
            }
        }
        for parent in all.iter().filter(|t| t.status == TaskStatus::Decomposing) {
            let children = children_by_parent.remove(&parent.id).unwrap_or_default();
            if (children.len() as u32) < parent.child_count {
                let created = self.spawn_children(parent, &children).await?;
                report.respawned += created.len();
                for child in created {
                    tolerate(self.process_received(child).await, "process subtask")?;
                }
                continue;
            }
            // Children that settled after the snapshot aggregate through
            // their own settle or on the next pass.
            if !children.iter().all(Task::is_settled) {
                continue;
            }
            if tolerate_value(self.aggregate_parent(parent.id).await, "aggregate")? == Some(true) {
                report.aggregated += 1;
            }
        }

        let stale_after = chrono_duration(self.config.stale_queued_after());
        let mut queued = self.tasks.list_by_status(TaskStatus::Queued).await?;
        for task in queued.iter().filter(|t| !t.stall_reported) {
            let waiting_since = task.queued_at.unwrap_or(task.created_at);
            if now - waiting_since < stale_after {
                continue;
            }
            warn!(
                task_id = %task.id,
                capability = %task.capability_required,
                queued_at = %waiting_since,
                "Task stalled in queue"
            );
            self.emit(TaskEvent::stalled(task, now)).await;
            let marked = self
                .tasks
                .touch(task.id, TaskStatus::Queued, TaskPatch::new().stall_reported(true))
                .await
                .map(|_| ());
            tolerate(marked, "stall report")?;
            report.stalled += 1;
        }
        queued.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        for task in queued.into_iter().filter(|t| t.is_due(now)) {
            if let Some(Some(_)) = tolerate_value(self.dispatch_queued(task).await, "dispatch")? {
                report.dispatched += 1;
            }
        }

        let claim_grace = chrono_duration(self.config.lock_ttl());
        for agent in self.registry.list().await? {
            let (AgentStatus::Busy, Some(task_id)) = (agent.status, agent.current_task) else {
                continue;
            };
            let stale = match self.tasks.get(task_id).await {
                Ok(task) => {
                    let holds = task.status.is_assigned()
                        && task.assigned_agent.as_deref() == Some(agent.agent_id.as_str());
                    let claim_expired = agent
                        .last_assigned_at
                        .map_or(true, |at| now - at > claim_grace);
                    task.is_settled() || (!holds && claim_expired)
                }
                Err(SwitchboardError::NotFound(_)) => true,
                Err(e) => return Err(e),
            };
            if stale && tolerate_value(self.registry.release(&agent.agent_id, task_id).await, "release")?
                == Some(true)
            {
                debug!(agent_id = %agent.agent_id, task_id = %task_id, "Freed agent held by a finished task");
                report.released += 1;
            }
        }

        if report != SweepReport::default() {
            debug!(?report, "Sweep finished");
        }
        Ok(report)
    }

    /// Take a task back from an agent that stopped answering.
    async fn reconcile(&self, task: &Task) -> SwitchboardResult<()> {
        let agent = task.assigned_agent.clone().unwrap_or_default();
        let reason = format!("agent '{agent}' stopped responding");
        if task.attempt_count >= self.config.retry.max_attempts() {
            let failed = self
                .transition(task, TaskStatus::Failed, TaskPatch::new().error(reason))
                .await?;
            warn!(task_id = %task.id, agent_id = %agent, "Task failed with its agent");
            self.settle(&failed).await
        } else {
            self.transition(task, TaskStatus::Queued, TaskPatch::new().unassign().error(reason))
                .await?;
            info!(task_id = %task.id, agent_id = %agent, "Task requeued from unresponsive agent");
            Ok(())
        }
    }

    // --- Run loop ---

    /// Consume submissions, reports, heartbeats and progress updates until `shutdown` turns
    /// true, sweeping on a fixed interval. High priority submissions are
    /// always taken before default ones. In-flight handlers are drained
    /// before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> SwitchboardResult<()> {
        let mut high = self.channel.consume(topics::TASKS_HIGH).await?;
        let mut default = self.channel.consume(topics::TASKS_DEFAULT).await?;
        let mut results = self.channel.consume(topics::AGENT_RESULTS).await?;
        let mut heartbeats = self.channel.consume(topics::AGENT_HEARTBEATS).await?;
        let mut progress = self.channel.consume(topics::AGENT_PROGRESS).await?;

        let permits = Arc::new(Semaphore::new(self.config.max_in_flight));
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            instance_id = %self.config.instance_id,
            channel = self.channel.name(),
            max_in_flight = self.config.max_in_flight,
            "Orchestrator started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            let (kind, delivery) = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                Some(delivery) = high.next() => (Inbound::Submission, delivery),
                Some(delivery) = results.next() => (Inbound::Report, delivery),
                Some(delivery) = heartbeats.next() => (Inbound::Heartbeat, delivery),
                Some(delivery) = progress.next() => (Inbound::Progress, delivery),
                Some(delivery) = default.next() => (Inbound::Submission, delivery),
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep(Utc::now()).await {
                        warn!(error = %e, "Sweep interrupted");
                    }
                    continue;
                }
            };

            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| SwitchboardError::Config(format!("in-flight limiter closed: {e}")))?;
            let this = self.clone();
            tokio::spawn(async move {
                this.handle_delivery(kind, delivery).await;
                drop(permit);
            });
        }

        info!("Orchestrator draining in-flight messages");
        let in_flight = u32::try_from(self.config.max_in_flight).unwrap_or(u32::MAX);
        if permits.acquire_many(in_flight).await.is_err() {
            error!("In-flight limiter closed during shutdown");
        }
        info!(instance_id = %self.config.instance_id, "Orchestrator stopped");
        Ok(())
    }

    async fn handle_delivery(&self, kind: Inbound, delivery: Delivery) {
        let envelope = &delivery.envelope;
        let outcome = match kind {
            Inbound::Submission => match envelope.decode::<TaskSubmission>() {
                Ok(submission) => self.handle_submission(&submission).await,
                Err(e) => Err(e),
            },
            Inbound::Report => match envelope.decode::<AgentReport>() {
                Ok(report) => self.handle_report(&report).await,
                Err(e) => Err(e),
            },
            Inbound::Heartbeat => match envelope.decode::<HeartbeatSignal>() {
                Ok(signal) => self.handle_heartbeat(&signal).await,
                Err(e) => Err(e),
            },
            Inbound::Progress => match envelope.decode::<ProgressUpdate>() {
                Ok(update) => self.handle_progress(&update).await,
                Err(e) => Err(e),
            },
        };

        match outcome {
            Ok(()) => delivery.ack(),
            Err(e) if e.is_dependency_outage() || e.is_conflict() => {
                warn!(
                    topic = %envelope.topic,
                    message_id = %envelope.message_id,
                    delivery_count = envelope.delivery_count,
                    error = %e,
                    "Handler paused; message will be redelivered"
                );
                tokio::time::sleep(self.config.outage_backoff()).await;
                delivery.nack();
            }
            Err(e) => {
                warn!(
                    topic = %envelope.topic,
                    message_id = %envelope.message_id,
                    error = %e,
                    "Dropping message"
                );
                delivery.ack();
            }
        }
    }

    // --- Recovery and queries ---

    /// Replay the degraded-mode journals into the store and pick up the
    /// tasks they restored. Records whose key is already stored are
    /// skipped, so nothing newer is ever overwritten.
    pub async fn recover_from_journal(&self) -> SwitchboardResult<RecoveryReport> {
        let report = self.replay_journals().await?;
        for task in self.tasks.list_by_status(TaskStatus::Received).await? {
            tolerate(self.process_received(task.id).await, "resume")?;
        }
        Ok(report)
    }

    /// Replay whichever journal has pending records, once the store
    /// answers. Does nothing when both journals are empty.
    async fn replay_journals(&self) -> SwitchboardResult<RecoveryReport> {
        let mut pending = Vec::new();
        for journal in [&self.task_journal, &self.decision_journal].into_iter().flatten() {
            pending.push(journal.has_pending().await);
        }
        if !pending.contains(&true) {
            return Ok(RecoveryReport::default());
        }
        self.store.ping().await?;

        let mut report = RecoveryReport::default();
        if let Some(journal) = &self.task_journal {
            report.tasks = journal.replay_into(self.store.as_ref()).await?;
        }
        if let Some(journal) = &self.decision_journal {
            report.decisions = journal.replay_into(self.store.as_ref()).await?;
        }
        if report.applied() > 0 || report.tasks.skipped > 0 {
            info!(
                tasks = report.tasks.applied,
                decisions = report.decisions.applied,
                skipped = report.tasks.skipped + report.decisions.skipped,
                "Journal replayed"
            );
        }
        Ok(report)
    }

    /// Current record of a task. Fails with `NotFound` for an id that was
    /// never stored.
    pub async fn status(&self, task_id: Uuid) -> SwitchboardResult<Task> {
        self.tasks.get(task_id).await
    }

    /// Decision log entries for a task, oldest first.
    pub async fn decisions(&self, task_id: Uuid) -> SwitchboardResult<Vec<DecisionLogEntry>> {
        self.decisions.log().entries_for(task_id).await
    }

    /// Ping every dependency and summarize agents and tasks. Never fails:
    /// an unreachable store only leaves the summaries empty.
    pub async fn health(&self) -> SystemHealth {
        let components = vec![
            ComponentHealth::from_ping("state_store", true, self.store.ping().await),
            ComponentHealth::from_ping("message_channel", true, self.channel.ping().await),
            ComponentHealth::from_ping("secret_store", false, self.secrets.ping().await),
        ];
        let mut health = SystemHealth::new(self.config.instance_id.clone(), components);
        if let Ok(agents) = self.registry.list().await {
            health = health.with_agents(&agents);
        }
        if let Ok(tasks) = self.tasks.list_all().await {
            health = health.with_tasks(&tasks);
        }
        health
    }

    // --- Events ---

    /// CAS transition plus its lifecycle event.
    async fn transition(&self, task: &Task, next: TaskStatus, patch: TaskPatch) -> SwitchboardResult<Task> {
        let updated = self.tasks.transition(task.id, task.status, next, patch).await?;
        self.emit(TaskEvent::transition(&updated, task.status)).await;
        Ok(updated)
    }

    /// Publish a task event. A failed publish is logged and never undoes the
    /// change it reports.
    async fn emit(&self, event: TaskEvent) {
        let published = match Envelope::encode(topics::TASK_EVENTS, &event) {
            Ok(envelope) => self
                .channel
                .publish(topics::TASK_EVENTS, envelope.with_correlation(event.task_id))
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            warn!(task_id = %event.task_id, kind = ?event.kind, error = %e, "Task event not published");
        }
    }
}

/// Per-item sweep failures are logged and skipped; dependency outages abort
/// the pass. Returns whether the step succeeded.
fn tolerate(result: SwitchboardResult<()>, step: &str) -> SwitchboardResult<bool> {
    tolerate_value(result, step).map(|v| v.is_some())
}

fn tolerate_value<T>(result: SwitchboardResult<T>, step: &str) -> SwitchboardResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_dependency_outage() => Err(e),
        Err(e) if e.is_conflict() => {
            debug!(step, error = %e, "Sweep step lost a race");
            Ok(None)
        }
        Err(e) => {
            warn!(step, error = %e, "Sweep step failed");
            Ok(None)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use switchboard_channels::MemoryChannel;
    use switchboard_store::MemoryStateStore;

    fn orchestrator(config: OrchestratorConfig) -> (Orchestrator, Arc<MemoryChannel>) {
        let channel = Arc::new(MemoryChannel::new("test"));
        let orchestrator = Orchestrator::builder(config)
            .store(Arc::new(MemoryStateStore::new()))
            .channel(channel.clone())
            .build()
            .unwrap();
        (orchestrator, channel)
    }

    #[test]
    fn test_builder_requires_adapters() {
        let err = Orchestrator::builder(OrchestratorConfig::default())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, SwitchboardError::Config(_)));
    }

    #[tokio::test]
    async fn test_submit_uses_priority_queue() {
        let (orchestrator, channel) = orchestrator(OrchestratorConfig::default());
        orchestrator
            .submit(TaskSubmission::new("x", serde_json::Value::Null))
            .await
            .unwrap();
        orchestrator
            .submit(
                TaskSubmission::new("x", serde_json::Value::Null)
                    .with_priority(switchboard_core::Priority::Critical),
            )
            .await
            .unwrap();
        assert_eq!(channel.published_count(topics::TASKS_DEFAULT), 1);
        assert_eq!(channel.published_count(topics::TASKS_HIGH), 1);
    }

    #[tokio::test]
    async fn test_transitions_emit_events() {
        let config = OrchestratorConfig {
            capability_catalog: vec!["deploy".into()],
            ..OrchestratorConfig::default()
        };
        let (orchestrator, channel) = orchestrator(config);
        let submission = TaskSubmission::new("deploy", serde_json::Value::Null);
        orchestrator.handle_submission(&submission).await.unwrap();

        // Routed but no agent: Received -> Queued only.
        let task = orchestrator.status(submission.task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.routing_misses, 1);
        let events: Vec<TaskEvent> = channel
            .published(topics::TASK_EVENTS)
            .iter()
            .map(|e| e.decode().unwrap())
            .collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].from, Some(TaskStatus::Received));
        assert_eq!(events[0].to, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_event_publish_failure_keeps_transition() {
        let config = OrchestratorConfig {
            capability_catalog: vec!["deploy".into()],
            ..OrchestratorConfig::default()
        };
        let (orchestrator, channel) = orchestrator(config);
        let task = Task::new("deploy", serde_json::Value::Null);
        orchestrator.tasks().create(&task).await.unwrap();

        channel.set_available(false);
        orchestrator.process_received(task.id).await.unwrap();
        channel.set_available(true);
        assert_eq!(
            orchestrator.status(task.id).await.unwrap().status,
            TaskStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_tolerate_classifies_errors() {
        assert!(tolerate(Ok(()), "x").unwrap());
        assert!(!tolerate(Err(SwitchboardError::Conflict("c".into())), "x").unwrap());
        assert!(!tolerate(Err(SwitchboardError::Agent("a".into())), "x").unwrap());
        assert!(tolerate(Err(SwitchboardError::StoreUnavailable("s".into())), "x").is_err());
    }
}
