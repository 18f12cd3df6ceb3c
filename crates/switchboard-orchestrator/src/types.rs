use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use switchboard_core::{Priority, TaskSubmission};
use uuid::Uuid;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Stored, not yet evaluated.
    Received,
    /// Split into subtasks; settles when they all have.
    Decomposing,
    /// Waiting for a capable agent.
    Queued,
    /// Claimed by an agent, handover in progress.
    Dispatched,
    /// The agent accepted the task.
    Running,
    /// Finished with a result.
    Succeeded,
    /// Finished without a result, or waiting to be requeued.
    Failed,
    /// Withdrawn by a caller.
    Cancelled,
}

impl TaskStatus {
    /// Every status, in state machine order.
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Received,
        TaskStatus::Decomposing,
        TaskStatus::Queued,
        TaskStatus::Dispatched,
        TaskStatus::Running,
        TaskStatus::Succeeded,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// Whether `self -> next` is an edge of the task state machine.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Received, Queued | Decomposing | Failed | Cancelled)
                | (Decomposing, Succeeded | Failed | Cancelled)
                | (Queued, Dispatched | Cancelled)
                | (Dispatched, Running | Queued | Failed | Cancelled)
                | (Running, Succeeded | Failed | Queued | Cancelled)
                | (Failed, Queued | Cancelled)
        )
    }

    /// Whether an agent currently holds a task in this state.
    pub fn is_assigned(self) -> bool {
        matches!(self, TaskStatus::Dispatched | TaskStatus::Running)
    }

    /// Lowercase name, as serialized.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Received => "received",
            TaskStatus::Decomposing => "decomposing",
            TaskStatus::Queued => "queued",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work requested by a capability tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task id.
    pub id: Uuid,
    /// Capability tag an agent must advertise to run the task.
    pub capability_required: String,
    /// Input handed to the agent.
    pub payload: serde_json::Value,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Decomposed task this one is a subtask of.
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    /// When the task was first stored.
    pub created_at: DateTime<Utc>,
    /// Last write.
    pub updated_at: DateTime<Utc>,
    /// Agent output, or the ordered child results of a decomposed task.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Dispatch attempts so far.
    #[serde(default)]
    pub attempt_count: u32,
    /// Inbound queue the task came from.
    #[serde(default)]
    pub priority: Priority,
    /// Agent holding the task while Dispatched or Running; kept afterwards
    /// as a record of who ran it.
    #[serde(default)]
    pub assigned_agent: Option<String>,
    /// Position among its siblings (0-based) for a subtask.
    #[serde(default)]
    pub child_index: Option<u32>,
    /// Number of planned subtasks of a decomposed task.
    #[serde(default)]
    pub child_count: u32,
    /// Decomposition depth (0 = root task).
    #[serde(default)]
    pub depth: u32,
    /// Subtask plan of a decomposed task, in child order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtasks: Vec<SubtaskSpec>,
    /// Last failure reason.
    #[serde(default)]
    pub error: Option<String>,
    /// Set on a Failed task that will be requeued automatically.
    #[serde(default)]
    pub retry_pending: bool,
    /// Earliest time the router may try this task again.
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Consecutive routing attempts that found no capable agent.
    #[serde(default)]
    pub routing_misses: u32,
    /// When the task last entered Queued.
    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
    /// Whether the current wait in the queue was already reported stalled.
    #[serde(default)]
    pub stall_reported: bool,
    /// Completion percentage last reported by the running agent.
    #[serde(default)]
    pub progress: Option<u8>,
    /// Status line of the latest progress update.
    #[serde(default)]
    pub progress_note: Option<String>,
}

impl Task {
    /// Create a new Received root task with a fresh id.
    pub fn new(capability_required: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            capability_required: capability_required.into(),
            payload,
            status: TaskStatus::Received,
            parent_id: None,
            created_at: now,
            updated_at: now,
            result: None,
            attempt_count: 0,
            priority: Priority::Normal,
            assigned_agent: None,
            child_index: None,
            child_count: 0,
            depth: 0,
            subtasks: Vec::new(),
            error: None,
            retry_pending: false,
            next_attempt_at: None,
            routing_misses: 0,
            queued_at: None,
            stall_reported: false,
            progress: None,
            progress_note: None,
        }
    }

    /// A Received task carrying the submission's id, payload and priority.
    pub fn from_submission(submission: &TaskSubmission) -> Self {
        let mut task = Self::new(
            submission.capability_required.clone(),
            submission.payload.clone(),
        );
        task.id = submission.task_id;
        task.priority = submission.priority;
        task
    }

    /// The `index`-th subtask of `parent`. The id is derived from the parent
    /// id and index so recreating a child always yields the same id.
    pub fn child_of(parent: &Task, index: u32, spec: &SubtaskSpec) -> Self {
        let mut task = Self::new(spec.capability.clone(), spec.payload.clone());
        task.id = child_id(parent.id, index);
        task.parent_id = Some(parent.id);
        task.child_index = Some(index);
        task.depth = parent.depth + 1;
        task.priority = parent.priority;
        task
    }

    /// Set the scheduling priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Succeeded, Cancelled, or Failed with no retry pending.
    pub fn is_settled(&self) -> bool {
        match self.status {
            TaskStatus::Succeeded | TaskStatus::Cancelled => true,
            TaskStatus::Failed => !self.retry_pending,
            _ => false,
        }
    }

    /// Whether the routing backoff has elapsed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// Deterministic id of the `index`-th child of `parent`.
pub fn child_id(parent: Uuid, index: u32) -> Uuid {
    Uuid::new_v5(&parent, index.to_string().as_bytes())
}

/// Field updates applied together with a status change.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    capability_required: Option<String>,
    result: Option<serde_json::Value>,
    error: Option<Option<String>>,
    assigned_agent: Option<Option<String>>,
    bump_attempt: bool,
    child_count: Option<u32>,
    subtasks: Option<Vec<SubtaskSpec>>,
    retry_pending: Option<bool>,
    next_attempt_at: Option<Option<DateTime<Utc>>>,
    routing_misses: Option<u32>,
    stall_reported: Option<bool>,
    progress: Option<(u8, Option<String>)>,
}

impl TaskPatch {
    /// Create an empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the required capability.
    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capability_required = Some(capability.into());
        self
    }

    /// Store the task result.
    pub fn result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Record a failure reason.
    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Some(error.into()));
        self
    }

    /// Clear the error.
    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    /// Hand the task to `agent_id`.
    pub fn assign(mut self, agent_id: impl Into<String>) -> Self {
        self.assigned_agent = Some(Some(agent_id.into()));
        self
    }

    /// Clear the assigned agent.
    pub fn unassign(mut self) -> Self {
        self.assigned_agent = Some(None);
        self
    }

    /// Count one more dispatch attempt.
    pub fn bump_attempt(mut self) -> Self {
        self.bump_attempt = true;
        self
    }

    /// Store a decomposition plan and its child count.
    pub fn plan(mut self, subtasks: Vec<SubtaskSpec>) -> Self {
        self.child_count = Some(subtasks.len() as u32);
        self.subtasks = Some(subtasks);
        self
    }

    /// Mark a failure that will be retried.
    pub fn retry_pending(mut self, pending: bool) -> Self {
        self.retry_pending = Some(pending);
        self
    }

    /// Hold the task until `at`.
    pub fn next_attempt_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_attempt_at = Some(Some(at));
        self
    }

    /// Clear the retry hold.
    pub fn clear_backoff(mut self) -> Self {
        self.next_attempt_at = Some(None);
        self.routing_misses = Some(0);
        self
    }

    /// Set the consecutive routing misses.
    pub fn routing_misses(mut self, misses: u32) -> Self {
        self.routing_misses = Some(misses);
        self
    }

    /// Mark the stall as reported.
    pub fn stall_reported(mut self, reported: bool) -> Self {
        self.stall_reported = Some(reported);
        self
    }

    /// Record a progress report.
    pub fn progress(mut self, percent: u8, note: Option<String>) -> Self {
        self.progress = Some((percent.min(100), note));
        self
    }

    /// Write every set field into `task`.
    pub fn apply(self, task: &mut Task) {
        if let Some(capability) = self.capability_required {
            task.capability_required = capability;
        }
        if let Some(result) = self.result {
            task.result = Some(result);
        }
        if let Some(error) = self.error {
            task.error = error;
        }
        if let Some(agent) = self.assigned_agent {
            task.assigned_agent = agent;
        }
        if self.bump_attempt {
            task.attempt_count += 1;
        }
        if let Some(count) = self.child_count {
            task.child_count = count;
        }
        if let Some(subtasks) = self.subtasks {
            task.subtasks = subtasks;
        }
        if let Some(pending) = self.retry_pending {
            task.retry_pending = pending;
        }
        if let Some(at) = self.next_attempt_at {
            task.next_attempt_at = at;
        }
        if let Some(misses) = self.routing_misses {
            task.routing_misses = misses;
        }
        if let Some(reported) = self.stall_reported {
            task.stall_reported = reported;
        }
        if let Some((percent, note)) = self.progress {
            task.progress = Some(percent);
            task.progress_note = note;
        }
    }
}

/// One subtask proposed by a decomposition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskSpec {
    /// Capability the subtask requires.
    pub capability: String,
    /// Input of the subtask.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl SubtaskSpec {
    /// Create a subtask needing `capability`.
    pub fn new(capability: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            capability: capability.into(),
            payload,
        }
    }
}

/// Availability of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Available for routing.
    Idle,
    /// Holding a task.
    Busy,
    /// Missed its heartbeats; excluded until a fresh one arrives.
    Unhealthy,
    /// Deregistered.
    Offline,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Unhealthy => write!(f, "unhealthy"),
            AgentStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Registry entry for a worker agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Agent id.
    pub agent_id: String,
    /// Capabilities advertised.
    pub capabilities: Vec<String>,
    /// Availability.
    pub status: AgentStatus,
    /// Send time of the latest heartbeat.
    pub last_heartbeat_at: DateTime<Utc>,
    /// Last time the agent was handed a task.
    #[serde(default)]
    pub last_assigned_at: Option<DateTime<Utc>>,
    /// Task held while Busy.
    #[serde(default)]
    pub current_task: Option<Uuid>,
    /// First registration.
    pub registered_at: DateTime<Utc>,
}

impl AgentDescriptor {
    /// Create a new Idle agent record with its heartbeat set to now.
    pub fn new(agent_id: impl Into<String>, capabilities: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.into(),
            capabilities,
            status: AgentStatus::Idle,
            last_heartbeat_at: now,
            last_assigned_at: None,
            current_task: None,
            registered_at: now,
        }
    }

    /// Whether the agent advertises `capability` exactly.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// The agent a task was handed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentAssignment {
    /// Assigned task.
    pub task_id: Uuid,
    /// Agent holding it.
    pub agent_id: String,
    /// Capability it was routed on.
    pub capability: String,
}

/// Outcome of evaluating a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decision {
    /// Queue the task for the given capability.
    RouteDirect {
        /// Capability to route on.
        capability: String,
    },
    /// Split the task into ordered subtasks.
    Decompose {
        /// Planned subtasks, in order.
        subtasks: Vec<SubtaskSpec>,
    },
    /// Fail the task without running it.
    Reject {
        /// Why the task cannot run.
        reason: String,
    },
}

impl Decision {
    /// The variant without its data.
    pub fn kind(&self) -> DecisionKind {
        match self {
            Decision::RouteDirect { .. } => DecisionKind::RouteDirect,
            Decision::Decompose { .. } => DecisionKind::Decompose,
            Decision::Reject { .. } => DecisionKind::Reject,
        }
    }
}

/// Which kind of [`Decision`] was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// See [`Decision::RouteDirect`].
    RouteDirect,
    /// See [`Decision::Decompose`].
    Decompose,
    /// See [`Decision::Reject`].
    Reject,
}

/// Append-only record of one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionLogEntry {
    /// Entry id.
    pub entry_id: Uuid,
    /// Task the decision is about.
    pub task_id: Uuid,
    /// Outcome.
    pub decision_kind: DecisionKind,
    /// Reason given by the backend or the fallback.
    pub rationale: String,
    /// When the decision was made.
    pub timestamp: DateTime<Utc>,
    /// Whether the decision came from the fallback path.
    #[serde(default)]
    pub fallback: bool,
    /// Instance that decided.
    #[serde(default)]
    pub instance_id: String,
}

/// What a [`TaskEvent`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    /// The task changed status.
    Transition,
    /// The task has waited in the queue past the stale threshold.
    Stalled,
    /// The running agent reported progress.
    Progress,
}

/// Published on the task events topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Event id.
    pub event_id: Uuid,
    /// Task the event is about.
    pub task_id: Uuid,
    /// What happened.
    pub kind: TaskEventKind,
    /// Previous state, for transitions.
    #[serde(default)]
    pub from: Option<TaskStatus>,
    /// State after the event.
    pub to: TaskStatus,
    /// Agent assigned at the time.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Reported percentage, on progress events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    /// When it happened.
    pub at: DateTime<Utc>,
}

impl TaskEvent {
    /// `task` just moved from `from` to its current status.
    pub fn transition(task: &Task, from: TaskStatus) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            task_id: task.id,
            kind: TaskEventKind::Transition,
            from: Some(from),
            to: task.status,
            agent_id: task.assigned_agent.clone(),
            progress: None,
            at: task.updated_at,
        }
    }

    /// `task` has waited in the queue too long.
    pub fn stalled(task: &Task, at: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            task_id: task.id,
            kind: TaskEventKind::Stalled,
            from: None,
            to: task.status,
            agent_id: None,
            progress: None,
            at,
        }
    }

    /// The agent running `task` reported progress.
    pub fn progress(task: &Task) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            task_id: task.id,
            kind: TaskEventKind::Progress,
            from: None,
            to: task.status,
            agent_id: task.assigned_agent.clone(),
            progress: task.progress,
            at: task.updated_at,
        }
    }
}

/// Timing of one finished dispatch attempt, as reported by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VelocityRecord {
    /// Task the attempt ran.
    pub task_id: Uuid,
    /// Agent that reported.
    pub agent_id: String,
    /// Capability the task required.
    pub capability: String,
    /// Dispatch attempt the report closed (1-based).
    pub attempt: u32,
    /// Duration the agent reported.
    pub duration_ms: u64,
    /// Whether the agent reported success.
    pub success: bool,
    /// When the report was applied.
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_edges() {
        use TaskStatus::*;
        assert!(Received.can_transition_to(Queued));
        assert!(Received.can_transition_to(Decomposing));
        assert!(Queued.can_transition_to(Dispatched));
        assert!(Dispatched.can_transition_to(Running));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Queued));
        assert!(Failed.can_transition_to(Queued));

        assert!(!Queued.can_transition_to(Succeeded));
        assert!(!Succeeded.can_transition_to(Queued));
        assert!(!Cancelled.can_transition_to(Queued));
        assert!(!Decomposing.can_transition_to(Queued));
        assert!(!Received.can_transition_to(Running));
    }

    #[test]
    fn test_cancelled_reachable_from_every_unsettled_state() {
        for status in TaskStatus::ALL {
            let expected = !matches!(status, TaskStatus::Succeeded | TaskStatus::Cancelled);
            assert_eq!(status.can_transition_to(TaskStatus::Cancelled), expected, "{status}");
        }
    }

    #[test]
    fn test_task_from_submission() {
        let submission = TaskSubmission::new("research", serde_json::json!({"q": "x"}))
            .with_priority(Priority::High);
        let task = Task::from_submission(&submission);
        assert_eq!(task.id, submission.task_id);
        assert_eq!(task.status, TaskStatus::Received);
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.attempt_count, 0);
        assert!(task.is_due(Utc::now()));
    }

    #[test]
    fn test_child_ids_are_deterministic() {
        let parent = Task::new("code", serde_json::Value::Null);
        let spec = SubtaskSpec::new("code.generate", serde_json::json!({"step": 1}));
        let a = Task::child_of(&parent, 0, &spec);
        let b = Task::child_of(&parent, 0, &spec);
        let c = Task::child_of(&parent, 1, &spec);
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(a.parent_id, Some(parent.id));
        assert_eq!(a.depth, 1);
        assert_eq!(a.child_index, Some(0));
    }

    #[test]
    fn test_settled() {
        let mut task = Task::new("x", serde_json::Value::Null);
        assert!(!task.is_settled());
        task.status = TaskStatus::Failed;
        task.retry_pending = true;
        assert!(!task.is_settled());
        task.retry_pending = false;
        assert!(task.is_settled());
        task.status = TaskStatus::Cancelled;
        assert!(task.is_settled());
    }

    #[test]
    fn test_patch_applies_fields() {
        let mut task = Task::new("x", serde_json::Value::Null);
        TaskPatch::new()
            .assign("coder-1")
            .bump_attempt()
            .error("boom")
            .routing_misses(2)
            .apply(&mut task);
        assert_eq!(task.assigned_agent.as_deref(), Some("coder-1"));
        assert_eq!(task.attempt_count, 1);
        assert_eq!(task.error.as_deref(), Some("boom"));
        assert_eq!(task.routing_misses, 2);

        TaskPatch::new()
            .progress(250, Some("almost".into()))
            .apply(&mut task);
        assert_eq!(task.progress, Some(100));
        assert_eq!(task.progress_note.as_deref(), Some("almost"));

        TaskPatch::new().unassign().clear_error().clear_backoff().apply(&mut task);
        assert!(task.assigned_agent.is_none());
        assert!(task.error.is_none());
        assert_eq!(task.routing_misses, 0);
    }

    #[test]
    fn test_decision_serialization() {
        let decision = Decision::Decompose {
            subtasks: vec![SubtaskSpec::new("a", serde_json::Value::Null)],
        };
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["kind"], "decompose");
        assert_eq!(decision.kind(), DecisionKind::Decompose);
        let parsed: Decision = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, decision);
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_string(&TaskStatus::Dispatched).unwrap(), "\"dispatched\"");
        assert_eq!(AgentStatus::Unhealthy.to_string(), "unhealthy");
    }
}
