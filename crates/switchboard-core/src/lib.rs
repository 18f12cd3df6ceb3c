//! Core types and error definitions for the Switchboard orchestrator.
//!
//! This crate provides the foundational types shared across all Switchboard
//! crates: the error taxonomy, the message envelope carried by the message
//! channel, and the wire types exchanged between callers, the orchestrator
//! and worker agents.
//!
//! # Main types
//!
//! - [`SwitchboardError`] — Unified error enum for all Switchboard subsystems.
//! - [`SwitchboardResult`] — Convenience alias for `Result<T, SwitchboardError>`.
//! - [`Envelope`] — A message published to or consumed from a channel topic.
//! - [`TaskSubmission`] — A task submitted by an external caller.
//! - [`DispatchRequest`] — A task handed to a worker agent.
//! - [`AgentReport`] — The outcome an agent reports for a dispatched task.
//! - [`HeartbeatSignal`] — A liveness signal pushed by an agent.
//! - [`ProgressUpdate`] — Partial progress an agent reports while it runs a task.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Error types ---

/// Top-level error type for Switchboard.
///
/// Variants fall in three groups: per-task outcomes (`Conflict`,
/// `NoCapableAgent`, ...), reasoning failures (`Timeout`, `RateLimited`,
/// `Reasoning`) and dependency outages (`*Unavailable`).
#[derive(Debug, thiserror::Error)]
pub enum SwitchboardError {
    /// An optimistic-concurrency check lost; re-read and retry.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The requested record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A status change that is not an edge of the task state machine.
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// No idle, healthy agent advertises the required capability.
    #[error("No capable agent for '{0}'")]
    NoCapableAgent(String),

    /// A heartbeat or report referenced an agent the registry does not know.
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    /// The reasoning capability exceeded its latency budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The reasoning capability refused the call because of rate limits.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The reasoning capability answered with something unusable.
    #[error("Reasoning error: {0}")]
    Reasoning(String),

    /// The state store cannot be reached.
    #[error("State store unavailable: {0}")]
    StoreUnavailable(String),

    /// The message channel cannot be reached.
    #[error("Message channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// The secret store cannot be reached or does not hold the secret.
    #[error("Secret unavailable: {0}")]
    SecretUnavailable(String),

    /// Invalid configuration. Fatal at startup only.
    #[error("Config error: {0}")]
    Config(String),

    /// A worker agent refused or failed a dispatch.
    #[error("Agent error: {0}")]
    Agent(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwitchboardError {
    /// Whether this error is an optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SwitchboardError::Conflict(_))
    }

    /// Whether this error means a dependency is down and the operation must
    /// pause rather than proceed.
    pub fn is_dependency_outage(&self) -> bool {
        matches!(
            self,
            SwitchboardError::StoreUnavailable(_)
                | SwitchboardError::ChannelUnavailable(_)
                | SwitchboardError::SecretUnavailable(_)
        )
    }
}

/// A convenience `Result` alias using [`SwitchboardError`].
pub type SwitchboardResult<T> = Result<T, SwitchboardError>;

// --- Envelope ---

/// A message carried by the message channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique identifier for this message.
    pub message_id: Uuid,
    /// Topic the message was published to.
    pub topic: String,
    /// Identifier linking a reply to its request.
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
    /// JSON body.
    pub payload: serde_json::Value,
    /// UTC timestamp of the first publish.
    pub published_at: DateTime<Utc>,
    /// How many times this message has been delivered (1 on first delivery).
    #[serde(default)]
    pub delivery_count: u32,
}

impl Envelope {
    /// Creates an envelope around a raw JSON payload.
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            topic: topic.into(),
            correlation_id: None,
            payload,
            published_at: Utc::now(),
            delivery_count: 0,
        }
    }

    /// Serializes `body` into a new envelope.
    pub fn encode<T: Serialize>(topic: impl Into<String>, body: &T) -> SwitchboardResult<Self> {
        Ok(Self::new(topic, serde_json::to_value(body)?))
    }

    /// Deserializes the payload into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> SwitchboardResult<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Sets the correlation id.
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Whether this delivery is a redelivery of an earlier one.
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

// --- Wire types ---

/// Scheduling priority of a submitted task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Routed through the high-priority queue.
    High,
    /// Routed through the high-priority queue.
    Critical,
}

impl Priority {
    /// Whether submissions of this priority use the high-priority queue.
    pub fn is_expedited(self) -> bool {
        matches!(self, Priority::High | Priority::Critical)
    }
}

/// A task submitted by an external caller.
///
/// The id is fixed at submission so that redelivery of the same message maps
/// to the same task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    /// Id the task will be stored under.
    pub task_id: Uuid,
    /// Capability tag the task needs.
    pub capability_required: String,
    /// Opaque task body.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: Priority,
}

impl TaskSubmission {
    /// Creates a submission with a fresh id and normal priority.
    pub fn new(capability_required: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            capability_required: capability_required.into(),
            payload,
            priority: Priority::Normal,
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// A task handed to a worker agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Task being dispatched.
    pub task_id: Uuid,
    /// Agent the task was assigned to.
    pub agent_id: String,
    /// Capability the agent is expected to exercise.
    pub capability: String,
    /// Opaque task body.
    pub payload: serde_json::Value,
    /// Dispatch attempt number (1-based).
    pub attempt: u32,
}

/// The outcome an agent reports for a dispatched task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReport {
    /// Task the report is about.
    pub task_id: Uuid,
    /// Agent that produced the report.
    pub agent_id: String,
    /// Whether the task succeeded.
    pub ok: bool,
    /// Output produced by the agent.
    #[serde(default)]
    pub output: serde_json::Value,
    /// Error message when `ok` is false.
    #[serde(default)]
    pub error: Option<String>,
    /// Wall-clock execution time reported by the agent.
    #[serde(default)]
    pub duration_ms: u64,
}

impl AgentReport {
    /// Creates a successful report.
    pub fn success(task_id: Uuid, agent_id: impl Into<String>, output: serde_json::Value) -> Self {
        Self {
            task_id,
            agent_id: agent_id.into(),
            ok: true,
            output,
            error: None,
            duration_ms: 0,
        }
    }

    /// Creates a failed report.
    pub fn failure(task_id: Uuid, agent_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id,
            agent_id: agent_id.into(),
            ok: false,
            output: serde_json::Value::Null,
            error: Some(error.into()),
            duration_ms: 0,
        }
    }

    /// Sets the reported duration.
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// A liveness signal pushed by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSignal {
    /// Agent sending the heartbeat.
    pub agent_id: String,
    /// When the agent sent it.
    pub at: DateTime<Utc>,
}

impl HeartbeatSignal {
    /// Creates a heartbeat stamped with the current time.
    pub fn now(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            at: Utc::now(),
        }
    }
}

/// Partial progress an agent reports while it runs a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Task the update is about.
    pub task_id: Uuid,
    /// Agent running the task.
    pub agent_id: String,
    /// Completion percentage, 0 to 100.
    pub percent: u8,
    /// Free-form status line.
    #[serde(default)]
    pub note: Option<String>,
    /// When the agent sent the update.
    pub at: DateTime<Utc>,
}

impl ProgressUpdate {
    /// Creates an update stamped with the current time. `percent` is capped
    /// at 100.
    pub fn new(task_id: Uuid, agent_id: impl Into<String>, percent: u8) -> Self {
        Self {
            task_id,
            agent_id: agent_id.into(),
            percent: percent.min(100),
            note: None,
            at: Utc::now(),
        }
    }

    /// Sets the status line.
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Notice sent to an agent whose task was cancelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelNotice {
    /// Cancelled task.
    pub task_id: Uuid,
    /// Agent that held the task.
    pub agent_id: String,
}
