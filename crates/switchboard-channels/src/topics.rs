//! Topic names shared by the orchestrator, agents and callers.

use switchboard_core::Priority;

/// Normal and low priority submissions.
pub const TASKS_DEFAULT: &str = "tasks.default";
/// High and critical priority submissions; consumed before `tasks.default`.
pub const TASKS_HIGH: &str = "tasks.high";
/// Task lifecycle events.
pub const TASK_EVENTS: &str = "tasks.events";
/// Agent reports.
pub const AGENT_RESULTS: &str = "agents.results";
/// Agent heartbeats.
pub const AGENT_HEARTBEATS: &str = "agents.heartbeats";
/// Progress updates from agents running a task.
pub const AGENT_PROGRESS: &str = "agents.progress";
/// Cancellation notices.
pub const AGENT_CANCEL: &str = "agents.cancel";

/// Inbound queue for a submission of the given priority.
pub fn submission_topic(priority: Priority) -> &'static str {
    if priority.is_expedited() {
        TASKS_HIGH
    } else {
        TASKS_DEFAULT
    }
}

/// Per-agent dispatch topic for agents that run out of process.
pub fn agent_dispatch(agent_id: &str) -> String {
    format!("agents.{agent_id}.dispatch")
}
