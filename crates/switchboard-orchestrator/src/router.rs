use crate::registry::AgentRegistry;
use crate::types::{AgentAssignment, Task};
use std::sync::Arc;
use switchboard_core::{SwitchboardError, SwitchboardResult};
use tracing::debug;

/// Picks an agent for a queued task.
pub struct TaskRouter {
    registry: Arc<AgentRegistry>,
}

impl TaskRouter {
    /// Create a new router over `registry`.
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }

    /// Claim the best idle agent for `task`. A claim lost to another
    /// orchestrator moves on to the next candidate.
    pub async fn route(&self, task: &Task) -> SwitchboardResult<AgentAssignment> {
        let candidates = self.registry.find_capable(&task.capability_required).await?;
        for candidate in candidates {
            if self.registry.try_claim(&candidate.agent_id, task.id).await? {
                return Ok(AgentAssignment {
                    task_id: task.id,
                    agent_id: candidate.agent_id,
                    capability: task.capability_required.clone(),
                });
            }
            debug!(
                task_id = %task.id,
                agent_id = %candidate.agent_id,
                "Lost claim race, trying next candidate"
            );
        }
        Err(SwitchboardError::NoCapableAgent(
            task.capability_required.clone(),
        ))
    }
}
