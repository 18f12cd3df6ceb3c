use async_trait::async_trait;
use switchboard_core::{DispatchRequest, SwitchboardResult};
use uuid::Uuid;

/// A worker the orchestrator can hand tasks to.
///
/// `dispatch` returns once the agent has accepted the task; the outcome
/// arrives later as an [`AgentReport`](switchboard_core::AgentReport) on the
/// results topic. An `Err` from `dispatch` means the task was refused.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Registry id.
    fn id(&self) -> &str;
    /// Capabilities the agent advertises.
    fn capabilities(&self) -> Vec<String>;
    /// Accept `request` for execution.
    async fn dispatch(&self, request: DispatchRequest) -> SwitchboardResult<()>;
    /// Liveness check. `Ok` counts as a heartbeat.
    async fn heartbeat(&self) -> SwitchboardResult<()>;
    /// Best-effort notice that `task_id` was cancelled.
    async fn cancel(&self, _task_id: Uuid) -> SwitchboardResult<()> {
        Ok(())
    }
}
