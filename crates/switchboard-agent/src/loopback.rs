use crate::agent::Agent;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchboard_channels::{topics, MessageChannel};
use switchboard_core::{AgentReport, DispatchRequest, Envelope, SwitchboardError, SwitchboardResult};
use tracing::{debug, warn};
use uuid::Uuid;

/// Computes the output for a dispatched task. `Err` becomes a failed report.
pub type TaskHandler =
    Arc<dyn Fn(&DispatchRequest) -> Result<serde_json::Value, String> + Send + Sync>;

/// An in-process agent that runs a handler and reports back over the
/// message channel, exactly like an out-of-process worker would.
///
/// Useful for local runs and for exercising the orchestrator end to end.
pub struct LoopbackAgent {
    id: String,
    capabilities: Vec<String>,
    channel: Arc<dyn MessageChannel>,
    handler: TaskHandler,
    delay: Duration,
    alive: Arc<AtomicBool>,
    cancelled: Arc<Mutex<HashSet<Uuid>>>,
    dispatched: Arc<AtomicUsize>,
}

impl LoopbackAgent {
    /// An agent that echoes the task payload as its output.
    pub fn echo(
        id: impl Into<String>,
        capabilities: Vec<String>,
        channel: Arc<dyn MessageChannel>,
    ) -> Self {
        Self {
            id: id.into(),
            capabilities,
            channel,
            handler: Arc::new(|req: &DispatchRequest| Ok(req.payload.clone())),
            delay: Duration::ZERO,
            alive: Arc::new(AtomicBool::new(true)),
            cancelled: Arc::new(Mutex::new(HashSet::new())),
            dispatched: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Replace the echo handler.
    pub fn with_handler(mut self, handler: TaskHandler) -> Self {
        self.handler = handler;
        self
    }

    /// Wait `delay` before reporting each task.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Stop (`false`) or resume (`true`) answering heartbeats and dispatches.
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    /// Tasks accepted so far.
    pub fn dispatch_count(&self) -> usize {
        self.dispatched.load(Ordering::SeqCst)
    }

    /// Whether a cancel notice arrived for `task_id`.
    pub fn was_cancelled(&self, task_id: Uuid) -> bool {
        self.cancelled.lock().contains(&task_id)
    }

    fn check_alive(&self) -> SwitchboardResult<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SwitchboardError::Agent(format!("agent '{}' is down", self.id)))
        }
    }
}

#[async_trait]
impl Agent for LoopbackAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    async fn dispatch(&self, request: DispatchRequest) -> SwitchboardResult<()> {
        self.check_alive()?;
        self.dispatched.fetch_add(1, Ordering::SeqCst);

        let channel = self.channel.clone();
        let handler = self.handler.clone();
        let delay = self.delay;
        let alive = self.alive.clone();
        let cancelled = self.cancelled.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if !alive.load(Ordering::SeqCst) {
                debug!(task_id = %request.task_id, agent_id = %request.agent_id, "Agent went down before reporting");
                return;
            }
            if cancelled.lock().contains(&request.task_id) {
                debug!(task_id = %request.task_id, agent_id = %request.agent_id, "Task cancelled; not reporting");
                return;
            }

            let report = match handler(&request) {
                Ok(output) => AgentReport::success(request.task_id, &request.agent_id, output),
                Err(error) => AgentReport::failure(request.task_id, &request.agent_id, error),
            }
            .with_duration(started.elapsed().as_millis() as u64);

            let published = match Envelope::encode(topics::AGENT_RESULTS, &report) {
                Ok(envelope) => channel.publish(topics::AGENT_RESULTS, envelope).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = published {
                warn!(task_id = %request.task_id, error = %e, "Failed to publish agent report");
            }
        });
        Ok(())
    }

    async fn heartbeat(&self) -> SwitchboardResult<()> {
        self.check_alive()
    }

    async fn cancel(&self, task_id: Uuid) -> SwitchboardResult<()> {
        self.cancelled.lock().insert(task_id);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use switchboard_channels::MemoryChannel;

    fn request(agent: &str) -> DispatchRequest {
        DispatchRequest {
            task_id: Uuid::new_v4(),
            agent_id: agent.to_string(),
            capability: "code_gen".to_string(),
            payload: serde_json::json!({"spec": "hello"}),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_echo_agent_reports_payload() {
        let channel = Arc::new(MemoryChannel::default());
        let mut results = channel.consume(topics::AGENT_RESULTS).await.unwrap();
        let agent = LoopbackAgent::echo("coder-1", vec!["code_gen".into()], channel.clone());

        let req = request("coder-1");
        agent.dispatch(req.clone()).await.unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(1), results.next())
            .await
            .unwrap()
            .unwrap();
        let report: AgentReport = delivery.envelope.decode().unwrap();
        delivery.ack();
        assert!(report.ok);
        assert_eq!(report.task_id, req.task_id);
        assert_eq!(report.output, req.payload);
        assert_eq!(agent.dispatch_count(), 1);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_failed_report() {
        let channel = Arc::new(MemoryChannel::default());
        let mut results = channel.consume(topics::AGENT_RESULTS).await.unwrap();
        let agent = LoopbackAgent::echo("coder-1", vec!["code_gen".into()], channel.clone())
            .with_handler(Arc::new(|_| Err("compile error".to_string())));

        agent.dispatch(request("coder-1")).await.unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(1), results.next())
            .await
            .unwrap()
            .unwrap();
        let report: AgentReport = delivery.envelope.decode().unwrap();
        assert!(!report.ok);
        assert_eq!(report.error.as_deref(), Some("compile error"));
    }

    #[tokio::test]
    async fn test_down_agent_refuses_dispatch_and_heartbeat() {
        let channel = Arc::new(MemoryChannel::default());
        let agent = LoopbackAgent::echo("coder-1", vec![], channel);
        agent.set_alive(false);
        assert!(agent.heartbeat().await.is_err());
        assert!(agent.dispatch(request("coder-1")).await.is_err());
        assert_eq!(agent.dispatch_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_task_is_not_reported() {
        let channel = Arc::new(MemoryChannel::default());
        let agent = LoopbackAgent::echo("coder-1", vec![], channel.clone())
            .with_delay(Duration::from_millis(50));
        let req = request("coder-1");
        agent.dispatch(req.clone()).await.unwrap();
        agent.cancel(req.task_id).await.unwrap();
        assert!(agent.was_cancelled(req.task_id));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(channel.published_count(topics::AGENT_RESULTS), 0);
    }
}
