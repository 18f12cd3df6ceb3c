//! Worker agent and reasoning abstractions for the Switchboard orchestrator.
//!
//! # Main types
//!
//! - [`Agent`] — A worker that accepts dispatched tasks.
//! - [`LoopbackAgent`] — In-process agent that reports over the channel.
//! - [`ReasoningBackend`] — The decision-making capability behind the
//!   decision engine.
//! - [`RetryPolicy`] — Retry ceiling and exponential backoff curve.

/// Worker agent trait.
pub mod agent;
/// In-process loopback agent.
pub mod loopback;
/// Reasoning capability trait and request/response types.
pub mod reasoning;
/// Retry policy and backoff curve.
pub mod retry;

pub use agent::Agent;
pub use loopback::{LoopbackAgent, TaskHandler};
pub use reasoning::{ReasoningBackend, ReasoningPrompt, ReasoningResponse};
pub use retry::{compute_backoff, RetryPolicy};
