//! Orchestrator core for Switchboard: task lifecycle, agent registry,
//! capability routing and reasoning-driven decomposition.
//!
//! Tasks arrive on the inbound queues, are evaluated by the decision engine,
//! and are either routed to a capable worker agent, split into subtasks whose
//! results are aggregated in order, or rejected. All state lives behind the
//! shared state store, so several orchestrator instances can run side by
//! side.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Consume loop, state machine, reconciliation sweep.
//! - [`TaskStore`] — Compare-and-swap task records with journal fallback.
//! - [`AgentRegistry`] — Agent availability, heartbeats and claims.
//! - [`TaskRouter`] — Picks and claims an agent for a queued task.
//! - [`DecisionEngine`] — Route, decompose or reject, with catalog fallback.
//! - [`DecisionLog`] — Append-only record of every decision.
//! - [`VelocityLog`] — How long each agent took per attempt, and whether it succeeded.
//! - [`OrchestratorConfig`] — Tunables with defaults.

/// Orchestrator configuration.
pub mod config;
/// Decision engine and decision log.
pub mod decision;
/// Orchestrator core: handlers, sweep and run loop.
pub mod engine;
/// Health snapshot types.
pub mod health;
/// Per-attempt velocity records.
pub mod metrics;
/// Agent registry.
pub mod registry;
/// Capability-based task routing.
pub mod router;
/// Task persistence.
pub mod task_store;
/// Task, agent and decision types.
pub mod types;

pub use config::OrchestratorConfig;
pub use decision::{catalog_matches, DecisionEngine, DecisionLog, DecisionSettings, REASONING_UNAVAILABLE};
pub use engine::{Orchestrator, OrchestratorBuilder, RecoveryReport, SweepReport};
pub use health::{AgentSummary, ComponentHealth, HealthStatus, SystemHealth};
pub use metrics::{AgentVelocity, VelocityLog};
pub use registry::AgentRegistry;
pub use router::TaskRouter;
pub use task_store::{CreateOutcome, TaskStore};
pub use types::{
    child_id, AgentAssignment, AgentDescriptor, AgentStatus, Decision, DecisionKind,
    DecisionLogEntry, SubtaskSpec, Task, TaskEvent, TaskEventKind, TaskPatch, TaskStatus,
    VelocityRecord,
};
