//! Message channel abstraction for the Switchboard orchestrator.
//!
//! Submissions, agent reports, heartbeats and task events all travel over a
//! [`MessageChannel`]. Delivery is at-least-once: a message stays pending
//! until its [`AckHandle`] is acknowledged.
//!
//! # Main types
//!
//! - [`MessageChannel`] — Publish and consume by topic.
//! - [`Delivery`] — A consumed message with its settlement handle.
//! - [`MemoryChannel`] — In-process implementation.

/// Channel trait, deliveries and acknowledgement handles.
pub mod channel;
/// In-memory channel implementation.
pub mod memory;
/// Topic names shared by orchestrators and agents.
pub mod topics;

pub use channel::{Ack, AckHandle, Delivery, MessageChannel, Redeliver, Subscription};
pub use memory::MemoryChannel;
