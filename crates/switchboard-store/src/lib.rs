//! State persistence for the Switchboard orchestrator.
//!
//! Every piece of orchestrator state (tasks, agents, decision log entries)
//! lives behind the [`StateStore`] trait so that several orchestrator
//! instances can share it. Writes go through compare-and-swap only.
//!
//! # Main types
//!
//! - [`StateStore`] — Versioned key/value store with leased locks.
//! - [`MemoryStateStore`] — In-process implementation.
//! - [`ScopedLock`] — A leased lock released on drop.
//! - [`Journal`] — Append-only fallback used while the store is down.
//! - `SqliteStateStore` — Single-file durable backend (feature `sqlite`).

/// Degraded-mode JSON-lines journal and replay.
pub mod journal;
/// In-memory state store.
pub mod memory;
/// SQLite-backed state store.
#[cfg(feature = "sqlite")]
pub mod sqlite;
/// State store trait, records, leases and JSON helpers.
pub mod store;

pub use journal::{Journal, JournalRecord, ReplayReport};
pub use memory::MemoryStateStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStateStore;
pub use store::{
    cas_json, get_json, scan_json, LockLease, Record, ScopedLock, StateStore, Versioned,
};
