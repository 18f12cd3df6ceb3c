//! Security primitives for the Switchboard orchestrator.
//!
//! Provides credential lookup and rate limiting for calls to the reasoning
//! capability.
//!
//! # Main types
//!
//! - [`SecretStore`] — Trait for fetching credentials by path.
//! - [`SecretValue`] — A credential that never prints its contents.
//! - [`EnvSecretStore`] / [`StaticSecretStore`] — Concrete stores.
//! - [`RateLimiter`] — Token-bucket rate limiter for request throttling.

/// Token-bucket rate limiting.
pub mod rate_limit;
/// Secret store trait and implementations.
pub mod secrets;

pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use secrets::{EnvSecretStore, SecretStore, SecretValue, StaticSecretStore};
