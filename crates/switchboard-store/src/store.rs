use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{SwitchboardError, SwitchboardResult};
use uuid::Uuid;

/// A stored value together with its revision.
///
/// Versions start at 1 when a key is created and increase by one on every
/// successful compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Stored value.
    pub value: String,
    /// Version to pass back to compare-and-swap.
    pub version: u64,
}

/// A lock held on a key until `expires_at` or until released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    /// Locked key.
    pub key: String,
    /// Instance holding the lock.
    pub holder: String,
    /// Proves ownership on release.
    pub token: Uuid,
    /// End of the lease.
    pub expires_at: DateTime<Utc>,
}

impl LockLease {
    /// Create a new lease for `holder` lasting `ttl`.
    pub fn new(key: impl Into<String>, holder: impl Into<String>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(30));
        Self {
            key: key.into(),
            holder: holder.into(),
            token: Uuid::new_v4(),
            expires_at: Utc::now() + ttl,
        }
    }

    /// Whether the lease ended before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Durable key/value and lock abstraction shared by every orchestrator
/// instance.
///
/// `compare_and_swap` is the only write primitive: `expected = None` means the
/// key must not exist yet, `Some(v)` means the stored version must equal `v`.
/// A mismatch returns [`SwitchboardError::Conflict`]; an unreachable backend
/// returns [`SwitchboardError::StoreUnavailable`].
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current record at `key`, if any.
    async fn get(&self, key: &str) -> SwitchboardResult<Option<Record>>;
    /// Write `value` if the stored version matches `expected`. Returns the
    /// new version.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: String,
    ) -> SwitchboardResult<u64>;
    /// All records whose key starts with `prefix`, sorted by key.
    async fn scan_prefix(&self, prefix: &str) -> SwitchboardResult<Vec<(String, Record)>>;
    /// Returns `None` when another holder owns an unexpired lock on `key`.
    async fn acquire_lock(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> SwitchboardResult<Option<LockLease>>;
    /// Returns `false` if the lease had already expired or been taken over.
    async fn release_lock(&self, lease: &LockLease) -> SwitchboardResult<bool>;
    /// Check that the backend is reachable.
    async fn ping(&self) -> SwitchboardResult<()>;
}

/// A deserialized value and the version it was read at.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    /// Decoded value.
    pub value: T,
    /// Version to pass back to compare-and-swap.
    pub version: u64,
}

/// Read and deserialize a JSON record.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> SwitchboardResult<Option<Versioned<T>>> {
    match store.get(key).await? {
        Some(record) => {
            let value = serde_json::from_str(&record.value)?;
            Ok(Some(Versioned {
                value,
                version: record.version,
            }))
        }
        None => Ok(None),
    }
}

/// Serialize `value` and compare-and-swap it into `key`.
pub async fn cas_json<T: Serialize + Sync>(
    store: &dyn StateStore,
    key: &str,
    expected: Option<u64>,
    value: &T,
) -> SwitchboardResult<u64> {
    let json = serde_json::to_string(value)?;
    store.compare_and_swap(key, expected, json).await
}

/// Deserialize every record under `prefix`, in key order.
pub async fn scan_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    prefix: &str,
) -> SwitchboardResult<Vec<Versioned<T>>> {
    let mut out = Vec::new();
    for (_, record) in store.scan_prefix(prefix).await? {
        out.push(Versioned {
            value: serde_json::from_str(&record.value)?,
            version: record.version,
        });
    }
    Ok(out)
}

/// A lock that is released when dropped.
///
/// Explicit [`ScopedLock::release`] is preferred; the drop path spawns the
/// release on the current runtime and otherwise relies on the TTL.
pub struct ScopedLock {
    store: Arc<dyn StateStore>,
    lease: Option<LockLease>,
}

impl ScopedLock {
    /// Try to take `key` for `holder`. `Ok(None)` means someone else holds it.
    pub async fn acquire(
        store: Arc<dyn StateStore>,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> SwitchboardResult<Option<Self>> {
        let lease = store.acquire_lock(key, holder, ttl).await?;
        Ok(lease.map(|lease| Self {
            store,
            lease: Some(lease),
        }))
    }

    /// Key of the held lock, if any.
    pub fn key(&self) -> Option<&str> {
        self.lease.as_ref().map(|l| l.key.as_str())
    }

    /// Release the lock. Returns whether it was still held.
    pub async fn release(mut self) -> SwitchboardResult<bool> {
        match self.lease.take() {
            Some(lease) => self.store.release_lock(&lease).await,
            None => Ok(false),
        }
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let store = self.store.clone();
                handle.spawn(async move {
                    if let Err(e) = store.release_lock(&lease).await {
                        tracing::debug!(key = %lease.key, error = %e, "Deferred lock release failed");
                    }
                });
            }
        }
    }
}

pub(crate) fn conflict(key: &str, expected: Option<u64>, actual: Option<u64>) -> SwitchboardError {
    SwitchboardError::Conflict(format!(
        "{key}: expected version {expected:?}, found {actual:?}"
    ))
}
