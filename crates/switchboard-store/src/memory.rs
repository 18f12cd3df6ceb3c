use crate::store::{conflict, LockLease, Record, StateStore};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use switchboard_core::{SwitchboardError, SwitchboardResult};

/// In-process state store for development, tests and single-node runs.
///
/// Records live in a `BTreeMap` so prefix scans come back in key order. The
/// store can be switched "offline" to exercise outage handling.
pub struct MemoryStateStore {
    records: Mutex<BTreeMap<String, Record>>,
    locks: Mutex<HashMap<String, LockLease>>,
    available: AtomicBool,
}

impl MemoryStateStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            locks: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Stored keys.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn check_available(&self) -> SwitchboardResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SwitchboardError::StoreUnavailable(
                "memory store is offline".to_string(),
            ))
        }
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> SwitchboardResult<Option<Record>> {
        self.check_available()?;
        Ok(self.records.lock().get(key).cloned())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: String,
    ) -> SwitchboardResult<u64> {
        self.check_available()?;
        let mut records = self.records.lock();
        let actual = records.get(key).map(|r| r.version);
        if actual != expected {
            return Err(conflict(key, expected, actual));
        }
        let version = actual.map_or(1, |v| v + 1);
        records.insert(key.to_string(), Record { value, version });
        Ok(version)
    }

    async fn scan_prefix(&self, prefix: &str) -> SwitchboardResult<Vec<(String, Record)>> {
        self.check_available()?;
        let records = self.records.lock();
        Ok(records
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect())
    }

    async fn acquire_lock(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> SwitchboardResult<Option<LockLease>> {
        self.check_available()?;
        let mut locks = self.locks.lock();
        if let Some(existing) = locks.get(key) {
            if !existing.is_expired(Utc::now()) {
                return Ok(None);
            }
        }
        let lease = LockLease::new(key, holder, ttl);
        locks.insert(key.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn release_lock(&self, lease: &LockLease) -> SwitchboardResult<bool> {
        self.check_available()?;
        let mut locks = self.locks.lock();
        match locks.get(&lease.key) {
            Some(current) if current.token == lease.token => {
                locks.remove(&lease.key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> SwitchboardResult<()> {
        self.check_available()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::{cas_json, get_json, ScopedLock};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_create_then_update() {
        let store = MemoryStateStore::new();
        let v1 = store
            .compare_and_swap("task:1", None, "a".into())
            .await
            .unwrap();
        assert_eq!(v1, 1);
        let v2 = store
            .compare_and_swap("task:1", Some(1), "b".into())
            .await
            .unwrap();
        assert_eq!(v2, 2);
        let record = store.get("task:1").await.unwrap().unwrap();
        assert_eq!(record.value, "b");
        assert_eq!(record.version, 2);
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let store = MemoryStateStore::new();
        store.compare_and_swap("k", None, "a".into()).await.unwrap();
        store
            .compare_and_swap("k", Some(1), "b".into())
            .await
            .unwrap();

        let err = store
            .compare_and_swap("k", Some(1), "c".into())
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let err = store.compare_and_swap("k", None, "d".into()).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.get("k").await.unwrap().unwrap().value, "b");
    }

    #[tokio::test]
    async fn test_scan_prefix_is_ordered_and_bounded() {
        let store = MemoryStateStore::new();
        for key in ["task:b", "agent:x", "task:a", "taskz"] {
            store.compare_and_swap(key, None, key.into()).await.unwrap();
        }
        let keys: Vec<String> = store
            .scan_prefix("task:")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["task:a".to_string(), "task:b".to_string()]);
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let store = MemoryStateStore::new();
        let v = cas_json(&store, "n", None, &serde_json::json!({"n": 1}))
            .await
            .unwrap();
        let loaded = get_json::<serde_json::Value>(&store, "n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.version, v);
        assert_eq!(loaded.value["n"], 1);
        assert!(get_json::<serde_json::Value>(&store, "missing")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_lock_exclusive_until_released() {
        let store = MemoryStateStore::new();
        let lease = store
            .acquire_lock("lock:task:1", "a", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert!(store
            .acquire_lock("lock:task:1", "b", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());

        assert!(store.release_lock(&lease).await.unwrap());
        assert!(!store.release_lock(&lease).await.unwrap());
        assert!(store
            .acquire_lock("lock:task:1", "b", Duration::from_secs(30))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken_over() {
        let store = MemoryStateStore::new();
        let stale = store
            .acquire_lock("lock:x", "a", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let fresh = store
            .acquire_lock("lock:x", "b", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(fresh.is_some());
        // The stale holder no longer owns the key.
        assert!(!store.release_lock(&stale).await.unwrap());
    }

    #[tokio::test]
    async fn test_scoped_lock_release() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let guard = ScopedLock::acquire(store.clone(), "lock:y", "a", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(guard.key(), Some("lock:y"));
        assert!(ScopedLock::acquire(store.clone(), "lock:y", "b", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
        assert!(guard.release().await.unwrap());
        assert!(ScopedLock::acquire(store, "lock:y", "b", Duration::from_secs(30))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_offline_store_reports_unavailable() {
        let store = MemoryStateStore::new();
        store.set_available(false);
        let err = store.get("k").await.unwrap_err();
        assert!(err.is_dependency_outage());
        assert!(store.ping().await.is_err());
        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }
}
