use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use switchboard_core::{SwitchboardError, SwitchboardResult};

/// A secret fetched from a [`SecretStore`].
///
/// `Debug` and `Display` never print the contents.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    /// Wrap a secret.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw secret.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(***)")
    }
}

impl fmt::Display for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Source of credentials.
///
/// A missing secret and an unreachable backend both surface as
/// [`SwitchboardError::SecretUnavailable`]; callers must not substitute a
/// built-in default.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Name used in logs and health reports.
    fn name(&self) -> &str;
    /// Fetch the secret stored at `path`.
    async fn get_secret(&self, path: &str) -> SwitchboardResult<SecretValue>;
    /// Check that the backend is reachable.
    async fn ping(&self) -> SwitchboardResult<()>;
}

/// Reads secrets from process environment variables.
///
/// The path `reasoning/api-key` maps to `SWITCHBOARD_SECRET_REASONING_API_KEY`.
pub struct EnvSecretStore {
    prefix: String,
}

impl EnvSecretStore {
    /// Create a new store with the default prefix.
    pub fn new() -> Self {
        Self::with_prefix("SWITCHBOARD_SECRET_")
    }

    /// Create a new store reading variables that start with `prefix`.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Environment variable holding `path`.
    pub fn env_key(&self, path: &str) -> String {
        let suffix: String = path
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{suffix}", self.prefix)
    }
}

impl Default for EnvSecretStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    fn name(&self) -> &str {
        "env"
    }

    async fn get_secret(&self, path: &str) -> SwitchboardResult<SecretValue> {
        let key = self.env_key(path);
        match std::env::var(&key) {
            Ok(value) if !value.is_empty() => Ok(SecretValue::new(value)),
            _ => Err(SwitchboardError::SecretUnavailable(format!(
                "{path} (env {key} not set)"
            ))),
        }
    }

    async fn ping(&self) -> SwitchboardResult<()> {
        Ok(())
    }
}

/// Secrets held in memory. Can be switched offline to simulate an outage.
pub struct StaticSecretStore {
    secrets: RwLock<HashMap<String, SecretValue>>,
    available: AtomicBool,
}

impl StaticSecretStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            secrets: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Add a secret.
    pub fn with_secret(self, path: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(path, value);
        self
    }

    /// Add or replace a secret.
    pub fn insert(&self, path: impl Into<String>, value: impl Into<String>) {
        self.secrets
            .write()
            .insert(path.into(), SecretValue::new(value));
    }

    /// Remove a secret. Returns whether it existed.
    pub fn remove(&self, path: &str) -> bool {
        self.secrets.write().remove(path).is_some()
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> SwitchboardResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SwitchboardError::SecretUnavailable(
                "secret store is offline".to_string(),
            ))
        }
    }
}

impl Default for StaticSecretStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    fn name(&self) -> &str {
        "static"
    }

    async fn get_secret(&self, path: &str) -> SwitchboardResult<SecretValue> {
        self.check_available()?;
        self.secrets
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| SwitchboardError::SecretUnavailable(path.to_string()))
    }

    async fn ping(&self) -> SwitchboardResult<()> {
        self.check_available()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_value_is_redacted() {
        let secret = SecretValue::new("hunter2");
        assert_eq!(format!("{secret:?}"), "SecretValue(***)");
        assert_eq!(secret.to_string(), "***");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn test_env_key_mapping() {
        let store = EnvSecretStore::new();
        assert_eq!(
            store.env_key("reasoning/api-key"),
            "SWITCHBOARD_SECRET_REASONING_API_KEY"
        );
    }

    #[tokio::test]
    async fn test_env_store_reads_variable() {
        let store = EnvSecretStore::with_prefix("SWITCHBOARD_TEST_SECRETS_READ_");
        std::env::set_var("SWITCHBOARD_TEST_SECRETS_READ_TOKEN", "abc");
        assert_eq!(store.get_secret("token").await.unwrap().expose(), "abc");

        let err = store.get_secret("absent").await.unwrap_err();
        assert!(matches!(err, SwitchboardError::SecretUnavailable(_)));
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_static_store_and_outage() {
        let store = StaticSecretStore::new().with_secret("reasoning/key", "k");
        assert_eq!(store.get_secret("reasoning/key").await.unwrap().expose(), "k");
        assert!(store.get_secret("other").await.is_err());

        store.set_available(false);
        assert!(store.get_secret("reasoning/key").await.is_err());
        assert!(store.ping().await.unwrap_err().is_dependency_outage());

        store.set_available(true);
        assert!(store.remove("reasoning/key"));
        assert!(store.get_secret("reasoning/key").await.is_err());
    }
}
