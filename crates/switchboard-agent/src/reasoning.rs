use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use switchboard_core::SwitchboardResult;
use switchboard_security::SecretValue;

/// Input to a reasoning call.
#[derive(Debug, Clone)]
pub struct ReasoningPrompt {
    /// Rendered prompt text.
    pub text: String,
    /// Credential for the backend, redacted in debug output.
    pub credential: Option<SecretValue>,
}

impl ReasoningPrompt {
    /// Create a new prompt without a credential.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            credential: None,
        }
    }

    /// Attach the credential the backend needs.
    pub fn with_credential(mut self, credential: SecretValue) -> Self {
        self.credential = Some(credential);
        self
    }
}

/// Raw structured answer from the reasoning capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningResponse {
    /// The JSON answer, before interpretation.
    pub body: serde_json::Value,
}

impl ReasoningResponse {
    /// Create a new response from a JSON answer.
    pub fn new(body: serde_json::Value) -> Self {
        Self { body }
    }
}

/// The decision-making capability (typically a language model).
///
/// Implementations should give up after `timeout` with
/// [`switchboard_core::SwitchboardError::Timeout`] and report throttling as
/// [`switchboard_core::SwitchboardError::RateLimited`].
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    /// Name used in logs and decision log entries.
    fn name(&self) -> &str;
    /// Answer `prompt` within `timeout`.
    async fn infer(
        &self,
        prompt: &ReasoningPrompt,
        timeout: Duration,
    ) -> SwitchboardResult<ReasoningResponse>;
}
