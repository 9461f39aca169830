//! Backend traits and the Ollama HTTP implementation.
//!
//! [`InferenceBackend`] is the application-level interface used by the
//! router: generate text, report health.  [`SessionControl`] is the narrower
//! interface the process supervisor needs: enumerate and stop loaded model
//! sessions, check readiness, run a functional probe.
//!
//! [`OllamaBackend`] implements both against the Ollama HTTP API.  All
//! connection details come from [`BackendConfig`]; nothing is hardcoded.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::config::BackendConfig;

// ---------------------------------------------------------------------------
// BackendError
// ---------------------------------------------------------------------------

/// Errors from a single backend call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// HTTP transport or connection error.
    #[error("HTTP request failed: {0}")]
    Request(String),

    /// The call did not complete within its timeout.
    #[error("backend request timed out")]
    Timeout,

    /// The response could not be parsed as expected JSON.
    #[error("failed to parse backend response: {0}")]
    Parse(String),

    /// The backend answered with no usable text.
    #[error("backend returned an empty response")]
    EmptyResponse,

    /// Every pooled connection is in use.  Treated as busy, not broken.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// No healthy backend can take the call.
    #[error("no healthy backend available")]
    Unavailable,
}

impl BackendError {
    /// Whether the router should retry the call on the other backend.
    pub fn triggers_failover(&self) -> bool {
        matches!(
            self,
            BackendError::Request(_)
                | BackendError::Timeout
                | BackendError::PoolExhausted
                | BackendError::Unavailable
        )
    }

    /// Whether the failure says something about the backend's health (as
    /// opposed to momentary saturation).
    pub fn marks_unhealthy(&self) -> bool {
        matches!(
            self,
            BackendError::Request(_) | BackendError::Timeout | BackendError::Unavailable
        )
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BackendError::Timeout
        } else {
            BackendError::Request(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Stopping,
    Stopped,
}

/// One loaded model context on a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSession {
    pub session_id: String,
    pub model_name: String,
    pub state: SessionState,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Application-level inference calls.
///
/// Implementors must be `Send + Sync` so they can be held behind an
/// `Arc<dyn InferenceBackend>`.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Short label for logs.
    fn name(&self) -> &str;

    /// Run one prompt to completion.
    async fn generate(&self, prompt: &str) -> Result<String, BackendError>;

    /// Cheap liveness check.
    async fn health(&self) -> Result<(), BackendError>;
}

/// Session management used by the process supervisor.
#[async_trait]
pub trait SessionControl: Send + Sync {
    async fn list_sessions(&self) -> Result<Vec<BackendSession>, BackendError>;

    /// Ask the backend to unload `model_name` (keep-alive zero).
    async fn stop_session(&self, model_name: &str) -> Result<(), BackendError>;

    /// The server accepts connections and answers its version endpoint.
    async fn readiness(&self) -> Result<(), BackendError>;

    /// Minimal prompt/response round trip.
    async fn probe(&self, prompt: &str) -> Result<String, BackendError>;
}

// ---------------------------------------------------------------------------
// Ollama wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PsResponse {
    #[serde(default)]
    models: Vec<PsModel>,
}

#[derive(Debug, Deserialize)]
struct PsModel {
    name: String,
    #[serde(default)]
    model: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

// ---------------------------------------------------------------------------
// OllamaBackend
// ---------------------------------------------------------------------------

/// Calls an Ollama server over HTTP.
///
/// The `reqwest::Client` keeps a connection pool that is reused across
/// calls.  A semaphore of `pool_size` permits bounds concurrent generate
/// calls; when it is exhausted the call fails fast with
/// [`BackendError::PoolExhausted`] so the router can fail over.
pub struct OllamaBackend {
    name: String,
    client: reqwest::Client,
    config: BackendConfig,
    pool: Arc<Semaphore>,
}

impl std::fmt::Debug for OllamaBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaBackend")
            .field("name", &self.name)
            .field("base_url", &self.config.base_url)
            .field("model", &self.config.model)
            .finish_non_exhaustive()
    }
}

impl OllamaBackend {
    /// Build a backend from config.
    ///
    /// A default client is used as a last-resort fallback if the builder
    /// fails.
    pub fn from_config(name: impl Into<String>, config: &BackendConfig) -> Self {
        let pool_size = config.pool_size.max(1);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(pool_size)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            name: name.into(),
            client,
            config: config.clone(),
            pool: Arc::new(Semaphore::new(pool_size)),
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn post_generate(&self, body: serde_json::Value) -> Result<String, BackendError> {
        let response = self
            .client
            .post(self.url("/api/generate"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))?;
        Ok(parsed.response.trim().to_string())
    }
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, prompt: &str) -> Result<String, BackendError> {
        let _permit = Arc::clone(&self.pool)
            .try_acquire_owned()
            .map_err(|_| BackendError::PoolExhausted)?;

        let body = serde_json::json!({
            "model":      self.config.model,
            "prompt":     prompt,
            "stream":     false,
            "keep_alive": self.config.keep_alive,
        });

        let text = self.post_generate(body).await?;
        if text.is_empty() {
            return Err(BackendError::EmptyResponse);
        }
        Ok(text)
    }

    async fn health(&self) -> Result<(), BackendError> {
        self.client
            .get(self.url("/api/version"))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl SessionControl for OllamaBackend {
    async fn list_sessions(&self) -> Result<Vec<BackendSession>, BackendError> {
        let response = self
            .client
            .get(self.url("/api/ps"))
            .send()
            .await?
            .error_for_status()?;
        let ps: PsResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))?;

        Ok(ps
            .models
            .into_iter()
            .map(|m| BackendSession {
                model_name: if m.model.is_empty() { m.name.clone() } else { m.model },
                session_id: m.name,
                state: SessionState::Active,
            })
            .collect())
    }

    async fn stop_session(&self, model_name: &str) -> Result<(), BackendError> {
        let body = serde_json::json!({
            "model":      model_name,
            "keep_alive": 0,
        });
        self.post_generate(body).await.map(|_| ())
    }

    async fn readiness(&self) -> Result<(), BackendError> {
        InferenceBackend::health(self).await
    }

    async fn probe(&self, prompt: &str) -> Result<String, BackendError> {
        let body = serde_json::json!({
            "model":   self.config.model,
            "prompt":  prompt,
            "stream":  false,
            "options": { "num_predict": 8 },
        });
        let text = self.post_generate(body).await?;
        if text.is_empty() {
            return Err(BackendError::EmptyResponse);
        }
        Ok(text)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_url: &str) -> BackendConfig {
        BackendConfig {
            base_url: base_url.into(),
            model: "qwen2.5:1.5b".into(),
            timeout_secs: 1,
            pool_size: 1,
            keep_alive: "5m".into(),
        }
    }

    #[test]
    fn from_config_builds_without_panic() {
        let backend = OllamaBackend::from_config("fast", &config("http://localhost:11434"));
        assert_eq!(backend.name(), "fast");
        assert_eq!(backend.model(), "qwen2.5:1.5b");
    }

    #[test]
    fn url_joins_without_double_slash() {
        let backend = OllamaBackend::from_config("fast", &config("http://localhost:11434/"));
        assert_eq!(backend.url("/api/ps"), "http://localhost:11434/api/ps");
    }

    #[test]
    fn backend_is_object_safe() {
        let backend = OllamaBackend::from_config("deep", &config("http://localhost:11434"));
        let _: Arc<dyn InferenceBackend> = Arc::new(backend);
    }

    #[tokio::test]
    async fn pool_exhaustion_is_reported_as_busy() {
        let backend = OllamaBackend::from_config("fast", &config("http://127.0.0.1:9"));
        let _held = Arc::clone(&backend.pool).try_acquire_owned().unwrap();
        assert_eq!(backend.generate("hi").await, Err(BackendError::PoolExhausted));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_request_error() {
        // Port 9 (discard) is closed on any sane test host.
        let backend = OllamaBackend::from_config("fast", &config("http://127.0.0.1:9"));
        let err = InferenceBackend::health(&backend).await.unwrap_err();
        assert!(err.marks_unhealthy(), "{err:?}");
    }

    #[test]
    fn ps_payload_parses() {
        let json = r#"{"models":[{"name":"qwen2.5:7b","model":"qwen2.5:7b","size":1},{"name":"llama3:8b"}]}"#;
        let ps: PsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(ps.models.len(), 2);
        assert_eq!(ps.models[1].name, "llama3:8b");
        assert!(ps.models[1].model.is_empty());
    }

    #[test]
    fn failover_classification() {
        assert!(BackendError::PoolExhausted.triggers_failover());
        assert!(!BackendError::PoolExhausted.marks_unhealthy());
        assert!(BackendError::Timeout.marks_unhealthy());
        assert!(!BackendError::Parse("x".into()).triggers_failover());
    }
}
