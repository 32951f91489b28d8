// HTTP provider backend
//
// POSTs each message as JSON to a configured endpoint and forwards the response
// body verbatim as a single text delta.

use async_trait::async_trait;
use ensemble_abstraction::{AgentBackend, BackendConfig, BackendError, ChunkStream, StreamChunk};
use futures::StreamExt;
use reqwest::{Client, Url};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::descriptor::AgentDescriptor;

const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Backend for agents hosted behind an HTTP API.
#[derive(Debug)]
pub struct HttpBackend {
    client: Client,
    endpoint: Url,
    model: Option<String>,
    api_key_env: Option<String>,
    api_key: OnceLock<Option<String>>,
    shut_down: AtomicBool,
}

impl HttpBackend {
    /// Reads `endpoint`, `model`, `api_key_env` and `timeout_secs` from the
    /// descriptor settings.
    ///
    /// # Errors
    /// Returns `InvalidSetting` for a missing or malformed endpoint or timeout.
    pub fn new(descriptor: &AgentDescriptor) -> Result<Self, BackendError> {
        let config = descriptor.backend_config();
        let endpoint = Url::parse(config.require("endpoint")?).map_err(|e| {
            BackendError::InvalidSetting { key: "endpoint".to_string(), reason: e.to_string() }
        })?;
        let timeout_secs = match config.get("timeout_secs") {
            Some(raw) => raw.parse::<u64>().map_err(|e| BackendError::InvalidSetting {
                key: "timeout_secs".to_string(),
                reason: e.to_string(),
            })?,
            None => DEFAULT_TIMEOUT_SECS,
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| BackendError::Initialization(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            model: config.get("model").map(str::to_string),
            api_key_env: config.get("api_key_env").map(str::to_string),
            api_key: OnceLock::new(),
            shut_down: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl AgentBackend for HttpBackend {
    async fn initialize(&self, config: &BackendConfig) -> Result<(), BackendError> {
        let key = match &self.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                BackendError::Initialization(format!("environment variable {var} is not set"))
            })?),
            None => None,
        };
        let _ = self.api_key.set(key);
        debug!(agent_id = %config.agent_id, endpoint = %self.endpoint, "HTTP backend ready");
        Ok(())
    }

    async fn send(&self, message: &str, cancel: CancellationToken) -> Result<ChunkStream, BackendError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(BackendError::Transport("backend has been shut down".to_string()));
        }
        let api_key = self
            .api_key
            .get()
            .ok_or_else(|| BackendError::Other("backend not initialized".to_string()))?;

        let mut request = self
            .client
            .post(self.endpoint.clone())
            .json(&serde_json::json!({ "model": self.model, "message": message }));
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(BackendError::Cancelled),
            response = request.send() => response.map_err(|e| BackendError::Transport(e.to_string()))?,
        };

        let status = response.status();
        let body = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(BackendError::Cancelled),
            body = response.text() => body.map_err(|e| BackendError::Transport(e.to_string()))?,
        };

        let chunks: Vec<Result<StreamChunk, BackendError>> = if status.is_success() {
            vec![Ok(StreamChunk::text(body)), Ok(StreamChunk::Complete)]
        } else {
            vec![Ok(StreamChunk::error("http_status", format!("provider returned {status}: {body}")))]
        };
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn shutdown(&self) -> Result<(), BackendError> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::AgentKind;

    #[test]
    fn test_endpoint_is_required() {
        let err = HttpBackend::new(&AgentDescriptor::new("http", AgentKind::HttpProvider))
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidSetting { ref key, .. } if key == "endpoint"));
    }

    #[test]
    fn test_malformed_timeout_is_rejected() {
        let descriptor = AgentDescriptor::new("http", AgentKind::HttpProvider)
            .with_setting("endpoint", "http://localhost:8080/v1/chat")
            .with_setting("timeout_secs", "soon");
        let err = HttpBackend::new(&descriptor).unwrap_err();
        assert!(matches!(err, BackendError::InvalidSetting { ref key, .. } if key == "timeout_secs"));
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_initialization() {
        let descriptor = AgentDescriptor::new("http", AgentKind::HttpProvider)
            .with_setting("endpoint", "http://localhost:8080/v1/chat")
            .with_setting("api_key_env", "ENSEMBLE_TEST_KEY_THAT_IS_NEVER_SET");
        let backend = HttpBackend::new(&descriptor).unwrap();
        let err = backend.initialize(&descriptor.backend_config()).await.unwrap_err();
        assert!(matches!(err, BackendError::Initialization(_)));
    }

    #[tokio::test]
    async fn test_send_before_initialize_fails() {
        let descriptor = AgentDescriptor::new("http", AgentKind::HttpProvider)
            .with_setting("endpoint", "http://localhost:8080/v1/chat");
        let backend = HttpBackend::new(&descriptor).unwrap();
        assert!(backend.send("hi", CancellationToken::new()).await.is_err());
    }
}
