//! Generation clients
//!
//! A backend is selected purely by configuration: the engine and pool see
//! only the [`GenerationClient`] trait, so a mock and a real HTTP provider
//! are interchangeable.

use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use conductor_sdk::{
    async_trait, GenerationClient, GenerationRequest, GenerationResult, OrchestratorError, Result,
};

/// Rough token estimate used for context-window checks and mock accounting.
/// Four characters per token is the usual English-text approximation.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64 / 4).max(1)
}

/// What a [`MockClient`] does when invoked.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Return this text.
    Respond(String),
    /// Fail with a retryable error (rate limit, transient transport).
    FailRetryable(String),
    /// Fail with a fatal error (bad credentials, misconfiguration).
    FailFatal(String),
}

/// Deterministic in-process backend for tests and local development.
pub struct MockClient {
    behavior: MockBehavior,
    latency: Duration,
}

impl MockClient {
    pub fn respond(text: impl Into<String>) -> Self {
        Self {
            behavior: MockBehavior::Respond(text.into()),
            latency: Duration::ZERO,
        }
    }

    pub fn fail_retryable(message: impl Into<String>) -> Self {
        Self {
            behavior: MockBehavior::FailRetryable(message.into()),
            latency: Duration::ZERO,
        }
    }

    pub fn fail_fatal(message: impl Into<String>) -> Self {
        Self {
            behavior: MockBehavior::FailFatal(message.into()),
            latency: Duration::ZERO,
        }
    }

    /// Simulate backend latency; useful for scheduling and cancellation tests.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl GenerationClient for MockClient {
    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult> {
        if !self.latency.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                _ = tokio::time::sleep(self.latency) => {}
            }
        } else if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }

        match &self.behavior {
            MockBehavior::Respond(text) => Ok(GenerationResult {
                text: text.clone(),
                tokens_in: estimate_tokens(&request.prompt),
                tokens_out: estimate_tokens(text),
                cost_usd: 0.0,
                latency: self.latency,
                model: request.model.clone(),
            }),
            MockBehavior::FailRetryable(msg) => {
                Err(OrchestratorError::agent_retryable(&request.model, msg))
            }
            MockBehavior::FailFatal(msg) => {
                Err(OrchestratorError::agent_fatal(&request.model, msg))
            }
        }
    }
}

/// Cloud provider reached over HTTP. The wire format is a plain JSON POST;
/// provider-specific adapters can wrap this or implement the trait directly.
pub struct HttpClient {
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct GenerationResponse {
    text: String,
    #[serde(default)]
    tokens_in: u64,
    #[serde(default)]
    tokens_out: u64,
}

impl HttpClient {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn classify_status(model: &str, status: reqwest::StatusCode) -> OrchestratorError {
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            OrchestratorError::agent_fatal(model, format!("auth rejected ({status})"))
        } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            OrchestratorError::agent_retryable(model, format!("provider returned {status}"))
        } else {
            OrchestratorError::agent_fatal(model, format!("provider returned {status}"))
        }
    }
}

#[async_trait]
impl GenerationClient for HttpClient {
    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult> {
        let started = std::time::Instant::now();

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            resp = builder.send() => resp.map_err(|e| {
                if e.is_timeout() {
                    OrchestratorError::agent_retryable(&request.model, format!("timeout: {e}"))
                } else {
                    OrchestratorError::agent_retryable(&request.model, format!("transport: {e}"))
                }
            })?,
        };

        if !response.status().is_success() {
            return Err(Self::classify_status(&request.model, response.status()));
        }

        let parsed: GenerationResponse = response.json().await.map_err(|e| {
            OrchestratorError::agent_fatal(&request.model, format!("malformed response: {e}"))
        })?;

        let tokens_in = if parsed.tokens_in > 0 {
            parsed.tokens_in
        } else {
            estimate_tokens(&request.prompt)
        };
        let tokens_out = if parsed.tokens_out > 0 {
            parsed.tokens_out
        } else {
            estimate_tokens(&parsed.text)
        };

        Ok(GenerationResult {
            text: parsed.text,
            tokens_in,
            tokens_out,
            cost_usd: 0.0,
            latency: started.elapsed(),
            model: request.model.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_responds_with_token_accounting() {
        let client = MockClient::respond("four words of text");
        let request = GenerationRequest::new("m", "a prompt of reasonable length");
        let cancel = CancellationToken::new();

        let result = client.generate(&request, &cancel).await.unwrap();
        assert_eq!(result.text, "four words of text");
        assert_eq!(result.model, "m");
        assert!(result.tokens_in > 0);
        assert!(result.tokens_out > 0);
    }

    #[tokio::test]
    async fn test_mock_failure_kinds() {
        let cancel = CancellationToken::new();
        let request = GenerationRequest::new("m", "p");

        let err = MockClient::fail_retryable("rate limited")
            .generate(&request, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let err = MockClient::fail_fatal("bad key")
            .generate(&request, &cancel)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_mock_latency_respects_cancellation() {
        let client = MockClient::respond("slow").with_latency(Duration::from_secs(30));
        let request = GenerationRequest::new("m", "p");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client.generate(&request, &cancel).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled));
    }

    #[test]
    fn test_status_classification() {
        let fatal = HttpClient::classify_status("m", reqwest::StatusCode::UNAUTHORIZED);
        assert!(!fatal.is_retryable());

        let retryable = HttpClient::classify_status("m", reqwest::StatusCode::TOO_MANY_REQUESTS);
        assert!(retryable.is_retryable());

        let server = HttpClient::classify_status("m", reqwest::StatusCode::BAD_GATEWAY);
        assert!(server.is_retryable());
    }
}
