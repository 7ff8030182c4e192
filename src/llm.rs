//! LLM completion adapter.
//!
//! The model is an opaque, best-effort text source: `complete(prompt,
//! timeout)` returns text or an [`LlmError`]. Nothing it returns is trusted
//! structurally; callers parse and validate.
//!
//! | Config value | Client |
//! |--------------|--------|
//! | `"disabled"` | [`DisabledLlm`] |
//! | `"openai"` | [`OpenAiClient`] (chat completions, `OPENAI_API_KEY`) |
//! | `"ollama"` | [`OllamaClient`] (`/api/generate`) |
//!
//! [`complete_bounded`] is the only way the pipeline calls a client: it
//! enforces the timeout even if a client ignores it, and applies the shared
//! retry policy to timeouts and transport errors.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::retry::RetryPolicy;

#[async_trait]
pub trait LlmClient: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, prompt: &str, timeout: Duration) -> Result<String, LlmError>;
}

/// Call `client` with a hard timeout per attempt, retrying transient failures.
pub async fn complete_bounded(
    client: &dyn LlmClient,
    prompt: &str,
    timeout: Duration,
    retry: &RetryPolicy,
) -> Result<String, LlmError> {
    retry
        .run("llm.complete", LlmError::is_retryable, |_| async move {
            match tokio::time::timeout(timeout, client.complete(prompt, timeout)).await {
                Ok(result) => result,
                Err(_) => Err(LlmError::Timeout(timeout)),
            }
        })
        .await
        .map_err(|e| e.last)
}

pub fn create_llm_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledLlm)),
        "openai" => Ok(Arc::new(OpenAiClient::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaClient::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

fn http_error(status: reqwest::StatusCode, body: String) -> LlmError {
    if status.as_u16() == 429 || status.is_server_error() {
        LlmError::Transport(format!("HTTP {}: {}", status, body))
    } else {
        LlmError::InvalidResponse(format!("HTTP {}: {}", status, body))
    }
}

// ============ Disabled ============

pub struct DisabledLlm;

#[async_trait]
impl LlmClient for DisabledLlm {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _prompt: &str, _timeout: Duration) -> Result<String, LlmError> {
        Err(LlmError::Disabled)
    }
}

// ============ OpenAI ============

pub struct OpenAiClient {
    http: reqwest::Client,
    model: String,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            http: reqwest::Client::new(),
            model,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            api_key,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, prompt: &str, timeout: Duration) -> Result<String, LlmError> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "messages": [{"role": "user", "content": prompt}],
        });
        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(timeout)
                } else {
                    LlmError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(http_error(status, text));
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| LlmError::InvalidResponse("missing choices[0].message.content".into()))
    }
}

// ============ Ollama ============

pub struct OllamaClient {
    http: reqwest::Client,
    model: String,
    base_url: String,
}

impl OllamaClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for Ollama provider"))?;
        Ok(Self {
            http: reqwest::Client::new(),
            model,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
        })
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(&self, prompt: &str, timeout: Duration) -> Result<String, LlmError> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });
        let response = self
            .http
            .post(format!("{}/api/generate", self.base_url.trim_end_matches('/')))
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(timeout)
                } else {
                    LlmError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(http_error(status, text));
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        json.get("response")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .ok_or_else(|| LlmError::InvalidResponse("missing response field".into()))
    }
}

// ============ Mock ============

#[cfg(test)]
pub(crate) use mock::MockLlmClient;

#[cfg(test)]
mod mock {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::LlmClient;
    use crate::error::LlmError;

    enum MockBehavior {
        Reply(String),
        Fail(LlmError),
        Hang,
    }

    /// Scripted client for tests: replies, fails, or never returns.
    pub(crate) struct MockLlmClient {
        behavior: MockBehavior,
        calls: AtomicUsize,
    }

    impl MockLlmClient {
        pub fn replying(text: impl Into<String>) -> Self {
            Self {
                behavior: MockBehavior::Reply(text.into()),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn failing(error: LlmError) -> Self {
            Self {
                behavior: MockBehavior::Fail(error),
                calls: AtomicUsize::new(0),
            }
        }

        /// A client whose calls never complete; only the caller's timeout ends them.
        pub fn hanging() -> Self {
            Self {
                behavior: MockBehavior::Hang,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmClient for MockLlmClient {
        fn name(&self) -> &str {
            "mock"
        }

        async fn complete(&self, _prompt: &str, _timeout: Duration) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                MockBehavior::Reply(text) => Ok(text.clone()),
                MockBehavior::Fail(err) => Err(err.clone()),
                MockBehavior::Hang => {
                    std::future::pending::<()>().await;
                    Err(LlmError::Transport("unreachable".into()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hanging_call_is_bounded() {
        let client = MockLlmClient::hanging();
        let started = std::time::Instant::now();
        let err = complete_bounded(
            &client,
            "classify",
            Duration::from_millis(30),
            &RetryPolicy::immediate(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LlmError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn transport_errors_are_retried() {
        let client = MockLlmClient::failing(LlmError::Transport("reset".into()));
        let err = complete_bounded(&client, "p", Duration::from_secs(1), &RetryPolicy::immediate(3))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Transport(_)));
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn disabled_is_not_retried() {
        let client = MockLlmClient::failing(LlmError::Disabled);
        let err = complete_bounded(&client, "p", Duration::from_secs(1), &RetryPolicy::immediate(3))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Disabled));
        assert_eq!(client.calls(), 1);
    }

    #[test]
    fn provider_selection() {
        assert_eq!(create_llm_client(&LlmConfig::default()).unwrap().name(), "disabled");
        let bad = LlmConfig {
            provider: "magic".into(),
            ..LlmConfig::default()
        };
        assert!(create_llm_client(&bad).is_err());
    }
}
