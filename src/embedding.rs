//! Embedding providers for semantic chunks.
//!
//! Embeddings are optional. With `embedding.provider = "disabled"` chunks are
//! stored without vectors and retrieval scores by term overlap. When a
//! provider is configured but a call fails, the writer logs and stores the
//! chunks without vectors; embedding never fails an ingest.
//!
//! HTTP 429 and 5xx responses and network errors are retried with the shared
//! [`RetryPolicy`]; other 4xx responses fail immediately.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::config::EmbeddingConfig;
use crate::retry::RetryPolicy;

#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;

    /// False for the disabled provider; callers skip embedding entirely.
    fn is_enabled(&self) -> bool {
        true
    }

    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single query text.
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    embedder
        .embed(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Empty embedding response"))
}

pub fn create_embedder(config: &EmbeddingConfig, retry: RetryPolicy) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "openai" | "ollama" => Ok(Arc::new(HttpEmbedder::new(config, retry)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    OpenAi,
    Ollama,
}

/// OpenAI `/v1/embeddings` or Ollama `/api/embed` client.
pub struct HttpEmbedder {
    flavor: Flavor,
    http: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
    api_key: Option<String>,
    retry: RetryPolicy,
}

/// Failure of one embedding HTTP attempt.
#[derive(Debug)]
struct AttemptError {
    retryable: bool,
    message: String,
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig, retry: RetryPolicy) -> Result<Self> {
        let flavor = match config.provider.as_str() {
            "openai" => Flavor::OpenAi,
            "ollama" => Flavor::Ollama,
            other => bail!("Unknown embedding provider: {}", other),
        };
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for {} provider", config.provider))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for {} provider", config.provider))?;
        let (url, api_key) = match flavor {
            Flavor::OpenAi => {
                let key = std::env::var("OPENAI_API_KEY")
                    .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
                let base = config.base_url.as_deref().unwrap_or("https://api.openai.com");
                (format!("{}/v1/embeddings", base.trim_end_matches('/')), Some(key))
            }
            Flavor::Ollama => {
                let base = config.base_url.as_deref().unwrap_or("http://localhost:11434");
                (format!("{}/api/embed", base.trim_end_matches('/')), None)
            }
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            flavor,
            http,
            model,
            dims,
            url,
            api_key,
            retry,
        })
    }

    async fn attempt(&self, body: &serde_json::Value) -> std::result::Result<serde_json::Value, AttemptError> {
        let mut request = self.http.post(&self.url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(|e| AttemptError {
            retryable: true,
            message: format!("embedding request to {} failed: {}", self.url, e),
        })?;
        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(|e| AttemptError {
                retryable: false,
                message: format!("invalid embedding response: {}", e),
            });
        }
        let text = response.text().await.unwrap_or_default();
        Err(AttemptError {
            retryable: status.as_u16() == 429 || status.is_server_error(),
            message: format!("embedding API error {}: {}", status, text),
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let body = &body;
        let json = self
            .retry
            .run("embedding", |e: &AttemptError| e.retryable, move |_| self.attempt(body))
            .await
            .map_err(|e| anyhow!(e.last.message))?;

        let vectors = match self.flavor {
            Flavor::OpenAi => parse_openai_response(&json)?,
            Flavor::Ollama => parse_ollama_response(&json)?,
        };
        if vectors.len() != texts.len() {
            bail!(
                "embedding response has {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            );
        }
        if let Some(v) = vectors.iter().find(|v| v.len() != self.dims) {
            bail!("embedding has {} dims, expected {}", v.len(), self.dims);
        }
        Ok(vectors)
    }
}

fn to_vector(value: &serde_json::Value) -> Result<Vec<f32>> {
    Ok(value
        .as_array()
        .ok_or_else(|| anyhow!("embedding is not an array"))?
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

/// Extract `data[].embedding`, ordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;
    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item.get("index").and_then(|i| i.as_u64()).unwrap_or(pos as u64);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))?;
        indexed.push((index, to_vector(embedding)?));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?
        .iter()
        .map(to_vector)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_response_is_reordered_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn ollama_response_requires_embeddings() {
        assert!(parse_ollama_response(&serde_json::json!({"model": "x"})).is_err());
        let vectors =
            parse_ollama_response(&serde_json::json!({"embeddings": [[0.5, 0.5]]})).unwrap();
        assert_eq!(vectors, vec![vec![0.5, 0.5]]);
    }

    #[tokio::test]
    async fn disabled_embedder() {
        let embedder = create_embedder(&EmbeddingConfig::default(), RetryPolicy::default()).unwrap();
        assert!(!embedder.is_enabled());
        assert!(embed_query(embedder.as_ref(), "yield").await.is_err());
    }
}
