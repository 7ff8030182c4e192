//! TOML configuration.
//!
//! Every section except `[db]` has serde defaults, so a minimal file is:
//!
//! ```toml
//! [db]
//! path = "./data/estate.sqlite"
//! ```
//!
//! [`load_config`] validates ranges and provider names. Components never read
//! [`Config`] directly: it is converted into the plain settings structs they
//! take at construction ([`PipelineSettings`], [`ClassifierSettings`],
//! [`RouterSettings`], [`TtlPolicy`], [`NurtureRules`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use estate_harness_core::chunk::ChunkBounds;

use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub nurture: NurtureConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IngestConfig {
    pub max_document_bytes: usize,
    pub concurrency: usize,
    pub retry: RetryConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_document_bytes: 25 * 1024 * 1024,
            concurrency: 4,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClassifierConfig {
    pub min_ai_confidence: f64,
    pub timeout_secs: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            min_ai_confidence: 0.6,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    pub min_tokens: usize,
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_tokens: 200,
            max_tokens: 500,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            base_url: None,
            max_retries: 1,
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: Option<String>,
    pub dims: Option<usize>,
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            base_url: None,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RouterConfig {
    pub min_intent_confidence: f64,
    pub handler_timeout_secs: u64,
    pub top_k: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            min_intent_confidence: 0.4,
            handler_timeout_secs: 15,
            top_k: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ContextConfig {
    pub property_ttl_secs: u64,
    pub client_ttl_secs: u64,
    pub market_ttl_secs: u64,
    pub session_idle_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            property_ttl_secs: 3_600,
            client_ttl_secs: 1_800,
            market_ttl_secs: 300,
            session_idle_secs: 1_800,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NurtureConfig {
    pub interval_secs: u64,
    pub hot_score_threshold: f64,
    pub recency_window_days: i64,
    pub inactivity_days: i64,
    /// Contacts and engagement older than this stop counting towards the score.
    pub activity_window_days: i64,
    pub follow_up_days_new: i64,
    pub follow_up_days_hot: i64,
    pub follow_up_days_warm: i64,
    pub follow_up_days_cold: i64,
}

impl Default for NurtureConfig {
    fn default() -> Self {
        Self {
            interval_secs: 900,
            hot_score_threshold: 70.0,
            recency_window_days: 7,
            inactivity_days: 30,
            activity_window_days: 30,
            follow_up_days_new: 2,
            follow_up_days_hot: 1,
            follow_up_days_warm: 7,
            follow_up_days_cold: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7410".to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Settings handed to components
// ═══════════════════════════════════════════════════════════════════════

/// Per-invocation settings for the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_document_bytes: usize,
    pub concurrency: usize,
    pub chunk_bounds: ChunkBounds,
    pub write_retry: RetryPolicy,
    pub classifier: ClassifierSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&Config::with_db_path(PathBuf::from(":memory:")))
    }
}

#[derive(Debug, Clone)]
pub struct ClassifierSettings {
    pub min_ai_confidence: f64,
    pub timeout: Duration,
    pub llm_retry: RetryPolicy,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        PipelineSettings::default().classifier
    }
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub min_intent_confidence: f64,
    pub handler_timeout: Duration,
    pub top_k: usize,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self::from(&RouterConfig::default())
    }
}

/// Cache lifetime per entity type plus session idle eviction.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    pub property: Duration,
    pub client: Duration,
    pub market_area: Duration,
    pub session_idle: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::from(&ContextConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct NurtureRules {
    pub hot_score_threshold: f64,
    pub recency_window: chrono::Duration,
    pub inactivity_window: chrono::Duration,
    pub activity_window: chrono::Duration,
    pub follow_up_new: chrono::Duration,
    pub follow_up_hot: chrono::Duration,
    pub follow_up_warm: chrono::Duration,
    pub follow_up_cold: chrono::Duration,
}

impl Default for NurtureRules {
    fn default() -> Self {
        Self::from(&NurtureConfig::default())
    }
}

impl Config {
    /// A config with every section defaulted.
    pub fn with_db_path(path: PathBuf) -> Self {
        Self {
            db: DbConfig { path },
            ingest: IngestConfig::default(),
            classifier: ClassifierConfig::default(),
            chunking: ChunkingConfig::default(),
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            router: RouterConfig::default(),
            context: ContextConfig::default(),
            nurture: NurtureConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_document_bytes: config.ingest.max_document_bytes,
            concurrency: config.ingest.concurrency.max(1),
            chunk_bounds: ChunkBounds {
                min_tokens: config.chunking.min_tokens,
                max_tokens: config.chunking.max_tokens,
            },
            write_retry: config.ingest.retry.policy(),
            classifier: ClassifierSettings {
                min_ai_confidence: config.classifier.min_ai_confidence,
                timeout: Duration::from_secs(config.classifier.timeout_secs),
                llm_retry: RetryPolicy {
                    max_attempts: config.llm.max_retries.max(1),
                    ..config.ingest.retry.policy()
                },
            },
        }
    }
}

impl From<&RouterConfig> for RouterSettings {
    fn from(config: &RouterConfig) -> Self {
        Self {
            min_intent_confidence: config.min_intent_confidence,
            handler_timeout: Duration::from_secs(config.handler_timeout_secs),
            top_k: config.top_k.max(1),
        }
    }
}

impl From<&ContextConfig> for TtlPolicy {
    fn from(config: &ContextConfig) -> Self {
        Self {
            property: Duration::from_secs(config.property_ttl_secs),
            client: Duration::from_secs(config.client_ttl_secs),
            market_area: Duration::from_secs(config.market_ttl_secs),
            session_idle: Duration::from_secs(config.session_idle_secs),
        }
    }
}

impl From<&NurtureConfig> for NurtureRules {
    fn from(config: &NurtureConfig) -> Self {
        Self {
            hot_score_threshold: config.hot_score_threshold,
            recency_window: chrono::Duration::days(config.recency_window_days),
            inactivity_window: chrono::Duration::days(config.inactivity_days),
            activity_window: chrono::Duration::days(config.activity_window_days),
            follow_up_new: chrono::Duration::days(config.follow_up_days_new),
            follow_up_hot: chrono::Duration::days(config.follow_up_days_hot),
            follow_up_warm: chrono::Duration::days(config.follow_up_days_warm),
            follow_up_cold: chrono::Duration::days(config.follow_up_days_cold),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate a config document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.chunking.min_tokens == 0 || config.chunking.max_tokens == 0 {
        bail!("chunking.min_tokens and chunking.max_tokens must be > 0");
    }
    if config.chunking.min_tokens > config.chunking.max_tokens {
        bail!("chunking.min_tokens must be <= chunking.max_tokens");
    }

    if config.ingest.max_document_bytes == 0 {
        bail!("ingest.max_document_bytes must be > 0");
    }
    if config.ingest.retry.max_attempts == 0 {
        bail!("ingest.retry.max_attempts must be >= 1");
    }
    if config.ingest.retry.base_delay_ms > config.ingest.retry.max_delay_ms {
        bail!("ingest.retry.base_delay_ms must be <= ingest.retry.max_delay_ms");
    }

    if !(0.0..=1.0).contains(&config.classifier.min_ai_confidence) {
        bail!("classifier.min_ai_confidence must be in [0.0, 1.0]");
    }
    if config.classifier.timeout_secs == 0 {
        bail!("classifier.timeout_secs must be > 0");
    }
    if !(0.0..=1.0).contains(&config.router.min_intent_confidence) {
        bail!("router.min_intent_confidence must be in [0.0, 1.0]");
    }
    if !(0.0..=100.0).contains(&config.nurture.hot_score_threshold) {
        bail!("nurture.hot_score_threshold must be in [0, 100]");
    }
    if config.nurture.inactivity_days <= 0
        || config.nurture.recency_window_days <= 0
        || config.nurture.activity_window_days <= 0
    {
        bail!("nurture.inactivity_days, nurture.recency_window_days and nurture.activity_window_days must be > 0");
    }
    if config.nurture.interval_secs == 0 {
        bail!("nurture.interval_secs must be > 0");
    }

    match config.llm.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown llm provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.llm.is_enabled() && config.llm.model.is_none() {
        bail!(
            "llm.model must be specified when provider is '{}'",
            config.llm.provider
        );
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    Ok(config)
}
