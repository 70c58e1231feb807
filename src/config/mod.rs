//! # Orchestrator Configuration
//!
//! Typed configuration for the task-queue worker and optimization pipeline.
//!
//! ## Architecture
//!
//! - **Layered Sources**: built-in defaults, `config/orchestrator.toml`,
//!   `config/orchestrator.<env>.toml`, then `ORCHESTRATOR__*` environment variables
//! - **Environment Awareness**: development/test/production overrides
//! - **Explicit Validation**: inconsistent values are rejected at startup
//!
//! ## Usage
//!
//! ```rust,no_run
//! use resume_orchestrator::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let batch_size = manager.config().worker.batch_size;
//! let lease = manager.config().worker.lease_duration();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure mirroring `config/orchestrator.toml`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Database connection and pooling configuration
    pub database: DatabaseConfig,

    /// Poll loop, lease, and concurrency settings
    pub worker: WorkerConfig,

    /// Retry backoff configuration
    pub backoff: BackoffConfig,

    /// Text chunking for embedding tasks
    pub chunking: ChunkingConfig,

    /// Optimize handler settings
    pub optimize: OptimizeConfig,

    /// LLM provider settings
    pub llm: LlmConfig,

    /// Embedding provider settings
    pub embedding: EmbeddingConfig,

    /// Vector index backend selection
    pub vector_index: VectorIndexConfig,
}

/// Database connection and pooling configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Explicit connection URL; `DATABASE_URL` takes precedence when set
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_seconds: u64,
    /// Apply embedded migrations on worker startup
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_seconds: 10,
            run_migrations: false,
        }
    }
}

impl DatabaseConfig {
    /// Resolve the connection URL, preferring the `DATABASE_URL` environment variable
    pub fn database_url(&self) -> Option<String> {
        std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.is_empty())
            .or_else(|| self.url.clone().filter(|url| !url.is_empty()))
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }
}

/// Poll loop configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Stable worker identity; generated per process when absent
    pub worker_id: Option<String>,
    /// Tasks requested per claim, capped at `max_concurrency` so every
    /// leased task starts as soon as it is claimed
    pub batch_size: u32,
    /// Upper bound applied to any claim request
    pub max_batch_size: u32,
    /// Lease length granted by a claim
    pub lease_duration_seconds: u64,
    /// Sleep between polls when nothing was claimed
    pub poll_interval_ms: u64,
    /// Claimed tasks processed in parallel
    pub max_concurrency: usize,
    /// Upper bound on a single handler execution
    pub handler_timeout_seconds: u64,
    /// Extend leases while a handler is running
    pub heartbeat_enabled: bool,
    pub heartbeat_interval_seconds: u64,
    /// Retry budget assigned to tasks enqueued without an explicit one
    pub default_max_attempts: u32,
    /// Pause after a store failure, doubled per consecutive failure
    pub store_error_backoff_base_ms: u64,
    pub store_error_backoff_max_ms: u64,
    /// How often the reliability report is logged; 0 disables it
    pub reliability_report_interval_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            batch_size: 5,
            max_batch_size: 50,
            lease_duration_seconds: 300,
            poll_interval_ms: 2000,
            max_concurrency: 4,
            handler_timeout_seconds: 180,
            heartbeat_enabled: false,
            heartbeat_interval_seconds: 60,
            default_max_attempts: 3,
            store_error_backoff_base_ms: 1000,
            store_error_backoff_max_ms: 30_000,
            reliability_report_interval_seconds: 300,
        }
    }
}

impl WorkerConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_seconds)
    }

    /// Tasks one poll may lease. Never more than can run at once, so no
    /// lease runs down while its task waits for a free slot.
    pub fn claim_limit(&self) -> u32 {
        let concurrency = u32::try_from(self.max_concurrency).unwrap_or(u32::MAX);
        self.batch_size.min(concurrency)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    /// Delay before polling again after `consecutive_failures` store errors
    pub fn store_error_backoff(&self, consecutive_failures: u32) -> Duration {
        let exp = consecutive_failures.saturating_sub(1).min(16);
        let delay = self
            .store_error_backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.store_error_backoff_max_ms);
        Duration::from_millis(delay)
    }
}

/// Backoff and retry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_seconds: u64,
    pub multiplier: f64,
    pub max_delay_seconds: u64,
    /// Upward jitter as a fraction of the computed delay
    pub jitter_fraction: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_seconds: 5,
            multiplier: 2.0,
            max_delay_seconds: 300,
            jitter_fraction: 0.1,
        }
    }
}

/// Chunking configuration for embedding tasks
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub target_chars: usize,
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_chars: 3500,
            overlap_chars: 400,
        }
    }
}

/// Optimize handler configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OptimizeConfig {
    /// Resume chunks retrieved from the vector index
    pub top_k: usize,
    pub temperature: f32,
    /// Re-request the preview in the desired language when it drifted
    pub translation_enabled: bool,
    /// Arabic-letter ratio separating Arabic from non-Arabic text
    pub translation_threshold: f64,
    /// Parse skills, experience and contact details from the resume into the report
    pub entity_extraction_enabled: bool,
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        Self {
            top_k: 6,
            temperature: 0.5,
            translation_enabled: true,
            translation_threshold: 0.15,
            entity_extraction_enabled: true,
        }
    }
}

/// Chat completion backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmBackend {
    /// OpenAI or any endpoint speaking its chat completions API
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(alias = "claude")]
    Anthropic,
    Gemini,
}

impl LlmBackend {
    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Anthropic => "https://api.anthropic.com/v1",
            Self::Gemini => "https://generativelanguage.googleapis.com/v1beta",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o-mini",
            Self::Anthropic => "claude-sonnet-4-20250514",
            Self::Gemini => "gemini-2.0-flash",
        }
    }

    /// Environment variable consulted when no key is configured
    pub fn api_key_env(self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::Gemini => "GEMINI_API_KEY",
        }
    }
}

/// LLM provider configuration. Unset `base_url` and `model` take the
/// selected backend's defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmBackend,
    pub base_url: Option<String>,
    /// Falls back to the backend's API key variable
    pub api_key: Option<String>,
    pub model: Option<String>,
    /// Completion length cap; required by the Anthropic API
    pub max_tokens: u32,
    pub request_timeout_seconds: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmBackend::OpenAi,
            base_url: None,
            api_key: None,
            model: None,
            max_tokens: 4096,
            request_timeout_seconds: 120,
        }
    }
}

impl LlmConfig {
    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .unwrap_or(self.provider.default_base_url())
            .trim_end_matches('/')
    }

    pub fn model(&self) -> &str {
        self.model
            .as_deref()
            .filter(|model| !model.is_empty())
            .unwrap_or(self.provider.default_model())
    }

    pub fn resolved_api_key(&self) -> Option<String> {
        resolve_api_key(self.api_key.as_deref(), self.provider.api_key_env())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// Embedding provider configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub base_url: String,
    /// Falls back to `OPENAI_API_KEY`
    pub api_key: Option<String>,
    pub model: String,
    pub dimensions: usize,
    /// Chunks sent per embedding request
    pub batch_size: usize,
    pub request_timeout_seconds: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "text-embedding-3-small".to_string(),
            dimensions: 1536,
            batch_size: 64,
            request_timeout_seconds: 60,
        }
    }
}

impl EmbeddingConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        resolve_api_key(self.api_key.as_deref(), "OPENAI_API_KEY")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

fn resolve_api_key(configured: Option<&str>, env_var: &str) -> Option<String> {
    configured
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .or_else(|| std::env::var(env_var).ok().filter(|key| !key.is_empty()))
}

/// Vector index backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorIndexBackend {
    /// `chunk_embeddings` table with the pgvector extension
    Postgres,
    /// Process-local index, for development and tests
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VectorIndexConfig {
    pub backend: VectorIndexBackend,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            backend: VectorIndexBackend::Postgres,
        }
    }
}

impl OrchestratorConfig {
    /// Validate cross-field consistency
    pub fn validate(&self) -> ConfigResult<()> {
        let worker = &self.worker;
        if worker.batch_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker.batch_size",
                "0",
                "must be at least 1",
            ));
        }
        if worker.batch_size > worker.max_batch_size {
            return Err(ConfigurationError::invalid_value(
                "worker.batch_size",
                worker.batch_size.to_string(),
                format!("must not exceed worker.max_batch_size ({})", worker.max_batch_size),
            ));
        }
        if worker.lease_duration_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker.lease_duration_seconds",
                "0",
                "lease must be positive",
            ));
        }
        if worker.handler_timeout_seconds >= worker.lease_duration_seconds
            && !worker.heartbeat_enabled
        {
            return Err(ConfigurationError::invalid_value(
                "worker.handler_timeout_seconds",
                worker.handler_timeout_seconds.to_string(),
                "must be shorter than the lease unless heartbeats are enabled",
            ));
        }
        if worker.heartbeat_enabled
            && worker.heartbeat_interval_seconds >= worker.lease_duration_seconds
        {
            return Err(ConfigurationError::invalid_value(
                "worker.heartbeat_interval_seconds",
                worker.heartbeat_interval_seconds.to_string(),
                "must be shorter than the lease",
            ));
        }
        if worker.max_concurrency == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker.max_concurrency",
                "0",
                "must be at least 1",
            ));
        }
        if worker.default_max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker.default_max_attempts",
                "0",
                "must be at least 1",
            ));
        }

        let backoff = &self.backoff;
        if backoff.multiplier < 1.0 {
            return Err(ConfigurationError::invalid_value(
                "backoff.multiplier",
                backoff.multiplier.to_string(),
                "must be >= 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&backoff.jitter_fraction) {
            return Err(ConfigurationError::invalid_value(
                "backoff.jitter_fraction",
                backoff.jitter_fraction.to_string(),
                "must be within [0.0, 1.0]",
            ));
        }
        // Jitter wider than the growth step would let a sample exceed the next attempt's floor
        if backoff.jitter_fraction > backoff.multiplier - 1.0 {
            return Err(ConfigurationError::invalid_value(
                "backoff.jitter_fraction",
                backoff.jitter_fraction.to_string(),
                "must not exceed backoff.multiplier - 1.0",
            ));
        }
        if backoff.base_delay_seconds > backoff.max_delay_seconds {
            return Err(ConfigurationError::invalid_value(
                "backoff.base_delay_seconds",
                backoff.base_delay_seconds.to_string(),
                "must not exceed backoff.max_delay_seconds",
            ));
        }

        let chunking = &self.chunking;
        if chunking.target_chars == 0 {
            return Err(ConfigurationError::invalid_value(
                "chunking.target_chars",
                "0",
                "must be at least 1",
            ));
        }
        if chunking.overlap_chars >= chunking.target_chars {
            return Err(ConfigurationError::invalid_value(
                "chunking.overlap_chars",
                chunking.overlap_chars.to_string(),
                "must be smaller than chunking.target_chars",
            ));
        }

        if self.optimize.top_k == 0 {
            return Err(ConfigurationError::invalid_value(
                "optimize.top_k",
                "0",
                "must be at least 1",
            ));
        }
        if self.llm.max_tokens == 0 {
            return Err(ConfigurationError::invalid_value(
                "llm.max_tokens",
                "0",
                "must be at least 1",
            ));
        }
        if self.embedding.batch_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "embedding.batch_size",
                "0",
                "must be at least 1",
            ));
        }
        if self.embedding.dimensions == 0 {
            return Err(ConfigurationError::invalid_value(
                "embedding.dimensions",
                "0",
                "must be at least 1",
            ));
        }

        Ok(())
    }
}
