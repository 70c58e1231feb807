//! # External Providers
//!
//! Collaborators the task handlers depend on, expressed as traits so the
//! worker can run against real services or in-process fakes:
//!
//! - [`LlmProvider`]: chat completion, optionally constrained by a JSON schema;
//!   [`llm_from_config`] picks the OpenAI, Anthropic or Gemini backend
//! - [`EmbeddingProvider`]: one vector per input text
//! - [`VectorIndex`]: namespaced upsert, similarity query, and pruning
//! - [`ContentStore`]: resume and job description text
//!
//! Every failure is a typed [`ProviderError`]; the error classifier maps it
//! onto the retry taxonomy.

pub mod anthropic;
pub mod content_store;
pub mod gemini;
mod http;
pub mod openai;
pub mod schema;
pub mod vector_index;

use crate::config::{LlmBackend, LlmConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub use anthropic::AnthropicChat;
pub use content_store::{InMemoryContentStore, PgContentStore};
pub use gemini::GeminiChat;
pub use openai::{OpenAiChat, OpenAiEmbeddings};
pub use schema::StructuredOutput;
pub use vector_index::{InMemoryVectorIndex, PgVectorIndex};

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Missing API key or invalid client settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection failed before a response arrived
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Non-2xx response from the provider
    #[error("API error ({status}): {message}")]
    Api {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    /// Response body did not have the expected shape
    #[error("Parse error: {0}")]
    Parse(String),

    /// Backing storage (vector table, content tables) failed
    #[error("Storage error: {0}")]
    Storage(String),
}

impl ProviderError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    /// HTTP status for API errors
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<sqlx::Error> for ProviderError {
    fn from(error: sqlx::Error) -> Self {
        Self::Storage(error.to_string())
    }
}

/// JSON schema the completion must conform to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSchema {
    pub name: String,
    pub schema: serde_json::Value,
}

impl ResponseSchema {
    /// Schema for a structured output type
    pub fn of<T: StructuredOutput>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: T::openai_schema(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f32,
    /// Structured output when set, free text otherwise
    pub response_schema: Option<ResponseSchema>,
}

impl LlmRequest {
    pub fn new(system_prompt: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            temperature: 0.5,
            response_schema: None,
        }
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn response_schema(mut self, schema: ResponseSchema) -> Self {
        self.response_schema = Some(schema);
        self
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Model identifier recorded with every result
    fn model(&self) -> &str;

    /// Run one completion and return the raw message content
    async fn generate(&self, request: LlmRequest) -> ProviderResult<String>;
}

/// Chat backend named by `llm.provider`
pub fn llm_from_config(config: &LlmConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    let provider: Arc<dyn LlmProvider> = match config.provider {
        LlmBackend::OpenAi => Arc::new(OpenAiChat::new(config.clone())?),
        LlmBackend::Anthropic => Arc::new(AnthropicChat::new(config.clone())?),
        LlmBackend::Gemini => Arc::new(GeminiChat::new(config.clone())?),
    };
    Ok(provider)
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn dimensions(&self) -> usize;

    /// Embed every input; implementations return one vector per text, in order
    async fn embed(&self, texts: &[String]) -> ProviderResult<Vec<Vec<f32>>>;
}

/// One chunk to index. `namespace` is the owning user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub namespace: Uuid,
    pub source_id: Uuid,
    pub chunk_index: u32,
    pub text: String,
    pub embedding: Vec<f32>,
}

impl VectorRecord {
    /// Metadata stored alongside the vector
    pub fn metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "owner_id": self.namespace,
            "source_id": self.source_id,
            "chunk_index": self.chunk_index,
            "text": self.text,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMatch {
    pub source_id: Uuid,
    pub chunk_index: u32,
    pub text: String,
    /// Cosine similarity, higher is closer
    pub score: f32,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or overwrite records keyed by `(namespace, source_id, chunk_index)`
    async fn upsert(&self, records: Vec<VectorRecord>) -> ProviderResult<()>;

    /// Nearest chunks in `namespace`, optionally restricted to one source
    async fn query(
        &self,
        namespace: Uuid,
        embedding: &[f32],
        top_k: usize,
        source_id: Option<Uuid>,
    ) -> ProviderResult<Vec<VectorMatch>>;

    /// Delete chunks of `source_id` with `chunk_index >= keep_below`
    async fn prune(&self, namespace: Uuid, source_id: Uuid, keep_below: u32) -> ProviderResult<u64>;

    /// Number of chunks indexed for `source_id`
    async fn count(&self, namespace: Uuid, source_id: Uuid) -> ProviderResult<u64>;
}

/// Text of a job description or resume version together with its owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub text: String,
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn resume_version(&self, id: Uuid) -> ProviderResult<Option<Document>>;

    async fn job(&self, id: Uuid) -> ProviderResult<Option<Document>>;
}
