//! OpenAI-compatible REST providers for chat completions and embeddings.

use super::http::{self, client};
use super::{EmbeddingProvider, LlmProvider, LlmRequest, ProviderError, ProviderResult};
use crate::config::{EmbeddingConfig, LlmConfig};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

fn authorize(builder: RequestBuilder, api_key: &str) -> RequestBuilder {
    builder
        .header("Authorization", format!("Bearer {api_key}"))
        .header("Content-Type", "application/json")
}

/// Chat completions with strict `json_schema` response formats
#[derive(Clone)]
pub struct OpenAiChat {
    client: Client,
    config: LlmConfig,
    api_key: String,
}

impl std::fmt::Debug for OpenAiChat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiChat")
            .field("base_url", &self.config.base_url())
            .field("model", &self.config.model())
            .finish()
    }
}

impl OpenAiChat {
    pub fn new(config: LlmConfig) -> ProviderResult<Self> {
        let api_key = config
            .resolved_api_key()
            .ok_or_else(|| ProviderError::Config("LLM API key not configured".into()))?;
        Ok(Self {
            client: client(config.request_timeout())?,
            config,
            api_key,
        })
    }
}

/// Embeddings endpoint, batched by `embedding.batch_size`
#[derive(Clone)]
pub struct OpenAiEmbeddings {
    client: Client,
    config: EmbeddingConfig,
    api_key: String,
}

impl std::fmt::Debug for OpenAiEmbeddings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiEmbeddings")
            .field("base_url", &self.config.base_url)
            .field("model", &self.config.model)
            .finish()
    }
}

impl OpenAiEmbeddings {
    /// The API key falls back to `OPENAI_API_KEY`
    pub fn new(config: EmbeddingConfig) -> ProviderResult<Self> {
        let api_key = config
            .resolved_api_key()
            .ok_or_else(|| ProviderError::Config("embedding API key not configured".into()))?;
        Ok(Self {
            client: client(config.request_timeout())?,
            config,
            api_key,
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct JsonSchemaFormat<'a> {
    name: &'a str,
    strict: bool,
    schema: &'a serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ResponseFormat<'a> {
    #[serde(rename = "type")]
    format_type: &'static str,
    json_schema: JsonSchemaFormat<'a>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat<'a>>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl LlmProvider for OpenAiChat {
    fn model(&self) -> &str {
        self.config.model()
    }

    async fn generate(&self, request: LlmRequest) -> ProviderResult<String> {
        let start = Instant::now();
        let response_format = request.response_schema.as_ref().map(|schema| ResponseFormat {
            format_type: "json_schema",
            json_schema: JsonSchemaFormat {
                name: &schema.name,
                strict: true,
                schema: &schema.schema,
            },
        });
        let body = ChatRequest {
            model: self.config.model(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user_prompt,
                },
            ],
            temperature: request.temperature,
            response_format,
        };

        let builder = authorize(
            self.client
                .post(format!("{}/chat/completions", self.config.base_url())),
            &self.api_key,
        )
        .json(&body);
        let response = http::send(builder, "chat_completion").await?;
        let parsed: ChatResponse = http::json_body(response).await?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::Parse("completion contained no message content".into()))?;

        debug!(
            model = %self.config.model(),
            structured = request.response_schema.is_some(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Chat completion finished"
        );

        Ok(content)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    async fn embed(&self, texts: &[String]) -> ProviderResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());

        for batch in texts.chunks(self.config.batch_size.max(1)) {
            let body = EmbeddingRequest {
                model: &self.config.model,
                input: batch,
            };
            let builder = authorize(
                self.client
                    .post(format!("{}/embeddings", self.config.base_url)),
                &self.api_key,
            )
            .json(&body);
            let response = http::send(builder, "embeddings").await?;

            let mut parsed: EmbeddingResponse = http::json_body(response).await?;
            parsed.data.sort_by_key(|d| d.index);

            debug!(
                model = %self.config.model,
                inputs = batch.len(),
                returned = parsed.data.len(),
                "Embedding batch finished"
            );
            vectors.extend(parsed.data.into_iter().map(|d| d.embedding));
        }

        Ok(vectors)
    }
}
