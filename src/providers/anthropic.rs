//! Anthropic Messages API chat backend.
//!
//! The Messages API has no strict response schema, so structured requests
//! carry the schema in the system prompt and the reply is unwrapped from any
//! code fence before it is handed to the caller.

use super::http::{self, client, strip_code_fences, with_schema_instructions};
use super::{LlmProvider, LlmRequest, ProviderError, ProviderResult};
use crate::config::LlmConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

const API_VERSION: &str = "2023-06-01";

#[derive(Clone)]
pub struct AnthropicChat {
    client: Client,
    config: LlmConfig,
    api_key: String,
}

impl std::fmt::Debug for AnthropicChat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicChat")
            .field("base_url", &self.config.base_url())
            .field("model", &self.config.model())
            .finish()
    }
}

impl AnthropicChat {
    /// The API key falls back to `ANTHROPIC_API_KEY`
    pub fn new(config: LlmConfig) -> ProviderResult<Self> {
        let api_key = config
            .resolved_api_key()
            .ok_or_else(|| ProviderError::Config("Anthropic API key not configured".into()))?;
        Ok(Self {
            client: client(config.request_timeout())?,
            config,
            api_key,
        })
    }

    fn body<'a>(&'a self, request: &'a LlmRequest, system: &'a str) -> MessagesRequest<'a> {
        MessagesRequest {
            model: self.config.model(),
            max_tokens: self.config.max_tokens,
            system,
            messages: vec![Message {
                role: "user",
                content: &request.user_prompt,
            }],
            temperature: request.temperature,
        }
    }
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

fn response_text(response: MessagesResponse) -> ProviderResult<String> {
    let text: String = response
        .content
        .into_iter()
        .filter(|block| block.block_type == "text")
        .filter_map(|block| block.text)
        .collect();
    if text.is_empty() {
        return Err(ProviderError::Parse("message contained no text content".into()));
    }
    Ok(text)
}

#[async_trait]
impl LlmProvider for AnthropicChat {
    fn model(&self) -> &str {
        self.config.model()
    }

    async fn generate(&self, request: LlmRequest) -> ProviderResult<String> {
        let start = Instant::now();
        let system = match &request.response_schema {
            Some(schema) => with_schema_instructions(&request.system_prompt, schema),
            None => request.system_prompt.clone(),
        };
        let builder = self
            .client
            .post(format!("{}/messages", self.config.base_url()))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&self.body(&request, &system));
        let response = http::send(builder, "anthropic_messages").await?;
        let text = response_text(http::json_body(response).await?)?;

        debug!(
            model = %self.config.model(),
            structured = request.response_schema.is_some(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Anthropic message finished"
        );

        Ok(match request.response_schema {
            Some(_) => strip_code_fences(&text).to_string(),
            None => text,
        })
    }
}
