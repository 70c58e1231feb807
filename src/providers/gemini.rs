//! Gemini `generateContent` chat backend.

use super::http::{self, client, strip_code_fences, with_schema_instructions};
use super::{LlmProvider, LlmRequest, ProviderError, ProviderResult};
use crate::config::LlmConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

#[derive(Clone)]
pub struct GeminiChat {
    client: Client,
    config: LlmConfig,
    api_key: String,
}

impl std::fmt::Debug for GeminiChat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiChat")
            .field("base_url", &self.config.base_url())
            .field("model", &self.config.model())
            .finish()
    }
}

impl GeminiChat {
    /// The API key falls back to `GEMINI_API_KEY`
    pub fn new(config: LlmConfig) -> ProviderResult<Self> {
        let api_key = config
            .resolved_api_key()
            .ok_or_else(|| ProviderError::Config("Gemini API key not configured".into()))?;
        Ok(Self {
            client: client(config.request_timeout())?,
            config,
            api_key,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.base_url(),
            self.config.model()
        )
    }
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
    response_mime_type: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    system_instruction: Content<'a>,
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

fn request_body<'a>(
    request: &'a LlmRequest,
    system: &'a str,
    max_output_tokens: u32,
) -> GenerateRequest<'a> {
    GenerateRequest {
        system_instruction: Content {
            role: None,
            parts: vec![Part { text: system }],
        },
        contents: vec![Content {
            role: Some("user"),
            parts: vec![Part {
                text: &request.user_prompt,
            }],
        }],
        generation_config: GenerationConfig {
            temperature: request.temperature,
            max_output_tokens,
            response_mime_type: if request.response_schema.is_some() {
                "application/json"
            } else {
                "text/plain"
            },
        },
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

fn response_text(response: GenerateResponse) -> ProviderResult<String> {
    let text: String = response
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .map(|content| content.parts.into_iter().filter_map(|part| part.text).collect())
        .unwrap_or_default();
    if text.is_empty() {
        return Err(ProviderError::Parse("response contained no candidate text".into()));
    }
    Ok(text)
}

#[async_trait]
impl LlmProvider for GeminiChat {
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
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&request_body(&request, &system, self.config.max_tokens));
        let response = http::send(builder, "gemini_generate").await?;
        let text = response_text(http::json_body(response).await?)?;

        debug!(
            model = %self.config.model(),
            structured = request.response_schema.is_some(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Gemini generation finished"
        );

        Ok(match request.response_schema {
            Some(_) => strip_code_fences(&text).to_string(),
            None => text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmBackend;
    use crate::providers::ResponseSchema;

    #[test]
    fn test_endpoint_names_the_model() {
        let chat = GeminiChat::new(LlmConfig {
            provider: LlmBackend::Gemini,
            api_key: Some("gm-test".to_string()),
            ..LlmConfig::default()
        })
        .unwrap();
        assert_eq!(
            chat.endpoint(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
        );
        assert!(!format!("{chat:?}").contains("gm-test"));
    }

    #[test]
    fn test_structured_requests_ask_for_json() {
        let request = LlmRequest::new("sys", "user").response_schema(ResponseSchema {
            name: "extracted_entities".to_string(),
            schema: serde_json::json!({"type": "object"}),
        });
        let value = serde_json::to_value(request_body(&request, "sys", 1024)).unwrap();
        assert_eq!(value["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(value["generationConfig"]["maxOutputTokens"], 1024);
        assert_eq!(value["systemInstruction"]["parts"][0]["text"], "sys");
        assert!(value["systemInstruction"].get("role").is_none());
        assert_eq!(value["contents"][0]["role"], "user");

        let plain = LlmRequest::new("sys", "user");
        let value = serde_json::to_value(request_body(&plain, "sys", 1024)).unwrap();
        assert_eq!(value["generationConfig"]["responseMimeType"], "text/plain");
    }

    #[test]
    fn test_response_text_reads_first_candidate() {
        let response: GenerateResponse = serde_json::from_value(serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "Bonjour"}, {"text": " le monde"}]}}]
        }))
        .unwrap();
        assert_eq!(response_text(response).unwrap(), "Bonjour le monde");

        let blocked: GenerateResponse =
            serde_json::from_value(serde_json::json!({"candidates": [{}]})).unwrap();
        assert!(matches!(response_text(blocked), Err(ProviderError::Parse(_))));
    }
}
