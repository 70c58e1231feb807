//! Request plumbing shared by the REST providers: error mapping,
//! `Retry-After` parsing, and JSON recovery for backends without strict
//! schema enforcement.

use super::{ProviderError, ProviderResult, ResponseSchema};
use reqwest::{Client, RequestBuilder, Response};
use std::time::Duration;
use tracing::warn;

/// Longest provider error body kept in an error message
const MAX_ERROR_BODY: usize = 300;

pub(crate) fn client(timeout: Duration) -> ProviderResult<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderError::Config(e.to_string()))
}

/// Send a request; non-2xx responses become [`ProviderError::Api`]
pub(crate) async fn send(builder: RequestBuilder, operation: &str) -> ProviderResult<Response> {
    let response = builder.send().await.map_err(|e| {
        warn!(operation = operation, error = %e, "Provider request failed");
        if e.is_timeout() {
            ProviderError::Timeout(e.to_string())
        } else {
            ProviderError::Network(e.to_string())
        }
    })?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = parse_retry_after(&response);
    let body = response.text().await.unwrap_or_default();
    warn!(
        operation = operation,
        status = %status,
        error = %truncate(&body, MAX_ERROR_BODY),
        "Provider API error"
    );
    Err(ProviderError::Api {
        status: status.as_u16(),
        message: truncate(&body, MAX_ERROR_BODY),
        retry_after,
    })
}

pub(crate) async fn json_body<T: serde::de::DeserializeOwned>(response: Response) -> ProviderResult<T> {
    response
        .json()
        .await
        .map_err(|e| ProviderError::Parse(e.to_string()))
}

fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

pub(crate) fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// System prompt extended with the schema, for backends that only accept
/// a prompt-level JSON contract
pub(crate) fn with_schema_instructions(system_prompt: &str, schema: &ResponseSchema) -> String {
    let schema_json =
        serde_json::to_string_pretty(&schema.schema).unwrap_or_else(|_| schema.schema.to_string());
    format!(
        "{system_prompt}\n\nYou MUST respond with valid JSON matching this schema:\n{schema_json}\n\nRespond ONLY with the JSON object, no additional text."
    )
}

/// Drop a Markdown code fence wrapped around a JSON reply
pub(crate) fn strip_code_fences(text: &str) -> &str {
    text.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}
