//! Client for the text-generation responses endpoint.
//!
//! Translation and goal evaluation both go through this endpoint. The request
//! shape is fixed, but response payloads vary across server versions, so
//! extraction is deliberately tolerant of several shapes.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

/// A backend that turns a prompt into completion text.
///
/// The engine's translation and evaluation services are generic over this
/// seam so they can be exercised without network access.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// HTTP-backed [`CompletionBackend`] speaking the responses-endpoint wire
/// format: `{"model", "text": {"format": {"type": "text"}}, "input"}`.
pub struct ResponsesClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
}

impl ResponsesClient {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl CompletionBackend for ResponsesClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "text": { "format": { "type": "text" } },
            "input": prompt,
        });
        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("responses endpoint unreachable")?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("responses endpoint returned {status}: {detail}"));
        }

        let payload: Value = response
            .json()
            .await
            .context("responses endpoint returned a non-JSON body")?;
        debug!(model = %self.model, "completion received");
        extract_output_text(&payload).context("no recognizable text in responses payload")
    }
}

/// Pulls completion text out of any of the payload shapes the endpoint is
/// known to produce: `output_text`, `output[].content[].text`,
/// `content[0].text`, or `choices[0].message.content`.
pub fn extract_output_text(payload: &Value) -> Option<String> {
    if let Some(text) = payload.get("output_text").and_then(Value::as_str) {
        return Some(text.to_string());
    }

    if let Some(items) = payload.get("output").and_then(Value::as_array) {
        let mut collected = String::new();
        for item in items {
            if let Some(parts) = item.get("content").and_then(Value::as_array) {
                for part in parts {
                    if let Some(text) = part.get("text").and_then(Value::as_str) {
                        collected.push_str(text);
                    }
                }
            }
        }
        if !collected.is_empty() {
            return Some(collected);
        }
    }

    if let Some(text) = payload
        .pointer("/content/0/text")
        .and_then(Value::as_str)
    {
        return Some(text.to_string());
    }

    if let Some(text) = payload
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
    {
        return Some(text.to_string());
    }

    None
}

/// Slices the substring between the first `{` and the last `}` of a raw
/// completion, for models that wrap JSON in prose.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if start < end { Some(&raw[start..=end]) } else { None }
}
