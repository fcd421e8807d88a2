//! HTTP client for an Ollama-compatible chat endpoint.

use std::time::Duration;

use relay_types::ModelError;

use crate::chat::{ChatRequest, ChatResponse};

/// Default local Ollama endpoint.
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Client for `POST {base}/api/chat`.
#[derive(Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl OllamaClient {
    /// Create a client whose requests give up after `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ModelError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ModelError::Network(e.to_string()))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            http,
            base_url,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send one non-streaming chat request.
    pub async fn chat(&self, request: &ChatRequest<'_>) -> Result<ChatResponse, ModelError> {
        let url = format!("{}/api/chat", self.base_url);
        tracing::debug!(
            "POST {url} (model {}, {} messages, {} tools)",
            request.model,
            request.messages.len(),
            request.tools.len()
        );

        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            return Err(classify_error(status.as_u16(), &body));
        }

        serde_json::from_str(&body)
            .map_err(|e| ModelError::BadResponse(format!("Failed to parse chat response: {e}")))
    }

    fn transport_error(&self, e: reqwest::Error) -> ModelError {
        if e.is_timeout() {
            ModelError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            ModelError::Network(e.to_string())
        }
    }
}

/// Classify an HTTP error response into a typed ModelError.
///
/// Ollama reports `{"error": "..."}`; OpenAI-style servers nest a `message`.
fn classify_error(status: u16, body: &str) -> ModelError {
    let parsed = serde_json::from_str::<serde_json::Value>(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|v| v.get("error"))
        .and_then(|e| {
            e.as_str()
                .or_else(|| e.get("message").and_then(|m| m.as_str()))
        })
        .map(str::to_string)
        .unwrap_or_else(|| body.trim().to_string());

    ModelError::Http { status, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_ollama_error_string() {
        let err = classify_error(404, r#"{"error":"model 'nope' not found"}"#);
        match err {
            ModelError::Http { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message, "model 'nope' not found");
            }
            other => panic!("Expected Http, got: {other:?}"),
        }
    }

    #[test]
    fn classify_nested_error_message() {
        let err = classify_error(400, r#"{"error":{"message":"bad tools"}}"#);
        assert!(matches!(err, ModelError::Http { status: 400, ref message } if message == "bad tools"));
    }

    #[test]
    fn classify_plain_text_body() {
        let err = classify_error(502, "Bad Gateway\n");
        assert!(matches!(err, ModelError::Http { status: 502, ref message } if message == "Bad Gateway"));
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = OllamaClient::new("http://localhost:11434/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://localhost:11434");
    }
}
