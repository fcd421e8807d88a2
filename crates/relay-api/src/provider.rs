//! Ollama model implementation of the `ModelClient` seam.

use crate::chat::{ChatRequest, reply_from_message};
use crate::client::OllamaClient;
use relay_types::{ConversationContext, ModelClient, ModelError, ReplyFuture, ToolDeclaration};
use std::time::Duration;

/// A named model served by an Ollama-compatible endpoint.
///
/// Wraps `OllamaClient`; no retries, a failed call surfaces to the caller.
#[derive(Clone)]
pub struct OllamaModel {
    client: OllamaClient,
    model: String,
}

impl OllamaModel {
    pub fn new(
        model: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ModelError> {
        Ok(Self {
            client: OllamaClient::new(base_url, timeout)?,
            model: model.into(),
        })
    }
}

impl ModelClient for OllamaModel {
    fn generate<'a>(
        &'a self,
        context: &'a ConversationContext,
        tools: &'a [ToolDeclaration],
    ) -> ReplyFuture<'a> {
        Box::pin(async move {
            let request = ChatRequest::new(&self.model, context, tools);
            let response = self.client.chat(&request).await?;
            let message = response.message.ok_or_else(|| {
                ModelError::BadResponse("chat response has no message".to_string())
            })?;
            if let Some(reason) = response.done_reason.as_deref() {
                tracing::debug!("model finished: {reason}");
            }
            Ok(reply_from_message(message))
        })
    }

    fn name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ollama_model_name() {
        let model =
            OllamaModel::new("llama3.2", "http://localhost:11434", Duration::from_secs(5)).unwrap();
        assert_eq!(model.name(), "llama3.2");
    }

    #[test]
    fn ollama_model_is_a_model_client() {
        fn assert_model<T: ModelClient>() {}
        assert_model::<OllamaModel>();
    }
}
