//! Seam for the language-model capability.

use crate::{ConversationContext, ModelError, ModelReply, ToolDeclaration};
use std::future::Future;
use std::pin::Pin;

/// A boxed model reply future.
pub type ReplyFuture<'a> = Pin<Box<dyn Future<Output = Result<ModelReply, ModelError>> + Send + 'a>>;

/// A language model that can answer with text or tool-call requests.
///
/// Dyn-compatible so the orchestration loop works with `Arc<dyn ModelClient>`.
/// Implementations own no retry policy visible to the loop.
pub trait ModelClient: Send + Sync {
    /// Produce the next step for the given context and tool declarations.
    fn generate<'a>(
        &'a self,
        context: &'a ConversationContext,
        tools: &'a [ToolDeclaration],
    ) -> ReplyFuture<'a>;

    /// Model/back-end name for logging and display.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn model_client_is_dyn_compatible() {
        fn _accept(_m: &dyn ModelClient) {}
    }

    #[test]
    fn arc_model_client_is_send_sync() {
        fn _assert_send_sync<T: Send + Sync>() {}
        _assert_send_sync::<Arc<dyn ModelClient>>();
    }
}
