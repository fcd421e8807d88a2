//! Model client for Relay: an Ollama-compatible `/api/chat` back-end.

pub mod chat;
pub mod client;
pub mod provider;
pub mod text_calls;

pub use client::{DEFAULT_BASE_URL, OllamaClient};
pub use provider::OllamaModel;
pub use text_calls::{TextToolCall, parse_text_tool_call};
