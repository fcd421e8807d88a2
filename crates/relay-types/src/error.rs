//! Error hierarchy for Relay.

use thiserror::Error;

/// Top-level error type for a query resolution.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Errors from the language-model capability.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Model endpoint returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Malformed model response: {0}")]
    BadResponse(String),

    #[error("Model call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// Errors from executing a tool through a [`crate::ToolExecutor`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("Remote error (code {code}): {message}")]
    Remote { code: i64, message: String },

    #[error("Tool call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Connection to '{server}' lost")]
    ConnectionLost { server: String },

    #[error("Server '{server}' is not ready")]
    NotReady { server: String },

    #[error("Tool execution failed: {0}")]
    ExecutionFailed(String),
}

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file parse error at {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}
