//! Error types for MCP operations.

use crate::connection::ConnectionState;
use relay_types::ToolError;
use thiserror::Error;

/// Failure to bring a server connection up. The child is already gone.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Unsupported server script '{path}': expected a .py or .js file")]
    UnsupportedScriptType { path: String },

    #[error("Failed to spawn MCP server '{name}': {source}")]
    SpawnFailed {
        name: String,
        source: std::io::Error,
    },

    #[error(
        "MCP server '{name}' did not complete the handshake within {timeout_ms}ms{}",
        stderr_suffix(.stderr)
    )]
    HandshakeTimeout {
        name: String,
        timeout_ms: u64,
        stderr: String,
    },

    #[error("MCP server '{name}' rejected the handshake: {reason}{}", stderr_suffix(.stderr))]
    HandshakeRejected {
        name: String,
        reason: String,
        stderr: String,
    },
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

/// Errors from MCP server communication.
#[derive(Debug, Error)]
pub enum McpError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("Request '{method}' to MCP server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    #[error("JSON-RPC error from '{server}' (code {code}): {message}")]
    Remote {
        server: String,
        code: i64,
        message: String,
    },

    #[error("Connection to MCP server '{server}' lost")]
    ConnectionLost { server: String },

    #[error("MCP server '{server}' is not ready (state: {state})")]
    NotReady {
        server: String,
        state: ConnectionState,
    },

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<McpError> for ToolError {
    fn from(err: McpError) -> Self {
        match err {
            McpError::Remote { code, message, .. } => ToolError::Remote { code, message },
            McpError::Timeout { timeout_ms, .. } => ToolError::Timeout { timeout_ms },
            McpError::ConnectionLost { server } => ToolError::ConnectionLost { server },
            McpError::NotReady { server, .. } => ToolError::NotReady { server },
            other => ToolError::ExecutionFailed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_timeout_mentions_stderr_when_present() {
        let err = ConnectError::HandshakeTimeout {
            name: "calc".into(),
            timeout_ms: 500,
            stderr: "Traceback: boom\n".into(),
        };
        assert_eq!(
            err.to_string(),
            "MCP server 'calc' did not complete the handshake within 500ms | stderr: Traceback: boom"
        );

        let quiet = ConnectError::HandshakeTimeout {
            name: "calc".into(),
            timeout_ms: 500,
            stderr: String::new(),
        };
        assert!(!quiet.to_string().contains("stderr"));
    }

    #[test]
    fn remote_error_maps_to_tool_error() {
        let err = McpError::Remote {
            server: "calc".into(),
            code: -32601,
            message: "Unknown tool: mul".into(),
        };
        assert_eq!(
            ToolError::from(err),
            ToolError::Remote {
                code: -32601,
                message: "Unknown tool: mul".into()
            }
        );
    }

    #[test]
    fn protocol_error_maps_to_execution_failure() {
        let err = McpError::Protocol("bad result".into());
        match ToolError::from(err) {
            ToolError::ExecutionFailed(msg) => assert!(msg.contains("bad result")),
            other => panic!("Expected ExecutionFailed, got: {other:?}"),
        }
    }
}
