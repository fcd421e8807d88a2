//! JSON-RPC 2.0 envelopes exchanged with MCP servers.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Protocol tag carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// The request method does not exist (also used for unknown tools).
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// A request arrived before the `initialize` handshake.
pub const NOT_INITIALIZED: i64 = -32002;

/// Code reported for a tool name absent from a server's catalog.
pub const UNKNOWN_TOOL: i64 = METHOD_NOT_FOUND;

/// A request identifier: JSON-RPC allows numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    Text(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// What an envelope represents on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Request,
    Notification,
    Response,
    /// Neither a call nor a response (e.g. no method, result or error).
    Invalid,
}

/// One protocol message: request, notification or response.
///
/// `result` keeps the difference between an absent field and an explicit
/// `null`, so a response whose result is `null` survives a decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

fn present_value<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

impl Envelope {
    fn blank() -> Self {
        Self {
            jsonrpc: default_version(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        }
    }

    /// A request expecting a response.
    pub fn request(
        id: RequestId,
        method: impl Into<String>,
        params: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Some(id),
            method: Some(method.into()),
            params,
            ..Self::blank()
        }
    }

    /// A fire-and-forget notification (no id).
    pub fn notification(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            method: Some(method.into()),
            params,
            ..Self::blank()
        }
    }

    /// A successful response.
    pub fn response(id: RequestId, result: serde_json::Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            ..Self::blank()
        }
    }

    /// An error response.
    pub fn error_response(id: RequestId, error: RpcError) -> Self {
        Self {
            id: Some(id),
            error: Some(error),
            ..Self::blank()
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        match (&self.method, &self.id) {
            (Some(_), Some(_)) => EnvelopeKind::Request,
            (Some(_), None) => EnvelopeKind::Notification,
            (None, Some(_)) if self.result.is_some() || self.error.is_some() => {
                EnvelopeKind::Response
            }
            _ => EnvelopeKind::Invalid,
        }
    }
}
