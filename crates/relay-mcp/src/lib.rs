//! MCP (Model Context Protocol) transport for Relay.
//!
//! Tool servers run as child processes speaking JSON-RPC 2.0 over stdio,
//! either one JSON document per line or with `Content-Length` headers. Each
//! connection owns a pump (reader/writer tasks), a correlator (pending
//! requests by id) and the tool catalog fetched during the handshake. The
//! [`Supervisor`] holds many connections and routes tool calls by name.

pub mod catalog;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod envelope;
pub mod error;
pub mod framing;
pub mod launcher;
pub mod manager;
pub mod pump;

pub use catalog::{ToolCatalog, ToolDescriptor, model_schema};
pub use config::{McpConfig, McpServerConfig};
pub use connection::{ConnectionState, ServerConnection, ToolCallOutcome, ToolContent};
pub use envelope::{Envelope, RequestId, RpcError, UNKNOWN_TOOL};
pub use error::{ConnectError, McpError};
pub use framing::Framing;
pub use launcher::{Launchers, ScriptKind};
pub use manager::{ConnectionHandle, Supervisor};
