//! One MCP server connection: spawn, handshake, tool calls, shutdown.
//!
//! ```text
//! Disconnected -> Spawning -> Initializing -> Ready -> Closing -> Closed
//!                     \             \                              ^
//!                      +-------------+-----------(failure)---------+
//! ```
//! A `Ready` connection whose streams close reports `Closed`.

use crate::catalog::{ToolCatalog, ToolsPage};
use crate::config::McpServerConfig;
use crate::correlator::Correlator;
use crate::envelope::UNKNOWN_TOOL;
use crate::error::{ConnectError, McpError};
use crate::pump::IoPump;
use relay_types::{ToolOutput, ToolOutputContent};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::process::Stdio;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

/// MCP protocol version we speak.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Upper bound on `tools/list` pages followed during the handshake.
const MAX_TOOL_PAGES: usize = 32;

/// How long a failed handshake waits for the child's last stderr output.
const STDERR_DRAIN: Duration = Duration::from_millis(500);

/// Lifecycle of a server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Spawning,
    Initializing,
    Ready,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Spawning => "spawning",
            ConnectionState::Initializing => "initializing",
            ConnectionState::Ready => "ready",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Identity reported by the server in its `initialize` result.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeResult {
    #[serde(default)]
    protocol_version: Option<String>,
    #[serde(default)]
    server_info: Option<ServerInfo>,
}

/// Result of a `tools/call` request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallOutcome {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default)]
    pub is_error: bool,
}

/// A content item in a tool result.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ToolContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: Value,
    },
    #[serde(other)]
    Unsupported,
}

impl ToolCallOutcome {
    /// Convert to the executor-facing output type.
    pub fn into_output(self) -> ToolOutput {
        let content = self
            .content
            .into_iter()
            .filter_map(|item| match item {
                ToolContent::Text { text } => Some(ToolOutputContent::Text { text }),
                ToolContent::Image { data, mime_type } => {
                    Some(ToolOutputContent::Image { data, mime_type })
                }
                ToolContent::Resource { resource } => {
                    let text = match resource.get("text").and_then(Value::as_str) {
                        Some(text) => text.to_string(),
                        None => format!(
                            "[resource: {}]",
                            resource.get("uri").and_then(Value::as_str).unwrap_or("?")
                        ),
                    };
                    Some(ToolOutputContent::Text { text })
                }
                ToolContent::Unsupported => None,
            })
            .collect();
        ToolOutput {
            content,
            is_error: self.is_error,
        }
    }
}

/// A live connection to one MCP server.
pub struct ServerConnection {
    name: String,
    config: McpServerConfig,
    state: Mutex<ConnectionState>,
    shut_down: AtomicBool,
    child: tokio::sync::Mutex<Option<Child>>,
    pump: IoPump,
    correlator: Correlator,
    catalog: ToolCatalog,
    server_info: ServerInfo,
}

impl ServerConnection {
    /// Spawn the configured command and perform the handshake.
    pub async fn connect(
        name: impl Into<String>,
        config: &McpServerConfig,
    ) -> Result<Self, ConnectError> {
        let name = name.into();
        let mut state = ConnectionState::Disconnected;
        transition(&name, &mut state, ConnectionState::Spawning);

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ConnectError::SpawnFailed {
            name: name.clone(),
            source,
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill().await;
            return Err(ConnectError::SpawnFailed {
                name,
                source: std::io::Error::other("child stdio was not captured"),
            });
        };
        tracing::debug!(server = %name, pid = ?child.id(), "spawned {}", config.command);

        let (pump, inbound) = IoPump::start(&name, stdout, stdin, config.framing);
        if let Some(stderr) = child.stderr.take() {
            pump.capture_stderr(stderr);
        }
        Self::establish(name, state, config, pump, inbound, Some(child)).await
    }

    /// Handshake with a server that is already running on the given streams.
    pub async fn connect_with_streams<R, W>(
        name: impl Into<String>,
        stdout: R,
        stdin: W,
        config: &McpServerConfig,
    ) -> Result<Self, ConnectError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let name = name.into();
        let mut state = ConnectionState::Disconnected;
        transition(&name, &mut state, ConnectionState::Spawning);
        let (pump, inbound) = IoPump::start(&name, stdout, stdin, config.framing);
        Self::establish(name, state, config, pump, inbound, None).await
    }

    async fn establish(
        name: String,
        mut state: ConnectionState,
        config: &McpServerConfig,
        pump: IoPump,
        inbound: tokio::sync::mpsc::UnboundedReceiver<crate::envelope::Envelope>,
        mut child: Option<Child>,
    ) -> Result<Self, ConnectError> {
        let correlator = Correlator::new(&name, pump.outbound(), inbound);
        transition(&name, &mut state, ConnectionState::Initializing);

        match handshake(&correlator, config).await {
            Ok((server_info, catalog)) => {
                transition(&name, &mut state, ConnectionState::Ready);
                tracing::info!(
                    "MCP server '{}' connected with {} tools",
                    name,
                    catalog.len()
                );
                Ok(Self {
                    name,
                    config: config.clone(),
                    state: Mutex::new(state),
                    shut_down: AtomicBool::new(false),
                    child: tokio::sync::Mutex::new(child),
                    pump,
                    correlator,
                    catalog,
                    server_info,
                })
            }
            Err(err) => {
                correlator.close();
                pump.close_input();
                if let Some(child) = child.as_mut() {
                    let _ = child.kill().await;
                }
                pump.drain_stderr(STDERR_DRAIN).await;
                pump.stop();
                transition(&name, &mut state, ConnectionState::Closed);

                let stderr = pump.diagnostics().joined();
                Err(handshake_error(name, config, err, stderr))
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Recent stderr lines from the server.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.pump.diagnostics().tail()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == ConnectionState::Ready && self.correlator.is_closed() {
            tracing::info!("MCP server '{}' closed its streams", self.name);
            transition(&self.name, &mut state, ConnectionState::Closed);
        }
        *state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Invoke a tool listed in this connection's catalog.
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<ToolCallOutcome, McpError> {
        let state = self.state();
        if state != ConnectionState::Ready {
            return Err(McpError::NotReady {
                server: self.name.clone(),
                state,
            });
        }
        if self.catalog.get(tool).is_none() {
            return Err(McpError::Remote {
                server: self.name.clone(),
                code: UNKNOWN_TOOL,
                message: format!("Unknown tool: {tool}"),
            });
        }

        let params = serde_json::json!({
            "name": tool,
            "arguments": arguments,
        });
        let result = self
            .correlator
            .call("tools/call", Some(params), self.config.timeout())
            .await?;
        serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("Failed to parse tools/call result: {e}")))
    }

    /// Close the connection and stop the child. Safe to call more than once.
    pub async fn disconnect(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(ConnectionState::Closing);
        self.correlator.close();
        self.pump.close_input();

        let mut child = self.child.lock().await;
        if let Some(child) = child.as_mut() {
            match tokio::time::timeout(self.config.shutdown_grace(), child.wait()).await {
                Ok(Ok(status)) => tracing::debug!(server = %self.name, "exited: {status}"),
                Ok(Err(e)) => tracing::warn!(server = %self.name, "wait failed: {e}"),
                Err(_) => {
                    tracing::warn!(
                        "MCP server '{}' did not exit within {}ms, killing",
                        self.name,
                        self.config.shutdown_grace_ms
                    );
                    if let Err(e) = child.kill().await {
                        tracing::warn!(server = %self.name, "kill failed: {e}");
                    }
                }
            }
        }
        self.pump.stop();
        self.set_state(ConnectionState::Closed);
        tracing::info!("MCP server '{}' disconnected", self.name);
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        transition(&self.name, &mut state, next);
    }
}

fn transition(name: &str, state: &mut ConnectionState, next: ConnectionState) {
    if *state != next {
        tracing::debug!(server = name, "state: {} -> {}", state, next);
        *state = next;
    }
}

async fn handshake(
    correlator: &Correlator,
    config: &McpServerConfig,
) -> Result<(ServerInfo, ToolCatalog), McpError> {
    let timeout = config.handshake_timeout();
    let init_params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "relay",
            "version": env!("CARGO_PKG_VERSION")
        }
    });
    let result = correlator
        .call("initialize", Some(init_params), timeout)
        .await?;
    let init: InitializeResult = serde_json::from_value(result)
        .map_err(|e| McpError::Protocol(format!("Malformed initialize result: {e}")))?;
    if let Some(version) = init.protocol_version.as_deref() {
        if version != PROTOCOL_VERSION {
            tracing::debug!("Server negotiated protocol version {version}");
        }
    }

    correlator
        .notify("notifications/initialized", None)
        .await?;

    let mut descriptors = Vec::new();
    let mut cursor: Option<String> = None;
    for _ in 0..MAX_TOOL_PAGES {
        let params = cursor
            .take()
            .map(|cursor| serde_json::json!({ "cursor": cursor }));
        let result = correlator.call("tools/list", params, timeout).await?;
        let page: ToolsPage = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("Failed to parse tools/list response: {e}")))?;
        descriptors.extend(page.tools);
        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => break,
        }
    }
    if cursor.is_some() {
        tracing::warn!("Stopped following tools/list after {MAX_TOOL_PAGES} pages");
    }

    Ok((init.server_info.unwrap_or_default(), ToolCatalog::new(descriptors)))
}

fn handshake_error(
    name: String,
    config: &McpServerConfig,
    err: McpError,
    stderr: String,
) -> ConnectError {
    match err {
        McpError::Timeout { .. } | McpError::ConnectionLost { .. } => {
            ConnectError::HandshakeTimeout {
                name,
                timeout_ms: config.handshake_timeout_ms,
                stderr,
            }
        }
        McpError::Remote { code, message, .. } => ConnectError::HandshakeRejected {
            name,
            reason: format!("{message} (code {code})"),
            stderr,
        },
        other => ConnectError::HandshakeRejected {
            name,
            reason: other.to_string(),
            stderr,
        },
    }
}
