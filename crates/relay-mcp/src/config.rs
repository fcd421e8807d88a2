//! Configuration types for MCP servers.

use crate::error::ConnectError;
use crate::framing::Framing;
use crate::launcher::Launchers;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

fn default_timeout() -> u64 {
    30000
}

fn default_handshake_timeout() -> u64 {
    10000
}

fn default_shutdown_grace() -> u64 {
    5000
}

/// Top-level MCP configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: HashMap<String, McpServerConfig>,
}

/// Configuration for a single MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Command to run (e.g., "python3", "node").
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the server process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Timeout for tool calls in milliseconds (default: 30000).
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    /// Timeout for each handshake request in milliseconds (default: 10000).
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    /// How long `disconnect` waits for the child to exit before killing it.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
    #[serde(default)]
    pub framing: Framing,
}

impl McpServerConfig {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
            timeout_ms: default_timeout(),
            handshake_timeout_ms: default_handshake_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
            framing: Framing::default(),
        }
    }

    /// Config that runs a `.py` or `.js` server script with the matching launcher.
    pub fn for_script(script: &Path, launchers: &Launchers) -> Result<Self, ConnectError> {
        let (command, args) = launchers.command_for(script)?;
        Ok(Self::new(command, args))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
