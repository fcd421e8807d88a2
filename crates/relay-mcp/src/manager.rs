//! Supervisor: owns every server connection and routes tool calls.

use crate::catalog::ToolDescriptor;
use crate::config::{McpConfig, McpServerConfig};
use crate::connection::{ServerConnection, ToolCallOutcome};
use crate::envelope::UNKNOWN_TOOL;
use crate::error::{ConnectError, McpError};
use crate::launcher::Launchers;
use relay_types::{ToolDeclaration, ToolError, ToolExecutor, ToolFuture};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Names a connection held by a [`Supervisor`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    name: String,
}

impl ConnectionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Default)]
struct Registry {
    connections: Vec<Arc<ServerConnection>>,
    /// Names claimed by connects still in their handshake.
    reserved: HashSet<String>,
    /// Tool name -> index into `connections`; first connection wins.
    routes: HashMap<String, usize>,
}

impl Registry {
    fn is_taken(&self, name: &str) -> bool {
        self.reserved.contains(name) || self.connections.iter().any(|c| c.name() == name)
    }

    fn rebuild_routes(&mut self) {
        self.routes.clear();
        for (i, conn) in self.connections.iter().enumerate() {
            for tool in conn.catalog().list() {
                self.routes.entry(tool.name.clone()).or_insert(i);
            }
        }
    }
}

/// Manages connections to multiple MCP servers.
pub struct Supervisor {
    launchers: Launchers,
    registry: RwLock<Registry>,
}

impl Supervisor {
    pub fn new(launchers: Launchers) -> Self {
        Self {
            launchers,
            registry: RwLock::new(Registry::default()),
        }
    }

    /// Start all configured MCP servers.
    ///
    /// Servers that fail to start are logged and skipped; the session continues
    /// with whatever servers are available.
    pub async fn start(config: &McpConfig, launchers: Launchers) -> Self {
        let supervisor = Self::new(launchers);
        let mut names: Vec<&String> = config.servers.keys().collect();
        names.sort();
        for name in names {
            if let Err(e) = supervisor.connect(name, &config.servers[name]).await {
                tracing::warn!("Failed to start MCP server '{}': {}", name, e);
                eprintln!("Warning: MCP server '{name}' failed to start: {e}");
            }
        }
        supervisor
    }

    /// Launch a `.py` or `.js` server script, named after its file.
    pub async fn connect_script(&self, script: &Path) -> Result<ConnectionHandle, ConnectError> {
        let config = McpServerConfig::for_script(script, &self.launchers)?;
        let name = script
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| script.display().to_string());
        self.connect(&name, &config).await
    }

    /// Spawn and hand-shake a server. A taken name gets a numeric suffix.
    pub async fn connect(
        &self,
        name: &str,
        config: &McpServerConfig,
    ) -> Result<ConnectionHandle, ConnectError> {
        let reservation = {
            let mut registry = self.write();
            let unique = unique_name(name, |candidate| registry.is_taken(candidate));
            registry.reserved.insert(unique.clone());
            Reservation {
                registry: &self.registry,
                name: unique,
                held: true,
            }
        };

        let result = ServerConnection::connect(reservation.name.clone(), config).await;
        let mut registry = self.write();
        reservation.release(&mut registry);
        let conn = result?;
        Ok(register(&mut registry, conn))
    }

    /// Disconnect and forget a connection. Returns `false` if it was unknown.
    pub async fn disconnect(&self, handle: &ConnectionHandle) -> bool {
        let removed = {
            let mut registry = self.write();
            let pos = registry
                .connections
                .iter()
                .position(|c| c.name() == handle.name);
            let removed = pos.map(|i| registry.connections.remove(i));
            registry.rebuild_routes();
            removed
        };
        match removed {
            Some(conn) => {
                conn.disconnect().await;
                true
            }
            None => false,
        }
    }

    pub fn connection(&self, name: &str) -> Option<Arc<ServerConnection>> {
        self.read()
            .connections
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// Number of connected servers.
    pub fn connection_count(&self) -> usize {
        self.read().connections.len()
    }

    /// Every tool from every connection, with its server name.
    pub fn tools(&self) -> Vec<(String, ToolDescriptor)> {
        let registry = self.read();
        registry
            .connections
            .iter()
            .flat_map(|c| {
                c.catalog()
                    .list()
                    .iter()
                    .map(|t| (c.name().to_string(), t.clone()))
            })
            .collect()
    }

    /// Connected servers and their tool counts.
    pub fn server_summary(&self) -> Vec<(String, usize)> {
        self.read()
            .connections
            .iter()
            .map(|c| (c.name().to_string(), c.catalog().len()))
            .collect()
    }

    /// Invoke a tool on whichever connection serves it.
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<ToolCallOutcome, McpError> {
        self.prune_closed().await;
        let conn = {
            let registry = self.read();
            registry
                .routes
                .get(tool)
                .map(|&i| Arc::clone(&registry.connections[i]))
        };
        match conn {
            Some(conn) => conn.call_tool(tool, arguments).await,
            None => Err(McpError::Remote {
                server: "relay".to_string(),
                code: UNKNOWN_TOOL,
                message: format!("Unknown tool: {tool}"),
            }),
        }
    }

    /// Forget connections whose server went away and reap their children.
    async fn prune_closed(&self) {
        let closed: Vec<Arc<ServerConnection>> = {
            let mut registry = self.write();
            if registry.connections.iter().all(|c| c.is_ready()) {
                return;
            }
            let (live, closed): (Vec<_>, Vec<_>) = std::mem::take(&mut registry.connections)
                .into_iter()
                .partition(|c| c.is_ready());
            registry.connections = live;
            registry.rebuild_routes();
            closed
        };
        for conn in closed {
            let stderr = conn.stderr_tail();
            if stderr.is_empty() {
                tracing::warn!("Dropping closed MCP server '{}'", conn.name());
            } else {
                tracing::warn!(
                    "Dropping closed MCP server '{}'; last stderr:\n{}",
                    conn.name(),
                    stderr.join("\n")
                );
            }
            conn.disconnect().await;
        }
    }

    /// Disconnect every server.
    pub async fn shutdown(&self) {
        let connections = {
            let mut registry = self.write();
            registry.routes.clear();
            std::mem::take(&mut registry.connections)
        };
        for conn in connections {
            conn.disconnect().await;
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// A name claimed for a connect in progress; released even if the connect
/// future is dropped.
struct Reservation<'a> {
    registry: &'a RwLock<Registry>,
    name: String,
    held: bool,
}

impl Reservation<'_> {
    fn release(mut self, registry: &mut Registry) {
        registry.reserved.remove(&self.name);
        self.held = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.held {
            let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
            registry.reserved.remove(&self.name);
        }
    }
}

fn register(registry: &mut Registry, conn: ServerConnection) -> ConnectionHandle {
    for tool in conn.catalog().list() {
        if let Some(&owner) = registry.routes.get(&tool.name) {
            tracing::warn!(
                "Tool '{}' from '{}' is already provided by '{}'; keeping the first",
                tool.name,
                conn.name(),
                registry.connections[owner].name()
            );
        }
    }
    let handle = ConnectionHandle {
        name: conn.name().to_string(),
    };
    registry.connections.push(Arc::new(conn));
    registry.rebuild_routes();
    handle
}

fn unique_name(base: &str, is_taken: impl Fn(&str) -> bool) -> String {
    if !is_taken(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{base}-{n}"))
        .find(|candidate| !is_taken(candidate))
        .unwrap_or_else(|| base.to_string())
}

impl ToolExecutor for Supervisor {
    fn declarations(&self) -> Vec<ToolDeclaration> {
        let registry = self.read();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for conn in registry.connections.iter().filter(|c| c.is_ready()) {
            for decl in conn.catalog().describe_for_model() {
                if seen.insert(decl.name.clone()) {
                    out.push(decl);
                }
            }
        }
        out
    }

    fn execute<'a>(&'a self, name: &'a str, arguments: Value) -> ToolFuture<'a> {
        Box::pin(async move {
            let outcome = self
                .call_tool(name, arguments)
                .await
                .map_err(ToolError::from)?;
            Ok(outcome.into_output())
        })
    }
}
