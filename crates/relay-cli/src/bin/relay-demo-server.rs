//! Demo MCP tool server with `add`, `echo` and `sleep` tools.
//!
//! Speaks the same stdio framing as the client side, so it doubles as the
//! server for Relay's end-to-end tests.

use anyhow::Result;
use clap::Parser;
use relay_mcp::connection::PROTOCOL_VERSION;
use relay_mcp::envelope::{EnvelopeKind, INVALID_PARAMS, METHOD_NOT_FOUND, NOT_INITIALIZED};
use relay_mcp::framing::FrameReader;
use relay_mcp::{Envelope, Framing, RequestId, RpcError};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

#[derive(Parser)]
#[command(
    name = "relay-demo-server",
    version,
    about = "Demo MCP server with add, echo and sleep tools"
)]
struct Args {
    /// Wire framing: line or length
    #[arg(long, default_value = "line")]
    framing: Framing,

    /// Tools per tools/list page (0 lists everything at once)
    #[arg(long, default_value_t = 0)]
    page_size: usize,

    /// Exit with an error before reading any request
    #[arg(long)]
    crash_on_start: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout carries protocol frames; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    if args.crash_on_start {
        eprintln!("relay-demo-server: refusing to start (--crash-on-start)");
        std::process::exit(1);
    }

    serve(args.framing, args.page_size).await
}

async fn serve(framing: Framing, page_size: usize) -> Result<()> {
    let server = Arc::new(DemoServer {
        initialized: AtomicBool::new(false),
        page_size,
    });
    let (tx, mut rx) = mpsc::channel::<Envelope>(64);

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(envelope) = rx.recv().await {
            let frame = framing.encode(&envelope)?;
            stdout.write_all(&frame).await?;
            stdout.flush().await?;
        }
        Ok::<_, anyhow::Error>(())
    });

    tracing::info!("relay-demo-server ready ({framing})");
    let mut reader = FrameReader::new(BufReader::new(tokio::io::stdin()), framing);
    let mut tasks = JoinSet::new();
    while let Some(envelope) = reader.next_envelope().await? {
        match envelope.kind() {
            EnvelopeKind::Request => {
                let Some(id) = envelope.id.clone() else {
                    continue;
                };
                let server = Arc::clone(&server);
                let tx = tx.clone();
                tasks.spawn(async move {
                    let reply = server.handle(id, envelope).await;
                    let _ = tx.send(reply).await;
                });
            }
            EnvelopeKind::Notification => {
                tracing::debug!("notification: {}", envelope.method.as_deref().unwrap_or(""));
            }
            EnvelopeKind::Response | EnvelopeKind::Invalid => {}
        }
    }

    tracing::info!("stdin closed, exiting");
    tasks.shutdown().await;
    drop(tx);
    writer.await??;
    Ok(())
}

struct DemoServer {
    initialized: AtomicBool,
    page_size: usize,
}

impl DemoServer {
    async fn handle(&self, id: RequestId, request: Envelope) -> Envelope {
        let method = request.method.as_deref().unwrap_or("");
        let result = match method {
            "initialize" => {
                self.initialized.store(true, Ordering::SeqCst);
                Ok(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": {
                        "name": "relay-demo-server",
                        "version": env!("CARGO_PKG_VERSION")
                    }
                }))
            }
            "ping" => Ok(json!({})),
            "tools/list" | "tools/call" if !self.initialized.load(Ordering::SeqCst) => Err(
                RpcError::new(NOT_INITIALIZED, "Server not initialized"),
            ),
            "tools/list" => Ok(self.list_tools(request.params.as_ref())),
            "tools/call" => self.call_tool(request.params.unwrap_or(Value::Null)).await,
            other => Err(RpcError::new(
                METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            )),
        };
        match result {
            Ok(result) => Envelope::response(id, result),
            Err(error) => {
                tracing::info!("{method} failed: {}", error.message);
                Envelope::error_response(id, error)
            }
        }
    }

    fn list_tools(&self, params: Option<&Value>) -> Value {
        let tools = tool_definitions();
        if self.page_size == 0 {
            return json!({ "tools": tools });
        }
        let start = params
            .and_then(|p| p.get("cursor"))
            .and_then(Value::as_str)
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0)
            .min(tools.len());
        let end = (start + self.page_size).min(tools.len());
        let mut page = json!({ "tools": &tools[start..end] });
        if end < tools.len() {
            page["nextCursor"] = json!(end.to_string());
        }
        page
    }

    async fn call_tool(&self, params: Value) -> Result<Value, RpcError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::new(INVALID_PARAMS, "tools/call requires a tool name"))?;
        let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
        tracing::info!("tools/call {name} {args}");

        match name {
            "add" => match (number(&args, "x"), number(&args, "y")) {
                (Ok(x), Ok(y)) => Ok(text_result((x + y).to_string(), false)),
                (Err(e), _) | (_, Err(e)) => Ok(text_result(e, true)),
            },
            "echo" => match args.get("text").and_then(Value::as_str) {
                Some(text) => Ok(text_result(text, false)),
                None => Ok(text_result("Argument 'text' must be a string", true)),
            },
            "sleep" => {
                let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(text_result(format!("slept {ms}ms"), false))
            }
            other => Err(RpcError::new(
                METHOD_NOT_FOUND,
                format!("Unknown tool: {other}"),
            )),
        }
    }
}

fn number(args: &Value, key: &str) -> Result<f64, String> {
    args.get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| format!("Argument '{key}' must be a number"))
}

fn text_result(text: impl Into<String>, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text.into() }],
        "isError": is_error
    })
}

fn tool_definitions() -> Vec<Value> {
    vec![
        json!({
            "name": "add",
            "description": "Add two numbers",
            "inputSchema": {
                "$schema": "http://json-schema.org/draft-07/schema#",
                "type": "object",
                "properties": {
                    "x": { "type": "number", "description": "First addend" },
                    "y": { "type": "number", "description": "Second addend" }
                },
                "required": ["x", "y"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "echo",
            "description": "Return the given text unchanged",
            "inputSchema": {
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }
        }),
        json!({
            "name": "sleep",
            "description": "Wait for the given number of milliseconds",
            "inputSchema": {
                "type": "object",
                "properties": { "ms": { "type": "integer", "minimum": 0 } },
                "required": ["ms"]
            }
        }),
    ]
}
