//! Relay CLI: answers questions with a local model and MCP tool servers.

use anyhow::{Context, Result};
use clap::Parser;
use relay_api::OllamaModel;
use relay_config::{CliOverrides, RelayConfig};
use relay_core::{LoopEvent, LoopLimits, Orchestrator, Outcome};
use relay_mcp::Supervisor;
use relay_types::RelayError;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Tool output longer than this is shortened in progress lines.
const PREVIEW_CHARS: usize = 200;

#[derive(Parser)]
#[command(
    name = "relay",
    version,
    about = "Answer questions with a local model and MCP tool servers"
)]
struct Cli {
    /// MCP server scripts to launch (.py or .js)
    scripts: Vec<PathBuf>,

    /// Answer a single prompt and exit (non-interactive)
    #[arg(short, long)]
    print: Option<String>,

    /// Model to use (overrides RELAY_MODEL)
    #[arg(long)]
    model: Option<String>,

    /// Ollama base URL (overrides OLLAMA_HOST)
    #[arg(long)]
    ollama_url: Option<String>,

    /// Maximum model calls per query
    #[arg(long)]
    max_steps: Option<usize>,

    /// Enable verbose/debug logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(io::stderr)
        .init();

    let config = RelayConfig::load(CliOverrides {
        model: cli.model,
        base_url: cli.ollama_url,
        max_steps: cli.max_steps,
    })?;

    let supervisor = Arc::new(Supervisor::start(&config.mcp, config.launchers.clone()).await);
    for script in &cli.scripts {
        add_server(&supervisor, script).await;
    }

    let model = OllamaModel::new(&config.model, &config.base_url, config.model_timeout())
        .context("Failed to create model client")?;
    let orchestrator = Orchestrator::new(Arc::new(model), supervisor.clone())
        .with_limits(LoopLimits {
            max_steps: config.max_steps,
            max_tool_calls: config.max_tool_calls,
            model_timeout: config.model_timeout(),
        })
        .with_system_prompt(config.system_prompt.clone());

    let result = match cli.print {
        Some(prompt) => run_query(&orchestrator, &prompt).await,
        None => repl(&orchestrator, &supervisor, &config).await,
    };

    supervisor.shutdown().await;
    result
}

async fn repl(
    orchestrator: &Orchestrator,
    supervisor: &Supervisor,
    config: &RelayConfig,
) -> Result<()> {
    let stdin = io::stdin();

    eprintln!(
        "relay v{} (model: {}, servers: {})",
        env!("CARGO_PKG_VERSION"),
        config.model,
        supervisor.connection_count()
    );
    eprintln!("Type a question, or 'help' for commands. Press Ctrl+D to exit.\n");

    loop {
        eprint!("> ");
        io::stderr().flush()?;

        let mut input = String::new();
        let bytes_read = stdin.lock().read_line(&mut input)?;
        if bytes_read == 0 {
            eprintln!();
            break;
        }

        match parse_command(input.trim()) {
            Command::Empty => continue,
            Command::Quit => break,
            Command::Help => print_help(),
            Command::ListTools => list_tools(supervisor),
            Command::AddServer(Some(path)) => add_server(supervisor, Path::new(path)).await,
            Command::AddServer(None) => eprintln!("Usage: add_server <path>"),
            Command::Query(query) => {
                if let Err(e) = run_query(orchestrator, query).await {
                    eprintln!("\nError: {e}");
                }
            }
        }

        println!();
    }

    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Empty,
    Quit,
    Help,
    ListTools,
    AddServer(Option<&'a str>),
    Query(&'a str),
}

fn parse_command(input: &str) -> Command<'_> {
    let (cmd, args) = match input.split_once(char::is_whitespace) {
        Some((c, a)) => (c, Some(a.trim()).filter(|a| !a.is_empty())),
        None => (input, None),
    };
    match cmd {
        "" => Command::Empty,
        "quit" | "exit" if args.is_none() => Command::Quit,
        "help" if args.is_none() => Command::Help,
        "list_tools" if args.is_none() => Command::ListTools,
        "add_server" => Command::AddServer(args),
        _ => Command::Query(input),
    }
}

async fn add_server(supervisor: &Supervisor, script: &Path) {
    match supervisor.connect_script(script).await {
        Ok(handle) => {
            let tools = supervisor
                .connection(handle.name())
                .map(|c| c.catalog().len())
                .unwrap_or(0);
            eprintln!("Connected to '{}' ({tools} tools)", handle.name());
        }
        Err(e) => eprintln!("Warning: {e}"),
    }
}

fn list_tools(supervisor: &Supervisor) {
    let tools = supervisor.tools();
    if tools.is_empty() {
        eprintln!("No tools available. Use add_server <path> to connect a server.");
        return;
    }
    for (server, tool) in &tools {
        if tool.description.is_empty() {
            eprintln!("  {:<20} ({server})", tool.name);
        } else {
            eprintln!("  {:<20} {}  ({server})", tool.name, tool.description);
        }
    }
}

/// Resolve one query, printing progress. Ctrl+C cancels it.
async fn run_query(orchestrator: &Orchestrator, query: &str) -> Result<()> {
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let stdout = io::stdout();
    let mut last_text: Option<String> = None;
    let result = orchestrator
        .resolve_with(query, cancel, |event| match event {
            LoopEvent::ModelText(text) => {
                let mut out = stdout.lock();
                let _ = writeln!(out, "{text}");
                let _ = out.flush();
                last_text = Some(text);
            }
            LoopEvent::ToolStart { name, arguments } => {
                eprintln!("  [tool: {name} {}]", preview(&arguments));
            }
            LoopEvent::ToolEnd {
                name,
                output,
                is_error,
            } => {
                let status = if is_error { "error" } else { "done" };
                eprintln!("  [tool {name} {status}: {}]", preview(&output));
            }
            LoopEvent::LoopExceeded { steps, tool_calls } => {
                eprintln!("  [stopped after {steps} steps and {tool_calls} tool calls]");
            }
            LoopEvent::Cancelled => eprintln!("\n  [cancelled]"),
            LoopEvent::Done => {}
        })
        .await;
    watcher.abort();

    let resolution = match result {
        Err(RelayError::Cancelled) => return Ok(()),
        other => other?,
    };
    if resolution.outcome == Outcome::LoopExceeded
        && last_text.as_deref() != Some(resolution.text.as_str())
    {
        println!("{}", resolution.text);
    }
    Ok(())
}

fn preview(text: &str) -> String {
    let text = text.trim().replace('\n', " ");
    match text.char_indices().nth(PREVIEW_CHARS) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text,
    }
}

fn print_help() {
    eprintln!("Available commands:");
    eprintln!("  add_server <path>  Launch a .py or .js MCP server script");
    eprintln!("  list_tools         List tools from connected servers");
    eprintln!("  help               Show this help");
    eprintln!("  quit | exit        Exit");
    eprintln!();
    eprintln!("Anything else is answered by the model. Ctrl+C cancels a running query.");
}
