//! Minimal bridge server.
//!
//! Demonstrates:
//! - Registering global and page-scoped procedures
//! - Calling back into the page from a procedure
//! - Connection open/close hooks
//! - Fire-and-forget alerts
//!
//! Point a page's client script at the printed URL, then call
//! `call_py("hello", "Ada")` from the browser console.
//!
//! Usage:
//!   cargo run --example hello_world
//!   cargo run --example hello_world -- --debug
//!   cargo run --example hello_world -- --port 9000

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use tracing_subscriber::EnvFilter;
use weblink::{Bridge, Connection, Invocation, Result, WsServer, dom};

// ============================================================================
// Args
// ============================================================================

/// Command-line arguments.
#[derive(Debug, Clone)]
struct Args {
    debug: bool,
    port: u16,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let port = args
            .iter()
            .position(|a| a == "--port")
            .and_then(|i| args.get(i + 1))
            .and_then(|p| p.parse().ok())
            .unwrap_or(weblink::bridge::DEFAULT_PORT);

        Self {
            debug: args.iter().any(|a| a == "--debug"),
            port,
        }
    }
}

fn init_logging(debug: bool) {
    let filter = if debug { "weblink=debug" } else { "weblink=info" };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}

// ============================================================================
// Procedures
// ============================================================================

/// Greets the caller and reports the page title back.
async fn hello(connection: Connection, invocation: Invocation) -> Result<()> {
    let name: String = invocation.arg(0).unwrap_or_else(|_| "stranger".into());

    let title = connection.eval_js("document.title").await?;
    println!("[hello] {name} on {} (title: {title:?})", connection.pathname());

    dom::alert(&connection, &format!("Hello, {name}!"))
}

/// Counts clicks per session.
async fn clicked(connection: Connection, _invocation: Invocation) -> Result<()> {
    let clicks = connection.increment_sequence_number();
    connection.eval_js_nowait(format!(
        "document.getElementById('clicks').textContent = {clicks};"
    ))
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    if let Err(e) = run(args).await {
        eprintln!("\n[ERROR] {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    println!("=== weblink: hello world ===\n");

    let bridge = Bridge::builder()
        .port(args.port)
        .call_timeout(Duration::from_secs(2))
        .procedure("hello", hello)
        .page_procedure("/counter.html", "clicked", clicked)
        .on_connection_open(|c: &Connection| println!("[open]  {} {}", c.id(), c.pathname()))
        .on_connection_close(|c: &Connection| println!("[close] {}", c.id()))
        .build()?;

    let server = WsServer::bind(&bridge).await?;
    println!("Listening on {}<connection id>/<page path>", server.ws_url());
    println!("Press Ctrl+C to stop\n");

    tokio::signal::ctrl_c().await?;

    println!("\nShutting down...");
    server.shutdown();
    bridge.shutdown();
    Ok(())
}
