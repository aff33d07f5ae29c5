use std::net::SocketAddr;
use std::sync::Arc;

use tapdance_adb::AdbBridge;
use tapdance_engine::mcp::context::EngineContext;
use tapdance_engine::mcp::server::McpServer;
use tapdance_engine::mcp::{http, stdio};
use tapdance_engine::session::{AdbDiscovery, DeviceSessionManager};
use tapdance_engine::{EngineError, Result};
use tracing_subscriber::EnvFilter;

enum Transport {
    Stdio,
    Http(u16),
}

fn parse_args() -> Result<Transport> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            // --sse is the legacy name; both serve the full route set.
            "--http" | "--sse" => {
                let port = match iter.next() {
                    Some(p) => p.parse::<u16>().map_err(|_| {
                        EngineError::Validation(format!("invalid port '{p}'"))
                    })?,
                    None => 8080,
                };
                return Ok(Transport::Http(port));
            }
            "--help" | "-h" => {
                eprintln!("Usage: tapdance-mcp [--http [PORT] | --sse [PORT]]");
                eprintln!("Without flags the server speaks JSON-RPC over stdio.");
                std::process::exit(0);
            }
            other => {
                return Err(EngineError::Validation(format!(
                    "unknown argument '{other}' (try --help)"
                )));
            }
        }
    }
    Ok(Transport::Stdio)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Protocol traffic owns stdout; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let transport = parse_args()?;

    eprintln!("Starting Tapdance MCP Server...");

    let bridge = Arc::new(AdbBridge::new()?);
    let discovery = Arc::new(AdbDiscovery::new(bridge.clone()));
    let sessions = Arc::new(DeviceSessionManager::new(discovery));
    let context = Arc::new(EngineContext::new(bridge, sessions));
    let server = McpServer::new(context)?;

    let schemas = server.tool_schemas();
    eprintln!("Available tools: {}", schemas.len());
    for schema in &schemas {
        eprintln!("  - {}: {}", schema.name, schema.description);
    }

    match transport {
        Transport::Stdio => {
            eprintln!("\nMCP Server ready. Listening for JSON-RPC requests on stdin...");
            stdio::serve(server).await
        }
        Transport::Http(port) => {
            let addr: SocketAddr = ([127, 0, 0, 1], port).into();
            eprintln!("\nMCP Server ready. Listening on http://{addr} ...");
            http::serve(server, addr).await;
            Ok(())
        }
    }
}
