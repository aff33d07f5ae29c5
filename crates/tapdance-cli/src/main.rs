use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tapdance_adb::AdbBridge;
use tapdance_cli::{Invocation, parse_invocation};
use tapdance_engine::mcp::context::EngineContext;
use tapdance_engine::mcp::server::{McpServer, ToolRequest, ToolSchema};
use tapdance_engine::session::{AdbDiscovery, DeviceSessionManager};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let code = match run(&args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(args: &[String]) -> Result<i32> {
    let invocation = parse_invocation(args).map_err(anyhow::Error::msg)?;

    let server = build_server()?;
    match invocation {
        Invocation::Help { tool } => {
            print_help(&server.tool_schemas(), tool.as_deref());
            Ok(0)
        }
        Invocation::Call { tool, params } => {
            let response = server
                .call_tool(ToolRequest {
                    tool_name: tool,
                    params,
                })
                .await
                .context("tool call failed")?;
            let rendered = serde_json::to_string_pretty(&response.result)
                .unwrap_or_else(|_| response.result.to_string());
            if response.success {
                println!("{rendered}");
                Ok(0)
            } else {
                eprintln!("{rendered}");
                Ok(1)
            }
        }
    }
}

fn build_server() -> Result<Arc<McpServer>> {
    let bridge = Arc::new(AdbBridge::new()?);
    let discovery = Arc::new(AdbDiscovery::new(bridge.clone()));
    let sessions = Arc::new(DeviceSessionManager::new(discovery));
    let context = Arc::new(EngineContext::new(bridge, sessions));
    Ok(McpServer::new(context)?)
}

fn print_help(schemas: &[ToolSchema], tool: Option<&str>) {
    match tool {
        Some(name) => match schemas.iter().find(|s| s.name == name) {
            Some(schema) => {
                println!("{} - {}", schema.name, schema.description);
                println!();
                println!("Parameters (JSON Schema):");
                println!(
                    "{}",
                    serde_json::to_string_pretty(&schema.parameters)
                        .unwrap_or_else(|_| schema.parameters.to_string())
                );
                print_example(&schema.name, &schema.parameters);
            }
            None => {
                eprintln!("Unknown tool '{name}'. Run 'tapdance help' for the full list.");
            }
        },
        None => {
            println!("Tapdance - drive Android devices from the command line");
            println!();
            println!("USAGE:");
            println!("    tapdance <toolName> --param value ...");
            println!("    tapdance help [toolName]");
            println!();
            println!("TOOLS:");
            for schema in schemas {
                println!("    {:24}{}", schema.name, schema.description);
            }
        }
    }
}

fn print_example(name: &str, parameters: &Value) {
    let Some(required) = parameters.get("required").and_then(Value::as_array) else {
        return;
    };
    let args: Vec<String> = required
        .iter()
        .filter_map(Value::as_str)
        .map(|key| format!("--{key} <value>"))
        .collect();
    if !args.is_empty() {
        println!();
        println!("Example:");
        println!("    tapdance {name} {}", args.join(" "));
    }
}
