//! MCP pwndbg Server
//!
//! A Model Context Protocol (MCP) server that drives a pwndbg-enabled GDB for
//! LLM agents. The debugged program gets its own pseudo-terminal, so agents can
//! talk to it (send payloads, read its output, hit Ctrl-C) while debugging it.
//!
//! Configuration is read from the environment:
//!   MCP_PWNDBG_GDB          debugger binary (default: gdb)
//!   MCP_PWNDBG_GDB_ARGS     debugger arguments (default: -q --interpreter=mi3)
//!   MCP_PWNDBG_TIMEOUT_MS   default command timeout (default: 5000)
//!   MCP_PWNDBG_POLL_MS      wait for a stop while the program runs (default: 1000)
//!
//! Usage:
//!   Add to Claude Desktop config:
//!   ```json
//!   {
//!     "mcpServers": {
//!       "pwndbg": {
//!         "command": "/path/to/mcp-pwndbg-server"
//!       }
//!     }
//!   }
//!   ```

mod gdb;
mod mcp;

use crate::gdb::{GdbConfig, SessionController};
use crate::mcp::protocol::*;
use crate::mcp::PwndbgMcpServer;
use anyhow::Result;
use std::io::{BufRead, BufReader, Write};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// MCP Server state
struct ServerState {
    server: PwndbgMcpServer,
    initialized: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting MCP pwndbg Server v{}", env!("CARGO_PKG_VERSION"));

    let config = GdbConfig::from_env();
    info!(
        "Debugger: {} {} (timeout {}ms)",
        config.gdb_path,
        config.gdb_args.join(" "),
        config.timeout_ms
    );
    let controller = Arc::new(SessionController::new(config));

    let state = RwLock::new(ServerState {
        server: PwndbgMcpServer::new(controller.clone()),
        initialized: false,
    });

    // Read from stdin, write to stdout
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut stdout = stdout.lock();

    let reader = BufReader::new(stdin);

    info!("MCP pwndbg Server ready, listening on stdin");

    for line in reader.lines() {
        match line {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                debug!("Received: {}", line);

                // Parse the JSON-RPC request
                let request: Result<JsonRpcRequest, _> = serde_json::from_str(&line);

                match request {
                    Ok(req) => {
                        let id = req.id.clone();
                        let response = handle_request(&state, req).await;

                        match response {
                            Ok(Some(resp)) => {
                                let resp_str = serde_json::to_string(&resp)?;
                                debug!("Sending: {}", resp_str);
                                writeln!(stdout, "{}", resp_str)?;
                                stdout.flush()?;
                            }
                            Ok(None) => {
                                // Notification, no response needed
                            }
                            Err(e) => {
                                error!("Error handling request: {:#}", e);
                                let error = match e.downcast_ref::<UnknownMethod>() {
                                    Some(UnknownMethod(method)) => {
                                        JsonRpcError::method_not_found(method)
                                    }
                                    None => JsonRpcError::internal_error(&format!("{:#}", e)),
                                };
                                let error_resp = JsonRpcErrorResponse {
                                    jsonrpc: "2.0".to_string(),
                                    id,
                                    error,
                                };
                                let resp_str = serde_json::to_string(&error_resp)?;
                                writeln!(stdout, "{}", resp_str)?;
                                stdout.flush()?;
                            }
                        }
                    }
                    Err(e) => {
                        error!("Failed to parse request: {}", e);
                        let error_resp = JsonRpcErrorResponse {
                            jsonrpc: "2.0".to_string(),
                            id: None,
                            error: JsonRpcError::parse_error(),
                        };
                        let resp_str = serde_json::to_string(&error_resp)?;
                        writeln!(stdout, "{}", resp_str)?;
                        stdout.flush()?;
                    }
                }
            }
            Err(e) => {
                error!("Error reading from stdin: {}", e);
                break;
            }
        }
    }

    info!("MCP pwndbg Server shutting down");
    controller.close().await;
    Ok(())
}

/// Method the server does not implement
#[derive(Debug, thiserror::Error)]
#[error("Unknown method: {0}")]
struct UnknownMethod(String);

/// Handle a JSON-RPC request
async fn handle_request(
    state: &RwLock<ServerState>,
    request: JsonRpcRequest,
) -> Result<Option<JsonRpcResponse>> {
    let method = request.method.as_str();

    debug!("Handling method: {}", method);

    let result = match method {
        // MCP Protocol methods
        "initialize" => {
            let mut state = state.write().await;
            state.initialized = true;
            state.server.handle_initialize(request.params).await?
        }
        "initialized" | "notifications/initialized" => {
            // Notification, no response needed
            return Ok(None);
        }
        "ping" => serde_json::json!({}),
        "tools/list" => {
            let state = state.read().await;
            if !state.initialized {
                warn!("tools/list before initialize");
            }
            state.server.handle_tools_list().await?
        }
        "tools/call" => {
            let state = state.read().await;
            state.server.handle_tools_call(request.params).await?
        }
        "resources/list" => serde_json::json!({"resources": []}),
        "prompts/list" => serde_json::json!({"prompts": []}),
        "logging/setLevel" => {
            // Acknowledge but ignore
            serde_json::json!({})
        }
        _ if request.id.is_none() => {
            debug!("Ignoring notification: {}", method);
            return Ok(None);
        }
        _ => {
            warn!("Unknown method: {}", method);
            return Err(UnknownMethod(method.to_string()).into());
        }
    };

    Ok(Some(JsonRpcResponse {
        jsonrpc: "2.0".to_string(),
        id: request.id.unwrap_or(RequestId::String("0".to_string())),
        result,
    }))
}
