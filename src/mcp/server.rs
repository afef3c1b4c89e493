//! MCP Server Handler Implementation

use crate::gdb::{ControlSignal, Execution, SessionController};
use crate::mcp::protocol::*;
use crate::mcp::tools::{get_all_tools, PWNDBG_SHORTCUTS};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

type Arguments = Option<serde_json::Map<String, serde_json::Value>>;

const DEFAULT_READ_SIZE: u64 = 1024;
const DEFAULT_READ_TIMEOUT: f64 = 1.0;
const DEFAULT_COUNT: u64 = 10;
/// Longest wait accepted from a caller, in seconds
const MAX_WAIT_SECS: f64 = 3600.0;

/// pwndbg MCP Server
pub struct PwndbgMcpServer {
    controller: Arc<SessionController>,
}

impl PwndbgMcpServer {
    pub fn new(controller: Arc<SessionController>) -> Self {
        Self { controller }
    }

    /// Get server info
    pub fn get_info(&self) -> InitializeResult {
        InitializeResult {
            protocol_version: "2024-11-05".to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: Some(false),
                }),
                ..Default::default()
            },
            server_info: Implementation {
                name: "mcp-pwndbg-server".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            instructions: Some(
                "pwndbg MCP Server for debugging and exploiting native programs.\n\n\
                 Load a program with 'load_executable', set breakpoints and start it with \
                 'execute_command' (e.g. 'break main', 'run'). The program has its own terminal: \
                 talk to it with 'send_to_process' and 'read_from_process', and stop it with \
                 'interrupt_process'. While it runs, commands are refused until it stops; \
                 'pwndbg_status' reports the state. If the debugger gets stuck, use 'hard_reset'."
                    .to_string(),
            ),
        }
    }

    /// Handle initialize request
    pub async fn handle_initialize(&self, _params: Option<serde_json::Value>) -> Result<serde_json::Value> {
        let info = self.get_info();
        Ok(serde_json::to_value(info)?)
    }

    /// Handle tools/list request
    pub async fn handle_tools_list(&self) -> Result<serde_json::Value> {
        let tools: Vec<Tool> = get_all_tools()
            .into_iter()
            .map(|t| Tool {
                name: t.name,
                description: Some(t.description),
                input_schema: t.input_schema,
            })
            .collect();

        let result = ListToolsResult {
            tools,
            next_cursor: None,
        };

        Ok(serde_json::to_value(result)?)
    }

    /// Handle tools/call request
    pub async fn handle_tools_call(&self, params: Option<serde_json::Value>) -> Result<serde_json::Value> {
        let params = params.ok_or_else(|| anyhow!("Missing params"))?;
        let request: CallToolRequest = serde_json::from_value(params)?;

        debug!("Calling tool: {}", request.name);

        let result = self.call_tool(&request.name, request.arguments).await;

        // Tool failures go back to the caller as content, the session lives on
        let result = result.unwrap_or_else(|e| {
            warn!("Tool {} failed: {:#}", request.name, e);
            CallToolResult::error_text(format!("{:#}", e))
        });

        Ok(serde_json::to_value(result)?)
    }

    async fn call_tool(&self, name: &str, args: Arguments) -> Result<CallToolResult> {
        match name {
            "load_executable" => self.handle_load_executable(args).await,
            "execute_command" => self.handle_execute_command(args).await,
            "send_to_process" => self.handle_send_to_process(args).await,
            "read_from_process" => self.handle_read_from_process(args).await,
            "interrupt_process" => self.handle_interrupt_process(args).await,
            "pwndbg_status" => self.handle_status().await,
            "hard_reset" => self.handle_hard_reset().await,
            "telescope" => {
                let address = required_string(&args, "address")?;
                let count = integer_arg(&args, "count").unwrap_or(DEFAULT_COUNT);
                self.run_command(&format!("telescope {} {}", address, count), None).await
            }
            "stack" => {
                let count = integer_arg(&args, "count").unwrap_or(DEFAULT_COUNT);
                self.run_command(&format!("stack {}", count), None).await
            }
            "disassemble" => {
                let function = required_string(&args, "function_name")?;
                self.run_command(&format!("disassemble {}", function), None).await
            }
            _ => match PWNDBG_SHORTCUTS.iter().find(|(tool, _, _)| *tool == name) {
                Some((_, command, _)) => self.run_command(command, None).await,
                None => Ok(CallToolResult::error_text(format!("Unknown tool: {}", name))),
            },
        }
    }

    // ========================================================================
    // Tool Handlers
    // ========================================================================

    async fn run_command(&self, command: &str, timeout: Option<Duration>) -> Result<CallToolResult> {
        let execution = self.controller.execute(command, timeout).await?;
        render_execution(execution)
    }

    async fn handle_load_executable(&self, args: Arguments) -> Result<CallToolResult> {
        let path = required_string(&args, "executable_path")?;
        let program_args: Vec<String> = args
            .as_ref()
            .and_then(|a| a.get("args"))
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        info!("Loading executable: {}", path);

        let load = self
            .controller
            .execute(&format!("-file-exec-and-symbols {}", mi_quote(&path)), None)
            .await?;
        let loaded = matches!(&load, Execution::Completed(output) if output.error.is_none());
        let mut result = render_execution(load)?;

        if loaded && !program_args.is_empty() {
            let set_args = self
                .controller
                .execute(&format!("-exec-arguments {}", program_args.join(" ")), None)
                .await?;
            let set_args = render_execution(set_args)?;
            if set_args.is_error == Some(true) {
                result.is_error = Some(true);
            }
            result.content.extend(set_args.content);
        }

        Ok(result)
    }

    async fn handle_execute_command(&self, args: Arguments) -> Result<CallToolResult> {
        let command = required_string(&args, "command")?;
        let timeout = number_arg(&args, "timeout").map(seconds);
        self.run_command(&command, timeout).await
    }

    async fn handle_send_to_process(&self, args: Arguments) -> Result<CallToolResult> {
        let data = required_string(&args, "data")?;
        let encoding = string_arg(&args, "encoding").unwrap_or_else(|| "text".to_string());

        let bytes = match decode_payload(&data, &encoding) {
            Ok(bytes) => bytes,
            Err(e) => return Ok(CallToolResult::error_text(e.to_string())),
        };

        let sent = self.controller.send_to_target(bytes).await?;
        Ok(CallToolResult::text(format!("Sent {} bytes to process", sent)))
    }

    async fn handle_read_from_process(&self, args: Arguments) -> Result<CallToolResult> {
        let size = integer_arg(&args, "size").unwrap_or(DEFAULT_READ_SIZE);
        let timeout = number_arg(&args, "timeout").unwrap_or(DEFAULT_READ_TIMEOUT);
        let size = usize::try_from(size).unwrap_or(usize::MAX).min(1 << 20);

        match self
            .controller
            .read_from_target(size, seconds(timeout))
            .await?
        {
            Some(output) => Ok(CallToolResult::text(output)),
            None => Ok(CallToolResult::text(format!(
                "No output from process within {:.1}s",
                timeout
            ))),
        }
    }

    async fn handle_interrupt_process(&self, args: Arguments) -> Result<CallToolResult> {
        let name = string_arg(&args, "signal").unwrap_or_else(|| "sigint".to_string());
        let signal = match ControlSignal::parse(&name) {
            Some(signal) => signal,
            None => {
                return Ok(CallToolResult::error_text(format!(
                    "Unknown signal '{}', expected sigint, eof or sigtstp",
                    name
                )))
            }
        };

        let byte = self.controller.interrupt(signal).await?;
        Ok(CallToolResult::text(format!(
            "Sent {:?} (0x{:02x}) to process",
            signal, byte
        )))
    }

    async fn handle_status(&self) -> Result<CallToolResult> {
        let status = self.controller.status().await?;
        Ok(CallToolResult::text(serde_json::to_string_pretty(&status)?))
    }

    async fn handle_hard_reset(&self) -> Result<CallToolResult> {
        info!("Resetting GDB session (was {})", self.controller.state().await);
        let handle = self.controller.hard_reset().await?;
        Ok(CallToolResult::success(vec![
            Content::text("GDB session restarted."),
            Content::text(serde_json::to_string_pretty(&handle)?),
        ]))
    }
}

fn render_execution(execution: Execution) -> Result<CallToolResult> {
    match execution {
        Execution::Busy => Ok(CallToolResult::text(
            "The program is running, the command was not sent. Read its output with \
             read_from_process, check pwndbg_status, or stop it with interrupt_process.",
        )),
        Execution::Closed => Ok(CallToolResult::error_text(
            "The GDB session has ended. Retry to start a new session.",
        )),
        Execution::Completed(output) => {
            let text = serde_json::to_string_pretty(&output)?;
            if output.error.is_some() {
                Ok(CallToolResult::error_text(text))
            } else {
                Ok(CallToolResult::text(text))
            }
        }
    }
}

fn string_arg(args: &Arguments, key: &str) -> Option<String> {
    args.as_ref()
        .and_then(|a| a.get(key).and_then(|v| v.as_str()).map(|s| s.to_string()))
}

fn required_string(args: &Arguments, key: &str) -> Result<String> {
    string_arg(args, key).ok_or_else(|| anyhow!("{} is required", key))
}

fn integer_arg(args: &Arguments, key: &str) -> Option<u64> {
    args.as_ref().and_then(|a| a.get(key)).and_then(|v| v.as_u64())
}

fn number_arg(args: &Arguments, key: &str) -> Option<f64> {
    args.as_ref().and_then(|a| a.get(key)).and_then(|v| v.as_f64())
}

fn seconds(value: f64) -> Duration {
    Duration::from_secs_f64(value.clamp(0.0, MAX_WAIT_SECS))
}

/// Quote a value as an MI c-string
fn mi_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Turn tool input into the bytes written to the program
fn decode_payload(data: &str, encoding: &str) -> Result<Vec<u8>> {
    match encoding {
        "text" => Ok(data.as_bytes().to_vec()),
        "hex" => {
            let digits: String = data.split_whitespace().collect();
            let digits = digits.strip_prefix("0x").unwrap_or(&digits);
            hex::decode(digits).map_err(|e| anyhow!("Invalid hex data: {}", e))
        }
        other => Err(anyhow!("Unknown encoding '{}', expected text or hex", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gdb::GdbConfig;

    /// A server whose debugger can never start
    fn offline_server() -> PwndbgMcpServer {
        let config = GdbConfig {
            gdb_path: "/nonexistent/gdb".to_string(),
            ..GdbConfig::default()
        };
        PwndbgMcpServer::new(Arc::new(SessionController::new(config)))
    }

    async fn call(server: &PwndbgMcpServer, params: serde_json::Value) -> CallToolResult {
        let value = server.handle_tools_call(Some(params)).await.unwrap();
        serde_json::from_value(value).unwrap()
    }

    fn text_of(result: &CallToolResult) -> &str {
        let Content::Text { text } = &result.content[0];
        text
    }

    #[test]
    fn test_decode_payload() {
        assert_eq!(decode_payload("AAAA\n", "text").unwrap(), b"AAAA\n".to_vec());
        assert_eq!(
            decode_payload("41 41 00 ff", "hex").unwrap(),
            vec![0x41, 0x41, 0x00, 0xff]
        );
        assert_eq!(decode_payload("0xdeadbeef", "hex").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert!(decode_payload("4", "hex").is_err());
        assert!(decode_payload("zz", "hex").is_err());
        assert!(decode_payload("AAAA", "base64").is_err());
    }

    #[test]
    fn test_mi_quote_escapes() {
        assert_eq!(mi_quote("/tmp/chall"), "\"/tmp/chall\"");
        assert_eq!(mi_quote(r#"/tmp/a "b"\c"#), r#""/tmp/a \"b\"\\c""#);
    }

    #[test]
    fn test_seconds_are_clamped() {
        assert_eq!(seconds(-1.0), Duration::ZERO);
        assert_eq!(seconds(0.5), Duration::from_millis(500));
        assert_eq!(seconds(1e12), Duration::from_secs(3600));
    }

    #[test]
    fn test_busy_is_not_an_error() {
        let result = render_execution(Execution::Busy).unwrap();
        assert_eq!(result.is_error, Some(false));
        assert!(text_of(&result).contains("running"));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let server = offline_server();
        let result = call(&server, serde_json::json!({ "name": "gdb_start" })).await;
        assert_eq!(result.is_error, Some(true));
        assert_eq!(text_of(&result), "Unknown tool: gdb_start");
    }

    #[tokio::test]
    async fn test_invalid_hex_is_rejected_before_sending() {
        let server = offline_server();
        let result = call(
            &server,
            serde_json::json!({
                "name": "send_to_process",
                "arguments": { "data": "4g", "encoding": "hex" }
            }),
        )
        .await;
        assert_eq!(result.is_error, Some(true));
        assert!(text_of(&result).starts_with("Invalid hex data"));
    }

    #[tokio::test]
    async fn test_missing_argument_is_reported() {
        let server = offline_server();
        let result = call(&server, serde_json::json!({ "name": "telescope", "arguments": {} })).await;
        assert_eq!(result.is_error, Some(true));
        assert_eq!(text_of(&result), "address is required");
    }

    #[tokio::test]
    async fn test_launch_failure_becomes_tool_error() {
        let server = offline_server();
        let result = call(&server, serde_json::json!({ "name": "vmmap" })).await;
        assert_eq!(result.is_error, Some(true));
        assert!(text_of(&result).contains("/nonexistent/gdb"));
    }

    #[tokio::test]
    async fn test_tools_list() {
        let server = offline_server();
        let value = server.handle_tools_list().await.unwrap();
        let tools = value["tools"].as_array().unwrap();
        assert!(tools.iter().any(|t| t["name"] == "send_to_process"));
        assert!(tools.iter().any(|t| t["name"] == "checksec"));
    }
}
