//! MCP Tool Definitions for pwndbg Debugging

use serde::{Deserialize, Serialize};

/// MCP Tool definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Pwndbg commands exposed as parameterless tools: (tool name, GDB command, description)
pub const PWNDBG_SHORTCUTS: &[(&str, &str, &str)] = &[
    (
        "list_pwndbg_commands",
        "pwndbg --all",
        "List every command pwndbg provides, with a one-line summary each.",
    ),
    (
        "context",
        "context",
        "Show the pwndbg context: registers, disassembly, stack and backtrace at the current stop.",
    ),
    ("heap", "heap", "Walk the glibc heap and list its chunks."),
    ("bins", "bins", "Show the contents of the tcache, fast, small, large and unsorted bins."),
    ("backtrace", "backtrace", "Print the call stack of the selected thread."),
    ("procinfo", "procinfo", "Show process information: pid, file descriptors, sockets."),
    ("tls", "tls", "Print the thread-local storage base address."),
    ("vmmap", "vmmap", "Show the virtual memory map of the target process."),
    ("checksec", "checksec", "Show the binary's security mitigations (RELRO, canary, NX, PIE)."),
];

fn no_arguments(name: &str, description: &str) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        }),
    }
}

/// Tool: Load executable
pub fn tool_load_executable() -> ToolDefinition {
    ToolDefinition {
        name: "load_executable".to_string(),
        description: "Load an executable and its symbols into GDB. Starts the debugger if needed. The program's stdin/stdout are attached to a dedicated terminal, use send_to_process/read_from_process to talk to it.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "executable_path": {
                    "type": "string",
                    "description": "Path to the executable file to debug"
                },
                "args": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Command-line arguments for the program"
                }
            },
            "required": ["executable_path"]
        }),
    }
}

/// Tool: Execute GDB command
pub fn tool_execute_command() -> ToolDefinition {
    ToolDefinition {
        name: "execute_command".to_string(),
        description: "Execute a GDB, pwndbg or GDB/MI command (e.g. 'break main', 'run', 'x/8gx $rsp', '-stack-list-frames'). While the program is running, commands are refused; read its output or interrupt it first.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Command to execute"
                },
                "timeout": {
                    "type": "number",
                    "description": "Seconds to wait for the command to finish (default: server setting)"
                }
            },
            "required": ["command"]
        }),
    }
}

/// Tool: Write to the program's stdin
pub fn tool_send_to_process() -> ToolDefinition {
    ToolDefinition {
        name: "send_to_process".to_string(),
        description: "Write data to the debugged program's stdin through its terminal. Bytes are delivered verbatim; include '\\n' to end a line. Use encoding 'hex' for binary payloads.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "data": {
                    "type": "string",
                    "description": "Data to send"
                },
                "encoding": {
                    "type": "string",
                    "enum": ["text", "hex"],
                    "description": "How 'data' is encoded (default: text)"
                }
            },
            "required": ["data"]
        }),
    }
}

/// Tool: Read the program's output
pub fn tool_read_from_process() -> ToolDefinition {
    ToolDefinition {
        name: "read_from_process".to_string(),
        description: "Read output written by the debugged program. Printable output is returned as text, anything else as a hex dump.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "size": {
                    "type": "integer",
                    "description": "Maximum number of bytes to read (default: 1024)"
                },
                "timeout": {
                    "type": "number",
                    "description": "Seconds to wait for output (default: 1.0)"
                }
            },
            "required": []
        }),
    }
}

/// Tool: Send a control character
pub fn tool_interrupt_process() -> ToolDefinition {
    ToolDefinition {
        name: "interrupt_process".to_string(),
        description: "Send a terminal control character to the debugged program, as if typed at its terminal: Ctrl-C (sigint), Ctrl-D (eof) or Ctrl-Z (sigtstp).".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "signal": {
                    "type": "string",
                    "enum": ["sigint", "eof", "sigtstp"],
                    "description": "Control character to send (default: sigint)"
                }
            },
            "required": []
        }),
    }
}

/// Tool: Session status
pub fn tool_pwndbg_status() -> ToolDefinition {
    no_arguments(
        "pwndbg_status",
        "Get the debugger session status: state (stopped/running/dead), program terminal and GDB pid. While the program runs, also reports stop notifications received since the last command.",
    )
}

/// Tool: Restart the debugger
pub fn tool_hard_reset() -> ToolDefinition {
    no_arguments(
        "hard_reset",
        "Kill the debugger and the debugged program and start a fresh GDB session. Breakpoints and the loaded file are lost.",
    )
}

/// Tool: Examine memory
pub fn tool_telescope() -> ToolDefinition {
    ToolDefinition {
        name: "telescope".to_string(),
        description: "Recursively dereference pointers starting at an address (pwndbg telescope).".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "address": {
                    "type": "string",
                    "description": "Address or expression, e.g. '$rsp' or '0x7fffffffe000'"
                },
                "count": {
                    "type": "integer",
                    "description": "Number of entries to show (default: 10)"
                }
            },
            "required": ["address"]
        }),
    }
}

/// Tool: Stack dump
pub fn tool_stack() -> ToolDefinition {
    ToolDefinition {
        name: "stack".to_string(),
        description: "Dereference entries on the stack (pwndbg stack).".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "count": {
                    "type": "integer",
                    "description": "Number of entries to show (default: 10)"
                }
            },
            "required": []
        }),
    }
}

/// Tool: Disassemble
pub fn tool_disassemble() -> ToolDefinition {
    ToolDefinition {
        name: "disassemble".to_string(),
        description: "Disassemble a function.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "function_name": {
                    "type": "string",
                    "description": "Function name or address"
                }
            },
            "required": ["function_name"]
        }),
    }
}

/// Get all available tools
pub fn get_all_tools() -> Vec<ToolDefinition> {
    let mut tools = vec![
        tool_load_executable(),
        tool_execute_command(),
        tool_send_to_process(),
        tool_read_from_process(),
        tool_interrupt_process(),
        tool_pwndbg_status(),
        tool_hard_reset(),
        tool_telescope(),
        tool_stack(),
        tool_disassemble(),
    ];
    tools.extend(
        PWNDBG_SHORTCUTS
            .iter()
            .map(|(name, _, description)| no_arguments(name, description)),
    );
    tools
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_tool_names_are_unique() {
        let tools = get_all_tools();
        let names: HashSet<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names.len(), tools.len());
        assert_eq!(tools.len(), 19);
    }

    #[test]
    fn test_required_fields_are_declared() {
        for tool in get_all_tools() {
            let properties = tool.input_schema["properties"].as_object().unwrap();
            for required in tool.input_schema["required"].as_array().unwrap() {
                let field = required.as_str().unwrap();
                assert!(
                    properties.contains_key(field),
                    "{} requires undeclared {}",
                    tool.name,
                    field
                );
            }
        }
    }
}
