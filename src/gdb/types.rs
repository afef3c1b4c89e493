//! GDB Machine Interface (MI) and Session Type Definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// GDB/MI result class types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
    Other(String),
}

/// GDB/MI async class types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AsyncClass {
    Stopped,
    Running,
    Other(String),
}

impl AsyncClass {
    pub fn name(&self) -> &str {
        match self {
            AsyncClass::Stopped => "stopped",
            AsyncClass::Running => "running",
            AsyncClass::Other(name) => name,
        }
    }
}

/// GDB/MI notification types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationClass {
    BreakpointCreated,
    BreakpointModified,
    BreakpointDeleted,
    ThreadGroupAdded,
    ThreadGroupStarted,
    ThreadGroupExited,
    ThreadCreated,
    ThreadSelected,
    ThreadExited,
    LibraryLoaded,
    LibraryUnloaded,
    CmdParamChanged,
    MemoryChanged,
    ParamChanged,
    Other(String),
}

impl NotificationClass {
    pub fn name(&self) -> &str {
        match self {
            NotificationClass::BreakpointCreated => "breakpoint-created",
            NotificationClass::BreakpointModified => "breakpoint-modified",
            NotificationClass::BreakpointDeleted => "breakpoint-deleted",
            NotificationClass::ThreadGroupAdded => "thread-group-added",
            NotificationClass::ThreadGroupStarted => "thread-group-started",
            NotificationClass::ThreadGroupExited => "thread-group-exited",
            NotificationClass::ThreadCreated => "thread-created",
            NotificationClass::ThreadSelected => "thread-selected",
            NotificationClass::ThreadExited => "thread-exited",
            NotificationClass::LibraryLoaded => "library-loaded",
            NotificationClass::LibraryUnloaded => "library-unloaded",
            NotificationClass::CmdParamChanged => "cmd-param-changed",
            NotificationClass::MemoryChanged => "memory-changed",
            NotificationClass::ParamChanged => "param-changed",
            NotificationClass::Other(name) => name,
        }
    }

    /// Notifications that only report a debugger setting change
    pub fn is_param_change(&self) -> bool {
        matches!(
            self,
            NotificationClass::CmdParamChanged | NotificationClass::ParamChanged
        )
    }
}

/// GDB/MI value types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MiValue {
    String(String),
    List(Vec<MiValue>),
    Tuple(MiTuple),
    None,
}

pub type MiTuple = std::collections::HashMap<String, MiValue>;

impl fmt::Display for MiValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MiValue::String(s) => write!(f, "{:?}", s),
            MiValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            MiValue::Tuple(tuple) => {
                // HashMap order is unstable, sort for reproducible output
                let mut keys: Vec<&String> = tuple.keys().collect();
                keys.sort();
                write!(f, "{{")?;
                for (i, key) in keys.into_iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}={}", key, tuple[key])?;
                }
                write!(f, "}}")
            }
            MiValue::None => Ok(()),
        }
    }
}

/// GDB/MI output record
#[derive(Debug, Clone, PartialEq)]
pub enum MiOutputRecord {
    Result {
        token: Option<u64>,
        class: ResultClass,
        results: Vec<MiResult>,
    },
    Async {
        token: Option<u64>,
        class: AsyncClass,
        results: Vec<MiResult>,
    },
    Notification {
        class: NotificationClass,
        results: Vec<MiResult>,
    },
    Console(String),
    Target(String),
    Log(String),
}

/// Coarse record kind as seen by the session: exec-async and notify records
/// both report out-of-band state and are grouped together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Result,
    Console,
    Log,
    Notify,
    Target,
}

impl MiOutputRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            MiOutputRecord::Result { .. } => RecordKind::Result,
            MiOutputRecord::Async { .. } | MiOutputRecord::Notification { .. } => {
                RecordKind::Notify
            }
            MiOutputRecord::Console(_) => RecordKind::Console,
            MiOutputRecord::Target(_) => RecordKind::Target,
            MiOutputRecord::Log(_) => RecordKind::Log,
        }
    }

    pub fn token(&self) -> Option<u64> {
        match self {
            MiOutputRecord::Result { token, .. } | MiOutputRecord::Async { token, .. } => *token,
            _ => None,
        }
    }
}

/// GDB/MI result (variable=value pair)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiResult {
    pub variable: String,
    pub value: MiValue,
}

/// Render `a="1",b={c="2"}` the way GDB prints result lists
pub fn format_results(results: &[MiResult]) -> String {
    results
        .iter()
        .map(|r| format!("{}={}", r.variable, r.value))
        .collect::<Vec<_>>()
        .join(",")
}

/// Debugger session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No debugger process, or the process is confirmed gone
    Dead,
    /// Debugger is accepting synchronous commands
    Stopped,
    /// Inferior is executing
    Running,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Dead => "dead",
            SessionState::Stopped => "stopped",
            SessionState::Running => "running",
        };
        f.write_str(name)
    }
}

/// Execution-state change reported by a `*running` / `*stopped` record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Running,
    Stopped,
}

impl SessionState {
    /// Apply a notification outcome. Only `Stopped -> Running` and
    /// `Running -> Stopped` are driven by notifications; death and startup
    /// are handled by the session lifecycle.
    pub fn transition(self, outcome: ExecOutcome) -> SessionState {
        match (self, outcome) {
            (SessionState::Stopped, ExecOutcome::Running) => SessionState::Running,
            (SessionState::Running, ExecOutcome::Stopped) => SessionState::Stopped,
            (state, _) => state,
        }
    }
}

/// Control characters that generate a signal (or EOF) on the inferior terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlSignal {
    #[serde(rename = "sigint")]
    Interrupt,
    #[serde(rename = "eof")]
    EndOfFile,
    #[serde(rename = "sigtstp")]
    Suspend,
}

impl ControlSignal {
    /// Byte used when the terminal does not define one
    pub fn default_byte(self) -> u8 {
        match self {
            ControlSignal::Interrupt => 0x03,
            ControlSignal::EndOfFile => 0x04,
            ControlSignal::Suspend => 0x1a,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sigint" | "int" | "ctrl-c" => Some(ControlSignal::Interrupt),
            "eof" | "ctrl-d" => Some(ControlSignal::EndOfFile),
            "sigtstp" | "tstp" | "ctrl-z" => Some(ControlSignal::Suspend),
            _ => None,
        }
    }
}

/// Public view of a live (or dead) session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHandle {
    pub id: Uuid,
    pub state: SessionState,
    #[serde(default)]
    pub tty: Option<PathBuf>,
    #[serde(default)]
    pub pid: Option<u32>,
}

/// Merged result of one command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    pub command: String,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub state: SessionState,
}

/// Outcome of `execute`
#[derive(Debug, Clone)]
pub enum Execution {
    /// Inferior is running; the command was not sent
    Busy,
    /// Session is dead; the command was not sent
    Closed,
    Completed(CommandOutput),
}

/// Session status plus any out-of-band output picked up while checking it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub session: SessionHandle,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<String>,
}

/// GDB configuration
#[derive(Debug, Clone)]
pub struct GdbConfig {
    pub gdb_path: String,
    pub gdb_args: Vec<String>,
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for GdbConfig {
    fn default() -> Self {
        Self {
            gdb_path: "gdb".to_string(),
            gdb_args: vec!["-q".to_string(), "--interpreter=mi3".to_string()],
            timeout_ms: 5000,
            poll_interval_ms: 1000,
        }
    }
}

impl GdbConfig {
    /// Build a configuration from `MCP_PWNDBG_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str, default: u64| match lookup(key) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!("Ignoring invalid {}={:?}, using {}", key, raw, default);
                default
            }),
            None => default,
        };

        Self {
            gdb_path: lookup("MCP_PWNDBG_GDB")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.gdb_path),
            gdb_args: lookup("MCP_PWNDBG_GDB_ARGS")
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or(defaults.gdb_args),
            timeout_ms: millis("MCP_PWNDBG_TIMEOUT_MS", defaults.timeout_ms),
            poll_interval_ms: millis("MCP_PWNDBG_POLL_MS", defaults.poll_interval_ms),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
