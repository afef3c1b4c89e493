//! Session error types

use thiserror::Error;

/// Errors raised by the debugger session.
///
/// Busy targets, missing output and GDB `^error` results are not errors;
/// they are reported through `Execution`, `Option` and `CommandOutput`.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to launch debugger `{path}`: {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("debugger failed during startup: {0}")]
    Startup(String),

    #[error("terminal error: {0}")]
    Terminal(#[from] nix::Error),

    #[error("{0} is not available, the debugger session is not running")]
    Unavailable(&'static str),

    #[error("debugger worker has shut down")]
    WorkerGone,

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;
