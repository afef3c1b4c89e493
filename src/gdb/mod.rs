//! GDB (GNU Debugger) session core
//!
//! Drives one pwndbg-enabled GDB over the Machine Interface (MI) and gives the
//! debugged program its own pseudo-terminal.

pub mod classifier;
pub mod error;
pub mod executor;
pub mod parser;
pub mod session;
pub mod terminal;
pub mod types;

pub use error::{SessionError, SessionResult};
pub use session::SessionController;
pub use types::*;
