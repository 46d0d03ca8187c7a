//! sandbox-shell - one persistent sandboxed shell, shared by agent tool calls.
//!
//! Commands are framed over the shell's stdin/stdout with per-command random
//! markers, so `cd`, exported variables and files survive between calls. The
//! session is spawned on first use, reaped when idle and respawned after it
//! dies.

pub mod config;
pub mod error;
pub mod executor;
pub mod framer;
pub mod http_server;
pub mod launcher;
mod reaper;
#[cfg(target_os = "linux")]
pub mod sandbox;
pub mod scanner;
pub mod session;
pub mod state;

pub use config::SessionConfig;
pub use error::ShellError;
pub use executor::CommandExecutor;
pub use framer::{OutputStream, ShellExecResult, TIMEOUT_EXIT_CODE};
pub use launcher::{LaunchSpec, LocalLauncher, SandboxLauncher};
pub use session::{Session, SessionManager, SessionState};
