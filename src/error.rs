//! Error types for session management and command execution.

use std::io;

/// Errors surfaced to callers of the executor and the session manager.
///
/// Timeouts and unparsable exit codes are not errors: they come back as a
/// partial [`ShellExecResult`](crate::framer::ShellExecResult).
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    /// The session process could not be brought up. The manager's slot is
    /// left empty, so the next call retries from scratch.
    #[error("failed to start shell session: {reason}")]
    SessionInit {
        reason: String,
        #[source]
        source: Option<io::Error>,
    },

    /// Writing the command to the shell's stdin failed.
    #[error("failed to write to shell stdin: {0}")]
    StdinWrite(#[source] io::Error),

    /// The shell's output pipes errored or closed underneath a command.
    #[error("shell stream failed: {0}")]
    Stream(String),
}

impl ShellError {
    pub(crate) fn init(reason: impl Into<String>) -> Self {
        ShellError::SessionInit {
            reason: reason.into(),
            source: None,
        }
    }

    pub(crate) fn init_io(reason: impl Into<String>, source: io::Error) -> Self {
        ShellError::SessionInit {
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Whether the session's streams can no longer be trusted and the
    /// process has to be replaced.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, ShellError::StdinWrite(_) | ShellError::Stream(_))
    }
}
