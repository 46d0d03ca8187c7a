//! Runs commands against the shared session.

use crate::error::ShellError;
use crate::framer::{Execution, Outcome, OutputStream, SessionEvent, ShellExecResult, Step};
use crate::session::{ProcessStatus, SessionIo, SessionManager};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

/// The tool-facing entry point: one command in, one [`ShellExecResult`] out.
#[derive(Clone)]
pub struct CommandExecutor {
    manager: SessionManager,
}

impl CommandExecutor {
    pub fn new(manager: SessionManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Run `command` with the configured timeout. `on_output_delta` sees
    /// output as it arrives, tagged by stream.
    pub async fn execute<F>(&self, command: &str, on_output_delta: F) -> Result<ShellExecResult, ShellError>
    where
        F: FnMut(OutputStream, &str) + Send,
    {
        let timeout = self.manager.config().exec_timeout;
        self.execute_with_timeout(command, timeout, on_output_delta).await
    }

    pub async fn execute_with_timeout<F>(
        &self,
        command: &str,
        timeout: Duration,
        mut on_output_delta: F,
    ) -> Result<ShellExecResult, ShellError>
    where
        F: FnMut(OutputStream, &str) + Send,
    {
        let lease = self.manager.checkout().await?;
        let mut io = lease.lock_io().await;
        lease.touch();

        let config = self.manager.config();
        let stale = io.discard_stale();
        let mut exec = Execution::new(command)
            .with_output_limit(config.max_output_bytes)
            .with_stale_markers(std::mem::take(&mut io.outstanding));
        debug!(session_id = %lease.id(), execution_id = %exec.id(), command, "Executing command");

        let outcome = match stale {
            Ok(discarded) => {
                if discarded > 0 {
                    debug!(execution_id = %exec.id(), discarded, "Discarded stale session output");
                }
                let deadline = Instant::now() + timeout;
                drive(&mut exec, &mut io, deadline, config.exit_grace, &mut on_output_delta).await
            }
            Err(err) => Outcome::Failed(err),
        };
        io.outstanding = exec.take_outstanding_markers();
        drop(io);

        match &outcome {
            Outcome::Completed(result) => {
                info!(execution_id = %exec.id(), exit_code = ?result.exit_code, "Command completed");
            }
            Outcome::TimedOut(result) => {
                warn!(
                    execution_id = %exec.id(),
                    timeout_ms = timeout.as_millis() as u64,
                    stdout_len = result.stdout.len(),
                    "Command timed out"
                );
            }
            Outcome::Failed(err) => {
                warn!(execution_id = %exec.id(), error = %err, "Command failed");
                if err.is_session_fatal() {
                    self.manager.invalidate(&lease).await;
                }
            }
        }
        outcome.into_result()
    }
}

enum Wake {
    Exited(Option<i32>),
    Event(Option<SessionEvent>),
    Deadline,
}

/// Push one execution through both protocol phases.
async fn drive(
    exec: &mut Execution,
    io: &mut SessionIo,
    mut deadline: Instant,
    exit_grace: Duration,
    emit: &mut (dyn FnMut(OutputStream, &str) + Send),
) -> Outcome {
    match timeout_at(deadline, write_script(&mut io.stdin, &exec.command_script())).await {
        Ok(Ok(())) => exec.on_command_written(),
        Ok(Err(e)) => exec.on_write_error(e),
        Err(_) => exec.on_write_timeout(),
    }

    // Exit status of a shell that left on its own. Held back until stdout
    // has been drained, so output queued ahead of the exit still counts.
    let mut exited: Option<Option<i32>> = None;
    let mut stdout_closed = false;
    let mut readers_done = false;
    loop {
        if let Some(outcome) = exec.take_outcome() {
            return outcome;
        }

        let wake = tokio::select! {
            biased;
            code = wait_for_exit(&mut io.status), if exited.is_none() => Wake::Exited(code),
            event = io.events.recv(), if !readers_done => Wake::Event(event),
            _ = sleep_until(deadline) => Wake::Deadline,
        };

        match wake {
            // Killed: nothing more worth waiting for.
            Wake::Exited(None) => {
                exec.on_event(SessionEvent::Exited(None), &mut *emit);
            }
            Wake::Exited(Some(code)) if stdout_closed => {
                exec.on_event(SessionEvent::Exited(Some(code)), &mut *emit);
            }
            Wake::Exited(Some(code)) => {
                exited = Some(Some(code));
                deadline = deadline.min(Instant::now() + exit_grace);
            }
            // Both pipes are done; the exit status may still be on its way.
            Wake::Event(None) => match exited {
                Some(code) => {
                    exec.on_event(SessionEvent::Exited(code), &mut *emit);
                }
                None => {
                    readers_done = true;
                    deadline = deadline.min(Instant::now() + exit_grace);
                }
            },
            Wake::Event(Some(event)) => match exec.on_event(event, &mut *emit) {
                Step::WriteExitRequest => {
                    match timeout_at(deadline, write_script(&mut io.stdin, &exec.exit_request())).await {
                        Ok(Ok(())) => {
                            exec.on_exit_request_written();
                        }
                        Ok(Err(e)) => exec.on_write_error(e),
                        Err(_) => exec.on_write_timeout(),
                    }
                }
                Step::AwaitExit => {
                    stdout_closed = true;
                    match exited {
                        Some(code) => {
                            exec.on_event(SessionEvent::Exited(code), &mut *emit);
                        }
                        None => deadline = deadline.min(Instant::now() + exit_grace),
                    }
                }
                Step::Continue | Step::Finished => {}
            },
            Wake::Deadline => match exited {
                Some(code) => {
                    exec.on_event(SessionEvent::Exited(code), &mut *emit);
                }
                None if readers_done => exec.on_disconnect(),
                None => exec.on_timeout(),
            },
        }
    }
}

/// Resolves once the supervisor has seen the process exit.
async fn wait_for_exit(status: &mut watch::Receiver<ProcessStatus>) -> Option<i32> {
    match status.wait_for(|s| *s != ProcessStatus::Running).await {
        Ok(status) => match *status {
            ProcessStatus::Exited(code) => code,
            ProcessStatus::Running => None,
        },
        // The session itself is gone.
        Err(_) => None,
    }
}

async fn write_script<W>(stdin: &mut W, script: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    stdin.write_all(script.as_bytes()).await?;
    stdin.flush().await
}
