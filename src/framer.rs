//! Per-command state machine for the two-phase marker protocol.
//!
//! Phase one writes the command followed by an end-marker echo and collects
//! stdout until the marker line shows up. Phase two asks the shell for the
//! saved exit status and reads it off the line preceding the exit marker. The
//! [`Execution`] reducer consumes [`SessionEvent`]s and never touches I/O; the
//! executor drives it.

use crate::error::ShellError;
use crate::scanner::{complete_utf8_len, MarkerScanner, Markers, Scan};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io;
use uuid::Uuid;

/// Exit code reported when a command does not finish before its deadline.
pub const TIMEOUT_EXIT_CODE: i32 = -2;

/// Shell variable holding the command's status between the two phases.
const STATUS_VAR: &str = "__sbx_rc";

/// Outcome of one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellExecResult {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the shell's answer could not be parsed, or the shell was
    /// killed by a signal.
    pub exit_code: Option<i32>,
}

impl ShellExecResult {
    pub fn timed_out(&self) -> bool {
        self.exit_code == Some(TIMEOUT_EXIT_CODE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// What the executor feeds the reducer: reader output, plus the process exit
/// once the supervisor has seen it.
#[derive(Debug)]
pub enum SessionEvent {
    Output { stream: OutputStream, chunk: Vec<u8> },
    Closed(OutputStream),
    Error { stream: OutputStream, message: String },
    /// The process is gone; `None` if it died from a signal.
    Exited(Option<i32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    Sent,
    CapturingOutput,
    AwaitingExitCode,
    Completed,
    TimedOut,
    Failed,
}

impl ExecState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecState::Completed | ExecState::TimedOut | ExecState::Failed)
    }
}

/// What the driver must do after feeding an event.
#[derive(Debug)]
pub enum Step {
    Continue,
    /// The end marker arrived: write [`Execution::exit_request`] to stdin.
    WriteExitRequest,
    /// Stdout closed: stop waiting for markers, wait briefly for the exit
    /// status instead.
    AwaitExit,
    Finished,
}

/// Terminal outcome; the result is built from it exactly once.
#[derive(Debug)]
pub enum Outcome {
    Completed(ShellExecResult),
    TimedOut(ShellExecResult),
    Failed(ShellError),
}

impl Outcome {
    pub fn into_result(self) -> Result<ShellExecResult, ShellError> {
        match self {
            Outcome::Completed(result) | Outcome::TimedOut(result) => Ok(result),
            Outcome::Failed(err) => Err(err),
        }
    }
}

pub struct Execution {
    id: Uuid,
    command: String,
    markers: Markers,
    state: ExecState,
    scanner: MarkerScanner,
    /// Markers of earlier timed-out commands still due on stdout. Everything
    /// up to the last of them belongs to those commands.
    stale: VecDeque<String>,
    /// Markers this execution leaves outstanding when it times out.
    leftover: Vec<String>,
    output_limit: usize,
    stdout: Option<String>,
    stderr: String,
    stderr_carry: Vec<u8>,
    stderr_dropped: usize,
    stdout_closed: bool,
    outcome: Option<Outcome>,
}

impl Execution {
    pub fn new(command: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            command: command.into(),
            markers: Markers::new(&id),
            state: ExecState::Sent,
            scanner: MarkerScanner::new(),
            stale: VecDeque::new(),
            leftover: Vec::new(),
            output_limit: usize::MAX,
            stdout: None,
            stderr: String::new(),
            stderr_carry: Vec::new(),
            stderr_dropped: 0,
            stdout_closed: false,
            outcome: None,
        }
    }

    /// Keep at most `limit` bytes of each stream, dropping the oldest.
    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self.scanner = MarkerScanner::with_limit(limit);
        self
    }

    /// Skip stdout (and drop stderr) until these markers have gone by.
    pub fn with_stale_markers(mut self, markers: Vec<String>) -> Self {
        self.stale = markers.into();
        self
    }

    /// Markers still due on the session's stdout once this execution has
    /// timed out. Empty for any other outcome.
    pub fn take_outstanding_markers(&mut self) -> Vec<String> {
        std::mem::take(&mut self.leftover)
    }

    pub fn id(&self) -> &Uuid {
        &self.id
    }

    pub fn state(&self) -> ExecState {
        self.state
    }

    pub fn markers(&self) -> &Markers {
        &self.markers
    }

    /// Bytes for phase one: the command, then save its status and echo the
    /// end marker.
    pub fn command_script(&self) -> String {
        let mut script = self.command.clone();
        if !script.ends_with('\n') {
            script.push('\n');
        }
        script.push_str(&format!("{}=$?; echo \"{}\"\n", STATUS_VAR, self.markers.end));
        script
    }

    /// Bytes for phase two: print the saved status, then the exit marker.
    pub fn exit_request(&self) -> String {
        format!(
            "echo \"${}\"; unset {}; echo \"{}\"\n",
            STATUS_VAR, STATUS_VAR, self.markers.exit
        )
    }

    /// Stdin accepted the command script.
    pub fn on_command_written(&mut self) {
        if self.state == ExecState::Sent {
            self.state = ExecState::CapturingOutput;
        }
    }

    /// Stdin accepted the exit request. Stdout that arrived in between is
    /// already buffered, so scan it right away.
    pub fn on_exit_request_written(&mut self) -> Step {
        if self.state != ExecState::AwaitingExitCode {
            return Step::Continue;
        }
        self.scan_exit_code()
    }

    /// Feed one session event through the state machine. `emit` receives
    /// stream deltas destined for the caller.
    pub fn on_event(&mut self, event: SessionEvent, emit: &mut dyn FnMut(OutputStream, &str)) -> Step {
        if self.state.is_terminal() {
            return Step::Finished;
        }
        match event {
            SessionEvent::Output {
                stream: OutputStream::Stderr,
                ..
            } if !self.stale.is_empty() => Step::Continue,
            SessionEvent::Output {
                stream: OutputStream::Stderr,
                chunk,
            } => {
                self.stderr_carry.extend_from_slice(&chunk);
                let complete = complete_utf8_len(&self.stderr_carry);
                if complete > 0 {
                    let text = String::from_utf8_lossy(&self.stderr_carry[..complete]).into_owned();
                    self.stderr_carry.drain(..complete);
                    emit(OutputStream::Stderr, &text);
                    self.stderr.push_str(&text);
                    self.stderr_dropped += keep_tail(&mut self.stderr, self.output_limit);
                }
                Step::Continue
            }
            SessionEvent::Output {
                stream: OutputStream::Stdout,
                chunk,
            } => {
                self.scanner.push(&chunk);
                match self.state {
                    ExecState::Sent | ExecState::CapturingOutput => {
                        if self.skip_stale() {
                            self.scan_end(emit)
                        } else {
                            Step::Continue
                        }
                    }
                    ExecState::AwaitingExitCode => self.scan_exit_code(),
                    _ => Step::Finished,
                }
            }
            SessionEvent::Closed(OutputStream::Stderr) => Step::Continue,
            SessionEvent::Closed(OutputStream::Stdout) => {
                self.stdout_closed = true;
                Step::AwaitExit
            }
            SessionEvent::Error { stream, message } => {
                self.fail(ShellError::Stream(format!("{} read failed: {}", stream.as_str(), message)));
                Step::Finished
            }
            SessionEvent::Exited(Some(code)) => {
                self.complete(Some(code));
                Step::Finished
            }
            SessionEvent::Exited(None) => {
                self.fail(ShellError::Stream("shell was killed".to_string()));
                Step::Finished
            }
        }
    }

    /// The deadline passed with no terminal event.
    pub fn on_timeout(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        if self.stdout_closed {
            self.fail(ShellError::Stream("shell stdout closed".to_string()));
            return;
        }
        let result = self.snapshot(Some(TIMEOUT_EXIT_CODE));
        self.leftover = self.stale.drain(..).collect();
        match self.state {
            ExecState::CapturingOutput => self.leftover.push(self.markers.end.clone()),
            ExecState::AwaitingExitCode => self.leftover.push(self.markers.exit.clone()),
            _ => {}
        }
        self.state = ExecState::TimedOut;
        self.outcome = Some(Outcome::TimedOut(result));
    }

    /// The event channel ended without an exit status.
    pub fn on_disconnect(&mut self) {
        self.fail(ShellError::Stream("session event channel closed".to_string()));
    }

    /// Stdin refused a write.
    pub fn on_write_error(&mut self, err: io::Error) {
        self.fail(ShellError::StdinWrite(err));
    }

    /// The deadline passed mid-write. Part of the script may already sit in
    /// the shell's input, so the session cannot be reused.
    pub fn on_write_timeout(&mut self) {
        self.fail(ShellError::StdinWrite(io::Error::new(
            io::ErrorKind::TimedOut,
            "timed out writing to shell stdin",
        )));
    }

    /// Take the terminal outcome. Only ever `Some` once.
    pub fn take_outcome(&mut self) -> Option<Outcome> {
        self.outcome.take()
    }

    /// Consume stdout owed to earlier commands. True once none is left.
    fn skip_stale(&mut self) -> bool {
        while let Some(marker) = self.stale.front() {
            match self.scanner.scan(marker) {
                Scan::Pending { .. } => return false,
                Scan::Found { .. } => {
                    self.stale.pop_front();
                    self.scanner.take_dropped();
                }
            }
        }
        true
    }

    fn scan_end(&mut self, emit: &mut dyn FnMut(OutputStream, &str)) -> Step {
        match self.scanner.scan(&self.markers.end) {
            Scan::Pending { ready } => {
                if !ready.is_empty() {
                    emit(OutputStream::Stdout, &String::from_utf8_lossy(&ready));
                }
                Step::Continue
            }
            Scan::Found { before, ready } => {
                if !ready.is_empty() {
                    emit(OutputStream::Stdout, &String::from_utf8_lossy(&ready));
                }
                self.stdout = Some(self.captured_stdout(&before));
                self.state = ExecState::AwaitingExitCode;
                Step::WriteExitRequest
            }
        }
    }

    fn scan_exit_code(&mut self) -> Step {
        match self.scanner.scan(&self.markers.exit) {
            Scan::Pending { .. } => Step::Continue,
            Scan::Found { before, .. } => {
                let text = String::from_utf8_lossy(&before);
                self.complete(parse_exit_code(&text));
                Step::Finished
            }
        }
    }

    fn captured_stdout(&mut self, bytes: &[u8]) -> String {
        let text = String::from_utf8_lossy(bytes);
        with_omission_note(self.scanner.take_dropped(), text.trim())
    }

    fn snapshot(&mut self, exit_code: Option<i32>) -> ShellExecResult {
        let stdout = match self.stdout.take() {
            Some(stdout) => stdout,
            // Whatever is buffered still belongs to an earlier command.
            None if !self.stale.is_empty() => String::new(),
            None => {
                let bytes = self.scanner.take_all();
                self.captured_stdout(&bytes)
            }
        };
        if !self.stderr_carry.is_empty() {
            self.stderr.push_str(&String::from_utf8_lossy(&self.stderr_carry));
            self.stderr_carry.clear();
        }
        let stderr = std::mem::take(&mut self.stderr);
        ShellExecResult {
            stdout,
            stderr: with_omission_note(std::mem::take(&mut self.stderr_dropped), &stderr),
            exit_code,
        }
    }

    fn complete(&mut self, exit_code: Option<i32>) {
        let result = self.snapshot(exit_code);
        self.state = ExecState::Completed;
        self.outcome = Some(Outcome::Completed(result));
    }

    fn fail(&mut self, err: ShellError) {
        if self.state.is_terminal() {
            return;
        }
        self.state = ExecState::Failed;
        self.outcome = Some(Outcome::Failed(err));
    }
}

fn with_omission_note(dropped: usize, text: &str) -> String {
    if dropped == 0 {
        text.to_string()
    } else {
        format!("[{} bytes of earlier output omitted]\n{}", dropped, text)
    }
}

/// Drop characters from the front of `text` until it fits in `limit` bytes.
/// Returns how many bytes went.
fn keep_tail(text: &mut String, limit: usize) -> usize {
    if text.len() <= limit {
        return 0;
    }
    let mut cut = text.len() - limit;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    text.drain(..cut);
    cut
}

/// The exit status is the last non-empty line before the exit marker.
fn parse_exit_code(text: &str) -> Option<i32> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdout(chunk: &str) -> SessionEvent {
        SessionEvent::Output {
            stream: OutputStream::Stdout,
            chunk: chunk.as_bytes().to_vec(),
        }
    }

    fn stderr(chunk: &str) -> SessionEvent {
        SessionEvent::Output {
            stream: OutputStream::Stderr,
            chunk: chunk.as_bytes().to_vec(),
        }
    }

    fn ignore(_: OutputStream, _: &str) {}

    #[test]
    fn full_cycle_completes_with_exit_code() {
        let mut exec = Execution::new("echo hello");
        let end = exec.markers().end.clone();
        let exit = exec.markers().exit.clone();
        let mut deltas = Vec::new();
        let mut emit = |s: OutputStream, c: &str| deltas.push((s, c.to_string()));

        exec.on_command_written();
        assert_eq!(exec.state(), ExecState::CapturingOutput);
        assert!(matches!(exec.on_event(stdout("hello\n"), &mut emit), Step::Continue));
        let step = exec.on_event(stdout(&format!("{}\n", end)), &mut emit);
        assert!(matches!(step, Step::WriteExitRequest));
        assert_eq!(exec.state(), ExecState::AwaitingExitCode);
        assert!(matches!(exec.on_exit_request_written(), Step::Continue));
        let step = exec.on_event(stdout(&format!("0\n{}\n", exit)), &mut emit);
        assert!(matches!(step, Step::Finished));
        assert_eq!(exec.state(), ExecState::Completed);

        let result = exec.take_outcome().unwrap().into_result().unwrap();
        assert_eq!(result.stdout, "hello");
        assert_eq!(result.exit_code, Some(0));
        assert!(exec.take_outcome().is_none());
        assert_eq!(deltas, vec![(OutputStream::Stdout, "hello\n".to_string())]);
    }

    #[test]
    fn exit_code_already_buffered_when_request_lands() {
        let mut exec = Execution::new("true");
        let mut emit = ignore;
        let burst = format!("{}\n3\n{}\n", exec.markers().end, exec.markers().exit);
        exec.on_command_written();
        assert!(matches!(exec.on_event(stdout(&burst), &mut emit), Step::WriteExitRequest));
        assert!(matches!(exec.on_exit_request_written(), Step::Finished));
        let result = exec.take_outcome().unwrap().into_result().unwrap();
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stdout, "");
    }

    #[test]
    fn unparsable_exit_code_is_none() {
        let mut exec = Execution::new("true");
        let mut emit = ignore;
        let burst = format!("ok\n{}\nnot-a-number\n{}\n", exec.markers().end, exec.markers().exit);
        exec.on_command_written();
        exec.on_event(stdout(&burst), &mut emit);
        exec.on_exit_request_written();
        let result = exec.take_outcome().unwrap().into_result().unwrap();
        assert_eq!(result.stdout, "ok");
        assert_eq!(result.exit_code, None);
    }

    #[test]
    fn timeout_returns_partial_output() {
        let mut exec = Execution::new("sleep 100");
        let mut emit = ignore;
        exec.on_command_written();
        exec.on_event(stdout("partial\n"), &mut emit);
        exec.on_event(stderr("warn\n"), &mut emit);
        exec.on_timeout();
        assert_eq!(exec.state(), ExecState::TimedOut);
        let result = exec.take_outcome().unwrap().into_result().unwrap();
        assert_eq!(result.stdout, "partial");
        assert_eq!(result.stderr, "warn\n");
        assert!(result.timed_out());
    }

    #[test]
    fn shell_exit_completes_with_process_status() {
        let mut exec = Execution::new("exit 7");
        let mut emit = ignore;
        exec.on_command_written();
        assert!(matches!(exec.on_event(SessionEvent::Closed(OutputStream::Stdout), &mut emit), Step::AwaitExit));
        assert!(matches!(exec.on_event(SessionEvent::Exited(Some(7)), &mut emit), Step::Finished));
        let result = exec.take_outcome().unwrap().into_result().unwrap();
        assert_eq!(result.stdout, "");
        assert_eq!(result.exit_code, Some(7));
    }

    #[test]
    fn killed_shell_fails_with_stream_error() {
        let mut exec = Execution::new("sleep 100");
        let mut emit = ignore;
        exec.on_command_written();
        exec.on_event(SessionEvent::Exited(None), &mut emit);
        assert_eq!(exec.state(), ExecState::Failed);
        let err = exec.take_outcome().unwrap().into_result().unwrap_err();
        assert!(matches!(err, ShellError::Stream(_)));
    }

    #[test]
    fn closed_stdout_without_exit_fails_on_deadline() {
        let mut exec = Execution::new("exec 1>&-");
        let mut emit = ignore;
        exec.on_command_written();
        exec.on_event(SessionEvent::Closed(OutputStream::Stdout), &mut emit);
        exec.on_timeout();
        assert_eq!(exec.state(), ExecState::Failed);
    }

    #[test]
    fn only_one_terminal_transition() {
        let mut exec = Execution::new("true");
        let mut emit = ignore;
        exec.on_command_written();
        exec.on_timeout();
        assert!(matches!(exec.on_event(SessionEvent::Exited(Some(1)), &mut emit), Step::Finished));
        exec.on_write_error(std::io::Error::other("late"));
        assert_eq!(exec.state(), ExecState::TimedOut);
        assert!(exec.take_outcome().unwrap().into_result().is_ok());
        assert!(exec.take_outcome().is_none());
    }

    #[test]
    fn stale_output_is_skipped_up_to_the_old_markers() {
        let mut exec = Execution::new("echo next")
            .with_stale_markers(vec!["__CMD_END_old__".to_string(), "__CMD_EXIT_older__".to_string()]);
        let end = exec.markers().end.clone();
        let mut deltas = Vec::new();
        let mut emit = |s: OutputStream, c: &str| deltas.push((s, c.to_string()));

        exec.on_command_written();
        exec.on_event(stdout("late\n__CMD_END_old__\n"), &mut emit);
        exec.on_event(stderr("late warning\n"), &mut emit);
        exec.on_event(stdout("0\n__CMD_EXIT_older__\nnext\n"), &mut emit);
        let step = exec.on_event(stdout(&format!("{}\n", end)), &mut emit);
        assert!(matches!(step, Step::WriteExitRequest));
        assert_eq!(deltas, vec![(OutputStream::Stdout, "next\n".to_string())]);

        exec.on_timeout();
        let result = exec.take_outcome().unwrap().into_result().unwrap();
        assert_eq!(result.stdout, "next");
        assert_eq!(result.stderr, "");
        assert_eq!(exec.take_outstanding_markers(), vec![exec.markers().exit.clone()]);
    }

    #[test]
    fn timeout_while_skipping_keeps_every_marker_outstanding() {
        let mut exec = Execution::new("echo next").with_stale_markers(vec!["__CMD_END_old__".to_string()]);
        let end = exec.markers().end.clone();
        let mut emit = ignore;
        exec.on_command_written();
        exec.on_event(stdout("still the old command\n"), &mut emit);
        exec.on_timeout();

        let result = exec.take_outcome().unwrap().into_result().unwrap();
        assert_eq!(result.stdout, "");
        assert!(result.timed_out());
        assert_eq!(exec.take_outstanding_markers(), vec!["__CMD_END_old__".to_string(), end]);
    }

    #[test]
    fn completed_execution_leaves_nothing_outstanding() {
        let mut exec = Execution::new("true");
        let mut emit = ignore;
        let burst = format!("{}\n0\n{}\n", exec.markers().end, exec.markers().exit);
        exec.on_command_written();
        exec.on_event(stdout(&burst), &mut emit);
        exec.on_exit_request_written();
        assert_eq!(exec.state(), ExecState::Completed);
        assert!(exec.take_outstanding_markers().is_empty());
    }

    #[test]
    fn output_limit_keeps_the_tail_of_both_streams() {
        let mut exec = Execution::new("noisy").with_output_limit(16);
        let end = exec.markers().end.clone();
        let mut emit = ignore;
        exec.on_command_written();
        for i in 0..10 {
            exec.on_event(stdout(&format!("line {}\n", i)), &mut emit);
            exec.on_event(stderr(&format!("warn {}\n", i)), &mut emit);
        }
        exec.on_event(stdout(&format!("{}\n", end)), &mut emit);
        exec.on_timeout();

        let result = exec.take_outcome().unwrap().into_result().unwrap();
        assert!(result.stdout.starts_with("["), "stdout: {:?}", result.stdout);
        assert!(result.stdout.contains("bytes of earlier output omitted"));
        assert!(result.stdout.ends_with("line 9"), "stdout: {:?}", result.stdout);
        assert!(result.stderr.contains("bytes of earlier output omitted"));
        assert!(result.stderr.ends_with("warn 8\nwarn 9\n"), "stderr: {:?}", result.stderr);
    }

    #[test]
    fn write_timeout_is_a_stdin_failure() {
        let mut exec = Execution::new("true");
        exec.on_write_timeout();
        assert_eq!(exec.state(), ExecState::Failed);
        let err = exec.take_outcome().unwrap().into_result().unwrap_err();
        assert!(matches!(err, ShellError::StdinWrite(_)));
        assert!(err.is_session_fatal());
        assert!(exec.take_outstanding_markers().is_empty());
    }

    #[test]
    fn command_script_saves_status_before_marker() {
        let exec = Execution::new("ls");
        let script = exec.command_script();
        assert!(script.starts_with("ls\n__sbx_rc=$?; echo \"__CMD_END_"));
        assert!(exec.exit_request().starts_with("echo \"$__sbx_rc\"; unset __sbx_rc; echo \"__CMD_EXIT_"));
    }

    #[test]
    fn parse_exit_code_takes_last_line() {
        assert_eq!(parse_exit_code("\n0\n"), Some(0));
        assert_eq!(parse_exit_code("stray\n127\n"), Some(127));
        assert_eq!(parse_exit_code(""), None);
        assert_eq!(parse_exit_code("abc"), None);
    }
}
