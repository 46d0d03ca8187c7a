//! Process factory seam between the session manager and the sandbox.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::info;

/// What to launch for a new session.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Session directory on the host. Already exists when `spawn` is called.
    pub host_dir: PathBuf,
    /// The same directory as seen from inside the sandbox.
    pub sandbox_dir: PathBuf,
}

/// Handle on a launched process, used by the session's exit supervisor.
#[async_trait]
pub trait ChildProcess: Send {
    /// Wait for the process to exit. `None` means it was killed by a signal.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Ask the process to die without waiting for it.
    fn start_kill(&mut self) -> io::Result<()>;
}

/// A process with piped stdio.
pub struct SpawnedProcess {
    pub pid: Option<u32>,
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
    pub child: Box<dyn ChildProcess>,
}

impl std::fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedProcess").field("pid", &self.pid).finish_non_exhaustive()
    }
}

/// Spawns the long-lived shell a session runs on. All isolation is the
/// launcher's business; the session only sees stdio and a child handle.
#[async_trait]
pub trait SandboxLauncher: Send + Sync {
    async fn spawn(&self, spec: &LaunchSpec) -> io::Result<SpawnedProcess>;

    /// Release anything the launcher set up for a session that has ended.
    async fn release(&self, _spec: &LaunchSpec) {}
}

#[async_trait]
impl ChildProcess for Child {
    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let status = Child::wait(self).await?;
        Ok(status.code())
    }

    fn start_kill(&mut self) -> io::Result<()> {
        Child::start_kill(self)
    }
}

/// Turn a tokio child with all three pipes into a [`SpawnedProcess`].
pub(crate) fn from_tokio_child(mut child: Child) -> io::Result<SpawnedProcess> {
    let pipe = |name: &str| io::Error::new(io::ErrorKind::BrokenPipe, format!("{} not piped", name));
    let stdin = child.stdin.take().ok_or_else(|| pipe("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| pipe("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| pipe("stderr"))?;
    Ok(SpawnedProcess {
        pid: child.id(),
        stdin: Box::new(stdin),
        stdout: Box::new(stdout),
        stderr: Box::new(stderr),
        child: Box::new(child),
    })
}

/// Runs the shell directly on the host, in the session directory. No
/// isolation at all: for development and tests.
#[derive(Debug, Default, Clone)]
pub struct LocalLauncher;

#[async_trait]
impl SandboxLauncher for LocalLauncher {
    async fn spawn(&self, spec: &LaunchSpec) -> io::Result<SpawnedProcess> {
        info!(program = %spec.program, cwd = ?spec.host_dir, "Spawning local shell");
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(&spec.env)
            .current_dir(&spec.host_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        from_tokio_child(child)
    }
}
