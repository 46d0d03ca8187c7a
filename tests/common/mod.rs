#![allow(dead_code)]

use async_trait::async_trait;
use sandbox_shell::launcher::{ChildProcess, LaunchSpec, LocalLauncher, SandboxLauncher, SpawnedProcess};
use sandbox_shell::{CommandExecutor, SessionConfig, SessionManager};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, DuplexStream, ReadBuf};

/// Config running a plain bash in `dir`.
pub fn bash_config(dir: &Path) -> SessionConfig {
    SessionConfig {
        shell: "bash".to_string(),
        shell_args: vec!["--noprofile".to_string(), "--norc".to_string()],
        host_dir: dir.to_path_buf(),
        sandbox_dir: dir.to_path_buf(),
        exec_timeout: Duration::from_secs(10),
        spawn_grace: Duration::from_millis(100),
        ..SessionConfig::default()
    }
}

/// Counts spawns, delegating to another launcher.
pub struct CountingLauncher {
    inner: Arc<dyn SandboxLauncher>,
    spawns: AtomicUsize,
}

impl CountingLauncher {
    pub fn new(inner: Arc<dyn SandboxLauncher>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            spawns: AtomicUsize::new(0),
        })
    }

    pub fn local() -> Arc<Self> {
        Self::new(Arc::new(LocalLauncher))
    }

    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxLauncher for CountingLauncher {
    async fn spawn(&self, spec: &LaunchSpec) -> io::Result<SpawnedProcess> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        self.inner.spawn(spec).await
    }
}

/// Fails the first `failures` spawns, then behaves like [`LocalLauncher`].
pub struct FlakyLauncher {
    failures: AtomicUsize,
}

impl FlakyLauncher {
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicUsize::new(failures),
        })
    }
}

#[async_trait]
impl SandboxLauncher for FlakyLauncher {
    async fn spawn(&self, spec: &LaunchSpec) -> io::Result<SpawnedProcess> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "sandbox unavailable"));
        }
        LocalLauncher.spawn(spec).await
    }
}

#[derive(Clone, Copy)]
enum FakeStdin {
    Open,
    /// Nobody on the other end: writes fail with `BrokenPipe`.
    Closed,
    /// A one-byte pipe nobody drains: writes block.
    Stuck,
}

/// In-memory process that never prints anything and lives until killed.
/// Runs entirely inside the tokio runtime, so it works under a paused clock.
pub struct FakeLauncher {
    stdin: FakeStdin,
    /// Stdout read fails as soon as anything is written to stdin.
    stdout_fails: bool,
}

impl FakeLauncher {
    pub fn idle() -> Arc<Self> {
        Arc::new(Self {
            stdin: FakeStdin::Open,
            stdout_fails: false,
        })
    }

    pub fn broken_stdin() -> Arc<Self> {
        Arc::new(Self {
            stdin: FakeStdin::Closed,
            stdout_fails: false,
        })
    }

    pub fn stuck_stdin() -> Arc<Self> {
        Arc::new(Self {
            stdin: FakeStdin::Stuck,
            stdout_fails: false,
        })
    }

    pub fn failing_stdout() -> Arc<Self> {
        Arc::new(Self {
            stdin: FakeStdin::Open,
            stdout_fails: true,
        })
    }
}

struct FakeChild {
    killed: bool,
    pipes: Vec<DuplexStream>,
}

#[async_trait]
impl ChildProcess for FakeChild {
    async fn wait(&mut self) -> io::Result<Option<i32>> {
        if self.killed {
            self.pipes.clear();
            return Ok(None);
        }
        std::future::pending().await
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.killed = true;
        Ok(())
    }
}

/// Stdout that breaks once the shell is sent input.
struct TornPipe(DuplexStream);

impl AsyncRead for TornPipe {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut scratch = [0u8; 256];
        let mut input = ReadBuf::new(&mut scratch);
        match Pin::new(&mut self.0).poll_read(cx, &mut input) {
            Poll::Ready(Ok(())) if input.filled().is_empty() => Poll::Ready(Ok(())),
            Poll::Ready(Ok(())) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "stdout torn",
            ))),
            other => other,
        }
    }
}

#[async_trait]
impl SandboxLauncher for FakeLauncher {
    async fn spawn(&self, _spec: &LaunchSpec) -> io::Result<SpawnedProcess> {
        let stdin_size = match self.stdin {
            FakeStdin::Stuck => 1,
            FakeStdin::Open | FakeStdin::Closed => 64 * 1024,
        };
        let (stdin, stdin_peer) = tokio::io::duplex(stdin_size);
        let (stdout_peer, stdout) = tokio::io::duplex(64 * 1024);
        let (stderr_peer, stderr) = tokio::io::duplex(64 * 1024);

        let mut pipes = vec![stdout_peer, stderr_peer];
        let stdout: Box<dyn AsyncRead + Send + Unpin> = if self.stdout_fails {
            Box::new(TornPipe(stdin_peer))
        } else {
            match self.stdin {
                FakeStdin::Closed => drop(stdin_peer),
                FakeStdin::Open | FakeStdin::Stuck => pipes.push(stdin_peer),
            }
            Box::new(stdout)
        };
        Ok(SpawnedProcess {
            pid: None,
            stdin: Box::new(stdin),
            stdout,
            stderr: Box::new(stderr),
            child: Box::new(FakeChild { killed: false, pipes }),
        })
    }
}

pub fn manager(launcher: Arc<dyn SandboxLauncher>, config: SessionConfig) -> SessionManager {
    SessionManager::new(launcher, config)
}

pub fn executor(launcher: Arc<dyn SandboxLauncher>, config: SessionConfig) -> CommandExecutor {
    CommandExecutor::new(SessionManager::new(launcher, config))
}

/// Run until the runtime has nothing left to do. Under a paused clock the
/// sleep only completes once every other task is parked.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
