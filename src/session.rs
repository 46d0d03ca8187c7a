//! The shell session and the manager that owns it.
//!
//! A [`SessionManager`] holds at most one live [`Session`]: a long-running
//! shell with piped stdio. The session is spawned lazily on first use, shared
//! by every caller, and torn down on reset, idle timeout, process exit, stream
//! failure or shutdown. Two reader tasks feed the session's bounded event
//! channel and an exit supervisor publishes the process status; the executor
//! drains both one command at a time. Nobody reads between commands, so a
//! chatty background process stalls on a full pipe instead of filling memory.

use crate::config::SessionConfig;
use crate::error::ShellError;
use crate::framer::{OutputStream, SessionEvent};
use crate::launcher::{ChildProcess, LaunchSpec, SandboxLauncher, SpawnedProcess};
use crate::reaper;
use serde::Serialize;
use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

const READ_BUF_SIZE: usize = 8192;
/// Chunks buffered between a reader task and the executor.
const EVENT_BUFFER: usize = 64;
const SHUTDOWN_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Ready,
    Terminating,
    Dead,
}

/// Whether the shell process is still around, as seen by its supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessStatus {
    Running,
    /// `None` if it died from a signal.
    Exited(Option<i32>),
}

/// The stdio end of a session, guarded by the session's command lock.
pub(crate) struct SessionIo {
    pub(crate) stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub(crate) events: mpsc::Receiver<SessionEvent>,
    pub(crate) status: watch::Receiver<ProcessStatus>,
    /// Markers of timed-out commands that the shell has yet to print. The
    /// next command's stdout starts after the last of them.
    pub(crate) outstanding: Vec<String>,
}

impl SessionIo {
    /// Drop events left over from an earlier command (late output of a
    /// background job). Fails if the process is already gone. Output owed to
    /// a timed-out command is left for the next execution to skip, since it
    /// carries the markers.
    pub(crate) fn discard_stale(&mut self) -> Result<usize, ShellError> {
        if let ProcessStatus::Exited(code) = *self.status.borrow() {
            return Err(ShellError::Stream(format!("shell exited between commands ({:?})", code)));
        }
        if !self.outstanding.is_empty() {
            return Ok(0);
        }
        let mut discarded = 0;
        while let Ok(event) = self.events.try_recv() {
            match event {
                SessionEvent::Output { .. } | SessionEvent::Closed(OutputStream::Stderr) => discarded += 1,
                SessionEvent::Closed(OutputStream::Stdout) => {
                    return Err(ShellError::Stream("shell stdout closed between commands".to_string()))
                }
                SessionEvent::Error { stream, message } => {
                    return Err(ShellError::Stream(format!("{} read failed: {}", stream.as_str(), message)))
                }
                SessionEvent::Exited(code) => {
                    return Err(ShellError::Stream(format!("shell exited between commands ({:?})", code)))
                }
            }
        }
        Ok(discarded)
    }
}

/// One running shell process.
pub struct Session {
    id: Uuid,
    pid: Option<u32>,
    spec: LaunchSpec,
    created_at: Instant,
    /// Milliseconds after `created_at` of the last command start or finish.
    last_activity_ms: AtomicU64,
    /// Callers holding a lease: running or queued commands.
    inflight: AtomicUsize,
    state: watch::Sender<SessionState>,
    status: watch::Sender<ProcessStatus>,
    kill: Notify,
    io: Mutex<SessionIo>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Serializable snapshot of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub pid: Option<u32>,
    pub state: SessionState,
    pub host_dir: String,
    pub sandbox_dir: String,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub busy: bool,
}

impl Session {
    fn new(
        spec: LaunchSpec,
        pid: Option<u32>,
        stdin: Box<dyn AsyncWrite + Send + Unpin>,
        events: mpsc::Receiver<SessionEvent>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Starting);
        let (status, status_rx) = watch::channel(ProcessStatus::Running);
        let io = SessionIo {
            stdin,
            events,
            status: status_rx,
            outstanding: Vec::new(),
        };
        Self {
            id: Uuid::new_v4(),
            pid,
            spec,
            created_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            inflight: AtomicUsize::new(0),
            state,
            status,
            kill: Notify::new(),
            io: Mutex::new(io),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn host_dir(&self) -> &Path {
        &self.spec.host_dir
    }

    pub fn sandbox_dir(&self) -> &Path {
        &self.spec.sandbox_dir
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_alive(&self) -> bool {
        matches!(self.state(), SessionState::Starting | SessionState::Ready)
    }

    pub fn is_busy(&self) -> bool {
        self.inflight.load(Ordering::SeqCst) > 0
    }

    pub fn last_activity(&self) -> Instant {
        self.created_at + Duration::from_millis(self.last_activity_ms.load(Ordering::SeqCst))
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_activity())
    }

    pub(crate) fn touch(&self) {
        let elapsed = Instant::now().saturating_duration_since(self.created_at);
        self.last_activity_ms.fetch_max(elapsed.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) async fn lock_io(&self) -> MutexGuard<'_, SessionIo> {
        self.io.lock().await
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.to_string(),
            pid: self.pid,
            state: self.state(),
            host_dir: self.spec.host_dir.display().to_string(),
            sandbox_dir: self.spec.sandbox_dir.display().to_string(),
            age_secs: Instant::now().saturating_duration_since(self.created_at).as_secs(),
            idle_secs: self.idle_for().as_secs(),
            busy: self.is_busy(),
        }
    }

    /// Ask the supervisor to kill the process. Returns whether the session
    /// was still alive.
    fn kill(&self) -> bool {
        let was_alive = self.state.send_if_modified(|state| {
            if matches!(*state, SessionState::Starting | SessionState::Ready) {
                *state = SessionState::Terminating;
                true
            } else {
                false
            }
        });
        if was_alive {
            self.kill.notify_one();
        }
        was_alive
    }

    /// Wait until the process is reaped, or `timeout` passes.
    pub async fn wait_dead(&self, timeout: Duration) -> bool {
        let mut state = self.state.subscribe();
        let finished = tokio::time::timeout(timeout, state.wait_for(|s| *s == SessionState::Dead))
            .await
            .is_ok();
        finished
    }
}

/// A checked-out session. While any lease is held the session counts as busy
/// and the idle reaper leaves it alone.
pub struct SessionLease {
    session: Arc<Session>,
}

impl SessionLease {
    fn new(session: Arc<Session>) -> Self {
        session.inflight.fetch_add(1, Ordering::SeqCst);
        session.touch();
        Self { session }
    }
}

impl Deref for SessionLease {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.session.touch();
        self.session.inflight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Result of one idle check.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReapCheck {
    Keep,
    Reaped,
    /// The session the reaper was started for no longer occupies the slot.
    Gone,
}

#[derive(Default)]
struct Slot {
    session: Option<Arc<Session>>,
    reaper: Option<JoinHandle<()>>,
    /// Last session taken out of the slot while possibly still alive. The
    /// next spawn waits for it to be released.
    retired: Option<Arc<Session>>,
}

impl Slot {
    fn stop_reaper(&mut self) {
        if let Some(handle) = self.reaper.take() {
            handle.abort();
        }
    }

    /// Empty the slot, keeping the old session around until it is dead.
    fn retire(&mut self) -> Option<Arc<Session>> {
        self.stop_reaper();
        let session = self.session.take()?;
        self.retired = Some(session.clone());
        Some(session)
    }
}

struct Inner {
    launcher: Arc<dyn SandboxLauncher>,
    config: SessionConfig,
    slot: Mutex<Slot>,
}

/// Owns the single shared session. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

/// Non-owning handle for background tasks.
#[derive(Clone)]
pub(crate) struct WeakSessionManager(Weak<Inner>);

impl WeakSessionManager {
    pub(crate) fn upgrade(&self) -> Option<SessionManager> {
        self.0.upgrade().map(|inner| SessionManager { inner })
    }
}

impl SessionManager {
    pub fn new(launcher: Arc<dyn SandboxLauncher>, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                launcher,
                config,
                slot: Mutex::new(Slot::default()),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    fn downgrade(&self) -> WeakSessionManager {
        WeakSessionManager(Arc::downgrade(&self.inner))
    }

    /// Return the live session, spawning one if there is none. Concurrent
    /// callers queue on the slot lock, so only one spawn happens.
    pub async fn get_or_create(&self) -> Result<Arc<Session>, ShellError> {
        let mut slot = self.inner.slot.lock().await;
        self.get_or_create_locked(&mut slot).await
    }

    /// Like [`get_or_create`](Self::get_or_create), but marks the session busy
    /// before the slot lock is released.
    pub async fn checkout(&self) -> Result<SessionLease, ShellError> {
        let mut slot = self.inner.slot.lock().await;
        let session = self.get_or_create_locked(&mut slot).await?;
        Ok(SessionLease::new(session))
    }

    /// The live session, if any.
    pub async fn current(&self) -> Option<Arc<Session>> {
        let slot = self.inner.slot.lock().await;
        slot.session.as_ref().filter(|s| s.is_alive()).cloned()
    }

    /// Kill the session, if any. Returns whether a live process was killed.
    pub async fn terminate(&self) -> bool {
        let mut slot = self.inner.slot.lock().await;
        match slot.retire() {
            Some(session) => {
                let killed = session.kill();
                info!(session_id = %session.id, killed, "Terminated shell session");
                killed
            }
            None => false,
        }
    }

    /// Terminate, then optionally start a fresh session straight away.
    pub async fn reset(&self, start_new: bool) -> Result<Option<Arc<Session>>, ShellError> {
        self.terminate().await;
        if start_new {
            self.get_or_create().await.map(Some)
        } else {
            Ok(None)
        }
    }

    /// Stop the reaper, kill the session and give it a moment to be reaped.
    pub async fn shutdown(&self) {
        let session = {
            let mut slot = self.inner.slot.lock().await;
            slot.retired = None;
            slot.retire()
        };
        if let Some(session) = session {
            info!(session_id = %session.id, "Shutting down shell session");
            if session.kill() && !session.wait_dead(SHUTDOWN_WAIT).await {
                warn!(session_id = %session.id, "Shell did not exit before shutdown");
            }
        }
    }

    /// Drop `session` from the slot (if it is still the current one) and kill
    /// it. Used when its streams can no longer be trusted.
    pub(crate) async fn invalidate(&self, session: &Session) {
        let mut slot = self.inner.slot.lock().await;
        if slot.session.as_ref().is_some_and(|s| s.id == session.id) {
            slot.retire();
        }
        drop(slot);
        if session.kill() {
            warn!(session_id = %session.id, "Invalidated shell session");
        }
    }

    /// Called by a session's supervisor once its process has exited.
    async fn on_session_exit(&self, id: Uuid) {
        let mut slot = self.inner.slot.lock().await;
        if slot.session.as_ref().is_some_and(|s| s.id == id) {
            slot.session = None;
            slot.stop_reaper();
            info!(session_id = %id, "Shell session ended; next command starts a new one");
        }
        if slot.retired.as_ref().is_some_and(|s| s.id == id) {
            slot.retired = None;
        }
    }

    /// Idle check run by the reaper for the session it was started with.
    pub(crate) async fn reap_if_idle(&self, id: Uuid) -> ReapCheck {
        let mut slot = self.inner.slot.lock().await;
        let Some(session) = slot.session.clone() else {
            return ReapCheck::Gone;
        };
        if session.id != id {
            return ReapCheck::Gone;
        }
        if session.is_busy() {
            debug!(session_id = %id, "Session busy, skipping idle check");
            return ReapCheck::Keep;
        }
        let idle = session.idle_for();
        if idle <= self.inner.config.idle_timeout {
            return ReapCheck::Keep;
        }
        info!(session_id = %id, idle_secs = idle.as_secs(), "Reaping idle shell session");
        // The caller is the reaper itself; let it finish on its own.
        slot.reaper = None;
        slot.retire();
        session.kill();
        ReapCheck::Reaped
    }

    async fn get_or_create_locked(&self, slot: &mut Slot) -> Result<Arc<Session>, ShellError> {
        if let Some(session) = &slot.session {
            if session.is_alive() {
                return Ok(session.clone());
            }
            debug!(session_id = %session.id, "Discarding dead session");
            slot.retire();
        }
        if let Some(old) = slot.retired.take() {
            if !old.wait_dead(SHUTDOWN_WAIT).await {
                warn!(session_id = %old.id, "Previous shell still shutting down, spawning anyway");
            }
        }

        let session = self.spawn_session().await?;
        slot.stop_reaper();
        slot.reaper = Some(reaper::spawn(
            self.downgrade(),
            session.id,
            self.inner.config.reap_interval,
        ));
        slot.session = Some(session.clone());
        Ok(session)
    }

    async fn spawn_session(&self) -> Result<Arc<Session>, ShellError> {
        let config = &self.inner.config;
        tokio::fs::create_dir_all(&config.host_dir).await.map_err(|e| {
            ShellError::init_io(
                format!("cannot create session directory {}", config.host_dir.display()),
                e,
            )
        })?;

        let spec = LaunchSpec {
            program: config.shell.clone(),
            args: config.shell_args.clone(),
            env: config.env.clone(),
            host_dir: config.host_dir.clone(),
            sandbox_dir: config.sandbox_dir.clone(),
        };
        let SpawnedProcess {
            pid,
            stdin,
            stdout,
            stderr,
            child,
        } = self
            .inner
            .launcher
            .spawn(&spec)
            .await
            .map_err(|e| ShellError::init_io(format!("cannot launch {}", spec.program), e))?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let session = Arc::new(Session::new(spec, pid, stdin, events_rx));
        info!(session_id = %session.id, pid = ?pid, "Spawned shell session");

        tokio::spawn(read_stream(OutputStream::Stdout, stdout, events_tx.clone()));
        tokio::spawn(read_stream(OutputStream::Stderr, stderr, events_tx));
        tokio::spawn(supervise(
            session.clone(),
            child,
            self.inner.launcher.clone(),
            self.downgrade(),
        ));

        if session.wait_dead(config.spawn_grace).await {
            warn!(session_id = %session.id, "Shell exited during startup");
            return Err(ShellError::init("shell exited immediately after launch"));
        }
        session.state.send_if_modified(|state| {
            if *state == SessionState::Starting {
                *state = SessionState::Ready;
                true
            } else {
                false
            }
        });
        Ok(session)
    }
}

async fn read_stream(
    stream: OutputStream,
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    events: mpsc::Sender<SessionEvent>,
) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let event = match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = events.send(SessionEvent::Closed(stream)).await;
                return;
            }
            Ok(n) => SessionEvent::Output {
                stream,
                chunk: buf[..n].to_vec(),
            },
            Err(e) => {
                let _ = events
                    .send(SessionEvent::Error {
                        stream,
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };
        // Waits while the channel is full; the pipe then fills and the
        // writer blocks.
        if events.send(event).await.is_err() {
            return;
        }
    }
}

/// Owns the child: waits for it to exit, kills it on request, releases the
/// launcher's resources, then marks the session dead and clears it from the
/// manager.
async fn supervise(
    session: Arc<Session>,
    mut child: Box<dyn ChildProcess>,
    launcher: Arc<dyn SandboxLauncher>,
    manager: WeakSessionManager,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = session.kill.notified() => {
                debug!(session_id = %session.id, "Killing shell");
                if let Err(e) = child.start_kill() {
                    warn!(session_id = %session.id, error = %e, "Failed to kill shell");
                }
            }
        }
    };

    let exit_code = match status {
        Ok(code) => code,
        Err(e) => {
            warn!(session_id = %session.id, error = %e, "Failed to wait for shell");
            None
        }
    };
    info!(session_id = %session.id, exit_code = ?exit_code, "Shell exited");

    // Not alive from here on, but only dead once the launcher has let go.
    session.state.send_if_modified(|state| {
        let alive = matches!(*state, SessionState::Starting | SessionState::Ready);
        if alive {
            *state = SessionState::Terminating;
        }
        alive
    });
    session.status.send_replace(ProcessStatus::Exited(exit_code));
    launcher.release(&session.spec).await;
    session.state.send_replace(SessionState::Dead);

    if let Some(manager) = manager.upgrade() {
        manager.on_session_exit(session.id).await;
    }
}
