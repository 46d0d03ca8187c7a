//! Session configuration and its command-line / environment surface.

use clap::Args;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(60);
pub const MAX_EXEC_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SPAWN_GRACE: Duration = Duration::from_millis(200);
pub const DEFAULT_EXIT_GRACE: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Everything the session manager and executor need to know.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Shell program launched for each session.
    pub shell: String,
    pub shell_args: Vec<String>,
    /// Extra environment for the shell process.
    pub env: HashMap<String, String>,
    /// Host-side session directory, created if absent.
    pub host_dir: PathBuf,
    /// Where `host_dir` appears inside the sandbox.
    pub sandbox_dir: PathBuf,
    pub exec_timeout: Duration,
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
    /// How long a fresh process must survive before it counts as started.
    pub spawn_grace: Duration,
    /// How long to wait for an exit status once stdout has closed.
    pub exit_grace: Duration,
    /// Per-stream cap on captured output; older bytes are dropped first.
    pub max_output_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: "/bin/bash".to_string(),
            shell_args: vec!["--noprofile".to_string(), "--norc".to_string()],
            env: HashMap::new(),
            host_dir: PathBuf::from("/tmp/sandbox-shell/session"),
            sandbox_dir: PathBuf::from("/workspace"),
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            reap_interval: DEFAULT_REAP_INTERVAL,
            spawn_grace: DEFAULT_SPAWN_GRACE,
            exit_grace: DEFAULT_EXIT_GRACE,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl SessionConfig {
    /// Resolve a caller-requested timeout: absent or zero falls back to the
    /// configured default, anything above [`MAX_EXEC_TIMEOUT`] is capped.
    pub fn resolve_timeout(&self, requested_ms: Option<u64>) -> Duration {
        match requested_ms {
            None | Some(0) => self.exec_timeout,
            Some(ms) => {
                let requested = Duration::from_millis(ms);
                if requested > MAX_EXEC_TIMEOUT {
                    warn!(
                        requested_ms = ms,
                        max_ms = MAX_EXEC_TIMEOUT.as_millis() as u64,
                        "Requested timeout exceeds maximum, capping"
                    );
                    MAX_EXEC_TIMEOUT
                } else {
                    requested
                }
            }
        }
    }
}

/// Resource limits applied by the isolating launcher.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub mem_kb: u64,
    pub fsize_kb: u64,
    pub nofile: u64,
    pub nproc: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            mem_kb: 2_097_152,
            fsize_kb: 1_048_576,
            nofile: 256,
            nproc: 64,
        }
    }
}

/// Session flags shared by `serve` and `--run`.
#[derive(Args, Debug, Clone)]
pub struct ShellArgs {
    /// Shell program to keep alive
    #[arg(long, global = true, env = "SANDBOX_SHELL_PROGRAM", default_value = "/bin/bash")]
    pub shell: String,

    /// Arguments passed to the shell (repeatable)
    #[arg(long = "shell-arg", global = true, allow_hyphen_values = true)]
    pub shell_args: Vec<String>,

    /// Host directory backing the session's working directory
    #[arg(long, global = true, env = "SANDBOX_SHELL_HOST_DIR", default_value = "/tmp/sandbox-shell/session")]
    pub host_dir: PathBuf,

    /// Path of the session directory inside the sandbox
    #[arg(long, global = true, env = "SANDBOX_SHELL_SANDBOX_DIR", default_value = "/workspace")]
    pub sandbox_dir: PathBuf,

    /// Per-command timeout in milliseconds
    #[arg(long, global = true, env = "SANDBOX_SHELL_EXEC_TIMEOUT_MS", default_value = "60000")]
    pub exec_timeout_ms: u64,

    /// Terminate the session after this many idle seconds
    #[arg(long, global = true, env = "SANDBOX_SHELL_IDLE_TIMEOUT_SECS", default_value = "1800")]
    pub idle_timeout_secs: u64,

    /// How often the idle reaper runs, in seconds
    #[arg(long, global = true, env = "SANDBOX_SHELL_REAP_INTERVAL_SECS", default_value = "300")]
    pub reap_interval_secs: u64,

    /// Bytes of stdout and of stderr kept per command
    #[arg(long, global = true, env = "SANDBOX_SHELL_MAX_OUTPUT_BYTES", default_value = "1048576")]
    pub max_output_bytes: usize,

    /// Run the shell chrooted in a fresh mount namespace (requires root)
    #[arg(long, global = true, env = "SANDBOX_SHELL_ISOLATE")]
    pub isolate: bool,

    /// Root directory assembled for the isolated shell
    #[arg(long, global = true, env = "SANDBOX_SHELL_ROOTFS", default_value = "/tmp/sandbox-shell/root")]
    pub rootfs: PathBuf,

    /// Memory limit in KB (isolated mode)
    #[arg(long, global = true, default_value = "2097152")]
    pub mem: u64,

    /// Maximum file size in KB (isolated mode)
    #[arg(long, global = true, default_value = "1048576")]
    pub fsize: u64,

    /// Maximum number of open files (isolated mode)
    #[arg(long, global = true, default_value = "256")]
    pub nofile: u64,
}

impl ShellArgs {
    pub fn session_config(&self) -> SessionConfig {
        let defaults = SessionConfig::default();
        let shell_args = if self.shell_args.is_empty() {
            defaults.shell_args.clone()
        } else {
            self.shell_args.clone()
        };
        SessionConfig {
            shell: self.shell.clone(),
            shell_args,
            host_dir: self.host_dir.clone(),
            sandbox_dir: self.sandbox_dir.clone(),
            exec_timeout: Duration::from_millis(self.exec_timeout_ms.max(1)),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            reap_interval: Duration::from_secs(self.reap_interval_secs.max(1)),
            max_output_bytes: self.max_output_bytes.max(1),
            ..defaults
        }
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            mem_kb: self.mem,
            fsize_kb: self.fsize,
            nofile: self.nofile,
            ..ResourceLimits::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_timeout_defaults_and_caps() {
        let config = SessionConfig::default();
        assert_eq!(config.resolve_timeout(None), DEFAULT_EXEC_TIMEOUT);
        assert_eq!(config.resolve_timeout(Some(0)), DEFAULT_EXEC_TIMEOUT);
        assert_eq!(config.resolve_timeout(Some(1500)), Duration::from_millis(1500));
        assert_eq!(config.resolve_timeout(Some(u64::MAX / 2)), MAX_EXEC_TIMEOUT);
    }
}
