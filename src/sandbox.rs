//! Linux isolation for the session shell: a tmpfs root with read-only system
//! binds, the session directory bind-mounted in, and a chrooted shell in its
//! own mount namespace.

use crate::config::ResourceLimits;
use crate::launcher::{from_tokio_child, LaunchSpec, SandboxLauncher, SpawnedProcess};
use async_trait::async_trait;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::resource::{setrlimit, Resource};
use nix::unistd::{chdir, chroot};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

/// One piece of the sandbox root, installed in table order.
#[derive(Debug, Clone, Copy)]
enum RootEntry {
    /// Host directory bound read-only at the same path, skipped if absent.
    ReadOnly(&'static str),
    /// Plain directory on the tmpfs.
    Dir { path: &'static str, mode: u32 },
    /// Host device node bound in at the same path, skipped if absent.
    Device(&'static str),
    Proc,
}

use RootEntry::{Device, Dir, Proc, ReadOnly};

const ROOT_LAYOUT: &[RootEntry] = &[
    ReadOnly("/bin"),
    ReadOnly("/lib"),
    ReadOnly("/lib64"),
    ReadOnly("/usr"),
    ReadOnly("/etc"),
    Dir { path: "/tmp", mode: 0o1777 },
    Dir { path: "/dev", mode: 0o755 },
    Device("/dev/null"),
    Device("/dev/zero"),
    Device("/dev/urandom"),
    Device("/dev/random"),
    Proc,
    Dir { path: "/home", mode: 0o755 },
];

impl RootEntry {
    fn path(&self) -> &'static str {
        match *self {
            ReadOnly(path) | Device(path) | Dir { path, .. } => path,
            Proc => "/proc",
        }
    }

    /// Where the entry is mounted under `rootfs`; `None` for plain directories.
    fn mount_target(&self, rootfs: &Path) -> Option<PathBuf> {
        match self {
            Dir { .. } => None,
            _ => Some(mount_point(rootfs, Path::new(self.path()))),
        }
    }

    fn install(&self, rootfs: &Path) -> io::Result<()> {
        let target = mount_point(rootfs, Path::new(self.path()));
        match *self {
            ReadOnly(host) if Path::new(host).exists() => {
                fs::create_dir_all(&target)?;
                bind(host, &target, MsFlags::MS_REC)?;
                mount(
                    None::<&str>,
                    &target,
                    None::<&str>,
                    MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_REC,
                    None::<&str>,
                )?;
            }
            Device(host) if Path::new(host).exists() => {
                fs::write(&target, "")?;
                bind(host, &target, MsFlags::empty())?;
            }
            ReadOnly(_) | Device(_) => {}
            Dir { mode, .. } => {
                fs::create_dir_all(&target)?;
                fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
            }
            Proc => {
                fs::create_dir_all(&target)?;
                mount(
                    Some("proc"),
                    &target,
                    Some("proc"),
                    MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                    None::<&str>,
                )?;
            }
        }
        Ok(())
    }
}

fn bind<P: ?Sized + nix::NixPath>(source: &P, target: &Path, extra: MsFlags) -> nix::Result<()> {
    mount(Some(source), target, None::<&str>, MsFlags::MS_BIND | extra, None::<&str>)
}

/// Launches the shell chrooted into `rootfs`. Needs root (CAP_SYS_ADMIN).
#[derive(Debug, Clone)]
pub struct IsolatedLauncher {
    rootfs: PathBuf,
    limits: ResourceLimits,
}

impl IsolatedLauncher {
    pub fn new(rootfs: impl Into<PathBuf>, limits: ResourceLimits) -> Self {
        Self {
            rootfs: rootfs.into(),
            limits,
        }
    }
}

#[async_trait]
impl SandboxLauncher for IsolatedLauncher {
    async fn spawn(&self, spec: &LaunchSpec) -> io::Result<SpawnedProcess> {
        let rootfs = self.rootfs.clone();
        let host_dir = spec.host_dir.clone();
        let sandbox_dir = spec.sandbox_dir.clone();
        tokio::task::spawn_blocking(move || setup_sandbox_root(&rootfs, &host_dir, &sandbox_dir))
            .await
            .map_err(io::Error::other)??;

        info!(rootfs = ?self.rootfs, sandbox_dir = ?spec.sandbox_dir, "Sandbox root ready, spawning shell");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .env_clear()
            .env("PATH", "/usr/local/bin:/usr/bin:/bin")
            .env("HOME", "/home")
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let rootfs = self.rootfs.clone();
        let workdir = spec.sandbox_dir.clone();
        let limits = self.limits;
        // SAFETY: the closure runs between fork and exec and only makes
        // syscalls; it allocates nothing shared with the parent.
        unsafe {
            command.pre_exec(move || {
                // Die with the server.
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                    return Err(io::Error::last_os_error());
                }
                unshare(CloneFlags::CLONE_NEWNS)?;
                chroot(rootfs.as_path())?;
                chdir(workdir.as_path())?;
                set_resource_limits(&limits)?;
                Ok(())
            });
        }

        let child = command.spawn()?;
        from_tokio_child(child)
    }

    async fn release(&self, spec: &LaunchSpec) {
        let rootfs = self.rootfs.clone();
        let sandbox_dir = spec.sandbox_dir.clone();
        let result = tokio::task::spawn_blocking(move || cleanup_sandbox(&rootfs, &sandbox_dir)).await;
        if let Err(e) = result {
            warn!(error = %e, "Sandbox cleanup task failed");
        }
    }
}

/// Path of the session mount inside `rootfs`.
fn mount_point(rootfs: &Path, sandbox_dir: &Path) -> PathBuf {
    rootfs.join(sandbox_dir.strip_prefix("/").unwrap_or(sandbox_dir))
}

fn setup_sandbox_root(rootfs: &Path, host_dir: &Path, sandbox_dir: &Path) -> io::Result<()> {
    if rootfs.exists() {
        cleanup_sandbox(rootfs, sandbox_dir);
    }
    fs::create_dir_all(rootfs)?;
    mount(
        Some("tmpfs"),
        rootfs,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("size=2G,mode=755"),
    )?;

    for entry in ROOT_LAYOUT {
        entry
            .install(rootfs)
            .map_err(|e| io::Error::new(e.kind(), format!("{}: {}", entry.path(), e)))?;
    }

    let session_mount = mount_point(rootfs, sandbox_dir);
    fs::create_dir_all(&session_mount)?;
    bind(host_dir, &session_mount, MsFlags::empty())
        .map_err(|e| io::Error::new(io::Error::from(e).kind(), format!("session dir: {}", e)))
}

fn set_resource_limits(limits: &ResourceLimits) -> nix::Result<()> {
    let mem_bytes = limits.mem_kb * 1024;
    setrlimit(Resource::RLIMIT_AS, mem_bytes, mem_bytes)?;
    let fsize_bytes = limits.fsize_kb * 1024;
    setrlimit(Resource::RLIMIT_FSIZE, fsize_bytes, fsize_bytes)?;
    setrlimit(Resource::RLIMIT_NOFILE, limits.nofile, limits.nofile)?;
    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
    setrlimit(Resource::RLIMIT_NPROC, limits.nproc, limits.nproc)?;
    Ok(())
}

fn cleanup_sandbox(rootfs: &Path, sandbox_dir: &Path) {
    let _ = umount2(&mount_point(rootfs, sandbox_dir), MntFlags::MNT_DETACH);
    for target in ROOT_LAYOUT.iter().rev().filter_map(|entry| entry.mount_target(rootfs)) {
        if target.exists() {
            let _ = umount2(&target, MntFlags::MNT_DETACH);
        }
    }
    let _ = umount2(rootfs, MntFlags::MNT_DETACH);
    // Only the mount point directory remains once everything is detached; never
    // recurse into a still-mounted session directory.
    let _ = fs::remove_dir(rootfs);
}
