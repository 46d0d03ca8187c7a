//! sandbox-shell - persistent sandboxed shell with an HTTP API.
//!
//! Usage:
//!   sandbox-shell serve [--port 8080]            # Start HTTP server
//!   sandbox-shell --run -- <command> [args]      # Run one command and exit

use clap::{Parser, Subcommand};
use sandbox_shell::config::ShellArgs;
use sandbox_shell::launcher::{LocalLauncher, SandboxLauncher};
use sandbox_shell::state::AppState;
use sandbox_shell::{http_server, CommandExecutor, OutputStream, SessionManager};
use std::io::Write;
use std::process::exit;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sandbox-shell")]
#[command(about = "Persistent sandboxed shell with HTTP API")]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Run a single command in a fresh session and exit with its status
    #[arg(long)]
    run: bool,

    #[command(flatten)]
    shell: ShellArgs,

    /// Command to run (with --run)
    #[arg(last = true)]
    cmd_args: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let launcher = match build_launcher(&args.shell) {
        Ok(launcher) => launcher,
        Err(e) => {
            eprintln!("Error: {}", e);
            exit(1);
        }
    };
    let manager = SessionManager::new(launcher, args.shell.session_config());
    let executor = CommandExecutor::new(manager.clone());

    match args.command {
        Some(Commands::Serve { port }) => {
            let result = http_server::run_server(port, AppState::new(executor)).await;
            manager.shutdown().await;
            if let Err(e) = result {
                eprintln!("Error: {}", e);
                exit(1);
            }
        }
        None if args.run => {
            if args.cmd_args.is_empty() {
                eprintln!("Error: No command specified");
                exit(1);
            }
            let command = args.cmd_args.join(" ");
            let result = executor
                .execute(&command, |stream, chunk| match stream {
                    OutputStream::Stdout => {
                        let mut stdout = std::io::stdout();
                        let _ = stdout.write_all(chunk.as_bytes());
                        let _ = stdout.flush();
                    }
                    OutputStream::Stderr => {
                        let _ = std::io::stderr().write_all(chunk.as_bytes());
                    }
                })
                .await;
            manager.shutdown().await;
            match result {
                Ok(result) if result.timed_out() => {
                    eprintln!("Error: command timed out");
                    exit(124);
                }
                Ok(result) => exit(result.exit_code.unwrap_or(1)),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(1);
                }
            }
        }
        None => {
            eprintln!("Error: Use 'serve' subcommand or --run flag");
            exit(1);
        }
    }
}

fn build_launcher(args: &ShellArgs) -> Result<Arc<dyn SandboxLauncher>, String> {
    if !args.isolate {
        return Ok(Arc::new(LocalLauncher));
    }
    isolated_launcher(args)
}

#[cfg(target_os = "linux")]
fn isolated_launcher(args: &ShellArgs) -> Result<Arc<dyn SandboxLauncher>, String> {
    use sandbox_shell::sandbox::IsolatedLauncher;

    // Must be root
    if !nix::unistd::geteuid().is_root() {
        return Err("--isolate must run as root (need CAP_SYS_ADMIN for namespaces)".to_string());
    }
    Ok(Arc::new(IsolatedLauncher::new(args.rootfs.clone(), args.resource_limits())))
}

#[cfg(not(target_os = "linux"))]
fn isolated_launcher(_args: &ShellArgs) -> Result<Arc<dyn SandboxLauncher>, String> {
    Err("--isolate only works on Linux".to_string())
}
