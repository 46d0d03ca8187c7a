//! Output nobody is waiting for must stay in the shell's pipe, not in our
//! heap. Reads the resident set size from procfs, so Linux only.
#![cfg(target_os = "linux")]

mod common;

use common::{bash_config, executor};
use sandbox_shell::{LocalLauncher, OutputStream};
use std::sync::Arc;
use std::time::Duration;

fn ignore(_: OutputStream, _: &str) {}

fn resident_kb() -> u64 {
    let status = std::fs::read_to_string("/proc/self/status").unwrap();
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse().ok())
        .unwrap()
}

#[tokio::test]
async fn timed_out_flood_does_not_grow_memory() {
    let dir = tempfile::tempdir().unwrap();
    let executor = executor(Arc::new(LocalLauncher), bash_config(dir.path()));
    executor.execute("true", ignore).await.unwrap();

    let before = resident_kb();
    let result = executor
        .execute_with_timeout("yes xxxxxxxxxxxxxxxx", Duration::from_millis(100), ignore)
        .await
        .unwrap();
    assert!(result.timed_out());

    // The flood keeps going with nobody reading.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let grown = resident_kb().saturating_sub(before);
    assert!(grown < 256 * 1024, "resident set grew by {} KiB while idle", grown);

    // The next command is still stuck behind the flood, but memory stays put.
    let result = executor
        .execute_with_timeout("echo unreachable", Duration::from_millis(500), ignore)
        .await
        .unwrap();
    assert!(result.timed_out());
    assert_eq!(result.stdout, "");
    let grown = resident_kb().saturating_sub(before);
    assert!(grown < 256 * 1024, "resident set grew by {} KiB while skipping", grown);

    executor.manager().shutdown().await;
}
