//! Shared fixtures for the cross-component tests.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::Config;

/// Write an executable fake agent CLI into `dir` and return its path.
///
/// Every script must consume stdin first: the spawner pipes the manifest in
/// and treats a failed write as an agent failure.
pub fn fake_cli(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    let script = format!("#!/bin/sh\ncat > /dev/null\n{body}\n");
    std::fs::write(&path, script).expect("write fake CLI");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod fake CLI");
    }
    path
}

/// A fake CLI that reports fixed token usage and exits cleanly.
pub fn reporting_cli(dir: &Path) -> PathBuf {
    fake_cli(
        dir,
        "agent-ok.sh",
        "echo \"working on it\"\necho \"Input: 100 tokens\"\necho \"Output: 250 tokens\"",
    )
}

/// A fake CLI that sleeps before exiting, for cap and cancel tests.
pub fn slow_cli(dir: &Path, seconds: &str) -> PathBuf {
    fake_cli(
        dir,
        "agent-slow.sh",
        &format!("sleep {seconds}\necho \"Input: 1 tokens\"\necho \"Output: 1 tokens\""),
    )
}

/// Test configuration rooted in a temp dir with the given CLI.
pub fn test_config(work_dir: &Path, cli: &Path, max_concurrent: usize) -> Config {
    let mut config = Config::for_tests(work_dir.to_path_buf());
    config.cli_path = cli.to_string_lossy().to_string();
    config.max_concurrent_agents = max_concurrent;
    config
}

/// Poll until `check` yields `Some(v)` or the timeout elapses.
pub async fn wait_for<T, F, Fut>(timeout: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
