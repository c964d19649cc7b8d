//! Subprocess runner.
//!
//! Commands run under `/bin/bash -lc` with the workspace as cwd. The child
//! is killed when the timeout elapses or the cancel token fires, whichever
//! comes first; a completed process always yields a [`CmdResult`], non-zero
//! exits included.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::process::Command;

use drover_domain::cancel::CancelToken;
use drover_domain::{Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Serialize)]
pub struct CmdResult {
    pub cmd: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

#[derive(Default)]
pub struct ExecOptions<'a> {
    pub dir: Option<&'a Path>,
    pub env: Option<&'a HashMap<String, String>>,
    pub timeout: Option<Duration>,
    pub cancel: Option<&'a CancelToken>,
}

/// Run a shell command to completion.
///
/// Returns `Ok` with the captured output for any exit status; `Err` only
/// for spawn failures, timeouts, and cancellation.
pub async fn run_command(cmd: &str, opts: ExecOptions<'_>) -> Result<CmdResult> {
    if cmd.trim().is_empty() {
        return Err(Error::InvalidInput("cmd is empty".into()));
    }
    let timeout = opts.timeout.unwrap_or(DEFAULT_TIMEOUT);
    let start = Instant::now();

    let mut command = Command::new("/bin/bash");
    command
        .arg("-lc")
        .arg(cmd)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);
    if let Some(dir) = opts.dir {
        command.current_dir(dir);
    }
    if let Some(env) = opts.env {
        command.envs(env);
    }

    let child = command.spawn()?;
    let output_fut = child.wait_with_output();
    tokio::pin!(output_fut);

    // Dropping the pinned future kills the child (kill_on_drop).
    let output = tokio::select! {
        output = &mut output_fut => output?,
        _ = wait_cancelled(opts.cancel) => {
            let reason = opts.cancel.map(|t| t.reason()).unwrap_or_else(|| "canceled".into());
            return Err(Error::Canceled(reason));
        }
        _ = tokio::time::sleep(timeout) => {
            return Err(Error::Timeout(format!(
                "command timed out after {}s: {cmd}",
                timeout.as_secs()
            )));
        }
    };

    Ok(CmdResult {
        cmd: cmd.to_owned(),
        exit_code: output.status.code().unwrap_or(1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

async fn wait_cancelled(cancel: Option<&CancelToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Resolve a command against `PATH`.
pub fn look_path(cmd: &str) -> Option<PathBuf> {
    if cmd.is_empty() {
        return None;
    }
    if cmd.contains('/') {
        let path = PathBuf::from(cmd);
        return path.is_file().then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(cmd))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let res = run_command("echo hello", ExecOptions::default()).await.unwrap();
        assert_eq!(res.exit_code, 0);
        assert_eq!(res.stdout, "hello\n");
        assert_eq!(res.cmd, "echo hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error() {
        let res = run_command("exit 3", ExecOptions::default()).await.unwrap();
        assert_eq!(res.exit_code, 3);
    }

    #[tokio::test]
    async fn captures_stderr() {
        let res = run_command("echo oops >&2; false", ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(res.stderr, "oops\n");
        assert_ne!(res.exit_code, 0);
    }

    #[tokio::test]
    async fn runs_in_given_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let res = run_command(
            "ls",
            ExecOptions {
                dir: Some(dir.path()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(res.stdout.contains("marker.txt"));
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let start = Instant::now();
        let err = run_command(
            "sleep 5",
            ExecOptions {
                timeout: Some(Duration::from_millis(100)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn cancel_kills_the_child_promptly() {
        let token = CancelToken::new();
        let killer = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            killer.cancel_with_reason("operator cancel");
        });

        let start = Instant::now();
        let err = run_command(
            "sleep 10",
            ExecOptions {
                cancel: Some(&token),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        match err {
            Error::Canceled(reason) => assert_eq!(reason, "operator cancel"),
            other => panic!("expected Canceled, got {other}"),
        }
        assert!(start.elapsed() < Duration::from_millis(600));
    }

    #[test]
    fn look_path_finds_common_binaries() {
        assert!(look_path("sh").is_some());
        assert!(look_path("definitely-not-a-binary-zzz").is_none());
        assert!(look_path("").is_none());
    }
}
