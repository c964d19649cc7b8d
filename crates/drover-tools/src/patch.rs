//! Unified-diff application via `git apply`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use drover_domain::cancel::CancelToken;
use drover_domain::tool::{MessagePart, ToolCall, ToolDefinition, ToolKind, ToolResult};
use drover_domain::{Error, Result};

use crate::registry::{parse_params, Tool};

const PATCH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize)]
pub struct PatchApplyResult {
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

/// Pipe a unified diff to `git apply --whitespace=nowarn -` at the
/// workspace root. The workspace must be a git repository.
pub async fn apply_unified_diff(
    workspace: &Path,
    diff: &str,
    cancel: Option<&CancelToken>,
) -> Result<PatchApplyResult> {
    if diff.trim().is_empty() {
        return Err(Error::InvalidInput("diff is empty".into()));
    }
    if !workspace.join(".git").exists() {
        return Err(Error::NotGitRepo);
    }

    let mut child = Command::new("git")
        .args(["apply", "--whitespace=nowarn", "-"])
        .current_dir(workspace)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(diff.as_bytes()).await?;
        drop(stdin);
    }

    let output_fut = child.wait_with_output();
    tokio::pin!(output_fut);

    let output = tokio::select! {
        output = &mut output_fut => output?,
        _ = wait_cancelled(cancel) => {
            let reason = cancel.map(|t| t.reason()).unwrap_or_else(|| "canceled".into());
            return Err(Error::Canceled(reason));
        }
        _ = tokio::time::sleep(PATCH_TIMEOUT) => {
            return Err(Error::Timeout("git apply timed out".into()));
        }
    };

    Ok(PatchApplyResult {
        applied: output.status.success(),
        stdout: Some(String::from_utf8_lossy(&output.stdout).into_owned()),
        stderr: Some(String::from_utf8_lossy(&output.stderr).into_owned()),
    })
}

async fn wait_cancelled(cancel: Option<&CancelToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

// ── apply_patch tool ───────────────────────────────────────────────

pub struct ApplyPatchTool {
    workspace: PathBuf,
}

impl ApplyPatchTool {
    pub fn new(workspace: &Path) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
        }
    }
}

#[derive(serde::Deserialize)]
struct ApplyPatchParams {
    #[serde(default)]
    patch: String,
}

#[async_trait::async_trait]
impl Tool for ApplyPatchTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "apply_patch".into(),
            description: "Apply a unified diff patch using git apply.".into(),
            kind: ToolKind::Write,
            parameters: Some(serde_json::json!({
                "type": "object",
                "properties": { "patch": { "type": "string" } },
                "required": ["patch"],
            })),
            requires_approval: true,
            allow_without_approval: false,
        }
    }

    async fn invoke(&self, call: &ToolCall, cancel: &CancelToken) -> ToolResult {
        let params: ApplyPatchParams = match parse_params(&call.input) {
            Ok(p) => p,
            Err(err) => return ToolResult::failure(&call.id, err.to_string()),
        };
        match apply_unified_diff(&self.workspace, &params.patch, Some(cancel)).await {
            Ok(result) if result.applied => {
                ToolResult::text(&call.id, to_pretty_json(&result))
            }
            Ok(result) => ToolResult::failure_with_text(
                &call.id,
                "git apply failed",
                to_pretty_json(&result),
            ),
            Err(err) => {
                let fallback = PatchApplyResult {
                    applied: false,
                    stdout: None,
                    stderr: None,
                };
                ToolResult::failure_with_text(&call.id, err.to_string(), to_pretty_json(&fallback))
            }
        }
    }
}

fn to_pretty_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{run_command, ExecOptions};

    fn git_available() -> bool {
        crate::exec::look_path("git").is_some()
    }

    async fn init_repo(dir: &Path) {
        for cmd in [
            "git init -q",
            "git config user.email t@t",
            "git config user.name t",
        ] {
            let res = run_command(
                cmd,
                ExecOptions {
                    dir: Some(dir),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
            assert_eq!(res.exit_code, 0, "{cmd}: {}", res.stderr);
        }
    }

    #[tokio::test]
    async fn rejects_non_git_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let err = apply_unified_diff(dir.path(), "--- a\n+++ b\n", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotGitRepo));
    }

    #[tokio::test]
    async fn rejects_empty_diff() {
        let dir = tempfile::tempdir().unwrap();
        assert!(apply_unified_diff(dir.path(), "  \n", None).await.is_err());
    }

    #[tokio::test]
    async fn applies_a_simple_diff() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        std::fs::write(dir.path().join("hello.txt"), "hello\n").unwrap();

        let diff = "--- a/hello.txt\n+++ b/hello.txt\n@@ -1 +1 @@\n-hello\n+goodbye\n";
        let result = apply_unified_diff(dir.path(), diff, None).await.unwrap();
        assert!(result.applied, "stderr: {:?}", result.stderr);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("hello.txt")).unwrap(),
            "goodbye\n"
        );
    }

    #[tokio::test]
    async fn reports_unappliable_diff() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;

        let diff = "--- a/missing.txt\n+++ b/missing.txt\n@@ -1 +1 @@\n-x\n+y\n";
        let result = apply_unified_diff(dir.path(), diff, None).await.unwrap();
        assert!(!result.applied);
    }
}
