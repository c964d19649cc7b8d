//! Exec-kind tools: shell, diagram, verify.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use drover_domain::cancel::CancelToken;
use drover_domain::tool::{ToolCall, ToolDefinition, ToolKind, ToolResult};

use crate::exec::{run_command, ExecOptions};
use crate::registry::{parse_params, Tool};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// shell
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ShellTool {
    workspace: PathBuf,
    timeout: Duration,
}

impl ShellTool {
    pub fn new(workspace: &Path, timeout: Duration) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            timeout,
        }
    }
}

#[derive(Deserialize)]
struct ShellParams {
    #[serde(default)]
    command: String,
    #[serde(default)]
    timeout_seconds: Option<u64>,
}

#[async_trait::async_trait]
impl Tool for ShellTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "shell".into(),
            description: "Run a shell command in the workspace.".into(),
            kind: ToolKind::Exec,
            parameters: Some(serde_json::json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string" },
                    "timeout_seconds": { "type": "integer" },
                },
                "required": ["command"],
            })),
            requires_approval: true,
            allow_without_approval: false,
        }
    }

    async fn invoke(&self, call: &ToolCall, cancel: &CancelToken) -> ToolResult {
        let params: ShellParams = match parse_params(&call.input) {
            Ok(p) => p,
            Err(err) => return ToolResult::failure(&call.id, err.to_string()),
        };
        let timeout = params
            .timeout_seconds
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
            .unwrap_or(self.timeout);

        let result = run_command(
            &params.command,
            ExecOptions {
                dir: Some(&self.workspace),
                timeout: Some(timeout),
                cancel: Some(cancel),
                ..Default::default()
            },
        )
        .await;
        match result {
            Ok(res) if res.exit_code == 0 => ToolResult::text(&call.id, pretty(&res)),
            Ok(res) => ToolResult::failure_with_text(
                &call.id,
                format!("command failed (exit {})", res.exit_code),
                pretty(&res),
            ),
            Err(err) => ToolResult::failure(&call.id, err.to_string()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// diagram
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct DiagramTool {
    workspace: PathBuf,
}

impl DiagramTool {
    pub fn new(workspace: &Path) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
        }
    }
}

#[async_trait::async_trait]
impl Tool for DiagramTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "diagram".into(),
            description: "Render diagrams using make diagrams.".into(),
            kind: ToolKind::Exec,
            parameters: Some(serde_json::json!({ "type": "object", "properties": {} })),
            requires_approval: true,
            allow_without_approval: false,
        }
    }

    async fn invoke(&self, call: &ToolCall, cancel: &CancelToken) -> ToolResult {
        let result = run_command(
            "make diagrams",
            ExecOptions {
                dir: Some(&self.workspace),
                timeout: Some(Duration::from_secs(30 * 60)),
                cancel: Some(cancel),
                ..Default::default()
            },
        )
        .await;
        match result {
            Ok(res) if res.exit_code == 0 => ToolResult::text(&call.id, pretty(&res)),
            Ok(res) => ToolResult::failure_with_text(
                &call.id,
                format!("command failed (exit {})", res.exit_code),
                pretty(&res),
            ),
            Err(err) => ToolResult::failure(&call.id, err.to_string()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// verify
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct VerifyTool {
    workspace: PathBuf,
    commands: Vec<String>,
    timeout: Duration,
}

impl VerifyTool {
    pub fn new(workspace: &Path, commands: Vec<String>, timeout: Duration) -> Self {
        let commands = if commands.is_empty() {
            vec!["make test".into()]
        } else {
            commands
        };
        Self {
            workspace: workspace.to_path_buf(),
            commands,
            timeout,
        }
    }
}

#[derive(Serialize)]
struct VerifyEntry {
    cmd: String,
    exit_code: i32,
    stdout: String,
    stderr: String,
    duration_ms: u64,
}

#[async_trait::async_trait]
impl Tool for VerifyTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "verify".into(),
            description: "Run the configured verification commands.".into(),
            kind: ToolKind::Exec,
            parameters: Some(serde_json::json!({ "type": "object", "properties": {} })),
            requires_approval: false,
            allow_without_approval: false,
        }
    }

    async fn invoke(&self, call: &ToolCall, cancel: &CancelToken) -> ToolResult {
        let mut entries: Vec<VerifyEntry> = Vec::new();
        let mut ok = true;
        for cmd in &self.commands {
            let result = run_command(
                cmd,
                ExecOptions {
                    dir: Some(&self.workspace),
                    timeout: Some(self.timeout),
                    cancel: Some(cancel),
                    ..Default::default()
                },
            )
            .await;
            match result {
                Ok(res) => {
                    if res.exit_code != 0 {
                        ok = false;
                    }
                    entries.push(VerifyEntry {
                        cmd: res.cmd,
                        exit_code: res.exit_code,
                        stdout: res.stdout,
                        stderr: res.stderr,
                        duration_ms: res.duration_ms,
                    });
                }
                Err(err) => {
                    ok = false;
                    entries.push(VerifyEntry {
                        cmd: cmd.clone(),
                        exit_code: 1,
                        stdout: String::new(),
                        stderr: err.to_string(),
                        duration_ms: 0,
                    });
                }
            }
        }

        let text = serde_json::to_string_pretty(&entries).unwrap_or_else(|_| "[]".to_owned());
        if ok {
            ToolResult::text(&call.id, text)
        } else {
            ToolResult::failure_with_text(&call.id, "verification failed", text)
        }
    }
}

fn pretty<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_owned())
}
