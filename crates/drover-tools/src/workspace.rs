//! Workspace read tools: tree listing, symbol map, file reads, substring
//! search, and git status.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use drover_domain::cancel::CancelToken;
use drover_domain::paths;
use drover_domain::tool::{ToolCall, ToolDefinition, ToolKind, ToolResult};
use drover_domain::{Error, Result};

use crate::exec::{run_command, ExecOptions};
use crate::registry::{parse_params, Tool};
use crate::symbols::build_repo_map;
use crate::walk::{default_walk_options, walk_files};

/// Resolve a workspace-relative argument, rejecting anything that escapes
/// the workspace root after normalization.
pub fn safe_workspace_path(workspace: &Path, rel: &str) -> Result<PathBuf> {
    if rel.trim().is_empty() {
        return Err(Error::InvalidInput("path is empty".into()));
    }
    let root = workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.to_path_buf());
    paths::ensure_within(&root, Path::new(rel))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// repo_tree
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RepoTreeTool {
    workspace: PathBuf,
    max_files: usize,
}

impl RepoTreeTool {
    pub fn new(workspace: &Path, max_files: usize) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            max_files,
        }
    }
}

#[derive(Deserialize, Default)]
struct RepoTreeParams {
    #[serde(default)]
    max_files: Option<usize>,
}

#[async_trait::async_trait]
impl Tool for RepoTreeTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "repo_tree".into(),
            description: "List files in the workspace (relative paths).".into(),
            kind: ToolKind::Read,
            parameters: Some(serde_json::json!({
                "type": "object",
                "properties": { "max_files": { "type": "integer" } },
            })),
            requires_approval: false,
            allow_without_approval: false,
        }
    }

    async fn invoke(&self, call: &ToolCall, _cancel: &CancelToken) -> ToolResult {
        let params: RepoTreeParams = parse_params(&call.input).unwrap_or_default();
        let max_files = params.max_files.filter(|n| *n > 0).unwrap_or(self.max_files);

        match walk_files(&self.workspace, &default_walk_options()) {
            Ok(files) => {
                let slice = &files[..files.len().min(max_files)];
                let text = if slice.is_empty() {
                    "workspace contains no files".to_owned()
                } else {
                    slice.join("\n")
                };
                ToolResult::text(&call.id, text)
            }
            Err(err) => ToolResult::failure(&call.id, err.to_string()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// repo_map
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RepoMapTool {
    workspace: PathBuf,
    max_symbols: usize,
}

impl RepoMapTool {
    pub fn new(workspace: &Path, max_symbols: usize) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            max_symbols,
        }
    }
}

#[derive(Deserialize, Default)]
struct RepoMapParams {
    #[serde(default)]
    max_symbols: Option<usize>,
}

#[async_trait::async_trait]
impl Tool for RepoMapTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "repo_map".into(),
            description: "List symbols in the repo, grouped by file.".into(),
            kind: ToolKind::Read,
            parameters: Some(serde_json::json!({
                "type": "object",
                "properties": { "max_symbols": { "type": "integer" } },
            })),
            requires_approval: false,
            allow_without_approval: false,
        }
    }

    async fn invoke(&self, call: &ToolCall, cancel: &CancelToken) -> ToolResult {
        let params: RepoMapParams = parse_params(&call.input).unwrap_or_default();
        let max_symbols = params.max_symbols.filter(|n| *n > 0).unwrap_or(self.max_symbols);

        let files = match walk_files(&self.workspace, &default_walk_options()) {
            Ok(files) => files,
            Err(err) => return ToolResult::failure(&call.id, err.to_string()),
        };
        match build_repo_map(&self.workspace, &files, max_symbols, Some(cancel)).await {
            Ok(map) => ToolResult::text(&call.id, map),
            Err(err) => ToolResult::failure(&call.id, err.to_string()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// read_file
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ReadFileTool {
    workspace: PathBuf,
    max_lines: usize,
}

impl ReadFileTool {
    pub fn new(workspace: &Path, max_lines: usize) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            max_lines,
        }
    }
}

#[derive(Deserialize)]
struct ReadFileParams {
    path: String,
    #[serde(default)]
    start_line: Option<usize>,
    #[serde(default)]
    end_line: Option<usize>,
}

#[async_trait::async_trait]
impl Tool for ReadFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "read_file".into(),
            description: "Read a file from the workspace with optional line range.".into(),
            kind: ToolKind::Read,
            parameters: Some(serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "start_line": { "type": "integer" },
                    "end_line": { "type": "integer" },
                },
                "required": ["path"],
            })),
            requires_approval: false,
            allow_without_approval: false,
        }
    }

    async fn invoke(&self, call: &ToolCall, _cancel: &CancelToken) -> ToolResult {
        let params: ReadFileParams = match parse_params(&call.input) {
            Ok(p) => p,
            Err(err) => return ToolResult::failure(&call.id, err.to_string()),
        };
        let abs = match safe_workspace_path(&self.workspace, &params.path) {
            Ok(p) => p,
            Err(err) => return ToolResult::failure(&call.id, err.to_string()),
        };
        let content = match std::fs::read_to_string(&abs) {
            Ok(c) => c,
            Err(err) => return ToolResult::failure(&call.id, err.to_string()),
        };

        let lines: Vec<&str> = content.split('\n').collect();
        let mut start = params.start_line.unwrap_or(1).max(1);
        let mut end = params.end_line.unwrap_or(lines.len()).min(lines.len());
        if start > end {
            start = end.max(1);
        }
        if self.max_lines > 0 && end.saturating_sub(start) + 1 > self.max_lines {
            end = lines.len().min(start + self.max_lines - 1);
        }
        let snippet = if lines.is_empty() {
            String::new()
        } else {
            lines[start - 1..end].join("\n")
        };
        ToolResult::text(&call.id, snippet)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// search
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SearchTool {
    workspace: PathBuf,
    max_results: usize,
}

impl SearchTool {
    pub fn new(workspace: &Path, max_results: usize) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            max_results,
        }
    }
}

#[derive(Deserialize)]
struct SearchParams {
    #[serde(default)]
    query: String,
    #[serde(default)]
    glob: Option<String>,
    #[serde(default)]
    max_results: Option<usize>,
}

#[async_trait::async_trait]
impl Tool for SearchTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "search".into(),
            description: "Search for a substring in workspace files.".into(),
            kind: ToolKind::Read,
            parameters: Some(serde_json::json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "glob": { "type": "string" },
                    "max_results": { "type": "integer" },
                },
                "required": ["query"],
            })),
            requires_approval: false,
            allow_without_approval: false,
        }
    }

    async fn invoke(&self, call: &ToolCall, _cancel: &CancelToken) -> ToolResult {
        let params: SearchParams = match parse_params(&call.input) {
            Ok(p) => p,
            Err(err) => return ToolResult::failure(&call.id, err.to_string()),
        };
        let query = params.query.trim();
        if query.is_empty() {
            return ToolResult::failure(&call.id, "query required");
        }
        let max_results = params.max_results.filter(|n| *n > 0).unwrap_or(self.max_results);
        let pattern = params
            .glob
            .as_deref()
            .and_then(|g| glob::Pattern::new(g).ok());

        let files = match walk_files(&self.workspace, &default_walk_options()) {
            Ok(files) => files,
            Err(err) => return ToolResult::failure(&call.id, err.to_string()),
        };

        let mut matches: Vec<String> = Vec::new();
        'outer: for rel in &files {
            if let Some(pattern) = &pattern {
                let name = Path::new(rel)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if !pattern.matches(&name) {
                    continue;
                }
            }
            let Ok(content) = std::fs::read_to_string(self.workspace.join(rel)) else {
                continue;
            };
            for (idx, line) in content.lines().enumerate() {
                if line.contains(query) {
                    matches.push(format!("{rel}:{}:{}", idx + 1, line.trim()));
                    if matches.len() >= max_results {
                        break 'outer;
                    }
                }
            }
        }
        ToolResult::text(&call.id, matches.join("\n"))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// git_status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct GitStatusTool {
    workspace: PathBuf,
}

impl GitStatusTool {
    pub fn new(workspace: &Path) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
        }
    }
}

#[async_trait::async_trait]
impl Tool for GitStatusTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "git_status".into(),
            description: "Return git status --porcelain for the workspace.".into(),
            kind: ToolKind::Read,
            parameters: Some(serde_json::json!({ "type": "object", "properties": {} })),
            requires_approval: false,
            allow_without_approval: false,
        }
    }

    async fn invoke(&self, call: &ToolCall, cancel: &CancelToken) -> ToolResult {
        // Non-repo workspaces succeed with empty output.
        if !self.workspace.join(".git").exists() {
            return ToolResult::text(&call.id, "");
        }
        let result = run_command(
            "git status --porcelain",
            ExecOptions {
                dir: Some(&self.workspace),
                timeout: Some(Duration::from_secs(10)),
                cancel: Some(cancel),
                ..Default::default()
            },
        )
        .await;
        match result {
            Ok(res) if res.exit_code == 0 => {
                ToolResult::text(&call.id, res.stdout.trim().to_owned())
            }
            Ok(res) => ToolResult::failure_with_text(
                &call.id,
                format!("git status failed (exit {})", res.exit_code),
                res.stdout,
            ),
            Err(err) => ToolResult::failure(&call.id, err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, input: &str) -> ToolCall {
        ToolCall {
            id: "call_t".into(),
            name: name.into(),
            input: input.into(),
        }
    }

    fn seed_workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "line one\nline two\nline three\n").unwrap();
        std::fs::write(dir.path().join("notes.md"), "needle here\n").unwrap();
        dir
    }

    #[test]
    fn path_safety_rejects_escapes() {
        let dir = seed_workspace();
        assert!(safe_workspace_path(dir.path(), "../../etc/passwd").is_err());
        assert!(safe_workspace_path(dir.path(), "/etc/passwd").is_err());
        assert!(safe_workspace_path(dir.path(), "src/../..").is_err());
        assert!(safe_workspace_path(dir.path(), "").is_err());
        assert!(safe_workspace_path(dir.path(), "src/lib.rs").is_ok());
    }

    #[tokio::test]
    async fn repo_tree_lists_relative_paths() {
        let dir = seed_workspace();
        let tool = RepoTreeTool::new(dir.path(), 500);
        let result = tool.invoke(&call("repo_tree", "{}"), &CancelToken::new()).await;
        assert!(result.ok);
        let text = part_text(&result);
        assert!(text.contains("src/lib.rs"));
        assert!(text.contains("notes.md"));
    }

    #[tokio::test]
    async fn read_file_clamps_ranges() {
        let dir = seed_workspace();
        let tool = ReadFileTool::new(dir.path(), 400);

        let result = tool
            .invoke(
                &call("read_file", r#"{"path":"src/lib.rs","start_line":2,"end_line":99}"#),
                &CancelToken::new(),
            )
            .await;
        assert!(result.ok);
        let text = part_text(&result);
        assert!(text.starts_with("line two"));

        // Cap on span length.
        let capped = ReadFileTool::new(dir.path(), 1);
        let result = capped
            .invoke(
                &call("read_file", r#"{"path":"src/lib.rs"}"#),
                &CancelToken::new(),
            )
            .await;
        assert_eq!(part_text(&result), "line one");
    }

    #[tokio::test]
    async fn read_file_rejects_traversal() {
        let dir = seed_workspace();
        let tool = ReadFileTool::new(dir.path(), 400);
        let result = tool
            .invoke(
                &call("read_file", r#"{"path":"../../etc/passwd"}"#),
                &CancelToken::new(),
            )
            .await;
        assert!(!result.ok);
        assert!(result.error.unwrap().contains("escapes workspace"));
    }

    #[tokio::test]
    async fn search_formats_path_line_text() {
        let dir = seed_workspace();
        let tool = SearchTool::new(dir.path(), 50);
        let result = tool
            .invoke(&call("search", r#"{"query":"needle"}"#), &CancelToken::new())
            .await;
        assert!(result.ok);
        assert_eq!(part_text(&result), "notes.md:1:needle here");

        // Glob narrows by file name.
        let result = tool
            .invoke(
                &call("search", r#"{"query":"line","glob":"*.md"}"#),
                &CancelToken::new(),
            )
            .await;
        assert!(part_text(&result).is_empty());

        let result = tool
            .invoke(&call("search", r#"{"query":""}"#), &CancelToken::new())
            .await;
        assert!(!result.ok);
    }

    #[tokio::test]
    async fn git_status_succeeds_outside_a_repo() {
        let dir = seed_workspace();
        let tool = GitStatusTool::new(dir.path());
        let result = tool.invoke(&call("git_status", "{}"), &CancelToken::new()).await;
        assert!(result.ok);
        assert!(part_text(&result).is_empty());
    }

    fn part_text(result: &ToolResult) -> String {
        use drover_domain::tool::MessagePart;
        result
            .parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { text } => Some(text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
