//! Spec documents: path helpers, the template, and the spec-mode tools.
//!
//! A spec is a markdown file with `Goal`, `Constraints`, and `Acceptance
//! tests` sections. Spec-mode sessions get three extra tools that read,
//! overwrite, and validate the session's spec file.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use drover_domain::cancel::CancelToken;
use drover_domain::paths;
use drover_domain::tool::{MessagePart, ToolCall, ToolDefinition, ToolKind, ToolResult};
use drover_domain::{Error, Result};

use crate::registry::{parse_params, Tool};

pub const DEFAULT_SPEC_CONTENT: &str = "# Goal\n\n<describe the goal>\n\n# Constraints / nuances\n\n- <constraints>\n\n# Acceptance tests\n\n- <acceptance tests>\n";

/// `<workspace>/specs/<name>/spec.md`.
pub fn default_spec_path(workspace: &Path, name: &str) -> Result<PathBuf> {
    if workspace.as_os_str().is_empty() {
        return Err(Error::InvalidInput("workspace path is empty".into()));
    }
    if name.trim().is_empty() {
        return Err(Error::InvalidInput("spec name is empty".into()));
    }
    Ok(workspace.join("specs").join(name).join("spec.md"))
}

/// Resolve a user-supplied spec path against the workspace, rejecting
/// escapes. Absolute paths must already live under the workspace.
pub fn resolve_spec_path(workspace: &Path, spec_path: &str) -> Result<PathBuf> {
    if spec_path.trim().is_empty() {
        return Err(Error::InvalidInput("spec_path is empty".into()));
    }
    let root = workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.to_path_buf());
    paths::ensure_within(&root, Path::new(spec_path))
}

/// Create the spec file from the template when missing. Returns whether a
/// file was created.
pub fn ensure_spec_file(spec_path: &Path) -> Result<bool> {
    if spec_path.as_os_str().is_empty() {
        return Err(Error::InvalidInput("spec path is empty".into()));
    }
    if spec_path.exists() {
        return Ok(false);
    }
    if let Some(parent) = spec_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(spec_path, DEFAULT_SPEC_CONTENT)?;
    Ok(true)
}

/// Check the three required headings. Returns `(ok, problems)`.
pub fn validate_spec_content(content: &str) -> (bool, Vec<String>) {
    let mut has_goal = false;
    let mut has_constraints = false;
    let mut has_acceptance = false;

    for line in content.lines() {
        let stripped = line.trim();
        if !stripped.starts_with('#') {
            continue;
        }
        let title = stripped.trim_start_matches('#').trim();
        if title.is_empty() {
            continue;
        }
        let lower = title.to_lowercase();
        if lower.starts_with("goal") {
            has_goal = true;
        }
        if lower.contains("constraint") {
            has_constraints = true;
        }
        if lower.contains("acceptance") {
            has_acceptance = true;
        }
    }

    let mut problems = Vec::new();
    if !has_goal {
        problems.push("missing heading: # Goal".to_owned());
    }
    if !has_constraints {
        problems.push("missing heading: # Constraints / nuances".to_owned());
    }
    if !has_acceptance {
        problems.push("missing heading: # Acceptance tests".to_owned());
    }
    (problems.is_empty(), problems)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Spec-mode tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SpecReadTool {
    spec_path: PathBuf,
}

impl SpecReadTool {
    pub fn new(spec_path: &Path) -> Self {
        Self {
            spec_path: spec_path.to_path_buf(),
        }
    }
}

#[async_trait::async_trait]
impl Tool for SpecReadTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "read_spec".into(),
            description: "Read the current spec.md content.".into(),
            kind: ToolKind::Read,
            parameters: Some(serde_json::json!({ "type": "object", "properties": {} })),
            requires_approval: false,
            allow_without_approval: false,
        }
    }

    async fn invoke(&self, call: &ToolCall, _cancel: &CancelToken) -> ToolResult {
        match std::fs::read_to_string(&self.spec_path) {
            Ok(content) => ToolResult::text(&call.id, content),
            Err(err) => ToolResult::failure_with_text(&call.id, err.to_string(), "spec not found"),
        }
    }
}

pub struct SpecWriteTool {
    spec_path: PathBuf,
}

impl SpecWriteTool {
    pub fn new(spec_path: &Path) -> Self {
        Self {
            spec_path: spec_path.to_path_buf(),
        }
    }
}

#[derive(Deserialize)]
struct WriteSpecParams {
    #[serde(default)]
    content: String,
}

#[async_trait::async_trait]
impl Tool for SpecWriteTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "write_spec".into(),
            description: "Overwrite spec.md with full content.".into(),
            kind: ToolKind::Write,
            parameters: Some(serde_json::json!({
                "type": "object",
                "properties": { "content": { "type": "string" } },
                "required": ["content"],
            })),
            requires_approval: false,
            allow_without_approval: true,
        }
    }

    async fn invoke(&self, call: &ToolCall, _cancel: &CancelToken) -> ToolResult {
        let params: WriteSpecParams = match parse_params(&call.input) {
            Ok(p) => p,
            Err(err) => return ToolResult::failure(&call.id, err.to_string()),
        };
        let mut content = params.content.trim().to_owned();
        if content.is_empty() {
            return ToolResult::failure(&call.id, "content is empty");
        }
        content.push('\n');

        if let Some(parent) = self.spec_path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                return ToolResult::failure(&call.id, err.to_string());
            }
        }
        match std::fs::write(&self.spec_path, content) {
            Ok(()) => ToolResult::text(&call.id, "spec written"),
            Err(err) => ToolResult::failure(&call.id, err.to_string()),
        }
    }
}

pub struct SpecValidateTool {
    spec_path: PathBuf,
}

impl SpecValidateTool {
    pub fn new(spec_path: &Path) -> Self {
        Self {
            spec_path: spec_path.to_path_buf(),
        }
    }
}

#[derive(Deserialize, Default)]
struct ValidateSpecParams {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait::async_trait]
impl Tool for SpecValidateTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "validate_spec".into(),
            description: "Validate spec.md structure (Goal, Constraints, Acceptance tests)."
                .into(),
            kind: ToolKind::Read,
            parameters: Some(serde_json::json!({
                "type": "object",
                "properties": { "content": { "type": "string" } },
            })),
            requires_approval: false,
            allow_without_approval: false,
        }
    }

    async fn invoke(&self, call: &ToolCall, _cancel: &CancelToken) -> ToolResult {
        let params: ValidateSpecParams = parse_params(&call.input).unwrap_or_default();
        let content = match params.content.filter(|c| !c.trim().is_empty()) {
            Some(content) => content,
            None => match std::fs::read_to_string(&self.spec_path) {
                Ok(content) => content,
                Err(err) => return ToolResult::failure(&call.id, err.to_string()),
            },
        };

        let (ok, problems) = validate_spec_content(&content);
        let mut text = format!("ok={ok}\n");
        if !problems.is_empty() {
            text.push_str(&problems.join("\n"));
        }
        let payload = serde_json::json!({ "ok": ok, "problems": problems });
        let parts = vec![
            MessagePart::text(text),
            MessagePart::text(serde_json::to_string_pretty(&payload).unwrap_or_default()),
        ];
        ToolResult {
            id: call.id.clone(),
            ok,
            parts,
            artifacts: None,
            error: if problems.is_empty() {
                None
            } else {
                Some(problems.join("; "))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_passes_validation() {
        let (ok, problems) = validate_spec_content(DEFAULT_SPEC_CONTENT);
        assert!(ok, "problems: {problems:?}");
    }

    #[test]
    fn validation_reports_missing_headings() {
        let (ok, problems) = validate_spec_content("# Goal\n\ndo things\n");
        assert!(!ok);
        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains("Constraints"));
        assert!(problems[1].contains("Acceptance"));

        let (ok, problems) = validate_spec_content("nothing structured");
        assert!(!ok);
        assert_eq!(problems.len(), 3);
    }

    #[test]
    fn validation_matches_headings_loosely() {
        let content = "## Goals\n\n### Hard constraints\n\n# Acceptance criteria\n";
        let (ok, _) = validate_spec_content(content);
        assert!(ok);
    }

    #[test]
    fn ensure_creates_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("specs/demo/spec.md");
        assert!(ensure_spec_file(&path).unwrap());
        assert!(!ensure_spec_file(&path).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), DEFAULT_SPEC_CONTENT);
    }

    #[test]
    fn resolve_spec_path_confines_to_workspace() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_spec_path(dir.path(), "specs/x/spec.md").is_ok());
        assert!(resolve_spec_path(dir.path(), "../outside/spec.md").is_err());
        assert!(resolve_spec_path(dir.path(), "/etc/spec.md").is_err());
        assert!(resolve_spec_path(dir.path(), " ").is_err());
    }

    #[tokio::test]
    async fn write_then_validate_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let spec_path = dir.path().join("spec.md");
        let write = SpecWriteTool::new(&spec_path);
        let validate = SpecValidateTool::new(&spec_path);
        let cancel = CancelToken::new();

        let call = ToolCall {
            id: "call_w".into(),
            name: "write_spec".into(),
            input: "{\"content\":\"# Goal\\n\\nship it\\n\\n# Constraints / nuances\\n\\n- none\\n\\n# Acceptance tests\\n\\n- make test\"}".into(),
        };
        let result = write.invoke(&call, &cancel).await;
        assert!(result.ok);
        assert!(std::fs::read_to_string(&spec_path).unwrap().ends_with('\n'));

        let call = ToolCall {
            id: "call_v".into(),
            name: "validate_spec".into(),
            input: "{}".into(),
        };
        let result = validate.invoke(&call, &cancel).await;
        assert!(result.ok);

        // Empty content is rejected by the writer.
        let call = ToolCall {
            id: "call_e".into(),
            name: "write_spec".into(),
            input: r#"{"content":"  "}"#.into(),
        };
        let result = write.invoke(&call, &cancel).await;
        assert!(!result.ok);
    }
}
