//! The tool registry.
//!
//! Tools are looked up by name; parameter schemas are data, so dispatch is
//! polymorphic over `dyn Tool` rather than over types.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use drover_domain::cancel::CancelToken;
use drover_domain::tool::{normalize_tool_input, ToolCall, ToolDefinition, ToolResult};
use drover_domain::{Error, Result};

use crate::patch::ApplyPatchTool;
use crate::shell::{DiagramTool, ShellTool, VerifyTool};
use crate::workspace::{GitStatusTool, ReadFileTool, RepoMapTool, RepoTreeTool, SearchTool};

#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;
    async fn invoke(&self, call: &ToolCall, cancel: &CancelToken) -> ToolResult;
}

/// Ordered mapping `name -> tool`.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.definition().name, tool);
    }

    /// All definitions, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub async fn invoke(&self, call: &ToolCall, cancel: &CancelToken) -> ToolResult {
        match self.get(&call.name) {
            Some(tool) => tool.invoke(call, cancel).await,
            None => ToolResult::failure(&call.id, format!("unknown tool: {}", call.name)),
        }
    }
}

/// The canonical workspace-scoped tool set.
pub fn default_tool_registry(workspace: &Path, verify_commands: &[String]) -> ToolRegistry {
    let commands: Vec<String> = if verify_commands.is_empty() {
        vec!["make test".into()]
    } else {
        verify_commands.to_vec()
    };

    let mut registry = ToolRegistry::new();
    registry.add(Arc::new(RepoTreeTool::new(workspace, 500)));
    registry.add(Arc::new(RepoMapTool::new(workspace, 400)));
    registry.add(Arc::new(ReadFileTool::new(workspace, 400)));
    registry.add(Arc::new(SearchTool::new(workspace, 50)));
    registry.add(Arc::new(GitStatusTool::new(workspace)));
    registry.add(Arc::new(ApplyPatchTool::new(workspace)));
    registry.add(Arc::new(ShellTool::new(
        workspace,
        Duration::from_secs(30 * 60),
    )));
    registry.add(Arc::new(DiagramTool::new(workspace)));
    registry.add(Arc::new(VerifyTool::new(
        workspace,
        commands,
        Duration::from_secs(30 * 60),
    )));
    registry
}

/// Parse a tool's input string into typed parameters after normalization.
pub fn parse_params<T: serde::de::DeserializeOwned>(input: &str) -> Result<T> {
    let normalized = normalize_tool_input(input);
    serde_json::from_str(&normalized).map_err(|_| Error::InvalidInput("invalid input".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_registry_lists_sorted_definitions() {
        let dir = tempfile::tempdir().unwrap();
        let registry = default_tool_registry(dir.path(), &[]);
        let names: Vec<String> = registry.definitions().iter().map(|d| d.name.clone()).collect();

        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        for expected in [
            "apply_patch",
            "diagram",
            "git_status",
            "read_file",
            "repo_map",
            "repo_tree",
            "search",
            "shell",
            "verify",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_a_clean_failure() {
        let dir = tempfile::tempdir().unwrap();
        let registry = default_tool_registry(dir.path(), &[]);
        let call = ToolCall {
            id: "call_x".into(),
            name: "teleport".into(),
            input: "{}".into(),
        };
        let result = registry.invoke(&call, &CancelToken::new()).await;
        assert!(!result.ok);
        assert!(result.error.unwrap().contains("unknown tool"));
    }

    #[test]
    fn parse_params_normalizes_first() {
        #[derive(serde::Deserialize)]
        struct P {
            #[serde(default)]
            max_files: Option<u64>,
        }
        let p: P = parse_params("").unwrap();
        assert!(p.max_files.is_none());
        let p: P = parse_params(r#"calling: {"max_files": 3}"#).unwrap();
        assert_eq!(p.max_files, Some(3));
        assert!(parse_params::<P>("true").is_err());
    }
}
