//! Workspace context gathering.
//!
//! One snapshot per turn: `AGENTS.md`, a truncated repo tree, the symbol
//! map, and git porcelain status. Every field degrades to empty on
//! failure; a missing ctags or a non-repo workspace never fails a turn.

use std::path::Path;

use chrono::Utc;

use drover_domain::cancel::CancelToken;
use drover_tools::exec::{run_command, ExecOptions};
use drover_tools::symbols::build_repo_map;
use drover_tools::{default_walk_options, walk_files};

const MAX_TREE_FILES: usize = 500;
const MAX_MAP_SYMBOLS: usize = 400;

#[derive(Debug, Clone, Default)]
pub struct ContextBundle {
    pub generated_at: String,
    pub workspace: String,
    pub agents_md: Option<String>,
    pub repo_tree: Option<String>,
    pub repo_map: Option<String>,
    pub git_status: Option<String>,
}

pub async fn gather_context(workspace: &Path, cancel: &CancelToken) -> ContextBundle {
    let mut bundle = ContextBundle {
        generated_at: Utc::now().to_rfc3339(),
        workspace: workspace.to_string_lossy().into_owned(),
        ..Default::default()
    };

    bundle.agents_md = std::fs::read_to_string(workspace.join("AGENTS.md"))
        .ok()
        .filter(|c| !c.trim().is_empty());

    let files = walk_files(workspace, &default_walk_options()).unwrap_or_default();
    if !files.is_empty() {
        bundle.repo_tree = Some(
            files
                .iter()
                .take(MAX_TREE_FILES)
                .cloned()
                .collect::<Vec<_>>()
                .join("\n"),
        );
    }

    match build_repo_map(workspace, &files, MAX_MAP_SYMBOLS, Some(cancel)).await {
        Ok(map) if !map.is_empty() => bundle.repo_map = Some(map),
        Ok(_) => {}
        Err(err) => {
            tracing::debug!(error = %err, "symbol map unavailable");
        }
    }

    if workspace.join(".git").exists() {
        let status = run_command(
            "git status --porcelain",
            ExecOptions {
                dir: Some(workspace),
                timeout: Some(std::time::Duration::from_secs(10)),
                cancel: Some(cancel),
                ..Default::default()
            },
        )
        .await;
        if let Ok(res) = status {
            if res.exit_code == 0 {
                bundle.git_status = Some(res.stdout.trim().to_owned());
            }
        }
    }

    bundle
}

/// Render the bundle as the system context block.
pub fn format_context_text(bundle: &ContextBundle) -> String {
    let mut out = String::from("Workspace context:\n");
    if let Some(agents) = &bundle.agents_md {
        out.push_str("AGENTS.md:\n");
        out.push_str(agents);
        out.push_str("\n\n");
    }
    if let Some(tree) = &bundle.repo_tree {
        out.push_str("REPO TREE:\n");
        out.push_str(tree);
        out.push_str("\n\n");
    }
    if let Some(map) = &bundle.repo_map {
        out.push_str("REPO MAP:\n");
        out.push_str(map);
        out.push_str("\n\n");
    }
    if let Some(status) = &bundle.git_status {
        out.push_str("GIT STATUS:\n");
        out.push_str(status);
        out.push_str("\n\n");
    }
    out.trim().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gathers_best_effort_fields() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "follow the makefile\n").unwrap();
        std::fs::write(dir.path().join("main.py"), "def main():\n    pass\n").unwrap();

        let bundle = gather_context(dir.path(), &CancelToken::new()).await;
        assert_eq!(bundle.agents_md.as_deref(), Some("follow the makefile\n"));
        assert!(bundle.repo_tree.as_deref().unwrap().contains("main.py"));
        // Not a git repo: no status.
        assert!(bundle.git_status.is_none());
    }

    #[tokio::test]
    async fn empty_workspace_degrades_to_empty_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = gather_context(dir.path(), &CancelToken::new()).await;
        assert!(bundle.agents_md.is_none());
        assert!(bundle.repo_tree.is_none());

        let text = format_context_text(&bundle);
        assert_eq!(text, "Workspace context:");
    }

    #[test]
    fn format_includes_present_sections_only() {
        let bundle = ContextBundle {
            repo_tree: Some("a.rs\nb.rs".into()),
            git_status: Some("M a.rs".into()),
            ..Default::default()
        };
        let text = format_context_text(&bundle);
        assert!(text.contains("REPO TREE:\na.rs"));
        assert!(text.contains("GIT STATUS:\nM a.rs"));
        assert!(!text.contains("AGENTS.md"));
        assert!(!text.contains("REPO MAP"));
    }
}
