//! Workspace tooling: the subprocess runner, patch application, bounded
//! filesystem walks, the symbol index, and the tool registry the turn
//! engine dispatches through.

pub mod exec;
pub mod patch;
pub mod registry;
pub mod shell;
pub mod spec;
pub mod symbols;
pub mod walk;
pub mod workspace;

pub use exec::{run_command, CmdResult, ExecOptions};
pub use patch::{apply_unified_diff, ApplyPatchTool, PatchApplyResult};
pub use registry::{default_tool_registry, Tool, ToolRegistry};
pub use shell::{DiagramTool, ShellTool, VerifyTool};
pub use spec::{
    default_spec_path, ensure_spec_file, resolve_spec_path, validate_spec_content, SpecReadTool,
    SpecValidateTool, SpecWriteTool,
};
pub use walk::{default_walk_options, walk_files, WalkOptions};
