//! Per-engine policies: automatic verification and approval gating.

use drover_domain::tool::{ToolDefinition, ToolKind};

/// Controls the post-quiescence verification hook.
#[derive(Debug, Clone)]
pub struct VerifyPolicy {
    /// Run `verify` automatically when a turn quiesces with a dirty
    /// workspace.
    pub auto_verify: bool,
    pub commands: Vec<String>,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            auto_verify: true,
            commands: vec!["make test".into()],
        }
    }
}

/// Which tool invocations need a human decision.
#[derive(Debug, Clone)]
pub struct ApprovalPolicy {
    pub require_for_kinds: Vec<ToolKind>,
    pub require_for_tools: Vec<String>,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            require_for_kinds: vec![ToolKind::Exec, ToolKind::Write],
            require_for_tools: Vec::new(),
        }
    }
}

impl ApprovalPolicy {
    /// A call requires approval unless the tool opts out, when the tool
    /// demands it, its kind is gated, or its name is listed.
    pub fn requires_approval(&self, definition: &ToolDefinition) -> bool {
        if definition.allow_without_approval {
            return false;
        }
        if definition.requires_approval {
            return true;
        }
        if self.require_for_kinds.contains(&definition.kind) {
            return true;
        }
        self.require_for_tools.contains(&definition.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(kind: ToolKind, requires: bool, allow: bool) -> ToolDefinition {
        ToolDefinition {
            name: "t".into(),
            description: String::new(),
            kind,
            parameters: None,
            requires_approval: requires,
            allow_without_approval: allow,
        }
    }

    #[test]
    fn default_policy_gates_exec_and_write() {
        let policy = ApprovalPolicy::default();
        assert!(policy.requires_approval(&def(ToolKind::Exec, false, false)));
        assert!(policy.requires_approval(&def(ToolKind::Write, false, false)));
        assert!(!policy.requires_approval(&def(ToolKind::Read, false, false)));
    }

    #[test]
    fn allow_without_approval_wins() {
        let policy = ApprovalPolicy::default();
        assert!(!policy.requires_approval(&def(ToolKind::Write, true, true)));
    }

    #[test]
    fn name_listing_gates_reads() {
        let mut policy = ApprovalPolicy::default();
        policy.require_for_tools.push("t".into());
        assert!(policy.requires_approval(&def(ToolKind::Read, false, false)));
    }
}
