//! One-shot spec synthesis from a user prompt.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use drover_domain::config::ModelPolicy;
use drover_domain::tool::Role;
use drover_domain::{Error, Result};
use drover_kit::{ChatMessage, GenerateRequest, Kit, ModelRouter};

use super::resolve_model;

pub struct SpecGenerator {
    kit: Arc<dyn Kit>,
    router: ModelRouter,
    policy: Arc<RwLock<ModelPolicy>>,
}

impl SpecGenerator {
    pub fn new(kit: Arc<dyn Kit>, policy: Arc<RwLock<ModelPolicy>>) -> Self {
        Self {
            kit,
            router: ModelRouter::new(),
            policy,
        }
    }

    /// Produce the spec document. An empty completion is an error; a
    /// non-empty one missing the `# Goal` heading falls back to the
    /// deterministic template.
    pub async fn generate_spec(
        &self,
        workspace: &Path,
        spec_name: &str,
        prompt: &str,
    ) -> Result<String> {
        let policy = self.policy.read().clone();
        let record = resolve_model(self.kit.as_ref(), &self.router, &policy).await?;

        let agents = std::fs::read_to_string(workspace.join("AGENTS.md")).unwrap_or_default();
        let request = build_spec_prompt(spec_name, prompt, &agents);

        let output = self
            .kit
            .generate(GenerateRequest {
                provider: record.provider.clone(),
                model: record.provider_model_id.clone(),
                messages: vec![ChatMessage::text(Role::User, request)],
                tools: Vec::new(),
            })
            .await?;

        let mut content = output.text.trim().to_owned();
        if content.is_empty() {
            return Err(Error::Provider {
                provider: record.provider,
                message: "model returned empty spec".into(),
            });
        }
        if !content.contains("# Goal") {
            content = fallback_spec(spec_name, prompt);
        }
        if !content.ends_with('\n') {
            content.push('\n');
        }
        Ok(content)
    }
}

fn build_spec_prompt(name: &str, prompt: &str, agents: &str) -> String {
    let mut out = String::new();
    out.push_str("You are an expert product/spec writer for a coding agent harness.\n");
    out.push_str("Return ONLY markdown (no code fences, no commentary).\n");
    out.push_str("Follow this exact structure:\n");
    out.push_str("---\n");
    out.push_str(&format!("name: {name}\n"));
    out.push_str("owner: you\n");
    out.push_str("status: draft\n");
    out.push_str("---\n\n");
    out.push_str("# Goal\n\n<one paragraph goal>\n\n");
    out.push_str("# Constraints / nuances\n\n- <bullets>\n\n");
    out.push_str("# Acceptance tests\n\n- <bulleted, runnable checks>\n\n");
    out.push_str("# Notes\n\n- <optional>\n\n");
    out.push_str("USER PROMPT:\n");
    out.push_str(prompt);
    out.push_str("\n\n");
    if !agents.trim().is_empty() {
        out.push_str("AGENTS.md:\n");
        out.push_str(agents);
        out.push_str("\n\n");
    }
    out
}

fn fallback_spec(name: &str, prompt: &str) -> String {
    format!(
        "---\nname: {name}\nowner: you\nstatus: draft\n---\n\n# Goal\n\n{}\n\n# Constraints / nuances\n\n- Follow repo conventions in AGENTS.md.\n\n# Acceptance tests\n\n- make test\n",
        prompt.trim()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_contains_required_headings() {
        let spec = fallback_spec("demo", "build a widget");
        assert!(spec.contains("# Goal"));
        assert!(spec.contains("build a widget"));
        assert!(spec.contains("# Acceptance tests"));
        assert!(spec.ends_with('\n'));
    }

    #[test]
    fn prompt_embeds_name_and_agents() {
        let prompt = build_spec_prompt("demo", "do things", "use the makefile");
        assert!(prompt.contains("name: demo"));
        assert!(prompt.contains("USER PROMPT:\ndo things"));
        assert!(prompt.contains("AGENTS.md:\nuse the makefile"));
    }
}
