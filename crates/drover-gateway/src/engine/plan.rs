//! Plan generation for the run engine.
//!
//! One model call produces a JSON step list. Parsing tolerates code fences
//! and surrounding prose; any failure falls back to the default plan.

use serde::Deserialize;

use drover_domain::id::new_step_id;
use drover_domain::tool::Role;
use drover_domain::{Error, Result};
use drover_kit::{ChatMessage, GenerateRequest, Kit, ModelRecord};
use drover_store::{Step, StepStatus, StepType};

use super::context::ContextBundle;

#[derive(Debug, Clone)]
pub struct Plan {
    pub steps: Vec<Step>,
}

/// `make test` then best-effort diagrams.
pub fn default_plan() -> Plan {
    Plan {
        steps: vec![
            make_step("Run tests", StepType::Command, false, Some("make test".into())),
            make_step(
                "Render diagrams (best effort)",
                StepType::Command,
                false,
                Some("make diagrams".into()),
            ),
        ],
    }
}

fn make_step(title: &str, step_type: StepType, needs_approval: bool, command: Option<String>) -> Step {
    Step {
        id: new_step_id(),
        title: title.into(),
        step_type,
        needs_approval,
        command,
        patch: None,
        status: StepStatus::Pending,
        started_at: None,
        completed_at: None,
    }
}

/// Ask the model for a plan; fall back to [`default_plan`] when the
/// response cannot be parsed.
pub async fn generate_plan(
    kit: &dyn Kit,
    record: &ModelRecord,
    spec_text: &str,
    bundle: &ContextBundle,
) -> Plan {
    let prompt = build_planning_prompt(spec_text, bundle);
    let output = kit
        .generate(GenerateRequest {
            provider: record.provider.clone(),
            model: record.provider_model_id.clone(),
            messages: vec![ChatMessage::text(Role::User, prompt)],
            tools: Vec::new(),
        })
        .await;

    match output {
        Ok(output) => match parse_plan_from_text(&output.text) {
            Ok(mut plan) => {
                normalize_plan(&mut plan);
                plan
            }
            Err(err) => {
                tracing::warn!(error = %err, "plan parsing failed; using default plan");
                default_plan()
            }
        },
        Err(err) => {
            tracing::warn!(error = %err, "plan generation failed; using default plan");
            default_plan()
        }
    }
}

pub fn parse_plan_from_text(text: &str) -> Result<Plan> {
    let mut value = text.trim();
    if let Some(rest) = value.strip_prefix("```json") {
        value = rest;
    }
    if let Some(rest) = value.strip_prefix("```") {
        value = rest;
    }
    if let Some(rest) = value.strip_suffix("```") {
        value = rest;
    }
    let value = value.trim();

    let start = value.find('{');
    let end = value.rfind('}');
    let value = match (start, end) {
        (Some(start), Some(end)) if end > start => &value[start..=end],
        _ => value,
    };

    #[derive(Deserialize)]
    struct PlanDoc {
        #[serde(default)]
        steps: Vec<StepDoc>,
    }

    #[derive(Deserialize)]
    struct StepDoc {
        #[serde(default)]
        id: String,
        #[serde(default)]
        title: String,
        #[serde(rename = "type", default = "note_type")]
        step_type: StepType,
        #[serde(default)]
        needs_approval: bool,
        #[serde(default)]
        command: Option<String>,
        #[serde(default)]
        patch: Option<String>,
    }

    fn note_type() -> StepType {
        StepType::Note
    }

    let doc: PlanDoc = serde_json::from_str(value)?;
    if doc.steps.is_empty() {
        return Err(Error::InvalidInput("no steps in plan".into()));
    }
    Ok(Plan {
        steps: doc
            .steps
            .into_iter()
            .map(|s| Step {
                id: s.id,
                title: s.title,
                step_type: s.step_type,
                needs_approval: s.needs_approval,
                command: s.command,
                patch: s.patch,
                status: StepStatus::Pending,
                started_at: None,
                completed_at: None,
            })
            .collect(),
    })
}

fn normalize_plan(plan: &mut Plan) {
    for step in &mut plan.steps {
        if step.id.trim().is_empty() {
            step.id = new_step_id();
        }
        if step.title.trim().is_empty() {
            step.title = format!("{:?}", step.step_type).to_lowercase();
        }
    }
}

fn build_planning_prompt(spec_text: &str, bundle: &ContextBundle) -> String {
    let mut out = String::new();
    out.push_str("You are an expert coding-agent planner.\n");
    out.push_str("Return JSON ONLY (no markdown, no code fences) with this exact schema:\n\n");
    out.push_str(r#"{"steps":[{"id":"step_...","title":"...","type":"command|patch|diagram|note","needs_approval":true|false,"command":"...","patch":"..."}]}"#);
    out.push_str("\n\nRules:\n");
    out.push_str("- Use needs_approval=true for any destructive command or infra change.\n");
    out.push_str("- Use type=patch with a unified diff in patch when you propose code edits.\n");
    out.push_str("- Keep the step list short and executable.\n\n");
    out.push_str("SPEC:\n");
    out.push_str(spec_text);
    out.push_str("\n\n");
    if let Some(agents) = &bundle.agents_md {
        out.push_str("AGENTS.md:\n");
        out.push_str(agents);
        out.push_str("\n\n");
    }
    if let Some(map) = &bundle.repo_map {
        out.push_str("REPO MAP (symbols):\n");
        out.push_str(map);
        out.push_str("\n\n");
    }
    if let Some(status) = &bundle.git_status {
        out.push_str("GIT STATUS:\n");
        out.push_str(status);
        out.push_str("\n\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_json_with_prose() {
        let text = "Here is the plan:\n```json\n{\"steps\":[{\"id\":\"\",\"title\":\"Run tests\",\"type\":\"command\",\"needs_approval\":false,\"command\":\"make test\"}]}\n```\nGood luck!";
        let mut plan = parse_plan_from_text(text).unwrap();
        normalize_plan(&mut plan);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].step_type, StepType::Command);
        assert!(plan.steps[0].id.starts_with("step_"));
    }

    #[test]
    fn unknown_step_type_becomes_note() {
        let text = r#"{"steps":[{"id":"s1","title":"ponder","type":"meditate"}]}"#;
        let plan = parse_plan_from_text(text).unwrap();
        assert_eq!(plan.steps[0].step_type, StepType::Note);
    }

    #[test]
    fn empty_steps_is_an_error() {
        assert!(parse_plan_from_text(r#"{"steps":[]}"#).is_err());
        assert!(parse_plan_from_text("not a plan").is_err());
    }

    #[test]
    fn default_plan_runs_tests_then_diagrams() {
        let plan = default_plan();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].command.as_deref(), Some("make test"));
        assert_eq!(plan.steps[1].command.as_deref(), Some("make diagrams"));
        assert!(!plan.steps[0].needs_approval);
    }
}
