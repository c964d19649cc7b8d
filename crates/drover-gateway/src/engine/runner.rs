//! The run engine: executes a pre-generated linear plan against a
//! workspace+spec pair, with per-step approvals and durable artifacts.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tracing::Instrument;

use drover_domain::cancel::CancelToken;
use drover_domain::config::ModelPolicy;
use drover_domain::{Error, Result};
use drover_kit::{Kit, ModelRouter};
use drover_store::{Event, RunStatus, Step, StepStatus, StepType, Store};
use drover_tools::exec::{run_command, ExecOptions};
use drover_tools::patch::apply_unified_diff;
use drover_tools::spec::ensure_spec_file;

use super::context::gather_context;
use super::plan::{generate_plan, Plan};
use super::resolve_model;

const STEP_TIMEOUT: Duration = Duration::from_secs(30 * 60);

pub struct RunEngine {
    store: Arc<Store>,
    kit: Arc<dyn Kit>,
    router: ModelRouter,
    policy: Arc<RwLock<ModelPolicy>>,
    running: Mutex<HashSet<String>>,
}

impl RunEngine {
    pub fn new(store: Arc<Store>, kit: Arc<dyn Kit>, policy: Arc<RwLock<ModelPolicy>>) -> Self {
        Self {
            store,
            kit,
            router: ModelRouter::new(),
            policy,
            running: Mutex::new(HashSet::new()),
        }
    }

    /// Launch a run on a dedicated task. Starting an already-running run
    /// is a no-op.
    pub fn start_run(self: Arc<Self>, run_id: &str) {
        {
            let mut running = self.running.lock();
            if running.contains(run_id) {
                return;
            }
            running.insert(run_id.to_owned());
        }

        let token = CancelToken::new();
        self.store.set_run_cancel(run_id, &token);

        let engine = self;
        let run_id = run_id.to_owned();
        let span = tracing::info_span!("run", run_id = %run_id);
        tokio::spawn(
            async move {
                let outcome = engine.execute(&run_id, &token).await;
                match outcome {
                    Ok(()) => {}
                    Err(Error::Canceled(reason)) => {
                        if let Err(err) = engine.cancel_run_record(&run_id, &reason) {
                            tracing::warn!(error = %err, "failed to record canceled run");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "run failed");
                        if let Err(err) = engine.fail_run(&run_id, &err.to_string()) {
                            tracing::warn!(error = %err, "failed to record failed run");
                        }
                    }
                }
                engine.running.lock().remove(&run_id);
            }
            .instrument(span),
        );
    }

    async fn execute(&self, run_id: &str, token: &CancelToken) -> Result<()> {
        let mut run = self.store.get_run(run_id)?;
        run.status = RunStatus::Running;
        self.store.update_run(run.clone())?;
        self.emit(run_id, "run_started", Some("run started"), None)?;

        let spec_path = PathBuf::from(&run.spec_path);
        if ensure_spec_file(&spec_path)? {
            self.emit(
                run_id,
                "spec_created",
                None,
                Some(json!({ "spec_path": run.spec_path })),
            )?;
        }
        let spec_text = std::fs::read_to_string(&spec_path)?;
        self.emit(
            run_id,
            "spec_loaded",
            None,
            Some(json!({ "bytes": spec_text.len() })),
        )?;

        let workspace = PathBuf::from(&run.workspace_path);
        let bundle = gather_context(&workspace, token).await;
        self.emit(
            run_id,
            "context_gathered",
            None,
            Some(json!({
                "has_agents_md": bundle.agents_md.is_some(),
                "repo_tree_len": bundle.repo_tree.as_deref().map(|t| t.lines().count()).unwrap_or(0),
                "repo_map_len": bundle.repo_map.as_deref().map(|m| m.lines().count()).unwrap_or(0),
            })),
        )?;

        let policy = self.policy.read().clone();
        let record = resolve_model(self.kit.as_ref(), &self.router, &policy).await?;
        run.model_canonical = Some(record.id.clone());
        self.store.update_run(run.clone())?;
        self.emit(
            run_id,
            "model_resolved",
            None,
            Some(json!({ "model": record.id })),
        )?;

        let plan: Plan = generate_plan(self.kit.as_ref(), &record, &spec_text, &bundle).await;
        self.emit(
            run_id,
            "plan_generated",
            None,
            Some(json!({ "steps": plan.steps.len() })),
        )?;

        run.steps = plan.steps.clone();
        self.store.update_run(run)?;

        for step in &plan.steps {
            if token.is_cancelled() {
                return Err(Error::Canceled(token.reason()));
            }
            self.execute_step(run_id, step, token).await?;
        }

        let mut run = self.store.get_run(run_id)?;
        run.status = RunStatus::Succeeded;
        run.error = None;
        self.store.update_run(run)?;
        self.emit(run_id, "run_succeeded", Some("run completed successfully"), None)
    }

    async fn execute_step(&self, run_id: &str, step: &Step, token: &CancelToken) -> Result<()> {
        self.emit(
            run_id,
            "step_started",
            None,
            Some(json!({ "step_id": step.id, "title": step.title, "type": step.step_type })),
        )?;
        let mut run = self.store.get_run(run_id)?;
        if let Some(item) = run.steps.iter_mut().find(|s| s.id == step.id) {
            item.status = StepStatus::Running;
            item.started_at = Some(Utc::now());
        }
        self.store.update_run(run.clone())?;

        if step.needs_approval {
            run.status = RunStatus::WaitingApproval;
            if let Some(item) = run.steps.iter_mut().find(|s| s.id == step.id) {
                item.status = StepStatus::WaitingApproval;
            }
            self.store.update_run(run)?;

            let rx = self.store.require_approval(run_id, &step.id)?;
            self.emit(
                run_id,
                "approval_requested",
                None,
                Some(json!({ "step_id": step.id, "title": step.title })),
            )?;
            let decision = Store::wait_for_approval(rx, token).await?;
            if decision.is_denied() {
                return Err(Error::Other("approval denied".into()));
            }

            let mut run = self.store.get_run(run_id)?;
            run.status = RunStatus::Running;
            if let Some(item) = run.steps.iter_mut().find(|s| s.id == step.id) {
                item.status = StepStatus::Running;
            }
            self.store.update_run(run)?;
        }

        match step.step_type {
            StepType::Command => self.exec_command_step(run_id, step, None, token).await,
            StepType::Patch => self.exec_patch_step(run_id, step, token).await,
            StepType::Diagram => {
                self.exec_command_step(run_id, step, Some("make diagrams"), token)
                    .await
            }
            StepType::Note => self.complete_step(run_id, &step.id, true, ""),
        }
    }

    async fn exec_command_step(
        &self,
        run_id: &str,
        step: &Step,
        command_override: Option<&str>,
        token: &CancelToken,
    ) -> Result<()> {
        let run = self.store.get_run(run_id)?;
        let command = command_override
            .map(str::to_owned)
            .or_else(|| step.command.clone())
            .unwrap_or_default();
        if command.trim().is_empty() {
            return self.complete_step(run_id, &step.id, true, "no command (skipped)");
        }

        let result = run_command(
            &command,
            ExecOptions {
                dir: Some(Path::new(&run.workspace_path)),
                timeout: Some(STEP_TIMEOUT),
                cancel: Some(token),
                ..Default::default()
            },
        )
        .await;

        let (ok, exit_code, artifact_json) = match &result {
            Ok(res) => (
                res.exit_code == 0,
                res.exit_code,
                serde_json::to_string_pretty(res)?,
            ),
            Err(Error::Canceled(reason)) => return Err(Error::Canceled(reason.clone())),
            Err(err) => (
                false,
                1,
                serde_json::to_string_pretty(&json!({ "error": err.to_string() }))?,
            ),
        };

        let artifact_rel =
            self.store
                .write_run_artifact(run_id, &step.id, "command.json", &artifact_json)?;
        self.emit(
            run_id,
            "command_executed",
            None,
            Some(json!({
                "step_id": step.id,
                "cmd": command,
                "exit_code": exit_code,
                "artifact_rel": artifact_rel,
            })),
        )?;

        if !ok {
            self.complete_step(run_id, &step.id, false, "command failed")?;
            return Err(Error::Other("command failed".into()));
        }
        self.complete_step(run_id, &step.id, true, "")
    }

    async fn exec_patch_step(&self, run_id: &str, step: &Step, token: &CancelToken) -> Result<()> {
        let run = self.store.get_run(run_id)?;
        let patch = step.patch.clone().unwrap_or_default();
        if patch.trim().is_empty() {
            return self.complete_step(run_id, &step.id, true, "no patch (skipped)");
        }

        let result = apply_unified_diff(Path::new(&run.workspace_path), &patch, Some(token)).await;
        let (applied, artifact_json) = match &result {
            Ok(res) => (res.applied, serde_json::to_string_pretty(res)?),
            Err(Error::Canceled(reason)) => return Err(Error::Canceled(reason.clone())),
            Err(err) => (
                false,
                serde_json::to_string_pretty(
                    &json!({ "applied": false, "error": err.to_string() }),
                )?,
            ),
        };

        let artifact_rel =
            self.store
                .write_run_artifact(run_id, &step.id, "patch_apply.json", &artifact_json)?;
        self.emit(
            run_id,
            "patch_applied",
            None,
            Some(json!({
                "step_id": step.id,
                "applied": applied,
                "artifact_rel": artifact_rel,
            })),
        )?;

        if !applied {
            self.complete_step(run_id, &step.id, false, "patch apply error")?;
            return Err(Error::Other("patch apply error".into()));
        }
        self.complete_step(run_id, &step.id, true, "")
    }

    fn complete_step(&self, run_id: &str, step_id: &str, ok: bool, msg: &str) -> Result<()> {
        let mut run = self.store.get_run(run_id)?;
        if let Some(item) = run.steps.iter_mut().find(|s| s.id == step_id) {
            item.completed_at = Some(Utc::now());
            item.status = if ok {
                StepStatus::Succeeded
            } else {
                StepStatus::Failed
            };
        }
        self.store.update_run(run)?;
        let event_type = if ok { "step_completed" } else { "step_failed" };
        let mut event = Event::new(run_id, event_type)
            .with_data(json!({ "step_id": step_id, "ok": ok }));
        if !msg.is_empty() {
            event = event.with_message(msg);
        }
        self.store.append_event(run_id, event)
    }

    fn fail_run(&self, run_id: &str, error: &str) -> Result<()> {
        let mut run = self.store.get_run(run_id)?;
        run.status = RunStatus::Failed;
        run.error = Some(error.to_owned());
        self.store.update_run(run)?;
        self.emit(run_id, "run_failed", Some(error), None)
    }

    fn cancel_run_record(&self, run_id: &str, reason: &str) -> Result<()> {
        let mut run = self.store.get_run(run_id)?;
        run.status = RunStatus::Canceled;
        run.error = None;
        self.store.update_run(run)?;
        self.emit(run_id, "run_canceled", Some(reason), None)
    }

    fn emit(
        &self,
        run_id: &str,
        event_type: &str,
        message: Option<&str>,
        data: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut event = Event::new(run_id, event_type);
        if let Some(message) = message {
            event = event.with_message(message);
        }
        if let Some(data) = data {
            event = event.with_data(data);
        }
        self.store.append_event(run_id, event)
    }
}
