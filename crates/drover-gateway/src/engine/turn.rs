//! The turn engine: the iterative plan/act loop driving one session turn.
//!
//! Given `(session_id, turn_id)` the engine snapshots workspace context,
//! resolves a model, then loops: compose prompt, call the model, dedup and
//! execute tool calls under the approval policy, and persist every
//! transcript message and event along the way. The loop ends on
//! quiescence (optionally after automatic verification), on cancellation,
//! on failure, or after [`MAX_ITERATIONS`] rounds.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine as _;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tracing::Instrument;

use drover_domain::cancel::CancelToken;
use drover_domain::config::ModelPolicy;
use drover_domain::id::{new_message_id, new_tool_call_id};
use drover_domain::tool::{
    normalize_tool_input, parse_tool_input, tool_call_key, MessagePart, Role, ToolCall, ToolKind,
    ToolResult,
};
use drover_domain::{Error, Result};
use drover_kit::{pricing, ChatMessage, ChatPart, GenerateRequest, GenerationCost, Kit, ModelRecord, ModelRouter};
use drover_store::{
    Message, Session, SessionEvent, SessionMode, SessionStatus, Store, TurnStatus,
};
use drover_tools::registry::{default_tool_registry, Tool, ToolRegistry};
use drover_tools::spec::{default_spec_path, ensure_spec_file, SpecReadTool, SpecValidateTool, SpecWriteTool};

use super::context::{format_context_text, gather_context, ContextBundle};
use super::policies::{ApprovalPolicy, VerifyPolicy};
use super::resolve_model;

/// Model-call rounds before a turn is failed as non-quiescent.
pub const MAX_ITERATIONS: usize = 8;

pub struct TurnEngine {
    store: Arc<Store>,
    kit: Arc<dyn Kit>,
    router: ModelRouter,
    policy: Arc<RwLock<ModelPolicy>>,
    verify_policy: VerifyPolicy,
    approval_policy: ApprovalPolicy,
    /// Session ids with an in-flight turn. At most one turn per session.
    running: Mutex<HashSet<String>>,
}

impl TurnEngine {
    pub fn new(store: Arc<Store>, kit: Arc<dyn Kit>, policy: Arc<RwLock<ModelPolicy>>) -> Self {
        Self {
            store,
            kit,
            router: ModelRouter::new(),
            policy,
            verify_policy: VerifyPolicy::default(),
            approval_policy: ApprovalPolicy::default(),
            running: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_verify_policy(mut self, verify_policy: VerifyPolicy) -> Self {
        self.verify_policy = verify_policy;
        self
    }

    pub fn with_approval_policy(mut self, approval_policy: ApprovalPolicy) -> Self {
        self.approval_policy = approval_policy;
        self
    }

    /// Admit and launch one turn on a dedicated task. Fails synchronously
    /// when the session already has a turn in flight.
    pub fn start_turn(self: Arc<Self>, session_id: &str, turn_id: &str) -> Result<()> {
        {
            let mut running = self.running.lock();
            if running.contains(session_id) {
                return Err(Error::Conflict(format!(
                    "session already running: {session_id}"
                )));
            }
            running.insert(session_id.to_owned());
        }

        let token = CancelToken::new();
        self.store.set_session_cancel(session_id, &token);

        let engine = self;
        let session_id = session_id.to_owned();
        let turn_id = turn_id.to_owned();
        let span = tracing::info_span!("turn", session_id = %session_id, turn_id = %turn_id);
        tokio::spawn(
            async move {
                let outcome = engine.run_turn(&session_id, &turn_id, &token).await;
                match outcome {
                    Ok(()) => {}
                    Err(Error::Canceled(reason)) => {
                        if let Err(err) = engine.cancel_turn(&session_id, &turn_id, &reason) {
                            tracing::warn!(error = %err, "failed to record canceled turn");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "turn failed");
                        if let Err(err) = engine.fail_turn(&session_id, &turn_id, &err.to_string())
                        {
                            tracing::warn!(error = %err, "failed to record failed turn");
                        }
                    }
                }
                engine.running.lock().remove(&session_id);
            }
            .instrument(span),
        );
        Ok(())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // The loop
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn run_turn(&self, session_id: &str, turn_id: &str, token: &CancelToken) -> Result<()> {
        let mut session = self.store.get_session(session_id)?;
        if session.turn_mut(turn_id).is_none() {
            return Err(Error::NotFound(format!("turn not found: {turn_id}")));
        }

        session.status = SessionStatus::Active;
        session.last_turn_id = Some(turn_id.to_owned());
        if let Some(turn) = session.turn_mut(turn_id) {
            turn.status = TurnStatus::Running;
            turn.started_at = Some(Utc::now());
            turn.error = None;
        }
        self.store.update_session(session.clone())?;
        self.emit(session_id, turn_id, "turn_started", None, None)?;

        let workspace = PathBuf::from(&session.workspace_path);
        let bundle = gather_context(&workspace, token).await;

        let policy = self.policy.read().clone();
        let record = resolve_model(self.kit.as_ref(), &self.router, &policy).await?;
        self.emit(
            session_id,
            turn_id,
            "model_resolved",
            None,
            Some(json!({ "model": record.id })),
        )?;

        let mut registry = default_tool_registry(&workspace, &self.verify_policy.commands);

        if session.mode == SessionMode::Spec {
            session = self.setup_spec_mode(session, turn_id, &workspace, &mut registry)?;
        }

        let mut workspace_dirty = false;
        let mut seen_call_keys: HashSet<String> = HashSet::new();

        for _ in 0..MAX_ITERATIONS {
            if token.is_cancelled() {
                return Err(Error::Canceled(token.reason()));
            }

            let messages = self.build_kit_messages(&session, &bundle, &record)?;
            let definitions = registry.definitions();
            let (assistant_text, tool_calls, cost) = self
                .run_model(session_id, turn_id, &record, messages, definitions)
                .await?;
            self.record_session_cost(&mut session, cost)?;

            // Dedup and schedule: a call key seen earlier this turn is
            // skipped with events instead of re-executed.
            let mut calls_to_run: Vec<(ToolCall, Arc<dyn Tool>)> = Vec::new();
            for call in &tool_calls {
                let tool = registry
                    .get(&call.name)
                    .ok_or_else(|| Error::NotFound(format!("unknown tool: {}", call.name)))?;
                if !seen_call_keys.insert(tool_call_key(call)) {
                    self.append_skipped_tool(session_id, turn_id, call)?;
                    continue;
                }
                calls_to_run.push((call.clone(), tool));
            }

            // Persist the assistant message (text plus accepted tool_use
            // parts).
            let mut parts: Vec<MessagePart> = Vec::new();
            if !assistant_text.trim().is_empty() {
                parts.push(MessagePart::text(assistant_text.clone()));
            }
            for (call, _) in &calls_to_run {
                parts.push(MessagePart::ToolUse {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    tool_input: parse_tool_input(&call.input),
                });
            }
            if !parts.is_empty() {
                let msg = Message::new(new_message_id(), Role::Assistant, parts);
                let msg_id = msg.id.clone();
                session = self.store.append_message(session_id, msg)?;
                self.emit(
                    session_id,
                    turn_id,
                    "message_added",
                    None,
                    Some(json!({ "message_id": msg_id, "role": "assistant" })),
                )?;
            }

            // Quiescence: no tool calls at all this round.
            if tool_calls.is_empty() {
                if self.verify_policy.auto_verify && workspace_dirty {
                    let (_, ok) = self
                        .invoke_verify(session_id, turn_id, &registry, token)
                        .await?;
                    session = self.store.get_session(session_id)?;
                    if !ok {
                        continue;
                    }
                }
                return self.complete_turn(session_id, turn_id);
            }

            // Execute accepted calls, in model order.
            for (call, tool) in &calls_to_run {
                let definition = tool.definition();

                if self.approval_policy.requires_approval(&definition) {
                    session = self.store.get_session(session_id)?;
                    session.status = SessionStatus::WaitingApproval;
                    if let Some(turn) = session.turn_mut(turn_id) {
                        turn.status = TurnStatus::WaitingApproval;
                    }
                    self.store.update_session(session.clone())?;

                    let rx = self.store.require_session_approval(session_id, &call.id)?;
                    self.emit(
                        session_id,
                        turn_id,
                        "approval_requested",
                        None,
                        Some(json!({ "tool": call.name, "tool_call_id": call.id })),
                    )?;
                    let decision = Store::wait_for_approval(rx, token).await?;
                    if decision.is_denied() {
                        self.emit(
                            session_id,
                            turn_id,
                            "approval_denied",
                            None,
                            Some(json!({
                                "tool": call.name,
                                "tool_call_id": call.id,
                                "reason": decision.reason,
                            })),
                        )?;
                        return Err(Error::Other("approval denied".into()));
                    }
                    session.status = SessionStatus::Active;
                    if let Some(turn) = session.turn_mut(turn_id) {
                        turn.status = TurnStatus::Running;
                    }
                    self.store.update_session(session.clone())?;
                    self.emit(
                        session_id,
                        turn_id,
                        "approval_granted",
                        None,
                        Some(json!({
                            "tool": call.name,
                            "tool_call_id": call.id,
                            "reason": decision.reason,
                        })),
                    )?;
                }

                self.emit(
                    session_id,
                    turn_id,
                    "tool_call_started",
                    None,
                    Some(json!({ "tool": call.name, "tool_call_id": call.id })),
                )?;
                let result = tool.invoke(call, token).await;
                self.emit(
                    session_id,
                    turn_id,
                    "tool_call_completed",
                    None,
                    Some(json!({
                        "tool": call.name,
                        "tool_call_id": call.id,
                        "ok": result.ok,
                        "error": result.error,
                    })),
                )?;

                session = self.append_tool_message(session_id, turn_id, &call.id, &result)?;

                let is_spec_write =
                    session.mode == SessionMode::Spec && call.name == "write_spec";
                if matches!(definition.kind, ToolKind::Write | ToolKind::Exec) && !is_spec_write {
                    workspace_dirty = true;
                }

                // Spec-mode post-hook: every write is validated, and a
                // failed validation hands control back to the model.
                if is_spec_write {
                    let (_, ok) = self
                        .invoke_spec_validate(session_id, turn_id, &registry, token)
                        .await?;
                    session = self.store.get_session(session_id)?;
                    if !ok {
                        continue;
                    }
                }

                if !result.ok {
                    break;
                }
            }

            // Every call this round was a duplicate: quiesce the same way
            // an empty round does.
            if calls_to_run.is_empty() {
                if self.verify_policy.auto_verify && workspace_dirty {
                    let (_, ok) = self
                        .invoke_verify(session_id, turn_id, &registry, token)
                        .await?;
                    session = self.store.get_session(session_id)?;
                    if !ok {
                        continue;
                    }
                }
                return self.complete_turn(session_id, turn_id);
            }
        }

        Err(Error::Other("max turn iterations reached".into()))
    }

    fn setup_spec_mode(
        &self,
        mut session: Session,
        turn_id: &str,
        workspace: &Path,
        registry: &mut ToolRegistry,
    ) -> Result<Session> {
        if session
            .spec_path
            .as_deref()
            .map(str::trim)
            .unwrap_or("")
            .is_empty()
        {
            let path = default_spec_path(workspace, &format!("session-{}", session.id))?;
            session.spec_path = Some(path.to_string_lossy().into_owned());
            self.store.update_session(session.clone())?;
            self.emit(
                &session.id,
                turn_id,
                "spec_path_set",
                None,
                Some(json!({ "spec_path": session.spec_path })),
            )?;
        }

        let spec_path = PathBuf::from(session.spec_path.clone().unwrap_or_default());
        if ensure_spec_file(&spec_path)? {
            self.emit(
                &session.id,
                turn_id,
                "spec_created",
                None,
                Some(json!({ "spec_path": session.spec_path })),
            )?;
        }

        registry.add(Arc::new(SpecReadTool::new(&spec_path)));
        registry.add(Arc::new(SpecWriteTool::new(&spec_path)));
        registry.add(Arc::new(SpecValidateTool::new(&spec_path)));
        Ok(session)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Prompt assembly
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    fn build_kit_messages(
        &self,
        session: &Session,
        bundle: &ContextBundle,
        record: &ModelRecord,
    ) -> Result<Vec<ChatMessage>> {
        let mut out: Vec<ChatMessage> = Vec::new();

        if let Some(system_prompt) = session.system_prompt.as_deref() {
            if !system_prompt.trim().is_empty() {
                out.push(ChatMessage::text(Role::System, system_prompt));
            }
        }
        if session.mode == SessionMode::Spec {
            out.push(ChatMessage::text(
                Role::System,
                spec_mode_prompt(session.spec_path.as_deref().unwrap_or("")),
            ));
        }
        let context_text = format_context_text(bundle);
        if !context_text.is_empty() {
            out.push(ChatMessage::text(Role::System, context_text));
        }
        if session.mode == SessionMode::Spec {
            if let Some(spec_path) = session.spec_path.as_deref() {
                if let Ok(content) = std::fs::read_to_string(spec_path) {
                    if !content.trim().is_empty() {
                        out.push(ChatMessage::text(
                            Role::System,
                            format!("CURRENT SPEC ({spec_path}):\n{content}"),
                        ));
                    }
                }
            }
        }

        let prepared = prepare_session_messages(&session.messages, record.supports_tools);
        for msg in &prepared {
            out.push(self.to_kit_message(&session.id, msg, record));
        }
        Ok(out)
    }

    fn to_kit_message(&self, session_id: &str, msg: &Message, record: &ModelRecord) -> ChatMessage {
        let mut parts: Vec<ChatPart> = Vec::new();
        for part in &msg.parts {
            match part {
                MessagePart::Text { text } => parts.push(ChatPart::Text { text: text.clone() }),
                MessagePart::ToolUse {
                    tool_call_id,
                    tool_name,
                    tool_input,
                } => parts.push(ChatPart::ToolUse {
                    id: tool_call_id.clone(),
                    name: tool_name.clone(),
                    arguments_json: tool_input.to_string(),
                }),
                MessagePart::Image {
                    attachment,
                    mime_type,
                } => {
                    let loaded = record
                        .supports_vision
                        .then(|| self.load_image_attachment(session_id, attachment, mime_type))
                        .flatten();
                    match loaded {
                        Some((base64, media_type)) => {
                            parts.push(ChatPart::Image { base64, media_type })
                        }
                        None => parts.push(ChatPart::Text {
                            text: format!("[image: {attachment}]"),
                        }),
                    }
                }
                MessagePart::File {
                    attachment,
                    mime_type: _,
                } => parts.push(ChatPart::Text {
                    text: format!("[file: {attachment}]"),
                }),
            }
        }
        let mut out = ChatMessage::new(msg.role, parts);
        out.tool_call_id = msg.tool_call_id.clone();
        out
    }

    fn load_image_attachment(
        &self,
        session_id: &str,
        reference: &str,
        mime_type: &Option<String>,
    ) -> Option<(String, String)> {
        if reference.is_empty() {
            return None;
        }
        let path = self
            .store
            .session_attachment_path(session_id, reference)
            .ok()?;
        let data = std::fs::read(path).ok()?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        let media_type = mime_type
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "image/png".to_owned());
        Some((encoded, media_type))
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Model interaction & cost
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn run_model(
        &self,
        session_id: &str,
        turn_id: &str,
        record: &ModelRecord,
        messages: Vec<ChatMessage>,
        tools: Vec<drover_domain::tool::ToolDefinition>,
    ) -> Result<(String, Vec<ToolCall>, Option<GenerationCost>)> {
        let output = self
            .kit
            .generate(GenerateRequest {
                provider: record.provider.clone(),
                model: record.provider_model_id.clone(),
                messages,
                tools,
            })
            .await?;

        let cost = output
            .cost
            .filter(|c| !c.is_empty())
            .or_else(|| {
                output
                    .usage
                    .as_ref()
                    .and_then(|usage| pricing::estimate_cost(record, usage))
            });

        if !output.text.is_empty() {
            self.emit(
                session_id,
                turn_id,
                "model_output_delta",
                None,
                Some(json!({ "delta": output.text })),
            )?;
        }
        self.emit(
            session_id,
            turn_id,
            "model_output_completed",
            None,
            Some(json!({ "finish_reason": output.finish_reason })),
        )?;

        let mut calls = Vec::new();
        for call in output.tool_calls {
            let id = if call.id.is_empty() {
                new_tool_call_id()
            } else {
                call.id
            };
            calls.push(ToolCall {
                id,
                name: call.name,
                input: normalize_tool_input(&call.arguments_json),
            });
        }
        Ok((output.text, calls, cost))
    }

    fn record_session_cost(
        &self,
        session: &mut Session,
        cost: Option<GenerationCost>,
    ) -> Result<()> {
        let Some(cost) = cost else {
            return Ok(());
        };
        if cost.is_empty() {
            return Ok(());
        }
        let entry = session.cost.get_or_insert_with(Default::default);
        let input = cost.input_cost_usd.unwrap_or(0.0);
        let output = cost.output_cost_usd.unwrap_or(0.0);
        let total = cost.total_cost_usd.unwrap_or(input + output);
        entry.input_cost_usd = round6(entry.input_cost_usd + input);
        entry.output_cost_usd = round6(entry.output_cost_usd + output);
        entry.total_cost_usd = round6(entry.total_cost_usd + total);
        self.store.update_session(session.clone())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Hooks: verify & spec validation
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Synthetic `verify` invocation after quiescence. Returns the tool
    /// message and its `ok` flag so the loop can keep iterating on
    /// failure.
    async fn invoke_verify(
        &self,
        session_id: &str,
        turn_id: &str,
        registry: &ToolRegistry,
        token: &CancelToken,
    ) -> Result<(Message, bool)> {
        let call = ToolCall {
            id: new_tool_call_id(),
            name: "verify".into(),
            input: "{}".into(),
        };
        let tool = registry
            .get("verify")
            .ok_or_else(|| Error::Other("verify tool not configured".into()))?;

        if self.approval_policy.requires_approval(&tool.definition()) {
            let rx = self.store.require_session_approval(session_id, &call.id)?;
            self.emit(
                session_id,
                turn_id,
                "approval_requested",
                None,
                Some(json!({ "tool": "verify", "tool_call_id": call.id })),
            )?;
            let decision = Store::wait_for_approval(rx, token).await?;
            if decision.is_denied() {
                return Err(Error::Other("verification denied".into()));
            }
        }

        self.emit(
            session_id,
            turn_id,
            "tool_call_started",
            None,
            Some(json!({ "tool": "verify", "tool_call_id": call.id })),
        )?;
        let result = tool.invoke(&call, token).await;
        self.emit(
            session_id,
            turn_id,
            "tool_call_completed",
            None,
            Some(json!({
                "tool": "verify",
                "tool_call_id": call.id,
                "ok": result.ok,
                "error": result.error,
            })),
        )?;

        let ok = result.ok;
        let mut msg = Message::new(new_message_id(), Role::Tool, result.parts.clone());
        msg.tool_call_id = Some(call.id.clone());
        let msg_id = msg.id.clone();
        self.store.append_message(session_id, msg.clone())?;
        self.emit(
            session_id,
            turn_id,
            "message_added",
            None,
            Some(json!({ "message_id": msg_id, "role": "tool" })),
        )?;
        Ok((msg, ok))
    }

    async fn invoke_spec_validate(
        &self,
        session_id: &str,
        turn_id: &str,
        registry: &ToolRegistry,
        token: &CancelToken,
    ) -> Result<(Message, bool)> {
        let call = ToolCall {
            id: new_tool_call_id(),
            name: "validate_spec".into(),
            input: "{}".into(),
        };
        let tool = registry
            .get("validate_spec")
            .ok_or_else(|| Error::Other("validate_spec tool not configured".into()))?;

        self.emit(
            session_id,
            turn_id,
            "tool_call_started",
            None,
            Some(json!({ "tool": "validate_spec", "tool_call_id": call.id })),
        )?;
        let result = tool.invoke(&call, token).await;
        self.emit(
            session_id,
            turn_id,
            "tool_call_completed",
            None,
            Some(json!({
                "tool": "validate_spec",
                "tool_call_id": call.id,
                "ok": result.ok,
                "error": result.error,
            })),
        )?;
        self.emit(
            session_id,
            turn_id,
            "spec_validated",
            None,
            Some(json!({ "ok": result.ok, "error": result.error })),
        )?;

        let ok = result.ok;
        let mut msg = Message::new(new_message_id(), Role::Tool, result.parts.clone());
        msg.tool_call_id = Some(call.id.clone());
        let msg_id = msg.id.clone();
        self.store.append_message(session_id, msg.clone())?;
        self.emit(
            session_id,
            turn_id,
            "message_added",
            None,
            Some(json!({ "message_id": msg_id, "role": "tool" })),
        )?;
        Ok((msg, ok))
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Bookkeeping
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    fn append_tool_message(
        &self,
        session_id: &str,
        turn_id: &str,
        tool_call_id: &str,
        result: &ToolResult,
    ) -> Result<Session> {
        let mut msg = Message::new(new_message_id(), Role::Tool, result.parts.clone());
        msg.tool_call_id = Some(tool_call_id.to_owned());
        let msg_id = msg.id.clone();
        let session = self.store.append_message(session_id, msg)?;
        self.emit(
            session_id,
            turn_id,
            "message_added",
            None,
            Some(json!({ "message_id": msg_id, "role": "tool" })),
        )?;
        Ok(session)
    }

    fn append_skipped_tool(&self, session_id: &str, turn_id: &str, call: &ToolCall) -> Result<()> {
        let reason = "duplicate tool call: no new info";
        self.emit(
            session_id,
            turn_id,
            "tool_call_skipped",
            None,
            Some(json!({ "tool": call.name, "tool_call_id": call.id, "reason": reason })),
        )?;
        self.emit(
            session_id,
            turn_id,
            "tool_call_completed",
            None,
            Some(json!({
                "tool": call.name,
                "tool_call_id": call.id,
                "ok": false,
                "error": reason,
                "skipped": true,
            })),
        )
    }

    fn complete_turn(&self, session_id: &str, turn_id: &str) -> Result<()> {
        let mut session = self.store.get_session(session_id)?;
        session.status = SessionStatus::Active;
        session.error = None;
        if let Some(turn) = session.turn_mut(turn_id) {
            turn.status = TurnStatus::Succeeded;
            turn.completed_at = Some(Utc::now());
        }
        self.store.update_session(session)?;
        self.emit(session_id, turn_id, "turn_completed", None, None)
    }

    fn fail_turn(&self, session_id: &str, turn_id: &str, error: &str) -> Result<()> {
        let mut session = self.store.get_session(session_id)?;
        session.status = SessionStatus::Failed;
        session.error = Some(error.to_owned());
        if let Some(turn) = session.turn_mut(turn_id) {
            turn.status = TurnStatus::Failed;
            turn.completed_at = Some(Utc::now());
            turn.error = Some(error.to_owned());
        }
        self.store.update_session(session)?;
        self.emit(
            session_id,
            turn_id,
            "turn_failed",
            Some(error.to_owned()),
            None,
        )
    }

    fn cancel_turn(&self, session_id: &str, turn_id: &str, reason: &str) -> Result<()> {
        let mut session = self.store.get_session(session_id)?;
        session.status = SessionStatus::Canceled;
        session.error = Some(reason.to_owned());
        if let Some(turn) = session.turn_mut(turn_id) {
            turn.status = TurnStatus::Failed;
            turn.completed_at = Some(Utc::now());
            turn.error = Some(reason.to_owned());
        }
        self.store.update_session(session)?;
        self.emit(
            session_id,
            turn_id,
            "session_canceled",
            Some(reason.to_owned()),
            None,
        )
    }

    fn emit(
        &self,
        session_id: &str,
        turn_id: &str,
        event_type: &str,
        message: Option<String>,
        data: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut event = SessionEvent::new(session_id, event_type).with_turn(turn_id);
        if let Some(message) = message {
            event = event.with_message(message);
        }
        if let Some(data) = data {
            event = event.with_data(data);
        }
        self.store.append_session_event(session_id, event)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message preparation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shape the transcript for the target model.
///
/// When the model lacks tool-message support, `tool_use` parts are
/// stripped and tool messages are inlined as labeled user text. Tool
/// messages whose call id never appeared in an earlier `tool_use` part
/// are inlined either way. Assistant text parts lose trailing whitespace.
pub(super) fn prepare_session_messages(messages: &[Message], supports_tools: bool) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::new();
    let mut seen_tool_uses: HashSet<String> = HashSet::new();

    for msg in messages {
        for part in &msg.parts {
            if let MessagePart::ToolUse { tool_call_id, .. } = part {
                seen_tool_uses.insert(tool_call_id.clone());
            }
        }

        let mut normalized = msg.clone();
        if !supports_tools {
            normalized
                .parts
                .retain(|p| !matches!(p, MessagePart::ToolUse { .. }));
            if normalized.parts.is_empty() {
                continue;
            }
        }

        if normalized.role != Role::Tool {
            out.push(normalized);
            continue;
        }

        let keep_as_tool = supports_tools
            && normalized
                .tool_call_id
                .as_deref()
                .map(|id| seen_tool_uses.contains(id))
                .unwrap_or(false);
        if keep_as_tool {
            out.push(normalized);
            continue;
        }

        let mut text = tool_message_text(&normalized.parts);
        if text.trim().is_empty() {
            text = "(no output)".to_owned();
        }
        let label = match normalized.tool_call_id.as_deref() {
            Some(id) => format!("TOOL OUTPUT ({id})"),
            None => "TOOL OUTPUT".to_owned(),
        };
        out.push(Message {
            id: normalized.id,
            role: Role::User,
            parts: vec![MessagePart::text(format!("{label}:\n{text}"))],
            created_at: normalized.created_at,
            tool_call_id: None,
        });
    }

    for msg in &mut out {
        if msg.role == Role::Assistant {
            for part in &mut msg.parts {
                if let MessagePart::Text { text } = part {
                    *text = text.trim_end().to_owned();
                }
            }
        }
    }
    out
}

fn tool_message_text(parts: &[MessagePart]) -> String {
    let mut out: Vec<String> = Vec::new();
    for part in parts {
        match part {
            MessagePart::Text { text } if !text.trim().is_empty() => out.push(text.clone()),
            MessagePart::Image { attachment, .. } => out.push(format!("[image: {attachment}]")),
            MessagePart::File { attachment, .. } => out.push(format!("[file: {attachment}]")),
            _ => {}
        }
    }
    out.join("\n")
}

fn spec_mode_prompt(spec_path: &str) -> String {
    let mut out = String::new();
    out.push_str("You are in spec-session mode.\n");
    out.push_str("Keep the spec as the primary artifact and update it using the write_spec tool.\n");
    out.push_str(
        "The spec must include headings: # Goal, # Constraints / nuances, # Acceptance tests.\n",
    );
    if !spec_path.trim().is_empty() {
        out.push_str(&format!("Spec path: {spec_path}\n"));
    }
    out.trim().to_owned()
}

fn round6(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn prepare_inlines_tool_messages_without_tool_support() {
        let assistant = Message::new(
            new_message_id(),
            Role::Assistant,
            vec![
                MessagePart::text("running  \n"),
                MessagePart::ToolUse {
                    tool_call_id: "call_1".into(),
                    tool_name: "shell".into(),
                    tool_input: json!({"command": "ls"}),
                },
            ],
        );
        let mut tool = Message::new(
            new_message_id(),
            Role::Tool,
            vec![MessagePart::text("file.txt")],
        );
        tool.tool_call_id = Some("call_1".into());

        let prepared = prepare_session_messages(&[assistant, tool], false);
        assert_eq!(prepared.len(), 2);
        // tool_use stripped, trailing whitespace trimmed.
        assert_eq!(prepared[0].parts.len(), 1);
        assert!(matches!(
            &prepared[0].parts[0],
            MessagePart::Text { text } if text == "running"
        ));
        // Tool message inlined as labeled user text.
        assert_eq!(prepared[1].role, Role::User);
        assert!(matches!(
            &prepared[1].parts[0],
            MessagePart::Text { text } if text.starts_with("TOOL OUTPUT (call_1):")
        ));
    }

    #[test]
    fn prepare_keeps_matched_tool_messages_with_tool_support() {
        let assistant = Message::new(
            new_message_id(),
            Role::Assistant,
            vec![MessagePart::ToolUse {
                tool_call_id: "call_1".into(),
                tool_name: "shell".into(),
                tool_input: json!({}),
            }],
        );
        let mut matched = Message::new(
            new_message_id(),
            Role::Tool,
            vec![MessagePart::text("out")],
        );
        matched.tool_call_id = Some("call_1".into());
        let mut orphan = Message::new(
            new_message_id(),
            Role::Tool,
            vec![MessagePart::text("stray")],
        );
        orphan.tool_call_id = Some("call_unknown".into());

        let prepared = prepare_session_messages(&[assistant, matched, orphan], true);
        assert_eq!(prepared[1].role, Role::Tool);
        // Orphan tool output is inlined even when tools are supported.
        assert_eq!(prepared[2].role, Role::User);
    }

    #[test]
    fn prepare_drops_tool_use_only_messages_without_support() {
        let assistant = Message::new(
            new_message_id(),
            Role::Assistant,
            vec![MessagePart::ToolUse {
                tool_call_id: "call_1".into(),
                tool_name: "repo_tree".into(),
                tool_input: json!({}),
            }],
        );
        let prepared = prepare_session_messages(&[assistant], false);
        assert!(prepared.is_empty());
    }

    #[test]
    fn empty_tool_output_is_labeled() {
        let mut tool = Message::new(new_message_id(), Role::Tool, vec![]);
        tool.tool_call_id = Some("call_2".into());
        let prepared = prepare_session_messages(&[tool], false);
        assert!(matches!(
            &prepared[0].parts[0],
            MessagePart::Text { text } if text.ends_with("(no output)")
        ));
    }

    #[test]
    fn round6_rounds_to_micro_dollars() {
        assert_eq!(round6(0.1234567), 0.123457);
        assert_eq!(round6(1.0000004), 1.0);
    }

    #[test]
    fn spec_prompt_mentions_path() {
        let prompt = spec_mode_prompt("/ws/specs/s/spec.md");
        assert!(prompt.contains("write_spec"));
        assert!(prompt.ends_with("Spec path: /ws/specs/s/spec.md"));
    }
}
