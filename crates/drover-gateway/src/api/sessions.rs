//! Session endpoints: lifecycle, messages/turns, approvals, attachments,
//! and the SSE event stream.

use std::path::Path as FsPath;

use axum::extract::{FromRequest, Multipart, Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use base64::Engine as _;
use serde::Deserialize;

use drover_domain::id::new_message_id;
use drover_domain::tool::{MessagePart, Role};
use drover_store::{ApprovalAction, ApprovalDecision, Message, SessionEvent, SessionMode};
use drover_tools::spec::{default_spec_path, ensure_spec_file, resolve_spec_path};

use crate::state::AppState;

use super::{domain_error, error_response};

const SSE_HISTORY: i64 = 200;

pub async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.list_sessions())
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.store.get_session(&session_id) {
        Ok(session) => Json(session).into_response(),
        Err(err) => domain_error(err),
    }
}

fn parse_mode(raw: &str) -> Result<SessionMode, Response> {
    match raw.trim() {
        "" | "chat" => Ok(SessionMode::Chat),
        "spec" => Ok(SessionMode::Spec),
        _ => Err(error_response(
            StatusCode::BAD_REQUEST,
            "mode must be chat or spec",
        )),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub workspace_path: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub spec_path: String,
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionRequest>,
) -> Response {
    let mode = match parse_mode(&body.mode) {
        Ok(mode) => mode,
        Err(resp) => return resp,
    };

    let mut spec_path = body.spec_path.trim().to_owned();
    if !spec_path.is_empty() {
        match resolve_spec_path(FsPath::new(&body.workspace_path), &spec_path) {
            Ok(resolved) => spec_path = resolved.to_string_lossy().into_owned(),
            Err(err) => return domain_error(err),
        }
    }

    let mut session = match state.store.create_session(
        &body.workspace_path,
        &body.system_prompt,
        mode,
        &spec_path,
    ) {
        Ok(session) => session,
        Err(err) => return domain_error(err),
    };

    // Spec sessions get a default spec file immediately so clients can
    // display it before the first turn.
    if session.mode == SessionMode::Spec
        && session.spec_path.as_deref().map(str::trim).unwrap_or("").is_empty()
    {
        let default = match default_spec_path(
            FsPath::new(&session.workspace_path),
            &format!("session-{}", session.id),
        ) {
            Ok(path) => path,
            Err(err) => return domain_error(err),
        };
        session.spec_path = Some(default.to_string_lossy().into_owned());
        if let Err(err) = state.store.update_session(session.clone()) {
            return domain_error(err);
        }
        let event = SessionEvent::new(&session.id, "spec_path_set")
            .with_data(serde_json::json!({ "spec_path": session.spec_path }));
        if let Err(err) = state.store.append_session_event(&session.id, event) {
            return domain_error(err);
        }
        match ensure_spec_file(&default) {
            Ok(true) => {
                let event = SessionEvent::new(&session.id, "spec_created")
                    .with_data(serde_json::json!({ "spec_path": session.spec_path }));
                if let Err(err) = state.store.append_session_event(&session.id, event) {
                    return domain_error(err);
                }
            }
            Ok(false) => {}
            Err(err) => return domain_error(err),
        }
    }

    Json(serde_json::json!({
        "session_id": session.id,
        "spec_path": session.spec_path,
    }))
    .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/sessions/:id/mode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
pub struct SetModeRequest {
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub spec_path: String,
}

pub async fn set_mode(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<SetModeRequest>,
) -> Response {
    if body.mode.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "mode is required");
    }
    let mode = match parse_mode(&body.mode) {
        Ok(mode) => mode,
        Err(resp) => return resp,
    };
    let mut session = match state.store.get_session(&session_id) {
        Ok(session) => session,
        Err(err) => return domain_error(err),
    };

    let workspace = FsPath::new(&session.workspace_path).to_path_buf();
    let requested = body.spec_path.trim();
    let spec_path: Option<String> = if mode == SessionMode::Spec {
        if !requested.is_empty() {
            match resolve_spec_path(&workspace, requested) {
                Ok(resolved) => Some(resolved.to_string_lossy().into_owned()),
                Err(err) => return domain_error(err),
            }
        } else if session.spec_path.as_deref().map(str::trim).unwrap_or("").is_empty() {
            match default_spec_path(&workspace, &format!("session-{}", session.id)) {
                Ok(path) => Some(path.to_string_lossy().into_owned()),
                Err(err) => return domain_error(err),
            }
        } else {
            session.spec_path.clone()
        }
    } else if !requested.is_empty() {
        match resolve_spec_path(&workspace, requested) {
            Ok(resolved) => Some(resolved.to_string_lossy().into_owned()),
            Err(err) => return domain_error(err),
        }
    } else {
        None
    };

    session.mode = mode;
    if let Some(spec_path) = spec_path {
        session.spec_path = Some(spec_path);
    }
    if let Err(err) = state.store.update_session(session.clone()) {
        return domain_error(err);
    }
    let event = SessionEvent::new(&session_id, "session_mode_set").with_data(serde_json::json!({
        "mode": session.mode,
        "spec_path": session.spec_path,
    }));
    if let Err(err) = state.store.append_session_event(&session_id, event) {
        return domain_error(err);
    }

    if session.mode == SessionMode::Spec {
        if let Some(spec_path) = session.spec_path.as_deref().filter(|p| !p.trim().is_empty()) {
            match ensure_spec_file(FsPath::new(spec_path)) {
                Ok(true) => {
                    let event = SessionEvent::new(&session_id, "spec_created")
                        .with_data(serde_json::json!({ "spec_path": session.spec_path }));
                    if let Err(err) = state.store.append_session_event(&session_id, event) {
                        return domain_error(err);
                    }
                }
                Ok(false) => {}
                Err(err) => return domain_error(err),
            }
        }
    }

    Json(serde_json::json!({
        "session_id": session.id,
        "mode": session.mode,
        "spec_path": session.spec_path,
    }))
    .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/sessions/:id/messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
pub struct AddMessageRequest {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
    #[serde(default)]
    pub auto_run: Option<bool>,
}

pub async fn add_message(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<AddMessageRequest>,
) -> Response {
    let role = match body.role.trim() {
        "user" => Role::User,
        "system" => Role::System,
        "assistant" => Role::Assistant,
        "tool" => Role::Tool,
        "" => return error_response(StatusCode::BAD_REQUEST, "role required"),
        other => {
            return error_response(StatusCode::BAD_REQUEST, format!("unknown role: {other}"))
        }
    };

    let msg = Message::new(new_message_id(), role, body.parts);
    let msg_id = msg.id.clone();
    if let Err(err) = state.store.append_message(&session_id, msg) {
        return domain_error(err);
    }
    let event = SessionEvent::new(&session_id, "message_added")
        .with_data(serde_json::json!({ "message_id": msg_id, "role": body.role }));
    if let Err(err) = state.store.append_session_event(&session_id, event) {
        return domain_error(err);
    }

    let turn_id = match state.store.add_turn(&session_id) {
        Ok(turn_id) => turn_id,
        Err(err) => return domain_error(err),
    };
    if body.auto_run.unwrap_or(true) {
        if let Err(err) = state.turns.clone().start_turn(&session_id, &turn_id) {
            return domain_error(err);
        }
    }

    Json(serde_json::json!({ "message_id": msg_id, "turn_id": turn_id })).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Approvals & cancellation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
pub struct SessionApproveRequest {
    #[serde(default)]
    pub tool_call_id: String,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub turn_id: Option<String>,
}

pub async fn approve(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<SessionApproveRequest>,
) -> Response {
    let tool_call_id = body.tool_call_id.trim();
    if tool_call_id.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "tool_call_id required");
    }
    let action = match body.action.as_deref().map(str::trim).unwrap_or("approve") {
        "approve" => ApprovalAction::Approve,
        "deny" => ApprovalAction::Deny,
        other => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("action must be approve or deny, got {other}"),
            )
        }
    };
    let decision = ApprovalDecision {
        action,
        reason: body.reason.clone(),
    };

    match state
        .store
        .resolve_session_approval(&session_id, tool_call_id, decision)
    {
        Ok(()) => {
            let event_type = match action {
                ApprovalAction::Deny => "approval_denied",
                ApprovalAction::Approve => "approval_granted",
            };
            let mut event = SessionEvent::new(&session_id, event_type).with_data(
                serde_json::json!({ "tool_call_id": tool_call_id, "reason": body.reason }),
            );
            if let Some(turn_id) = &body.turn_id {
                event = event.with_turn(turn_id.clone());
            }
            if let Err(err) = state.store.append_session_event(&session_id, event) {
                return domain_error(err);
            }
            Json(serde_json::json!({ "ok": true })).into_response()
        }
        Err(err) => error_response(StatusCode::BAD_REQUEST, err.to_string()),
    }
}

pub async fn cancel(State(state): State<AppState>, Path(session_id): Path<String>) -> Response {
    state.store.cancel_session(&session_id);
    let event = SessionEvent::new(&session_id, "session_canceled");
    if let Err(err) = state.store.append_session_event(&session_id, event) {
        return domain_error(err);
    }
    Json(serde_json::json!({ "ok": true })).into_response()
}

pub async fn retry_turn(
    State(state): State<AppState>,
    Path((session_id, turn_id)): Path<(String, String)>,
) -> Response {
    match state.turns.clone().start_turn(&session_id, &turn_id) {
        Ok(()) => Json(serde_json::json!({ "ok": true })).into_response(),
        Err(err) => domain_error(err),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/sessions/:id/attachments
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
pub struct AttachmentRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub content_base64: String,
}

/// Accepts `multipart/form-data` with a `file` field, or a JSON body with
/// base64 content.
pub async fn upload_attachment(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    req: Request,
) -> Response {
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_owned();

    if content_type.starts_with("multipart/form-data") {
        let mut multipart = match Multipart::from_request(req, &state).await {
            Ok(multipart) => multipart,
            Err(err) => return error_response(StatusCode::BAD_REQUEST, err.to_string()),
        };
        while let Ok(Some(field)) = multipart.next_field().await {
            if field.name() != Some("file") {
                continue;
            }
            let name = field.file_name().unwrap_or_default().to_owned();
            let mime_type = field.content_type().unwrap_or_default().to_owned();
            let data = match field.bytes().await {
                Ok(data) => data,
                Err(err) => return error_response(StatusCode::BAD_REQUEST, err.to_string()),
            };
            return match state
                .store
                .save_session_attachment(&session_id, &name, &mime_type, &data)
            {
                Ok(saved) => Json(saved).into_response(),
                Err(err) => domain_error(err),
            };
        }
        return error_response(StatusCode::BAD_REQUEST, "file required");
    }

    let body: AttachmentRequest = match Json::<AttachmentRequest>::from_request(req, &state).await {
        Ok(Json(body)) => body,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid json"),
    };
    if body.content_base64.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "content_base64 required");
    }
    let content = match base64::engine::general_purpose::STANDARD.decode(body.content_base64.trim())
    {
        Ok(content) => content,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid base64 content"),
    };
    match state
        .store
        .save_session_attachment(&session_id, &body.name, &body.mime_type, &content)
    {
        Ok(saved) => Json(saved).into_response(),
        Err(err) => domain_error(err),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/sessions/:id/events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub max: Option<i64>,
}

pub async fn events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Response {
    if query.format.as_deref() == Some("json") {
        let max = query.max.unwrap_or(0);
        return Json(state.store.read_session_events(&session_id, max)).into_response();
    }

    let history = state.store.read_session_events(&session_id, SSE_HISTORY);
    let mut rx = state.store.subscribe_session(&session_id);

    let stream = async_stream::stream! {
        for event in history {
            yield sse_frame(&event);
        }
        loop {
            match rx.recv().await {
                Ok(event) => yield sse_frame(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "session event subscriber lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(std::time::Duration::from_secs(15))
                .text("keep-alive"),
        )
        .into_response()
}

fn sse_frame(event: &SessionEvent) -> Result<SseEvent, std::convert::Infallible> {
    let data = serde_json::to_string(event).unwrap_or_default();
    Ok(SseEvent::default().event("message").data(data))
}

pub async fn export_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.store.export_session(&session_id) {
        Ok(archive) => (
            [
                (header::CONTENT_TYPE, "application/gzip".to_owned()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{session_id}.tar.gz\""),
                ),
            ],
            archive,
        )
            .into_response(),
        Err(err) => domain_error(err),
    }
}
