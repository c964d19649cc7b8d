//! Run endpoints: create/list/get, SSE events, approval, cancel, export.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use drover_store::{ApprovalDecision, Event};

use crate::state::AppState;

use super::{domain_error, error_response};

const SSE_HISTORY: i64 = 200;

pub async fn list_runs(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.list_runs())
}

#[derive(Deserialize)]
pub struct CreateRunRequest {
    #[serde(default)]
    pub workspace_path: String,
    #[serde(default)]
    pub spec_path: String,
}

pub async fn create_run(
    State(state): State<AppState>,
    Json(body): Json<CreateRunRequest>,
) -> Response {
    match state.store.create_run(&body.workspace_path, &body.spec_path) {
        Ok(run) => {
            state.runs.clone().start_run(&run.id);
            Json(serde_json::json!({ "run_id": run.id })).into_response()
        }
        Err(err) => domain_error(err),
    }
}

pub async fn get_run(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    match state.store.get_run(&run_id) {
        Ok(run) => Json(run).into_response(),
        Err(err) => domain_error(err),
    }
}

pub async fn run_events(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    let history = state.store.read_events(&run_id, SSE_HISTORY);
    let mut rx = state.store.subscribe(&run_id);

    let stream = async_stream::stream! {
        for event in history {
            yield sse_frame(&event);
        }
        loop {
            match rx.recv().await {
                Ok(event) => yield sse_frame(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "run event subscriber lagged");
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

fn sse_frame(event: &Event) -> Result<SseEvent, std::convert::Infallible> {
    let data = serde_json::to_string(event).unwrap_or_default();
    Ok(SseEvent::default().event("message").data(data))
}

#[derive(Deserialize)]
pub struct ApproveRunRequest {
    #[serde(default)]
    pub step_id: String,
}

pub async fn approve_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(body): Json<ApproveRunRequest>,
) -> Response {
    if body.step_id.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "step_id required");
    }
    match state
        .store
        .approve(&run_id, &body.step_id, ApprovalDecision::approve())
    {
        Ok(()) => {
            let event = Event::new(&run_id, "approval_granted")
                .with_data(serde_json::json!({ "step_id": body.step_id }));
            if let Err(err) = state.store.append_event(&run_id, event) {
                return domain_error(err);
            }
            Json(serde_json::json!({ "ok": true })).into_response()
        }
        Err(err) => error_response(StatusCode::BAD_REQUEST, err.to_string()),
    }
}

pub async fn cancel_run(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    state.store.cancel_run(&run_id);
    let event = Event::new(&run_id, "run_cancel_requested");
    if let Err(err) = state.store.append_event(&run_id, event) {
        return domain_error(err);
    }
    Json(serde_json::json!({ "ok": true })).into_response()
}

pub async fn export_run(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    match state.store.export_run(&run_id) {
        Ok(archive) => (
            [
                (header::CONTENT_TYPE, "application/gzip".to_owned()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{run_id}.tar.gz\""),
                ),
            ],
            archive,
        )
            .into_response(),
        Err(err) => domain_error(err),
    }
}
