//! HTTP API surface.
//!
//! JSON bodies throughout; failures come back as `{"error": "..."}` with
//! a 4xx/5xx status. Event streams are SSE with history replay before the
//! live subscription.

pub mod auth;
pub mod models;
pub mod runs;
pub mod sessions;
pub mod specs;
pub mod workspace;

use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use drover_domain::Error;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        // Runs
        .route("/v1/runs", get(runs::list_runs).post(runs::create_run))
        .route("/v1/runs/:id", get(runs::get_run))
        .route("/v1/runs/:id/events", get(runs::run_events))
        .route("/v1/runs/:id/approve", post(runs::approve_run))
        .route("/v1/runs/:id/cancel", post(runs::cancel_run))
        .route("/v1/runs/:id/export", get(runs::export_run))
        // Sessions
        .route(
            "/v1/sessions",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route("/v1/sessions/:id", get(sessions::get_session))
        .route("/v1/sessions/:id/mode", post(sessions::set_mode))
        .route("/v1/sessions/:id/messages", post(sessions::add_message))
        .route("/v1/sessions/:id/approve", post(sessions::approve))
        .route("/v1/sessions/:id/cancel", post(sessions::cancel))
        .route("/v1/sessions/:id/attachments", post(sessions::upload_attachment))
        .route("/v1/sessions/:id/events", get(sessions::events))
        .route("/v1/sessions/:id/export", get(sessions::export_session))
        .route(
            "/v1/sessions/:id/turns/:turn_id/retry",
            post(sessions::retry_turn),
        )
        // Specs, models, workspace
        .route("/v1/specs/generate", post(specs::generate_spec))
        .route("/v1/models", get(models::list_models))
        .route(
            "/v1/model-policy",
            get(models::get_policy).post(models::set_policy),
        )
        .route("/v1/workspace/tree", get(workspace::tree))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer_token,
        ))
        .layer(CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

/// `{"error": msg}` with the given status.
pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

/// Map a domain error onto the API contract.
pub(crate) fn domain_error(err: Error) -> Response {
    let status = match &err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::InvalidInput(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}
