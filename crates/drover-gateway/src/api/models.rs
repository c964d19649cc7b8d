//! Model listing and policy endpoints.

use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use drover_domain::config::{save_settings, ModelPolicy, Settings};
use drover_kit::Kit;

use crate::state::AppState;

use super::domain_error;

pub async fn list_models(State(state): State<AppState>) -> Response {
    match state.kit.list_models().await {
        Ok(models) => {
            let policy = state.policy.read().clone();
            Json(serde_json::json!({ "models": models, "policy": policy })).into_response()
        }
        Err(err) => domain_error(err),
    }
}

pub async fn get_policy(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.policy.read().clone())
}

#[derive(Deserialize)]
pub struct SetPolicyRequest {
    #[serde(default)]
    pub require_tools: bool,
    #[serde(default)]
    pub require_vision: bool,
    #[serde(default = "default_max_cost")]
    pub max_cost_usd: f64,
    #[serde(default)]
    pub preferred_models: Vec<String>,
}

fn default_max_cost() -> f64 {
    5.0
}

/// Update the live policy and persist it to `settings.json`.
pub async fn set_policy(
    State(state): State<AppState>,
    Json(body): Json<SetPolicyRequest>,
) -> Response {
    let policy = ModelPolicy {
        require_tools: body.require_tools,
        require_vision: body.require_vision,
        max_cost_usd: body.max_cost_usd,
        preferred_models: body.preferred_models,
    };
    *state.policy.write() = policy.clone();

    let settings = Settings {
        model_policy: policy.clone(),
    };
    if let Err(err) = save_settings(&state.settings_path, &settings) {
        tracing::warn!(error = %err, "failed to persist model policy");
    }
    Json(policy).into_response()
}
