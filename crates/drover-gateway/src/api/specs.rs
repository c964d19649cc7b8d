//! One-shot spec generation endpoint.

use std::path::Path;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use drover_tools::spec::resolve_spec_path;

use crate::state::AppState;

use super::{domain_error, error_response};

#[derive(Deserialize)]
pub struct GenerateSpecRequest {
    #[serde(default)]
    pub workspace_path: String,
    #[serde(default)]
    pub spec_name: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub overwrite: bool,
}

pub async fn generate_spec(
    State(state): State<AppState>,
    Json(body): Json<GenerateSpecRequest>,
) -> Response {
    let workspace = body.workspace_path.trim();
    let spec_name = body.spec_name.trim();
    let prompt = body.prompt.trim();
    if workspace.is_empty() || spec_name.is_empty() || prompt.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "workspace_path, spec_name, and prompt are required",
        );
    }
    if !is_safe_spec_name(spec_name) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "spec_name must be alphanumeric with dashes or underscores",
        );
    }
    let workspace = Path::new(workspace);
    if !workspace.is_dir() {
        return error_response(StatusCode::BAD_REQUEST, "workspace_path must be a directory");
    }

    let spec_rel = format!("specs/{spec_name}/spec.md");
    let spec_abs = match resolve_spec_path(workspace, &spec_rel) {
        Ok(path) => path,
        Err(err) => return domain_error(err),
    };
    if !body.overwrite && spec_abs.exists() {
        return error_response(StatusCode::CONFLICT, "spec already exists");
    }

    let content = match state.specgen.generate_spec(workspace, spec_name, prompt).await {
        Ok(content) => content,
        Err(err) => return domain_error(err),
    };

    if let Some(parent) = spec_abs.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            return domain_error(err.into());
        }
        if let Err(err) = std::fs::create_dir_all(parent.join("diagrams")) {
            return domain_error(err.into());
        }
    }
    if let Err(err) = std::fs::write(&spec_abs, &content) {
        return domain_error(err.into());
    }

    Json(serde_json::json!({
        "spec_path": spec_abs,
        "content": content,
    }))
    .into_response()
}

fn is_safe_spec_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
