//! Workspace introspection.

use std::path::Path;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use drover_tools::{default_walk_options, walk_files};

use crate::state::AppState;

use super::{domain_error, error_response};

#[derive(Deserialize)]
pub struct TreeQuery {
    #[serde(default)]
    pub workspace_path: String,
}

/// Bounded walk of an arbitrary workspace directory.
pub async fn tree(State(_state): State<AppState>, Query(query): Query<TreeQuery>) -> Response {
    let workspace = query.workspace_path.trim();
    if workspace.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "workspace_path required");
    }
    let root = Path::new(workspace);
    if !root.is_dir() {
        return error_response(StatusCode::BAD_REQUEST, "workspace_path must be a directory");
    }

    let mut opts = default_walk_options();
    opts.max_files = 800;
    opts.max_depth = 8;
    match walk_files(root, &opts) {
        Ok(files) => Json(serde_json::json!({ "root": workspace, "files": files })).into_response(),
        Err(err) => domain_error(err),
    }
}
