use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use drover_domain::config::ModelPolicy;
use drover_kit::Kit;
use drover_store::Store;

use crate::engine::{RunEngine, SpecGenerator, TurnEngine};

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub kit: Arc<dyn Kit>,
    /// The live model policy; updated via `/v1/model-policy` and read by
    /// both engines at the start of every turn/run.
    pub policy: Arc<RwLock<ModelPolicy>>,
    pub turns: Arc<TurnEngine>,
    pub runs: Arc<RunEngine>,
    pub specgen: Arc<SpecGenerator>,
    /// Where model-policy updates are persisted.
    pub settings_path: PathBuf,
    /// SHA-256 of the configured bearer token; `None` disables auth.
    pub auth_token_hash: Option<Arc<Vec<u8>>>,
}
