//! Engines: the per-turn agent loop, the plan-oriented run loop, and the
//! one-shot spec generator.

pub mod context;
pub mod plan;
pub mod policies;
pub mod runner;
pub mod specgen;
pub mod turn;


pub use runner::RunEngine;
pub use specgen::SpecGenerator;
pub use turn::TurnEngine;

use drover_domain::config::ModelPolicy;
use drover_domain::Result;
use drover_kit::{Kit, ModelConstraints, ModelRecord, ModelRouter, ResolutionRequest};

/// Resolve the model for a turn/run from the current policy.
pub(crate) async fn resolve_model(
    kit: &dyn Kit,
    router: &ModelRouter,
    policy: &ModelPolicy,
) -> Result<ModelRecord> {
    let records = kit.list_models().await?;
    router.resolve(
        &records,
        &ResolutionRequest {
            constraints: ModelConstraints {
                require_tools: policy.require_tools,
                require_vision: policy.require_vision,
                max_cost_usd: Some(policy.max_cost_usd),
            },
            preferred_models: policy.preferred_models.clone(),
        },
    )
}
