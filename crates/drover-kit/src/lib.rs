//! Model-provider abstraction ("kit").
//!
//! The engines depend only on the [`Kit`] trait: list the available model
//! records and run one non-streaming generation with tool definitions.
//! Model selection happens in [`router::ModelRouter`] against the daemon's
//! model policy. One concrete adapter is provided for OpenAI-compatible
//! chat-completions endpoints (OpenAI, Ollama, vLLM, ...).

pub mod openai_compat;
pub mod pricing;
pub mod router;
mod types;

pub use openai_compat::OpenAiCompatKit;
pub use router::{ModelConstraints, ModelRouter, ResolutionRequest};
pub use types::{
    ChatMessage, ChatPart, GenerateOutput, GenerateRequest, GenerationCost, KitToolCall,
    ModelRecord, Usage,
};

use drover_domain::Result;

/// The provider abstraction consumed by the engines.
#[async_trait::async_trait]
pub trait Kit: Send + Sync {
    /// All model records this kit can serve.
    async fn list_models(&self) -> Result<Vec<ModelRecord>>;

    /// Run one generation and wait for the full response.
    async fn generate(&self, req: GenerateRequest) -> Result<GenerateOutput>;
}
