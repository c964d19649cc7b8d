//! Provider-agnostic request/response types.

use serde::{Deserialize, Serialize};

use drover_domain::tool::{Role, ToolDefinition};

/// A model known to the kit, with the capability flags the router needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    /// Canonical id, e.g. `openai/gpt-4o`.
    pub id: String,
    pub provider: String,
    /// The id the provider's API expects.
    pub provider_model_id: String,
    #[serde(default)]
    pub supports_tools: bool,
    #[serde(default)]
    pub supports_vision: bool,
    /// USD per million input tokens, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_cost_per_mtok: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_cost_per_mtok: Option<f64>,
}

/// One message of a generation request.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub parts: Vec<ChatPart>,
    /// Set on `role = tool` messages.
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, parts: Vec<ChatPart>) -> Self {
        Self {
            role,
            parts,
            tool_call_id: None,
        }
    }

    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self::new(role, vec![ChatPart::Text { text: text.into() }])
    }
}

#[derive(Debug, Clone)]
pub enum ChatPart {
    Text {
        text: String,
    },
    Image {
        base64: String,
        media_type: String,
    },
    /// A tool invocation the assistant made earlier in the conversation.
    ToolUse {
        id: String,
        name: String,
        arguments_json: String,
    },
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub provider: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
}

/// A tool call as returned by the provider.
#[derive(Debug, Clone)]
pub struct KitToolCall {
    pub id: String,
    pub name: String,
    pub arguments_json: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GenerationCost {
    pub input_cost_usd: Option<f64>,
    pub output_cost_usd: Option<f64>,
    pub total_cost_usd: Option<f64>,
}

impl GenerationCost {
    pub fn is_empty(&self) -> bool {
        self.input_cost_usd.is_none()
            && self.output_cost_usd.is_none()
            && self.total_cost_usd.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerateOutput {
    pub text: String,
    pub tool_calls: Vec<KitToolCall>,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    pub cost: Option<GenerationCost>,
}
