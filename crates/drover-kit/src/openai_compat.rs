//! OpenAI-compatible adapter.
//!
//! Works with OpenAI, Ollama, vLLM, LM Studio, and any other endpoint that
//! follows the OpenAI chat-completions contract. Construction is
//! environment-driven: `OPENAI_API_KEY` (+ optional `OPENAI_BASE_URL`)
//! selects hosted OpenAI; otherwise `OLLAMA_BASE_URL` (default
//! `http://localhost:11434`) selects a local endpoint.

use serde::Deserialize;
use serde_json::{json, Value};

use drover_domain::tool::{Role, ToolDefinition};
use drover_domain::{Error, Result};

use crate::types::{
    ChatMessage, ChatPart, GenerateOutput, GenerateRequest, KitToolCall, ModelRecord, Usage,
};
use crate::Kit;

pub struct OpenAiCompatKit {
    base_url: String,
    api_key: Option<String>,
    models: Vec<ModelRecord>,
    client: reqwest::Client,
}

impl OpenAiCompatKit {
    pub fn new(base_url: &str, api_key: Option<String>, models: Vec<ModelRecord>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| Error::Provider {
                provider: "openai-compat".into(),
                message: e.to_string(),
            })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
            models,
            client,
        })
    }

    /// Build a kit from the environment. Hosted OpenAI when a key is set,
    /// a local Ollama endpoint otherwise.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .map(|k| k.trim().to_owned())
            .filter(|k| !k.is_empty());

        if let Some(key) = api_key {
            let base = std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_owned());
            return Self::new(&base, Some(key), openai_models());
        }

        let base = std::env::var("OLLAMA_BASE_URL")
            .ok()
            .map(|b| b.trim().to_owned())
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| "http://localhost:11434".to_owned());
        tracing::info!(base_url = %base, "no OPENAI_API_KEY configured; using Ollama endpoint");
        let model = std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| "llama3.1".to_owned());
        Self::new(
            &format!("{base}/v1"),
            None,
            vec![ModelRecord {
                id: format!("ollama/{model}"),
                provider: "ollama".into(),
                provider_model_id: model,
                supports_tools: true,
                supports_vision: false,
                input_cost_per_mtok: Some(0.0),
                output_cost_per_mtok: Some(0.0),
            }],
        )
    }

    fn build_body(&self, req: &GenerateRequest) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(message_to_wire).collect();
        let mut body = json!({
            "model": req.model,
            "messages": messages,
        });
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_wire).collect();
            body["tools"] = Value::Array(tools);
        }
        body
    }
}

#[async_trait::async_trait]
impl Kit for OpenAiCompatKit {
    async fn list_models(&self) -> Result<Vec<ModelRecord>> {
        Ok(self.models.clone())
    }

    async fn generate(&self, req: GenerateRequest) -> Result<GenerateOutput> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(&req);

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| Error::Provider {
            provider: req.provider.clone(),
            message: e.to_string(),
        })?;

        let status = response.status();
        let raw = response.text().await.map_err(|e| Error::Provider {
            provider: req.provider.clone(),
            message: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(Error::Provider {
                provider: req.provider.clone(),
                message: format!("HTTP {status}: {raw}"),
            });
        }

        let parsed: WireResponse = serde_json::from_str(&raw).map_err(|e| Error::Provider {
            provider: req.provider.clone(),
            message: format!("malformed completion response: {e}"),
        })?;
        let choice = parsed.choices.into_iter().next().ok_or_else(|| Error::Provider {
            provider: req.provider.clone(),
            message: "completion response has no choices".into(),
        })?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| KitToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments_json: tc.function.arguments,
            })
            .collect();

        Ok(GenerateOutput {
            text: choice.message.content.unwrap_or_default(),
            tool_calls,
            finish_reason: choice.finish_reason,
            usage: parsed.usage.map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
            cost: None,
        })
    }
}

fn openai_models() -> Vec<ModelRecord> {
    vec![
        ModelRecord {
            id: "openai/gpt-4o".into(),
            provider: "openai".into(),
            provider_model_id: "gpt-4o".into(),
            supports_tools: true,
            supports_vision: true,
            input_cost_per_mtok: Some(2.50),
            output_cost_per_mtok: Some(10.00),
        },
        ModelRecord {
            id: "openai/gpt-4o-mini".into(),
            provider: "openai".into(),
            provider_model_id: "gpt-4o-mini".into(),
            supports_tools: true,
            supports_vision: true,
            input_cost_per_mtok: Some(0.15),
            output_cost_per_mtok: Some(0.60),
        },
    ]
}

// ── Wire mapping ───────────────────────────────────────────────────

fn message_to_wire(msg: &ChatMessage) -> Value {
    let role = match msg.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    let mut text_parts: Vec<&str> = Vec::new();
    let mut image_parts: Vec<Value> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    for part in &msg.parts {
        match part {
            ChatPart::Text { text } => text_parts.push(text),
            ChatPart::Image { base64, media_type } => image_parts.push(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:{media_type};base64,{base64}") },
            })),
            ChatPart::ToolUse {
                id,
                name,
                arguments_json,
            } => tool_calls.push(json!({
                "id": id,
                "type": "function",
                "function": { "name": name, "arguments": arguments_json },
            })),
        }
    }
    let text = text_parts.join("\n");

    let mut out = match msg.role {
        Role::Tool => json!({
            "role": role,
            "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
            "content": text,
        }),
        Role::User if !image_parts.is_empty() => {
            let mut content = vec![json!({ "type": "text", "text": text })];
            content.extend(image_parts);
            json!({ "role": role, "content": content })
        }
        _ => json!({ "role": role, "content": text }),
    };
    if !tool_calls.is_empty() {
        out["tool_calls"] = Value::Array(tool_calls);
    }
    out
}

fn tool_to_wire(def: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": def.name,
            "description": def.description,
            "parameters": def.parameters.clone().unwrap_or_else(|| json!({
                "type": "object",
                "properties": {},
            })),
        },
    })
}

// ── Wire response shapes ───────────────────────────────────────────

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_message_carries_call_id() {
        let mut msg = ChatMessage::text(Role::Tool, "output");
        msg.tool_call_id = Some("call_9".into());
        let wire = message_to_wire(&msg);
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "call_9");
        assert_eq!(wire["content"], "output");
    }

    #[test]
    fn assistant_tool_use_becomes_tool_calls() {
        let msg = ChatMessage::new(
            Role::Assistant,
            vec![
                ChatPart::Text {
                    text: "running it".into(),
                },
                ChatPart::ToolUse {
                    id: "call_1".into(),
                    name: "shell".into(),
                    arguments_json: r#"{"command":"ls"}"#.into(),
                },
            ],
        );
        let wire = message_to_wire(&msg);
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "shell");
        assert_eq!(wire["content"], "running it");
    }

    #[test]
    fn user_image_parts_build_content_array() {
        let msg = ChatMessage::new(
            Role::User,
            vec![
                ChatPart::Text {
                    text: "what is this".into(),
                },
                ChatPart::Image {
                    base64: "aGk=".into(),
                    media_type: "image/png".into(),
                },
            ],
        );
        let wire = message_to_wire(&msg);
        let content = wire["content"].as_array().unwrap();
        assert_eq!(content.len(), 2);
        assert!(content[1]["image_url"]["url"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
    }

    #[test]
    fn response_parsing() {
        let raw = r#"{
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{"id": "c1", "type": "function",
                        "function": {"name": "repo_tree", "arguments": "{}"}}]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;
        let parsed: WireResponse = serde_json::from_str(raw).unwrap();
        let choice = &parsed.choices[0];
        assert!(choice.message.content.is_none());
        assert_eq!(
            choice.message.tool_calls.as_ref().unwrap()[0].function.name,
            "repo_tree"
        );
        assert_eq!(parsed.usage.unwrap().total_tokens, 15);
    }
}
