//! Provider-agnostic tool types.
//!
//! A tool declares a [`ToolDefinition`] (name, kind, JSON-schema parameters,
//! approval flags) and is invoked with a [`ToolCall`] whose `input` is the
//! raw JSON string produced by the model. Results carry transcript
//! [`MessagePart`]s.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a tool does to the workspace. Drives the approval policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Read,
    Write,
    Exec,
}

/// Message roles shared by transcripts and provider requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub kind: ToolKind,
    /// JSON Schema for the tool's parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub allow_without_approval: bool,
}

/// A structured request from the model to invoke a named tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON argument string as produced by the model.
    pub input: String,
}

/// One entry of a transcript message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    Image {
        /// Workspace-relative attachment path (`attachments/<name>`).
        #[serde(rename = "ref")]
        attachment: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    File {
        #[serde(rename = "ref")]
        attachment: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    ToolUse {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        tool_input: Value,
    },
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        MessagePart::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub id: String,
    pub ok: bool,
    pub parts: Vec<MessagePart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn text(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: true,
            parts: vec![MessagePart::text(text)],
            artifacts: None,
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            parts: Vec::new(),
            artifacts: None,
            error: Some(error.into()),
        }
    }

    pub fn failure_with_text(
        id: impl Into<String>,
        error: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            ok: false,
            parts: vec![MessagePart::text(text)],
            artifacts: None,
            error: Some(error.into()),
        }
    }
}

// ── Tool-input marshalling ─────────────────────────────────────────

/// Normalize a raw tool-input string to something JSON-parseable.
///
/// Empty or `null` input becomes `{}`. Invalid JSON gets one repair
/// attempt: extract the last balanced `{...}` substring (models sometimes
/// wrap arguments in prose). Anything else passes through unchanged.
pub fn normalize_tool_input(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return "{}".to_owned();
    }
    if is_valid_json(trimmed) {
        return trimmed.to_owned();
    }
    if let Some(candidate) = extract_last_json_object(trimmed) {
        if is_valid_json(candidate) {
            return candidate.to_owned();
        }
    }
    trimmed.to_owned()
}

/// Parse a tool input into a JSON value, falling back to the raw string.
pub fn parse_tool_input(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Value::Object(Default::default());
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_owned()))
}

/// A duplicate-detection key for a tool call: `name:canonical_input`.
///
/// Valid JSON inputs are re-serialized with sorted keys so semantically
/// equal calls collapse regardless of whitespace or key order.
pub fn tool_call_key(call: &ToolCall) -> String {
    let raw = call.input.trim();
    let canonical = if raw.is_empty() || raw == "null" {
        "{}".to_owned()
    } else {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => value.to_string(),
            Err(_) => raw.to_owned(),
        }
    };
    format!("{}:{}", call.name, canonical)
}

fn is_valid_json(value: &str) -> bool {
    serde_json::from_str::<Value>(value).is_ok()
}

/// Scan backwards for the last balanced `{...}` block.
fn extract_last_json_object(value: &str) -> Option<&str> {
    let bytes = value.as_bytes();
    let mut depth = 0usize;
    let mut end = None;
    for i in (0..bytes.len()).rev() {
        match bytes[i] {
            b'}' => {
                if depth == 0 {
                    end = Some(i);
                }
                depth += 1;
            }
            b'{' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        if let Some(end) = end {
                            return Some(&value[i..=end]);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_empty_and_null() {
        assert_eq!(normalize_tool_input(""), "{}");
        assert_eq!(normalize_tool_input("  "), "{}");
        assert_eq!(normalize_tool_input("null"), "{}");
    }

    #[test]
    fn normalize_passes_valid_json() {
        assert_eq!(normalize_tool_input(r#"{"a": 1}"#), r#"{"a": 1}"#);
    }

    #[test]
    fn normalize_extracts_embedded_object() {
        let raw = r#"Sure, calling the tool now: {"path": "src/main.rs"} hope that helps"#;
        assert_eq!(normalize_tool_input(raw), r#"{"path": "src/main.rs"}"#);
    }

    #[test]
    fn normalize_keeps_garbage_as_is() {
        assert_eq!(normalize_tool_input("not json at all"), "not json at all");
    }

    #[test]
    fn parse_falls_back_to_string() {
        assert_eq!(parse_tool_input(""), serde_json::json!({}));
        assert_eq!(parse_tool_input(r#"{"a":1}"#), serde_json::json!({"a":1}));
        assert_eq!(parse_tool_input("plain"), Value::String("plain".into()));
    }

    #[test]
    fn call_key_collapses_semantic_duplicates() {
        let a = ToolCall {
            id: "c1".into(),
            name: "search".into(),
            input: r#"{"a":1,"b":2}"#.into(),
        };
        let b = ToolCall {
            id: "c2".into(),
            name: "search".into(),
            input: r#"{ "b": 2, "a": 1 }"#.into(),
        };
        assert_eq!(tool_call_key(&a), tool_call_key(&b));

        let c = ToolCall {
            id: "c3".into(),
            name: "search".into(),
            input: r#"{"a":2}"#.into(),
        };
        assert_ne!(tool_call_key(&a), tool_call_key(&c));
    }

    #[test]
    fn message_part_serde_tagging() {
        let part = MessagePart::ToolUse {
            tool_call_id: "call_1".into(),
            tool_name: "shell".into(),
            tool_input: serde_json::json!({"command": "ls"}),
        };
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "tool_use");
        assert_eq!(json["tool_name"], "shell");

        let image = MessagePart::Image {
            attachment: "attachments/shot.png".into(),
            mime_type: Some("image/png".into()),
        };
        let json = serde_json::to_value(&image).unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["ref"], "attachments/shot.png");

        let back: MessagePart = serde_json::from_value(json).unwrap();
        assert!(matches!(back, MessagePart::Image { .. }));
    }
}
