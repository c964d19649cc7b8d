//! Session records: long-lived conversational contexts with transcripts,
//! turns, and accumulated cost, persisted as `sessions/<sid>/session.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use drover_domain::tool::{MessagePart, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    WaitingApproval,
    Completed,
    Failed,
    Canceled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Chat,
    Spec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Pending,
    Running,
    WaitingApproval,
    Succeeded,
    Failed,
}

/// One user-initiated iteration of the turn engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub status: TurnStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A transcript entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
    pub created_at: DateTime<Utc>,
    /// Set on `role = tool` messages to pair them with the assistant's
    /// `tool_use` part.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn new(id: String, role: Role, parts: Vec<MessagePart>) -> Self {
        Self {
            id,
            role,
            parts,
            created_at: Utc::now(),
            tool_call_id: None,
        }
    }
}

/// Dollar cost accumulated across a session's turns.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SessionCost {
    #[serde(default)]
    pub input_cost_usd: f64,
    #[serde(default)]
    pub output_cost_usd: f64,
    #[serde(default)]
    pub total_cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub mode: SessionMode,
    pub workspace_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_turn_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub turns: Vec<Turn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<SessionCost>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Session {
    pub fn turn_mut(&mut self, turn_id: &str) -> Option<&mut Turn> {
        self.turns.iter_mut().find(|t| t.id == turn_id)
    }
}

/// One line of a session's append-only events log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub ts: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl SessionEvent {
    pub fn new(session_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            ts: Utc::now().to_rfc3339(),
            session_id: session_id.into(),
            turn_id: None,
            event_type: event_type.into(),
            message: None,
            data: None,
        }
    }

    pub fn with_turn(mut self, turn_id: impl Into<String>) -> Self {
        self.turn_id = Some(turn_id.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

// ── Approvals ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalAction {
    Approve,
    Deny,
}

/// The decision made by a human reviewer. A sum type so callers cannot
/// confuse "no decision yet" with approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub action: ApprovalAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ApprovalDecision {
    pub fn approve() -> Self {
        Self {
            action: ApprovalAction::Approve,
            reason: None,
        }
    }

    pub fn deny(reason: Option<String>) -> Self {
        Self {
            action: ApprovalAction::Deny,
            reason,
        }
    }

    pub fn is_denied(&self) -> bool {
        self.action == ApprovalAction::Deny
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_part_round_trip_in_message() {
        let msg = Message::new(
            "msg_1".into(),
            Role::Assistant,
            vec![
                MessagePart::text("hello"),
                MessagePart::ToolUse {
                    tool_call_id: "call_1".into(),
                    tool_name: "repo_tree".into(),
                    tool_input: serde_json::json!({}),
                },
            ],
        );
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.parts.len(), 2);
        assert!(matches!(back.parts[1], MessagePart::ToolUse { .. }));
    }

    #[test]
    fn decision_actions() {
        assert!(!ApprovalDecision::approve().is_denied());
        assert!(ApprovalDecision::deny(Some("nope".into())).is_denied());
        let json = serde_json::to_string(&ApprovalDecision::approve()).unwrap();
        assert!(json.contains(r#""action":"approve""#));
    }

    #[test]
    fn session_status_terminality() {
        assert!(!SessionStatus::Active.is_terminal());
        assert!(!SessionStatus::WaitingApproval.is_terminal());
        assert!(SessionStatus::Canceled.is_terminal());
    }
}
