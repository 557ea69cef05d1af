//! Engine wire payloads.

use rift_agents_core::{AgentId, AgentStatus, ChatMessage, Range, RunContext, Tasks};
use serde::{Deserialize, Serialize};

/// Request `run`.
pub const RUN: &str = "run";
/// Notification `cancel`.
pub const CANCEL: &str = "cancel";
/// Notification `accept`.
pub const ACCEPT: &str = "accept";
/// Notification `reject`.
pub const REJECT: &str = "reject";
/// Notification `delete`.
pub const DELETE: &str = "delete";
/// Request `restart_agent`.
pub const RESTART: &str = "restart_agent";
/// Request `listAgents`.
pub const LIST_AGENTS: &str = "listAgents";
/// Standard handshake request, never namespaced.
pub const INITIALIZE: &str = "initialize";
/// Standard handshake notification, never namespaced.
pub const INITIALIZED: &str = "initialized";
/// Standard notification, never namespaced.
pub const DID_CHANGE_CONFIGURATION: &str = "workspace/didChangeConfiguration";

/// Params of `initialize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub process_id: Option<u32>,
    pub root_uri: Option<String>,
    pub capabilities: serde_json::Value,
    pub client_info: ClientInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl InitializeParams {
    #[must_use]
    pub fn new(root_uri: Option<String>) -> Self {
        Self {
            process_id: Some(std::process::id()),
            root_uri,
            capabilities: serde_json::json!({}),
            client_info: ClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

/// Params of `run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunParams {
    pub agent_type: String,
    pub agent_params: RunContext,
}

/// Result of `run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub id: AgentId,
}

/// Params of the id-only messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdParams {
    pub id: AgentId,
}

/// Result of `{type}_{id}_request_input`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputResponse {
    pub response: String,
}

/// Params and result of `{type}_{id}_request_chat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatExchange {
    pub messages: Vec<ChatMessage>,
}

/// Params of `{type}_{id}_send_update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateParams {
    pub msg: String,
}

/// Params of `{type}_{id}_send_result`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultParams {
    pub id: AgentId,
    #[serde(rename = "type")]
    pub agent_type: String,
}

/// Params of `{type}_{id}_send_progress`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Tasks>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ProgressPayload>,
}

/// Progress payload: either the engine confirming an accept/reject, or
/// incremental session output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressPayload {
    Sentinel(StatusSentinel),
    Structured(StructuredPayload),
}

/// Bare `"accepted"` / `"rejected"` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusSentinel {
    Accepted,
    Rejected,
}

impl StatusSentinel {
    #[must_use]
    pub const fn status(self) -> AgentStatus {
        match self {
            Self::Accepted => AgentStatus::Accepted,
            Self::Rejected => AgentStatus::Rejected,
        }
    }
}

/// Structured progress output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredPayload {
    #[serde(default, alias = "additive_ranges", skip_serializing_if = "Option::is_none")]
    pub additive_ranges: Option<Vec<Range>>,
    #[serde(default, alias = "negative_ranges", skip_serializing_if = "Option::is_none")]
    pub negative_ranges: Option<Vec<Range>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, alias = "done_streaming", skip_serializing_if = "Option::is_none")]
    pub done_streaming: Option<bool>,
}

impl StructuredPayload {
    /// Whether the payload carries a decoration update.
    #[must_use]
    pub const fn has_ranges(&self) -> bool {
        self.additive_ranges.is_some() || self.negative_ranges.is_some()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_sentinel_payload() {
        let params: ProgressParams = serde_json::from_value(json!({"payload": "accepted"})).unwrap();
        assert_eq!(
            params.payload,
            Some(ProgressPayload::Sentinel(StatusSentinel::Accepted))
        );
    }

    #[test]
    fn test_structured_payload_accepts_both_spellings() {
        let camel: ProgressParams = serde_json::from_value(json!({
            "payload": {
                "additiveRanges": [{"start": {"line": 1, "character": 0}, "end": {"line": 2, "character": 0}}],
                "doneStreaming": true
            }
        }))
        .unwrap();
        let snake: ProgressParams = serde_json::from_value(json!({
            "payload": {
                "additive_ranges": [{"start": {"line": 1, "character": 0}, "end": {"line": 2, "character": 0}}],
                "done_streaming": true
            }
        }))
        .unwrap();
        assert_eq!(camel, snake);
        let Some(ProgressPayload::Structured(p)) = camel.payload else {
            panic!("expected structured payload");
        };
        assert!(p.has_ranges());
        assert_eq!(p.done_streaming, Some(true));
    }

    #[test]
    fn test_unknown_sentinel_is_rejected() {
        let result = serde_json::from_value::<ProgressParams>(json!({"payload": "maybe"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_tasks_only_progress() {
        let params: ProgressParams =
            serde_json::from_value(json!({"tasks": {"task": {"description": "edit", "status": "done"}}}))
                .unwrap();
        let tasks = params.tasks.unwrap();
        assert_eq!(tasks.task.agent_status(), Some(AgentStatus::Done));
        assert!(tasks.subtasks.is_empty());
        assert!(params.payload.is_none());
    }
}
