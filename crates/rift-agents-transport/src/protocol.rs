//! Webview envelope protocol.
//!
//! Every message is `{"type": ..., "data": ...}`; data fields are camelCase.

use rift_agents_core::{AgentId, RunContext, StoreSnapshot};
use serde::{Deserialize, Serialize};

/// Message from the webview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum WebviewMessage {
    /// Start an agent. Without a context the editor's active one is used.
    RunAgent {
        agent_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<RunContext>,
    },
    CancelAgent { agent_id: AgentId },
    AcceptAgent { agent_id: AgentId },
    RejectAgent { agent_id: AgentId },
    DeleteAgent { agent_id: AgentId },
    RestartAgent { agent_id: AgentId },
    SelectAgent { agent_id: AgentId },
    /// New user turn for an agent waiting on chat.
    ChatMessage { agent_id: AgentId, message: String },
    /// Answer for an agent waiting on input.
    InputResponse { agent_id: AgentId, response: String },
    /// Refresh the agent catalog.
    ListAgents,
    /// Resend the full state.
    RefreshState,
}

impl WebviewMessage {
    /// Whether handling waits on an engine response.
    #[must_use]
    pub const fn awaits_engine(&self) -> bool {
        matches!(
            self,
            Self::RunAgent { .. } | Self::RestartAgent { .. } | Self::ListAgents
        )
    }
}

/// Message to the webview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum OutboundMessage {
    /// Full store state.
    StateUpdate(StoreSnapshot),
    Error { message: String },
}

impl OutboundMessage {
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_inbound_envelope_shape() {
        let msg: WebviewMessage = serde_json::from_value(json!({
            "type": "chatMessage",
            "data": {"agentId": "a1", "message": "hello"}
        }))
        .unwrap();
        assert_eq!(
            msg,
            WebviewMessage::ChatMessage {
                agent_id: "a1".into(),
                message: "hello".into()
            }
        );
    }

    #[test]
    fn test_unit_messages_need_no_data() {
        let msg: WebviewMessage = serde_json::from_value(json!({"type": "listAgents"})).unwrap();
        assert_eq!(msg, WebviewMessage::ListAgents);
        assert!(msg.awaits_engine());
    }

    #[test]
    fn test_run_agent_context_is_optional() {
        let msg: WebviewMessage = serde_json::from_value(json!({
            "type": "runAgent",
            "data": {"agentType": "rift_chat"}
        }))
        .unwrap();
        assert!(matches!(msg, WebviewMessage::RunAgent { context: None, .. }));
    }

    #[test]
    fn test_outbound_state_update() {
        let value = serde_json::to_value(OutboundMessage::StateUpdate(StoreSnapshot::default())).unwrap();
        assert_eq!(value["type"], "stateUpdate");
        assert_eq!(value["data"]["agents"], json!([]));
        assert_eq!(value["data"]["selectedAgentId"], json!(null));

        let value = serde_json::to_value(OutboundMessage::error("boom")).unwrap();
        assert_eq!(value, json!({"type": "error", "data": {"message": "boom"}}));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result = serde_json::from_value::<WebviewMessage>(json!({"type": "copyText", "data": {}}));
        assert!(result.is_err());
    }
}
