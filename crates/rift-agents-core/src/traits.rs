//! Editor host collaborator.

use crate::types::{AgentId, AgentStatus, Anchor, DecorationSet, RunContext};

/// Editor surface the sessions render into.
///
/// Implement this trait to integrate with your editor. The framework decides
/// what to show; the host decides how and in which visible editors.
pub trait EditorHost: Send + Sync {
    /// Render `decorations` in every visible editor showing the anchored
    /// document. An empty set clears them.
    fn render_decorations(&self, agent_id: &str, anchor: &Anchor, decorations: &DecorationSet);

    /// An agent's status changed; code lenses at its anchor need a refresh.
    fn refresh_code_lenses(&self, agent_id: &str, anchor: &Anchor, status: AgentStatus);

    /// Document, cursor and workspace of the active editor, if any. Used
    /// when a UI starts an agent without naming where.
    fn active_context(&self) -> Option<RunContext> {
        None
    }

    /// Informational message pushed by the engine for an agent.
    fn show_message(&self, agent_id: &str, message: &str) {
        tracing::info!(agent_id, "{message}");
    }

    /// An agent reported its final result.
    fn agent_finished(&self, agent_id: &AgentId, agent_type: &str) {
        tracing::info!(agent_id, agent_type, "agent finished");
    }

    /// Connecting to the engine failed several times in a row; return `true`
    /// to try again. Transient failures are retried without asking. The
    /// default declines, which stops the supervisor; interactive hosts should
    /// offer the user a retry instead.
    fn retry_connection(&self, error: &str) -> bool {
        tracing::warn!("connection to engine failed: {error}");
        false
    }
}

/// Host that renders nothing. Useful for headless clients and tests.
#[derive(Debug, Default, Clone)]
pub struct NoopHost;

impl EditorHost for NoopHost {
    fn render_decorations(&self, _agent_id: &str, _anchor: &Anchor, _decorations: &DecorationSet) {}

    fn refresh_code_lenses(&self, _agent_id: &str, _anchor: &Anchor, _status: AgentStatus) {}
}
