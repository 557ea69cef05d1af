//! Session data model shared by the store, the router and the webview bridge.

use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Agent identifier, assigned by the engine when a `run` request returns.
pub type AgentId = String;

/// Agent status as shown by code lenses and the webview.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Agent is working. Initial state of every session.
    Running,
    /// Agent finished and awaits accept/reject.
    Done,
    /// Agent failed and awaits accept/reject.
    Error,
    /// The engine confirmed an accept.
    Accepted,
    /// The engine confirmed a reject.
    Rejected,
}

impl AgentStatus {
    /// Wire name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }

    /// Parse a wire status name. Unknown names yield `None`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "error" => Some(Self::Error),
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    /// `accepted` and `rejected` offer no further affordances.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected)
    }

    /// Whether a structured task-status update may move `self` to `next`.
    ///
    /// Only `running -> done | error` is reachable this way; the terminal
    /// states are entered through the accept/reject sentinel instead.
    #[must_use]
    pub const fn accepts_task_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Running, Self::Done | Self::Error)
        )
    }

    /// Code-lens actions offered for this status.
    #[must_use]
    pub const fn lens_actions(self) -> &'static [LensAction] {
        match self {
            Self::Running => &[LensAction::Cancel],
            Self::Done | Self::Error => &[LensAction::Accept, LensAction::Reject],
            Self::Accepted | Self::Rejected => &[],
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inline affordance rendered next to an agent's anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LensAction {
    Cancel,
    Accept,
    Reject,
}

impl LensAction {
    /// Title shown to the user.
    #[must_use]
    pub const fn title(self) -> &'static str {
        match self {
            Self::Cancel => "Cancel",
            Self::Accept => "Accept",
            Self::Reject => "Reject",
        }
    }
}

/// Zero-based line/character position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    #[must_use]
    pub const fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

/// Half-open text range `[start, end)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    #[must_use]
    pub const fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    /// A range covering nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Document identity; `version` is advisory only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextDocumentIdentifier {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i32>,
}

impl TextDocumentIdentifier {
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            version: None,
        }
    }

    /// Same document regardless of version.
    #[must_use]
    pub fn same_document(&self, other: &Self) -> bool {
        self.uri == other.uri
    }
}

/// Where a session's decorations and code lenses live. Fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub document: TextDocumentIdentifier,
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Range>,
}

/// Ambient editor context sent with a `run` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunContext {
    pub text_document: TextDocumentIdentifier,
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Range>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_folder_path: Option<PathBuf>,
}

impl RunContext {
    /// Create a context anchored at a cursor position.
    #[must_use]
    pub fn new(text_document: TextDocumentIdentifier, position: Position) -> Self {
        Self {
            text_document,
            position,
            selection: None,
            workspace_folder_path: None,
        }
    }

    #[must_use]
    pub const fn with_selection(mut self, selection: Range) -> Self {
        self.selection = Some(selection);
        self
    }

    #[must_use]
    pub fn with_workspace(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_folder_path = Some(root.into());
        self
    }

    /// Capture the anchor a new session is pinned to.
    #[must_use]
    pub fn anchor(&self) -> Anchor {
        Anchor {
            document: self.text_document.clone(),
            position: self.position,
            selection: self.selection,
        }
    }
}

/// Chat participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One chat turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Additive ("accepted so far") and negative ("to be removed") ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecorationSet {
    pub additive: Vec<Range>,
    pub negative: Vec<Range>,
}

impl DecorationSet {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.additive.is_empty() && self.negative.is_empty()
    }

    pub fn clear(&mut self) {
        self.additive.clear();
        self.negative.clear();
    }
}

/// Free-text prompt the engine is waiting on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRequest {
    pub msg: String,
    #[serde(default)]
    pub place_holder: String,
}

/// One node of the engine's task tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub description: String,
    pub status: String,
}

impl Task {
    /// Task status as an agent status, if it names one.
    #[must_use]
    pub fn agent_status(&self) -> Option<AgentStatus> {
        AgentStatus::parse(&self.status)
    }
}

/// Root task plus subtasks, as reported by progress notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tasks {
    pub task: Task,
    #[serde(default)]
    pub subtasks: Vec<Task>,
}

/// Catalog entry returned by `listAgents`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub agent_type: String,
    #[serde(default)]
    pub agent_description: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_icon: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_transitions_from_running() {
        let running = AgentStatus::Running;
        assert!(running.accepts_task_transition(AgentStatus::Done));
        assert!(running.accepts_task_transition(AgentStatus::Error));
        assert!(!running.accepts_task_transition(AgentStatus::Accepted));
        assert!(!running.accepts_task_transition(AgentStatus::Rejected));
        assert!(!AgentStatus::Done.accepts_task_transition(AgentStatus::Running));
    }

    #[test]
    fn test_lens_actions_follow_status() {
        assert_eq!(AgentStatus::Running.lens_actions(), &[LensAction::Cancel]);
        assert_eq!(
            AgentStatus::Error.lens_actions(),
            &[LensAction::Accept, LensAction::Reject]
        );
        assert!(AgentStatus::Accepted.lens_actions().is_empty());
    }

    #[test]
    fn test_status_wire_names() {
        let json = serde_json::to_string(&AgentStatus::Accepted).unwrap();
        assert_eq!(json, "\"accepted\"");
        assert_eq!(AgentStatus::parse("done"), Some(AgentStatus::Done));
        assert_eq!(AgentStatus::parse("scheduled"), None);
    }

    #[test]
    fn test_run_context_wire_shape() {
        let ctx = RunContext::new(TextDocumentIdentifier::new("file:///a.rs"), Position::new(3, 4))
            .with_workspace("/work");
        let value = serde_json::to_value(&ctx).unwrap();
        assert_eq!(value["textDocument"]["uri"], "file:///a.rs");
        assert_eq!(value["position"]["line"], 3);
        assert_eq!(value["workspaceFolderPath"], "/work");
        assert!(value.get("selection").is_none());
    }

    #[test]
    fn test_same_document_ignores_version() {
        let a = TextDocumentIdentifier {
            uri: "file:///a.rs".into(),
            version: Some(1),
        };
        let b = TextDocumentIdentifier {
            uri: "file:///a.rs".into(),
            version: Some(7),
        };
        assert!(a.same_document(&b));
    }
}
