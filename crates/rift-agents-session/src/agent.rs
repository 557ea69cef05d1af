//! One agent session: status machine, progress application and the
//! chat/input bridge.
//!
//! The authoritative state lives in the [`SessionStore`]; a session only
//! knows its identity and anchor and mutates its store entry in place.

use std::sync::Arc;

use rift_agents_core::{
    AgentId, AgentState, AgentStatus, Anchor, ChatMessage, DecorationSet, EditorHost, InputRequest,
    PubSub, PubSubError, SessionStore, StoreError,
};
use thiserror::Error;

use crate::wire::{ChatExchange, InputResponse, ProgressParams, ProgressPayload, ResultParams};

/// Answer a user gives to a parked engine request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserReply {
    /// Full chat history including the new user turn.
    Chat(Vec<ChatMessage>),
    /// Free-text answer.
    Input(String),
}

/// Collaborators shared by every session of one router.
#[derive(Clone)]
pub struct SessionContext {
    pub store: Arc<SessionStore>,
    pub replies: Arc<PubSub<UserReply>>,
    pub host: Arc<dyn EditorHost>,
}

impl SessionContext {
    /// Fresh store and reply registry around `host`.
    #[must_use]
    pub fn new(host: Arc<dyn EditorHost>) -> Self {
        Self {
            store: Arc::new(SessionStore::new()),
            replies: Arc::new(PubSub::new()),
            host,
        }
    }
}

/// Session error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    PubSub(#[from] PubSubError),
    #[error("Expected a {expected} reply on {topic}")]
    UnexpectedReply {
        topic: String,
        expected: &'static str,
    },
}

/// Side effects a progress notification asks for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressOutcome {
    /// New status, when it changed.
    pub status: Option<AgentStatus>,
    /// Decorations to re-render, when they changed.
    pub decorations: Option<DecorationSet>,
}

impl ProgressOutcome {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.status.is_none() && self.decorations.is_none()
    }
}

/// Topic a pending chat request of one session waits on.
#[must_use]
pub fn chat_topic(agent_type: &str, agent_id: &str) -> String {
    format!("{agent_type}_{agent_id}_chat_request")
}

/// Topic a pending input request of one session waits on.
#[must_use]
pub fn input_topic(agent_type: &str, agent_id: &str) -> String {
    format!("{agent_type}_{agent_id}_input_request")
}

/// Apply one progress notification to a session's state.
///
/// Terminal sessions ignore everything. Range lists are replaced, never
/// merged, so applying the same payload twice equals applying it once.
pub fn apply_progress(
    state: &mut AgentState,
    params: &ProgressParams,
    decorates: bool,
) -> ProgressOutcome {
    let mut outcome = ProgressOutcome::default();

    if state.status.is_terminal() {
        tracing::debug!(agent_id = %state.id, status = %state.status, "late progress ignored");
        return outcome;
    }

    if let Some(tasks) = &params.tasks {
        state.tasks = Some(tasks.clone());
        match tasks.task.agent_status() {
            Some(next) if next == state.status => {}
            Some(next) if state.status.accepts_task_transition(next) => {
                state.status = next;
                outcome.status = Some(next);
            }
            Some(next) => {
                tracing::warn!(
                    agent_id = %state.id,
                    from = %state.status,
                    to = %next,
                    "ignoring task status transition"
                );
            }
            None => {
                tracing::debug!(agent_id = %state.id, status = %tasks.task.status, "unrecognised task status");
            }
        }
    }

    match &params.payload {
        None => {}
        Some(ProgressPayload::Sentinel(sentinel)) => {
            let next = sentinel.status();
            state.status = next;
            state.decorations.clear();
            state.is_streaming = false;
            state.input_request = None;
            outcome.status = Some(next);
            outcome.decorations = Some(DecorationSet::default());
        }
        Some(ProgressPayload::Structured(payload)) => {
            if decorates && payload.has_ranges() {
                state.decorations = DecorationSet {
                    additive: payload.additive_ranges.clone().unwrap_or_default(),
                    negative: payload.negative_ranges.clone().unwrap_or_default(),
                };
                outcome.decorations = Some(state.decorations.clone());
            }

            if let Some(response) = &payload.response {
                state.streaming_text.clone_from(response);
                state.is_streaming = true;
            }

            if payload.done_streaming == Some(true) {
                let text = std::mem::take(&mut state.streaming_text);
                if text.is_empty() {
                    tracing::warn!(agent_id = %state.id, "done streaming without a response");
                } else {
                    state.chat_history.push(ChatMessage::assistant(text));
                }
                state.is_streaming = false;
            }
        }
    }

    outcome
}

/// Live agent session bound to one store entry.
pub struct AgentSession {
    id: AgentId,
    agent_type: String,
    anchor: Anchor,
    decorates: bool,
    ctx: SessionContext,
}

impl AgentSession {
    #[must_use]
    pub fn new(
        id: impl Into<AgentId>,
        agent_type: impl Into<String>,
        anchor: Anchor,
        decorates: bool,
        ctx: SessionContext,
    ) -> Self {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            anchor,
            decorates,
            ctx,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    #[must_use]
    pub const fn anchor(&self) -> &Anchor {
        &self.anchor
    }

    /// Whether progress ranges are rendered for this session.
    #[must_use]
    pub const fn decorates(&self) -> bool {
        self.decorates
    }

    /// Initial store projection of this session.
    #[must_use]
    pub fn initial_state(&self) -> AgentState {
        AgentState::new(self.id.clone(), self.agent_type.clone(), self.anchor.clone())
    }

    #[must_use]
    pub fn chat_topic(&self) -> String {
        chat_topic(&self.agent_type, &self.id)
    }

    #[must_use]
    pub fn input_topic(&self) -> String {
        input_topic(&self.agent_type, &self.id)
    }

    /// `{type}_{id}_send_progress`.
    ///
    /// # Errors
    /// Returns `Store` if the session is no longer in the store.
    pub fn handle_progress(&self, params: &ProgressParams) -> Result<ProgressOutcome, SessionError> {
        let outcome = self
            .ctx
            .store
            .update(&self.id, |state| apply_progress(state, params, self.decorates))?;

        if let Some(decorations) = &outcome.decorations {
            self.ctx
                .host
                .render_decorations(&self.id, &self.anchor, decorations);
        }
        if let Some(status) = outcome.status {
            tracing::info!(agent_id = %self.id, %status, "status changed");
            self.ctx
                .host
                .refresh_code_lenses(&self.id, &self.anchor, status);
        }
        Ok(outcome)
    }

    /// `{type}_{id}_send_update`.
    ///
    /// # Errors
    /// Returns `Store` if the session is no longer in the store.
    pub fn handle_update(&self, msg: &str) -> Result<(), SessionError> {
        self.ctx
            .store
            .update(&self.id, |state| state.last_update = Some(msg.to_string()))?;
        self.ctx.host.show_message(&self.id, msg);
        Ok(())
    }

    /// `{type}_{id}_send_result`.
    ///
    /// # Errors
    /// Returns `Store` if the session is no longer in the store.
    pub fn handle_result(&self, params: &ResultParams) -> Result<(), SessionError> {
        if params.id != self.id {
            tracing::warn!(agent_id = %self.id, reported = %params.id, "result names another agent");
        }
        self.ctx.store.mark_notification(&self.id)?;
        self.ctx.host.agent_finished(&self.id, &self.agent_type);
        Ok(())
    }

    /// `{type}_{id}_request_chat`. Shows the engine's history and waits,
    /// with no timeout, for the user's next turn.
    ///
    /// # Errors
    /// Returns `PubSub` if a chat request is already pending or the wait is
    /// cancelled, `Store` if the session is gone.
    pub async fn handle_chat_request(&self, request: ChatExchange) -> Result<ChatExchange, SessionError> {
        let topic = self.chat_topic();
        let subscription = self.ctx.replies.subscribe(topic.clone())?;

        self.ctx
            .store
            .update(&self.id, |state| state.chat_history = request.messages)?;
        self.ctx.store.mark_notification(&self.id)?;
        tracing::debug!(agent_id = %self.id, %topic, "waiting for chat reply");

        match subscription.recv().await? {
            UserReply::Chat(messages) => Ok(ChatExchange { messages }),
            UserReply::Input(_) => Err(SessionError::UnexpectedReply {
                topic,
                expected: "chat",
            }),
        }
    }

    /// `{type}_{id}_request_input`. Shows the prompt and waits, with no
    /// timeout, for the user's answer.
    ///
    /// # Errors
    /// Same as [`handle_chat_request`](Self::handle_chat_request).
    pub async fn handle_input_request(&self, request: InputRequest) -> Result<InputResponse, SessionError> {
        let topic = self.input_topic();
        let subscription = self.ctx.replies.subscribe(topic.clone())?;

        self.ctx
            .store
            .update(&self.id, |state| state.input_request = Some(request))?;
        self.ctx.store.mark_notification(&self.id)?;
        tracing::debug!(agent_id = %self.id, %topic, "waiting for input");

        let response = match subscription.recv().await? {
            UserReply::Input(response) => response,
            UserReply::Chat(_) => {
                return Err(SessionError::UnexpectedReply {
                    topic,
                    expected: "input",
                });
            }
        };
        self.ctx
            .store
            .update(&self.id, |state| state.input_request = None)?;
        Ok(InputResponse { response })
    }

    /// Wake any parked chat/input request with a cancellation.
    pub fn cancel_pending(&self) -> usize {
        [self.chat_topic(), self.input_topic()]
            .iter()
            .filter(|topic| self.ctx.replies.cancel(topic))
            .count()
    }

    /// Drop everything but identity and anchor, as after an engine restart.
    ///
    /// # Errors
    /// Returns `Store` if the session is no longer in the store.
    pub fn reset(&self) -> Result<(), SessionError> {
        self.cancel_pending();
        self.ctx.store.replace(&self.id, self.initial_state())?;
        self.clear_decorations();
        self.ctx
            .host
            .refresh_code_lenses(&self.id, &self.anchor, AgentStatus::Running);
        Ok(())
    }

    /// Remove this session's decorations from the editor.
    pub fn clear_decorations(&self) {
        self.ctx
            .host
            .render_decorations(&self.id, &self.anchor, &DecorationSet::default());
    }

    /// Mark a session whose engine connection is gone.
    ///
    /// # Errors
    /// Returns `Store` if the session is no longer in the store.
    pub fn invalidate(&self) -> Result<(), SessionError> {
        self.cancel_pending();
        let changed = self.ctx.store.update(&self.id, |state| {
            state.is_streaming = false;
            state.input_request = None;
            if state.status == AgentStatus::Running {
                state.status = AgentStatus::Error;
                true
            } else {
                false
            }
        })?;
        if changed {
            self.ctx
                .host
                .refresh_code_lenses(&self.id, &self.anchor, AgentStatus::Error);
        }
        Ok(())
    }
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession")
            .field("id", &self.id)
            .field("agent_type", &self.agent_type)
            .field("decorates", &self.decorates)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use rift_agents_core::{Position, Range, Task, Tasks, TextDocumentIdentifier};
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    /// Host that records what it was asked to render.
    #[derive(Default)]
    struct RecordingHost {
        decorations: Mutex<Vec<DecorationSet>>,
        lenses: Mutex<Vec<AgentStatus>>,
        messages: Mutex<Vec<String>>,
    }

    impl EditorHost for RecordingHost {
        fn render_decorations(&self, _agent_id: &str, _anchor: &Anchor, decorations: &DecorationSet) {
            self.decorations.lock().unwrap().push(decorations.clone());
        }

        fn refresh_code_lenses(&self, _agent_id: &str, _anchor: &Anchor, status: AgentStatus) {
            self.lenses.lock().unwrap().push(status);
        }

        fn show_message(&self, _agent_id: &str, message: &str) {
            self.messages.lock().unwrap().push(message.to_string());
        }
    }

    fn anchor() -> Anchor {
        Anchor {
            document: TextDocumentIdentifier::new("file:///src/main.rs"),
            position: Position::new(4, 0),
            selection: None,
        }
    }

    fn session(agent_type: &str, decorates: bool) -> (Arc<AgentSession>, Arc<RecordingHost>) {
        let host = Arc::new(RecordingHost::default());
        let ctx = SessionContext::new(Arc::clone(&host) as Arc<dyn EditorHost>);
        let session = AgentSession::new("a1", agent_type, anchor(), decorates, ctx);
        session
            .ctx
            .store
            .insert(session.initial_state(), false)
            .unwrap();
        (Arc::new(session), host)
    }

    fn progress(value: serde_json::Value) -> ProgressParams {
        serde_json::from_value(value).unwrap()
    }

    fn status_of(session: &AgentSession) -> AgentStatus {
        session.ctx.store.get(session.id()).unwrap().status
    }

    fn range(a: u32, b: u32) -> Range {
        Range::new(Position::new(a, 0), Position::new(b, 0))
    }

    #[test]
    fn test_task_status_moves_running_to_done() {
        let (session, host) = session("rift_chat", false);
        let outcome = session
            .handle_progress(&progress(json!({"tasks": {"task": {"status": "done"}}})))
            .unwrap();

        assert_eq!(outcome.status, Some(AgentStatus::Done));
        assert_eq!(status_of(&session), AgentStatus::Done);
        assert_eq!(*host.lenses.lock().unwrap(), vec![AgentStatus::Done]);
    }

    #[test]
    fn test_same_task_status_is_noop() {
        let (session, host) = session("rift_chat", false);
        let outcome = session
            .handle_progress(&progress(json!({"tasks": {"task": {"status": "running"}}})))
            .unwrap();
        assert!(outcome.is_noop());
        assert!(host.lenses.lock().unwrap().is_empty());
    }

    #[test]
    fn test_task_status_cannot_reach_terminal_states() {
        let (session, _host) = session("rift_chat", false);
        session
            .handle_progress(&progress(json!({"tasks": {"task": {"status": "accepted"}}})))
            .unwrap();
        assert_eq!(status_of(&session), AgentStatus::Running);

        session
            .handle_progress(&progress(json!({"tasks": {"task": {"status": "error"}}})))
            .unwrap();
        session
            .handle_progress(&progress(json!({"tasks": {"task": {"status": "running"}}})))
            .unwrap();
        assert_eq!(status_of(&session), AgentStatus::Error);
    }

    #[test]
    fn test_sentinel_ends_session_and_clears_ranges() {
        let (session, host) = session("code_edit", true);
        session
            .handle_progress(&progress(json!({
                "payload": {"additiveRanges": [range(1, 2)], "negativeRanges": [range(3, 4)]}
            })))
            .unwrap();
        assert!(!session.ctx.store.get("a1").unwrap().decorations.is_empty());

        // Straight from running, no done/error in between.
        session
            .handle_progress(&progress(json!({"payload": "rejected"})))
            .unwrap();

        let state = session.ctx.store.get("a1").unwrap();
        assert_eq!(state.status, AgentStatus::Rejected);
        assert!(state.decorations.is_empty());
        assert!(host.decorations.lock().unwrap().last().unwrap().is_empty());
        assert!(AgentStatus::Rejected.lens_actions().is_empty());
    }

    #[test]
    fn test_terminal_session_ignores_late_notifications() {
        let (session, host) = session("code_edit", true);
        session
            .handle_progress(&progress(json!({"payload": "accepted"})))
            .unwrap();
        let before = session.ctx.store.get("a1").unwrap();
        let renders = host.decorations.lock().unwrap().len();

        let outcome = session
            .handle_progress(&progress(json!({
                "tasks": {"task": {"status": "error"}},
                "payload": {"additiveRanges": [range(0, 9)]}
            })))
            .unwrap();
        assert!(outcome.is_noop());
        assert_eq!(session.ctx.store.get("a1").unwrap(), before);
        assert_eq!(host.decorations.lock().unwrap().len(), renders);
    }

    #[test]
    fn test_repeated_progress_replaces_ranges() {
        let (session, _host) = session("code_completion", true);
        let params = progress(json!({
            "payload": {"additiveRanges": [range(1, 2), range(5, 6)], "negativeRanges": []}
        }));

        session.handle_progress(&params).unwrap();
        let once = session.ctx.store.get("a1").unwrap().decorations;
        session.handle_progress(&params).unwrap();
        let twice = session.ctx.store.get("a1").unwrap().decorations;

        assert_eq!(once, twice);
        assert_eq!(twice.additive.len(), 2);

        session
            .handle_progress(&progress(json!({"payload": {"negativeRanges": [range(7, 8)]}})))
            .unwrap();
        let replaced = session.ctx.store.get("a1").unwrap().decorations;
        assert!(replaced.additive.is_empty());
        assert_eq!(replaced.negative, vec![range(7, 8)]);
    }

    #[test]
    fn test_non_decorating_types_keep_no_ranges() {
        let (session, host) = session("rift_chat", false);
        session
            .handle_progress(&progress(json!({"payload": {"additiveRanges": [range(1, 2)]}})))
            .unwrap();
        assert!(session.ctx.store.get("a1").unwrap().decorations.is_empty());
        assert!(host.decorations.lock().unwrap().is_empty());
    }

    #[test]
    fn test_streaming_response_lands_in_history() {
        let (session, _host) = session("rift_chat", false);
        session
            .handle_progress(&progress(json!({"payload": {"response": "Hel"}})))
            .unwrap();
        let state = session.ctx.store.get("a1").unwrap();
        assert!(state.is_streaming);
        assert_eq!(state.streaming_text, "Hel");

        session
            .handle_progress(&progress(json!({"payload": {"response": "Hello", "done_streaming": true}})))
            .unwrap();
        let state = session.ctx.store.get("a1").unwrap();
        assert!(!state.is_streaming);
        assert!(state.streaming_text.is_empty());
        assert_eq!(state.chat_history, vec![ChatMessage::assistant("Hello")]);
    }

    #[test]
    fn test_tasks_are_recorded() {
        let (session, _host) = session("rift_chat", false);
        let tasks = Tasks {
            task: Task {
                description: "plan".into(),
                status: "running".into(),
            },
            subtasks: vec![Task {
                description: "read files".into(),
                status: "done".into(),
            }],
        };
        session
            .handle_progress(&ProgressParams {
                tasks: Some(tasks.clone()),
                payload: None,
            })
            .unwrap();
        assert_eq!(session.ctx.store.get("a1").unwrap().tasks, Some(tasks));
    }

    #[test]
    fn test_update_reaches_host() {
        let (session, host) = session("rift_chat", false);
        session.handle_update("indexing workspace").unwrap();
        assert_eq!(
            session.ctx.store.get("a1").unwrap().last_update.as_deref(),
            Some("indexing workspace")
        );
        assert_eq!(*host.messages.lock().unwrap(), vec!["indexing workspace"]);
    }

    #[test]
    fn test_handlers_fail_for_removed_session() {
        let (session, _host) = session("rift_chat", false);
        session.ctx.store.remove("a1").unwrap();
        let err = assert_err!(session.handle_update("late"));
        assert_eq!(err, SessionError::Store(StoreError::UnknownAgent("a1".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chat_request_waits_without_timeout() {
        let (session, _host) = session("chatType", false);
        let request = ChatExchange {
            messages: vec![ChatMessage::assistant("What next?")],
        };

        let pending = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.handle_chat_request(request).await }
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!pending.is_finished());

        let state = session.ctx.store.get("a1").unwrap();
        assert_eq!(state.chat_history, vec![ChatMessage::assistant("What next?")]);
        assert!(state.has_notification);

        let reply = vec![
            ChatMessage::assistant("What next?"),
            ChatMessage::user("Add tests"),
        ];
        assert_ok!(
            session
                .ctx
                .replies
                .publish("chatType_a1_chat_request", UserReply::Chat(reply.clone()))
        );
        let exchange = pending.await.unwrap().unwrap();
        assert_eq!(exchange.messages, reply);
    }

    #[tokio::test]
    async fn test_input_request_round_trip() {
        let (session, _host) = session("engineer", false);
        let pending = tokio::spawn({
            let session = Arc::clone(&session);
            async move {
                session
                    .handle_input_request(InputRequest {
                        msg: "Which file?".into(),
                        place_holder: "path".into(),
                    })
                    .await
            }
        });

        while !session.ctx.replies.is_pending(&session.input_topic()) {
            tokio::task::yield_now().await;
        }
        assert!(session.ctx.store.get("a1").unwrap().input_request.is_some());

        session
            .ctx
            .replies
            .publish("engineer_a1_input_request", UserReply::Input("lib.rs".into()))
            .unwrap();
        let response = pending.await.unwrap().unwrap();
        assert_eq!(response.response, "lib.rs");
        assert!(session.ctx.store.get("a1").unwrap().input_request.is_none());
    }

    #[tokio::test]
    async fn test_second_chat_request_is_rejected() {
        let (session, _host) = session("rift_chat", false);
        let _first = session.ctx.replies.subscribe(session.chat_topic()).unwrap();
        let err = session
            .handle_chat_request(ChatExchange { messages: vec![] })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::PubSub(PubSubError::AlreadySubscribed(_))));
    }

    #[tokio::test]
    async fn test_cancel_pending_wakes_parked_request() {
        let (session, _host) = session("rift_chat", false);
        let pending = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.handle_chat_request(ChatExchange { messages: vec![] }).await }
        });
        while !session.ctx.replies.is_pending(&session.chat_topic()) {
            tokio::task::yield_now().await;
        }

        assert_eq!(session.cancel_pending(), 1);
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::PubSub(PubSubError::Cancelled(_))));
    }

    #[test]
    fn test_reset_restores_fresh_state() {
        let (session, host) = session("code_edit", true);
        session
            .handle_progress(&progress(json!({
                "tasks": {"task": {"status": "done"}},
                "payload": {"additiveRanges": [range(1, 3)]}
            })))
            .unwrap();
        session.ctx.store.select("a1").unwrap();

        session.reset().unwrap();
        let state = session.ctx.store.get("a1").unwrap();
        assert_eq!(state, session.initial_state());
        assert!(session.ctx.store.is_selected("a1"));
        assert_eq!(host.lenses.lock().unwrap().last(), Some(&AgentStatus::Running));
    }

    #[test]
    fn test_invalidate_fails_running_sessions() {
        let (session, _host) = session("rift_chat", false);
        session.invalidate().unwrap();
        assert_eq!(status_of(&session), AgentStatus::Error);
    }
}
