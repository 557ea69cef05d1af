//! Session router: owns the engine connection and multiplexes sessions.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak},
};

use async_trait::async_trait;
use rift_agents_core::{
    AgentDescriptor, AgentId, AgentStatus, Anchor, ChatMessage, EditorHost, InputRequest,
    PubSubError, RunContext, SessionStore, StoreError,
};
use rift_agents_rpc::{Connection, InboundHandler, JsonRpcError, ResponseHook, RpcError};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::{
    agent::{self, AgentSession, SessionContext, SessionError, UserReply},
    routing::{ChannelKey, ChannelKind, RoutingError, RoutingTable},
    wire::{
        self, AgentIdParams, ChatExchange, InitializeParams, ProgressParams, ResultParams,
        RunParams, RunResult, UpdateParams,
    },
};

/// Router error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    #[error("Not connected to the engine")]
    NotConnected,
    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),
    #[error("No live route for {0}")]
    UnknownChannel(String),
    #[error("{method} is a {kind:?} channel")]
    WrongKind { method: String, kind: ChannelKind },
    #[error("Invalid params for {method}: {reason}")]
    InvalidParams { method: String, reason: String },
    #[error("Invalid engine response: {0}")]
    InvalidResponse(String),
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),
    #[error("Reply error: {0}")]
    PubSub(#[from] PubSubError),
}

impl From<StoreError> for RouterError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UnknownAgent(id) => Self::UnknownAgent(id),
            other => Self::Session(SessionError::Store(other)),
        }
    }
}

impl RouterError {
    /// JSON-RPC error returned to the engine for a failed inbound request.
    #[must_use]
    pub fn to_rpc_error(&self) -> JsonRpcError {
        match self {
            Self::UnknownChannel(method) => JsonRpcError::method_not_found(method),
            Self::InvalidParams { .. } => JsonRpcError::invalid_params(self.to_string()),
            Self::Session(SessionError::PubSub(PubSubError::Cancelled(_))) => {
                JsonRpcError::cancelled(self.to_string())
            }
            _ => JsonRpcError::internal(self.to_string()),
        }
    }
}

/// Router configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Agent types whose progress ranges are rendered as decorations.
    pub decoration_agent_types: Vec<String>,
    /// Agent types that do not take the selection when they start.
    pub background_agent_types: Vec<String>,
    /// Namespace prepended to every method on the wire, e.g. `morph/`.
    pub method_prefix: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            decoration_agent_types: vec!["code_completion".to_string(), "code_edit".to_string()],
            background_agent_types: vec!["code_completion".to_string()],
            method_prefix: String::new(),
        }
    }
}

impl RouterConfig {
    #[must_use]
    pub fn with_method_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.method_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn decorates(&self, agent_type: &str) -> bool {
        self.decoration_agent_types.iter().any(|t| t == agent_type)
    }

    #[must_use]
    pub fn is_background(&self, agent_type: &str) -> bool {
        self.background_agent_types.iter().any(|t| t == agent_type)
    }
}

/// Single owner of the engine connection.
///
/// Turns session operations into wire traffic and hands inbound traffic to
/// the session owning the addressed channel. Sessions live until deleted;
/// their routes are installed before the engine can address them.
pub struct SessionRouter {
    config: RouterConfig,
    ctx: SessionContext,
    connection: RwLock<Option<Arc<Connection>>>,
    routes: Mutex<RoutingTable>,
    sessions: Mutex<HashMap<AgentId, Arc<AgentSession>>>,
}

impl SessionRouter {
    /// Create a router with a fresh store around `host`.
    #[must_use]
    pub fn new(config: RouterConfig, host: Arc<dyn EditorHost>) -> Arc<Self> {
        Self::with_context(config, SessionContext::new(host))
    }

    /// Create a router over existing collaborators.
    #[must_use]
    pub fn with_context(config: RouterConfig, ctx: SessionContext) -> Arc<Self> {
        Arc::new(Self {
            config,
            ctx,
            connection: RwLock::new(None),
            routes: Mutex::new(RoutingTable::new()),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.ctx.store
    }

    #[must_use]
    pub fn host(&self) -> &Arc<dyn EditorHost> {
        &self.ctx.host
    }

    /// Handler to pass to [`Connection::start`]. Holds the router weakly.
    #[must_use]
    pub fn inbound_handler(self: &Arc<Self>) -> Arc<dyn InboundHandler> {
        Arc::new(InboundRouter(Arc::downgrade(self)))
    }

    fn routes(&self) -> MutexGuard<'_, RoutingTable> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<AgentId, Arc<AgentSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn method(&self, name: &str) -> String {
        format!("{}{name}", self.config.method_prefix)
    }

    /// The live connection, or `NotConnected`.
    fn connection(&self) -> Result<Arc<Connection>, RouterError> {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|c| c.is_running())
            .cloned()
            .ok_or(RouterError::NotConnected)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection().is_ok()
    }

    fn require_agent(&self, id: &str) -> Result<(), RouterError> {
        if self.ctx.store.contains(id) {
            Ok(())
        } else {
            Err(RouterError::UnknownAgent(id.to_string()))
        }
    }

    /// Live session handling `id`, if any.
    #[must_use]
    pub fn session(&self, id: &str) -> Option<Arc<AgentSession>> {
        self.sessions().get(id).cloned()
    }

    /// Ids of sessions with installed routes.
    #[must_use]
    pub fn live_sessions(&self) -> Vec<AgentId> {
        self.sessions().keys().cloned().collect()
    }

    /// Make `connection` the live connection. Sessions bound to a previous
    /// connection are invalidated.
    pub fn attach(&self, connection: Arc<Connection>) {
        let previous = self
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(connection);
        if let Some(previous) = previous {
            previous.close();
            self.invalidate_sessions();
        }
        tracing::info!("attached engine connection");
    }

    /// Drop the live connection and invalidate every session bound to it.
    pub fn detach(&self) -> Option<Arc<Connection>> {
        let previous = self
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(connection) = &previous {
            connection.close();
            self.invalidate_sessions();
            tracing::info!("detached engine connection");
        }
        previous
    }

    /// Sessions created on a dropped connection have no continuation: their
    /// routes go, parked requests are cancelled and running ones turn into
    /// errors. They stay in the store until the user deletes them.
    fn invalidate_sessions(&self) {
        let sessions: Vec<Arc<AgentSession>> = self.sessions().drain().map(|(_, s)| s).collect();
        self.routes().clear();
        let cancelled = self.ctx.replies.cancel_all();

        for session in &sessions {
            if let Err(e) = session.invalidate() {
                tracing::warn!(agent_id = session.id(), "Failed to invalidate session: {e}");
            }
        }
        tracing::info!(sessions = sessions.len(), cancelled, "invalidated sessions");
    }

    /// Language-server style handshake: `initialize`, then `initialized`.
    ///
    /// # Errors
    /// Returns `NotConnected` or `Rpc` if the engine refuses.
    pub async fn initialize(&self, root_uri: Option<String>) -> Result<Value, RouterError> {
        let connection = self.connection()?;
        let params = serde_json::to_value(InitializeParams::new(root_uri)).map_err(RpcError::from)?;
        let result = connection.request(wire::INITIALIZE, params).await?;
        connection.notify(wire::INITIALIZED, json!({})).await?;
        let server = result.get("serverInfo").cloned().unwrap_or_default();
        tracing::info!(%server, "engine initialized");
        Ok(result)
    }

    /// Start an agent. The session, its store entry and its routes exist by
    /// the time the engine can send anything addressed to it.
    ///
    /// # Errors
    /// Returns `NotConnected` without a live connection, `Rpc` if the engine
    /// refuses, `InvalidResponse` if the reply carries no usable id.
    pub async fn run(
        self: &Arc<Self>,
        agent_type: &str,
        context: RunContext,
    ) -> Result<AgentId, RouterError> {
        let connection = self.connection()?;
        let anchor = context.anchor();
        let params = serde_json::to_value(RunParams {
            agent_type: agent_type.to_string(),
            agent_params: context,
        })
        .map_err(RpcError::from)?;

        let (tx, rx) = oneshot::channel();
        let router = Arc::downgrade(self);
        let owned_type = agent_type.to_string();
        let hook: ResponseHook = Box::new(move |result: &Value| {
            let opened = match router.upgrade() {
                Some(router) => router.open_session(result, &owned_type, anchor),
                None => Err(RouterError::NotConnected),
            };
            let _ = tx.send(opened);
        });

        connection
            .request_with_hook(&self.method(wire::RUN), params, hook)
            .await?;
        rx.await
            .map_err(|_| RouterError::InvalidResponse("run result was not handled".to_string()))?
    }

    /// Runs on the connection's reader task, before the next inbound message.
    fn open_session(
        &self,
        result: &Value,
        agent_type: &str,
        anchor: Anchor,
    ) -> Result<AgentId, RouterError> {
        let RunResult { id } = RunResult::deserialize(result)
            .map_err(|e| RouterError::InvalidResponse(format!("run: {e}")))?;

        let session = Arc::new(AgentSession::new(
            id.clone(),
            agent_type,
            anchor,
            self.config.decorates(agent_type),
            self.ctx.clone(),
        ));
        let select = !self.config.is_background(agent_type);

        {
            let mut routes = self.routes();
            routes.install(agent_type, &id)?;
            if let Err(e) = self.ctx.store.insert(session.initial_state(), select) {
                routes.remove_agent(&id);
                return Err(e.into());
            }
        }
        self.sessions().insert(id.clone(), Arc::clone(&session));

        self.ctx
            .host
            .refresh_code_lenses(&id, session.anchor(), AgentStatus::Running);
        tracing::info!(agent_id = %id, agent_type, selected = select, "agent started");
        Ok(id)
    }

    async fn notify_agent(&self, method: &str, id: &str) -> Result<(), RouterError> {
        let connection = self.connection()?;
        self.require_agent(id)?;
        connection.notify(&self.method(method), id_params(id)?).await?;
        tracing::debug!(agent_id = id, method, "sent");
        Ok(())
    }

    /// Ask the engine to stop an agent. Status changes arrive later as
    /// progress.
    ///
    /// # Errors
    /// Returns `NotConnected` or `UnknownAgent`.
    pub async fn cancel(&self, id: &str) -> Result<(), RouterError> {
        self.notify_agent(wire::CANCEL, id).await
    }

    /// Accept an agent's edits. Confirmed later by an `accepted` progress.
    ///
    /// # Errors
    /// Returns `NotConnected` or `UnknownAgent`.
    pub async fn accept(&self, id: &str) -> Result<(), RouterError> {
        self.notify_agent(wire::ACCEPT, id).await
    }

    /// Reject an agent's edits. Confirmed later by a `rejected` progress.
    ///
    /// # Errors
    /// Returns `NotConnected` or `UnknownAgent`.
    pub async fn reject(&self, id: &str) -> Result<(), RouterError> {
        self.notify_agent(wire::REJECT, id).await
    }

    /// Tell the engine to drop an agent, then forget it locally whatever the
    /// engine does.
    ///
    /// # Errors
    /// Returns `UnknownAgent`. Being disconnected or failing to send is
    /// logged and does not stop the local teardown.
    pub async fn delete(&self, id: &str) -> Result<(), RouterError> {
        self.require_agent(id)?;

        match self.connection() {
            Ok(connection) => {
                if let Err(e) = connection.notify(&self.method(wire::DELETE), id_params(id)?).await {
                    tracing::warn!(agent_id = id, "Failed to send delete: {e}");
                }
            }
            Err(_) => tracing::warn!(agent_id = id, "not connected, deleting locally"),
        }

        self.routes().remove_agent(id);
        let session = self.sessions().remove(id);
        match session {
            Some(session) => {
                session.cancel_pending();
                session.clear_decorations();
            }
            None => {
                // Invalidated by a reconnect; only its topics may linger.
                let state = self.ctx.store.get(id)?;
                self.ctx
                    .replies
                    .cancel(&agent::chat_topic(&state.agent_type, id));
                self.ctx
                    .replies
                    .cancel(&agent::input_topic(&state.agent_type, id));
            }
        }
        self.ctx.store.remove(id)?;
        tracing::info!(agent_id = id, "agent deleted");
        Ok(())
    }

    /// Restart an agent under the same id and reset its local state. The
    /// reset and any route reinstall happen before the engine can address
    /// the restarted agent.
    ///
    /// # Errors
    /// Returns `NotConnected`, `UnknownAgent`, or `Rpc` if the engine
    /// refuses.
    pub async fn restart_session(self: &Arc<Self>, id: &str) -> Result<(), RouterError> {
        let connection = self.connection()?;
        let state = self.ctx.store.get(id)?;

        let (tx, rx) = oneshot::channel();
        let router = Arc::downgrade(self);
        let owned_id = id.to_string();
        let hook: ResponseHook = Box::new(move |_: &Value| {
            let restarted = match router.upgrade() {
                Some(router) => router.reset_session(&owned_id, &state.agent_type, state.anchor),
                None => Err(RouterError::NotConnected),
            };
            let _ = tx.send(restarted);
        });

        connection
            .request_with_hook(&self.method(wire::RESTART), id_params(id)?, hook)
            .await?;
        rx.await
            .map_err(|_| RouterError::InvalidResponse("restart result was not handled".to_string()))??;
        tracing::info!(agent_id = id, "agent restarted");
        Ok(())
    }

    /// Runs on the connection's reader task, before the next inbound message.
    fn reset_session(&self, id: &str, agent_type: &str, anchor: Anchor) -> Result<(), RouterError> {
        self.require_agent(id)?;
        let session = match self.session(id) {
            Some(session) => session,
            None => self.reopen_session(id, agent_type, anchor)?,
        };
        session.reset()?;
        Ok(())
    }

    /// Re-route a session invalidated by a reconnect.
    fn reopen_session(
        &self,
        id: &str,
        agent_type: &str,
        anchor: Anchor,
    ) -> Result<Arc<AgentSession>, RouterError> {
        self.routes().install(agent_type, id)?;
        let session = Arc::new(AgentSession::new(
            id,
            agent_type,
            anchor,
            self.config.decorates(agent_type),
            self.ctx.clone(),
        ));
        self.sessions().insert(id.to_string(), Arc::clone(&session));
        tracing::debug!(agent_id = id, "session re-routed");
        Ok(session)
    }

    /// Fetch the engine's agent catalog and cache it in the store.
    ///
    /// # Errors
    /// Returns `NotConnected`, `Rpc`, or `InvalidResponse`.
    pub async fn list_available_agents(&self) -> Result<Vec<AgentDescriptor>, RouterError> {
        let connection = self.connection()?;
        let result = connection
            .request(&self.method(wire::LIST_AGENTS), json!({}))
            .await?;
        let agents: Vec<AgentDescriptor> = serde_json::from_value(result)
            .map_err(|e| RouterError::InvalidResponse(format!("listAgents: {e}")))?;

        tracing::debug!(count = agents.len(), "agent catalog refreshed");
        self.ctx.store.set_available_agents(agents.clone());
        Ok(agents)
    }

    /// Tell the engine that client configuration changed.
    ///
    /// # Errors
    /// Returns `NotConnected` or `Rpc`.
    pub async fn configuration_changed(&self, settings: Value) -> Result<(), RouterError> {
        let connection = self.connection()?;
        connection
            .notify(
                wire::DID_CHANGE_CONFIGURATION,
                json!({ "settings": settings }),
            )
            .await?;
        Ok(())
    }

    /// Make `id` the selected agent.
    ///
    /// # Errors
    /// Returns `UnknownAgent`.
    pub fn select(&self, id: &str) -> Result<(), RouterError> {
        self.ctx.store.select(id)?;
        Ok(())
    }

    /// Answer an agent's pending chat request with a new user turn.
    ///
    /// # Errors
    /// Returns `UnknownAgent`, or `PubSub(NoSubscriber)` when the agent is
    /// not waiting for chat.
    pub fn send_chat_message(&self, id: &str, text: &str) -> Result<(), RouterError> {
        let state = self.ctx.store.get(id)?;
        let topic = agent::chat_topic(&state.agent_type, id);
        if !self.ctx.replies.is_pending(&topic) {
            return Err(PubSubError::NoSubscriber(topic).into());
        }

        self.ctx.store.append_chat_message(id, ChatMessage::user(text))?;
        let history = self.ctx.store.get(id)?.chat_history;
        self.ctx.replies.publish(&topic, UserReply::Chat(history))?;
        Ok(())
    }

    /// Answer an agent's pending input request.
    ///
    /// # Errors
    /// Returns `UnknownAgent`, or `PubSub(NoSubscriber)` when the agent is
    /// not waiting for input.
    pub fn submit_input(&self, id: &str, text: &str) -> Result<(), RouterError> {
        let state = self.ctx.store.get(id)?;
        let topic = agent::input_topic(&state.agent_type, id);
        self.ctx
            .replies
            .publish(&topic, UserReply::Input(text.to_string()))?;
        Ok(())
    }

    fn route(&self, method: &str) -> Result<(ChannelKey, Arc<AgentSession>), RouterError> {
        let unknown = || RouterError::UnknownChannel(method.to_string());
        let name = method
            .strip_prefix(self.config.method_prefix.as_str())
            .ok_or_else(unknown)?;
        let key = self.routes().resolve(name).cloned().ok_or_else(unknown)?;
        let session = self.session(&key.agent_id).ok_or_else(unknown)?;
        Ok((key, session))
    }

    /// Answer an engine request addressed to a session channel.
    ///
    /// # Errors
    /// Returns `UnknownChannel` for methods without a live route.
    pub async fn dispatch_request(&self, method: &str, params: Value) -> Result<Value, RouterError> {
        let (key, session) = self.route(method)?;
        let result = match key.kind {
            ChannelKind::RequestChat => {
                let request: ChatExchange = parse_params(method, params)?;
                serde_json::to_value(session.handle_chat_request(request).await?)
            }
            ChannelKind::RequestInput => {
                let request: InputRequest = parse_params(method, params)?;
                serde_json::to_value(session.handle_input_request(request).await?)
            }
            kind => {
                return Err(RouterError::WrongKind {
                    method: method.to_string(),
                    kind,
                });
            }
        };
        Ok(result.map_err(RpcError::from)?)
    }

    /// Apply an engine notification addressed to a session channel.
    ///
    /// # Errors
    /// Returns `UnknownChannel` for methods without a live route.
    pub fn dispatch_notification(&self, method: &str, params: Value) -> Result<(), RouterError> {
        let (key, session) = self.route(method)?;
        match key.kind {
            ChannelKind::SendProgress => {
                let params: ProgressParams = parse_params(method, params)?;
                session.handle_progress(&params)?;
            }
            ChannelKind::SendUpdate => {
                let params: UpdateParams = parse_params(method, params)?;
                session.handle_update(&params.msg)?;
            }
            ChannelKind::SendResult => {
                let params: ResultParams = parse_params(method, params)?;
                session.handle_result(&params)?;
            }
            kind => {
                return Err(RouterError::WrongKind {
                    method: method.to_string(),
                    kind,
                });
            }
        }
        Ok(())
    }
}

fn id_params(id: &str) -> Result<Value, RouterError> {
    let params = serde_json::to_value(AgentIdParams { id: id.to_string() }).map_err(RpcError::from)?;
    Ok(params)
}

fn parse_params<T: DeserializeOwned>(method: &str, params: Value) -> Result<T, RouterError> {
    serde_json::from_value(params).map_err(|e| RouterError::InvalidParams {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

/// Connection-facing side of the router.
struct InboundRouter(Weak<SessionRouter>);

#[async_trait]
impl InboundHandler for InboundRouter {
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, JsonRpcError> {
        let Some(router) = self.0.upgrade() else {
            return Err(JsonRpcError::internal("client is shutting down"));
        };
        router.dispatch_request(method, params).await.map_err(|e| {
            tracing::error!(method, "Failed to handle engine request: {e}");
            e.to_rpc_error()
        })
    }

    async fn handle_notification(&self, method: &str, params: Value) {
        let Some(router) = self.0.upgrade() else {
            return;
        };
        if let Err(e) = router.dispatch_notification(method, params) {
            tracing::error!(method, "Failed to handle engine notification: {e}");
        }
    }
}
