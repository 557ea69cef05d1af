//! Process-wide session store observed by UI subscribers.
//!
//! Holds the externally visible projection of every live agent in insertion
//! order, the selected agent and the engine's agent catalog. Every mutation
//! is broadcast as a [`StoreEvent`]; late subscribers start from a snapshot.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use futures::{StreamExt, stream::BoxStream};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::types::{
    AgentDescriptor, AgentId, AgentStatus, Anchor, ChatMessage, DecorationSet, InputRequest, Tasks,
};

/// Broadcast capacity; lagging observers resynchronise from a snapshot.
const EVENT_CAPACITY: usize = 1024;

/// Store error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),
    #[error("Agent already exists: {0}")]
    DuplicateAgent(AgentId),
}

/// Externally visible projection of one agent session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub id: AgentId,
    #[serde(rename = "type")]
    pub agent_type: String,
    pub status: AgentStatus,
    pub anchor: Anchor,
    pub chat_history: Vec<ChatMessage>,
    pub input_request: Option<InputRequest>,
    pub is_streaming: bool,
    pub streaming_text: String,
    pub has_notification: bool,
    pub tasks: Option<Tasks>,
    pub decorations: DecorationSet,
    pub last_update: Option<String>,
}

impl AgentState {
    /// Fresh state for a newly created or restarted session.
    #[must_use]
    pub fn new(id: impl Into<AgentId>, agent_type: impl Into<String>, anchor: Anchor) -> Self {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            status: AgentStatus::Running,
            anchor,
            chat_history: Vec::new(),
            input_request: None,
            is_streaming: false,
            streaming_text: String::new(),
            has_notification: false,
            tasks: None,
            decorations: DecorationSet::default(),
            last_update: None,
        }
    }
}

/// Store change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "id", rename_all = "snake_case")]
pub enum StoreEvent {
    AgentAdded(AgentId),
    AgentUpdated(AgentId),
    AgentRemoved(AgentId),
    SelectionChanged(Option<AgentId>),
    CatalogUpdated,
}

/// Point-in-time copy of the whole store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub agents: Vec<AgentState>,
    pub selected_agent_id: Option<AgentId>,
    pub available_agents: Vec<AgentDescriptor>,
}

impl StoreSnapshot {
    /// Look up an agent in the snapshot.
    #[must_use]
    pub fn agent(&self, id: &str) -> Option<&AgentState> {
        self.agents.iter().find(|a| a.id == id)
    }
}

#[derive(Default)]
struct Inner {
    agents: HashMap<AgentId, AgentState>,
    order: Vec<AgentId>,
    selected: Option<AgentId>,
    available: Vec<AgentDescriptor>,
}

/// Ordered agent map with selection and change broadcast.
pub struct SessionStore {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<StoreEvent>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: RwLock::new(Inner::default()),
            sender,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: StoreEvent) {
        let _ = self.sender.send(event); // no observers is fine
    }

    /// Insert a new agent, optionally making it the selected one.
    ///
    /// # Errors
    /// Returns `DuplicateAgent` if the id is already live.
    pub fn insert(&self, state: AgentState, select: bool) -> Result<(), StoreError> {
        let id = state.id.clone();
        {
            let mut inner = self.write();
            if inner.agents.contains_key(&id) {
                return Err(StoreError::DuplicateAgent(id));
            }
            inner.order.push(id.clone());
            inner.agents.insert(id.clone(), state);
            if select {
                inner.selected = Some(id.clone());
            }
        }
        self.emit(StoreEvent::AgentAdded(id.clone()));
        if select {
            self.emit(StoreEvent::SelectionChanged(Some(id)));
        }
        Ok(())
    }

    /// Mutate one agent in place.
    ///
    /// # Errors
    /// Returns `UnknownAgent` if the id is not live.
    pub fn update<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut AgentState) -> R,
    ) -> Result<R, StoreError> {
        let result = {
            let mut inner = self.write();
            let state = inner
                .agents
                .get_mut(id)
                .ok_or_else(|| StoreError::UnknownAgent(id.to_string()))?;
            f(state)
        };
        self.emit(StoreEvent::AgentUpdated(id.to_string()));
        Ok(result)
    }

    /// Replace an agent's state wholesale, keeping its position and selection.
    ///
    /// # Errors
    /// Returns `UnknownAgent` if the id is not live.
    pub fn replace(&self, id: &str, state: AgentState) -> Result<(), StoreError> {
        self.update(id, |current| *current = state)
    }

    /// Remove an agent. If it was selected, selection falls to the first
    /// remaining agent, or to none.
    ///
    /// # Errors
    /// Returns `UnknownAgent` if the id is not live.
    pub fn remove(&self, id: &str) -> Result<AgentState, StoreError> {
        let (state, selection_changed) = {
            let mut inner = self.write();
            let state = inner
                .agents
                .remove(id)
                .ok_or_else(|| StoreError::UnknownAgent(id.to_string()))?;
            inner.order.retain(|k| k != id);
            let was_selected = inner.selected.as_deref() == Some(id);
            if was_selected {
                inner.selected = inner.order.first().cloned();
            }
            (state, was_selected.then(|| inner.selected.clone()))
        };
        self.emit(StoreEvent::AgentRemoved(id.to_string()));
        if let Some(selected) = selection_changed {
            self.emit(StoreEvent::SelectionChanged(selected));
        }
        Ok(state)
    }

    /// Select an agent and clear its notification flag.
    ///
    /// # Errors
    /// Returns `UnknownAgent` if the id is not live.
    pub fn select(&self, id: &str) -> Result<(), StoreError> {
        {
            let mut inner = self.write();
            let state = inner
                .agents
                .get_mut(id)
                .ok_or_else(|| StoreError::UnknownAgent(id.to_string()))?;
            state.has_notification = false;
            inner.selected = Some(id.to_string());
        }
        self.emit(StoreEvent::AgentUpdated(id.to_string()));
        self.emit(StoreEvent::SelectionChanged(Some(id.to_string())));
        Ok(())
    }

    /// Flag an agent as needing attention unless it is the selected one.
    /// Returns whether the flag was raised.
    ///
    /// # Errors
    /// Returns `UnknownAgent` if the id is not live.
    pub fn mark_notification(&self, id: &str) -> Result<bool, StoreError> {
        let raised = {
            let mut inner = self.write();
            let selected = inner.selected.as_deref() == Some(id);
            let state = inner
                .agents
                .get_mut(id)
                .ok_or_else(|| StoreError::UnknownAgent(id.to_string()))?;
            state.has_notification = !selected;
            !selected
        };
        self.emit(StoreEvent::AgentUpdated(id.to_string()));
        Ok(raised)
    }

    /// Append a chat turn authored locally.
    ///
    /// # Errors
    /// Returns `UnknownAgent` if the id is not live.
    pub fn append_chat_message(&self, id: &str, message: ChatMessage) -> Result<(), StoreError> {
        self.update(id, |state| state.chat_history.push(message))
    }

    /// Get a copy of one agent.
    ///
    /// # Errors
    /// Returns `UnknownAgent` if the id is not live.
    pub fn get(&self, id: &str) -> Result<AgentState, StoreError> {
        self.read()
            .agents
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownAgent(id.to_string()))
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.read().agents.contains_key(id)
    }

    /// Agent ids in insertion order.
    #[must_use]
    pub fn ids(&self) -> Vec<AgentId> {
        self.read().order.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().agents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().agents.is_empty()
    }

    #[must_use]
    pub fn selected_agent_id(&self) -> Option<AgentId> {
        self.read().selected.clone()
    }

    #[must_use]
    pub fn is_selected(&self, id: &str) -> bool {
        self.read().selected.as_deref() == Some(id)
    }

    /// Replace the cached agent catalog.
    pub fn set_available_agents(&self, agents: Vec<AgentDescriptor>) {
        self.write().available = agents;
        self.emit(StoreEvent::CatalogUpdated);
    }

    #[must_use]
    pub fn available_agents(&self) -> Vec<AgentDescriptor> {
        self.read().available.clone()
    }

    /// Copy the whole store.
    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        let inner = self.read();
        StoreSnapshot {
            agents: inner
                .order
                .iter()
                .filter_map(|id| inner.agents.get(id).cloned())
                .collect(),
            selected_agent_id: inner.selected.clone(),
            available_agents: inner.available.clone(),
        }
    }

    /// Receiver for live change events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.sender.subscribe()
    }

    /// Stream that yields the current snapshot, then a fresh snapshot after
    /// every change. Lagged events collapse into the next snapshot.
    #[must_use]
    pub fn snapshot_stream(self: &std::sync::Arc<Self>) -> BoxStream<'static, StoreSnapshot> {
        let rx = self.subscribe();
        let initial = self.snapshot();
        let store = std::sync::Arc::clone(self);
        let live = BroadcastStream::new(rx).map(move |_| store.snapshot());
        futures::stream::once(async move { initial }).chain(live).boxed()
    }
}
