//! Per-session channel routes.
//!
//! The engine addresses each session through method names built as
//! `{agent_type}_{agent_id}_{suffix}`. The table maps those names to a typed
//! [`ChannelKey`] once, at session creation, and forgets them at deletion;
//! dispatch never re-parses a method name.

use std::collections::HashMap;

use rift_agents_core::AgentId;
use thiserror::Error;

/// Routing error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("Channel {method} is already routed to agent {owner}")]
    Collision { method: String, owner: AgentId },
    #[error("Agent {0} already has routes")]
    AlreadyRouted(AgentId),
}

/// Kind of a per-session channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    RequestInput,
    RequestChat,
    SendUpdate,
    SendProgress,
    SendResult,
}

impl ChannelKind {
    pub const ALL: [Self; 5] = [
        Self::RequestInput,
        Self::RequestChat,
        Self::SendUpdate,
        Self::SendProgress,
        Self::SendResult,
    ];

    /// Method-name suffix.
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::RequestInput => "request_input",
            Self::RequestChat => "request_chat",
            Self::SendUpdate => "send_update",
            Self::SendProgress => "send_progress",
            Self::SendResult => "send_result",
        }
    }

    /// Requests expect a response; the rest are notifications.
    #[must_use]
    pub const fn is_request(self) -> bool {
        matches!(self, Self::RequestInput | Self::RequestChat)
    }
}

/// Composite route key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub agent_type: String,
    pub agent_id: AgentId,
    pub kind: ChannelKind,
}

impl ChannelKey {
    #[must_use]
    pub fn new(agent_type: impl Into<String>, agent_id: impl Into<AgentId>, kind: ChannelKind) -> Self {
        Self {
            agent_type: agent_type.into(),
            agent_id: agent_id.into(),
            kind,
        }
    }

    /// Wire method name of this channel.
    #[must_use]
    pub fn method(&self) -> String {
        format!("{}_{}_{}", self.agent_type, self.agent_id, self.kind.suffix())
    }
}

/// Method name -> route, plus the reverse index used for teardown.
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: HashMap<String, ChannelKey>,
    by_agent: HashMap<AgentId, Vec<String>>,
}

impl RoutingTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install every channel of one session. All or nothing.
    ///
    /// # Errors
    /// Returns error if the agent is already routed or any derived method
    /// name is owned by another live session.
    pub fn install(&mut self, agent_type: &str, agent_id: &str) -> Result<Vec<String>, RoutingError> {
        if self.by_agent.contains_key(agent_id) {
            return Err(RoutingError::AlreadyRouted(agent_id.to_string()));
        }

        let keys: Vec<ChannelKey> = ChannelKind::ALL
            .iter()
            .map(|&kind| ChannelKey::new(agent_type, agent_id, kind))
            .collect();

        for key in &keys {
            let method = key.method();
            if let Some(owner) = self.routes.get(&method) {
                return Err(RoutingError::Collision {
                    method,
                    owner: owner.agent_id.clone(),
                });
            }
        }

        let methods: Vec<String> = keys
            .into_iter()
            .map(|key| {
                let method = key.method();
                self.routes.insert(method.clone(), key);
                method
            })
            .collect();

        tracing::debug!(agent_id, agent_type, ?methods, "installed routes");
        self.by_agent.insert(agent_id.to_string(), methods.clone());
        Ok(methods)
    }

    /// Drop every route of one session. Returns how many were removed.
    pub fn remove_agent(&mut self, agent_id: &str) -> usize {
        let Some(methods) = self.by_agent.remove(agent_id) else {
            return 0;
        };
        for method in &methods {
            self.routes.remove(method);
        }
        tracing::debug!(agent_id, removed = methods.len(), "removed routes");
        methods.len()
    }

    /// Drop every route.
    pub fn clear(&mut self) {
        self.routes.clear();
        self.by_agent.clear();
    }

    /// Look up the route for an inbound method.
    #[must_use]
    pub fn resolve(&self, method: &str) -> Option<&ChannelKey> {
        self.routes.get(method)
    }

    /// Methods installed for one session.
    #[must_use]
    pub fn methods_for(&self, agent_id: &str) -> &[String] {
        self.by_agent.get(agent_id).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
