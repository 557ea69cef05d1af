//! Bridge between a webview and the session router.

use std::sync::Arc;

use futures::{StreamExt, stream::BoxStream};
use rift_agents_session::{RouterError, SessionRouter};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::protocol::{OutboundMessage, WebviewMessage};

/// Bridge error.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error("No active editor to run {0} in")]
    NoActiveEditor(String),
    #[error("Invalid webview message: {0}")]
    InvalidMessage(#[from] serde_json::Error),
    #[error("Channel closed")]
    ChannelClosed,
}

/// Applies webview commands to a router and turns store changes into
/// `stateUpdate` messages.
#[derive(Clone)]
pub struct WebviewBridge {
    router: Arc<SessionRouter>,
}

impl WebviewBridge {
    #[must_use]
    pub const fn new(router: Arc<SessionRouter>) -> Self {
        Self { router }
    }

    #[must_use]
    pub const fn router(&self) -> &Arc<SessionRouter> {
        &self.router
    }

    /// Apply one webview command. Only `refreshState` answers directly;
    /// every other effect reaches the webview through [`state_updates`].
    ///
    /// [`state_updates`]: Self::state_updates
    ///
    /// # Errors
    /// Returns the router's error, or `NoActiveEditor` when an agent is run
    /// without a context and the editor has none.
    pub async fn handle(&self, message: WebviewMessage) -> Result<Option<OutboundMessage>, BridgeError> {
        let router = &self.router;
        match message {
            WebviewMessage::RunAgent {
                agent_type,
                context,
            } => {
                let context = context
                    .or_else(|| router.host().active_context())
                    .ok_or_else(|| BridgeError::NoActiveEditor(agent_type.clone()))?;
                router.run(&agent_type, context).await?;
            }
            WebviewMessage::CancelAgent { agent_id } => router.cancel(&agent_id).await?,
            WebviewMessage::AcceptAgent { agent_id } => router.accept(&agent_id).await?,
            WebviewMessage::RejectAgent { agent_id } => router.reject(&agent_id).await?,
            WebviewMessage::DeleteAgent { agent_id } => router.delete(&agent_id).await?,
            WebviewMessage::RestartAgent { agent_id } => router.restart_session(&agent_id).await?,
            WebviewMessage::SelectAgent { agent_id } => router.select(&agent_id)?,
            WebviewMessage::ChatMessage { agent_id, message } => {
                router.send_chat_message(&agent_id, &message)?;
            }
            WebviewMessage::InputResponse { agent_id, response } => {
                router.submit_input(&agent_id, &response)?;
            }
            WebviewMessage::ListAgents => {
                router.list_available_agents().await?;
            }
            WebviewMessage::RefreshState => {
                return Ok(Some(OutboundMessage::StateUpdate(router.store().snapshot())));
            }
        }
        Ok(None)
    }

    /// Parse and apply a raw JSON message. Failures come back as `error`
    /// messages for the webview.
    pub async fn handle_text(&self, text: &str) -> Option<OutboundMessage> {
        let result = match serde_json::from_str::<WebviewMessage>(text) {
            Ok(message) => self.handle(message).await,
            Err(e) => Err(e.into()),
        };
        result.unwrap_or_else(|e| {
            tracing::warn!("Webview message failed: {e}");
            Some(OutboundMessage::error(e.to_string()))
        })
    }

    /// Current state, then a fresh state after every store change.
    #[must_use]
    pub fn state_updates(&self) -> BoxStream<'static, OutboundMessage> {
        self.router
            .store()
            .snapshot_stream()
            .map(OutboundMessage::StateUpdate)
            .boxed()
    }

    /// Open an in-process channel pair for one webview.
    ///
    /// Returns the webview side and the task serving it; the task ends when
    /// the webview side is dropped.
    #[must_use]
    pub fn open(&self) -> (WebviewPort, JoinHandle<()>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.clone().serve(inbound_rx, outbound_tx));
        (
            WebviewPort {
                sender: inbound_tx,
                receiver: outbound_rx,
            },
            task,
        )
    }

    /// Serve one webview until either side goes away.
    pub async fn serve(
        self,
        mut inbound: mpsc::UnboundedReceiver<WebviewMessage>,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
    ) {
        let mut updates = self.state_updates();
        loop {
            tokio::select! {
                update = updates.next() => {
                    let Some(update) = update else { break };
                    if outbound.send(update).is_err() {
                        break;
                    }
                }
                message = inbound.recv() => {
                    let Some(message) = message else { break };
                    if message.awaits_engine() {
                        // Engine round trips must not hold up other commands.
                        let bridge = self.clone();
                        let outbound = outbound.clone();
                        tokio::spawn(async move { bridge.reply(message, &outbound).await });
                    } else {
                        self.reply(message, &outbound).await;
                    }
                }
            }
        }
        tracing::debug!("webview detached");
    }

    async fn reply(&self, message: WebviewMessage, outbound: &mpsc::UnboundedSender<OutboundMessage>) {
        let reply = match self.handle(message).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("Webview command failed: {e}");
                Some(OutboundMessage::error(e.to_string()))
            }
        };
        if let Some(reply) = reply {
            let _ = outbound.send(reply);
        }
    }
}

/// Webview side of an opened bridge.
pub struct WebviewPort {
    pub sender: mpsc::UnboundedSender<WebviewMessage>,
    pub receiver: mpsc::UnboundedReceiver<OutboundMessage>,
}

impl WebviewPort {
    /// Send a command to the bridge.
    ///
    /// # Errors
    /// Returns error if the bridge task has ended.
    pub fn send(&self, message: WebviewMessage) -> Result<(), BridgeError> {
        self.sender
            .send(message)
            .map_err(|_| BridgeError::ChannelClosed)
    }

    /// Next message for the webview.
    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        self.receiver.recv().await
    }
}
