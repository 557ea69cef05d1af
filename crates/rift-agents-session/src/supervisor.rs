//! Reconnect supervisor.
//!
//! Establishes the engine connection, keeps it attached to the router while
//! it runs, and rebuilds it from scratch once it stops.

use std::{sync::Arc, time::Duration};

use rift_agents_rpc::{Connection, TransportConfig, TransportError, tcp};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::router::{RouterError, SessionRouter};

/// Supervisor error.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Router error: {0}")]
    Router(#[from] RouterError),
}

/// Supervisor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub transport: TransportConfig,
    /// Pause before retrying after a failed attempt.
    pub retry_delay: Duration,
    /// Failed attempts retried without asking the editor host.
    pub quiet_retries: u32,
    /// Run the `initialize` handshake on every new connection.
    pub handshake: bool,
    /// Workspace root announced in the handshake.
    pub root_uri: Option<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            retry_delay: Duration::from_secs(1),
            quiet_retries: 3,
            handshake: true,
            root_uri: None,
        }
    }
}

/// Keeps a router connected to the engine.
pub struct Supervisor {
    router: Arc<SessionRouter>,
    config: SupervisorConfig,
}

impl Supervisor {
    #[must_use]
    pub const fn new(router: Arc<SessionRouter>, config: SupervisorConfig) -> Self {
        Self { router, config }
    }

    #[must_use]
    pub const fn router(&self) -> &Arc<SessionRouter> {
        &self.router
    }

    /// Run until establishing a connection keeps failing and the editor host
    /// declines to retry. The host is only asked once `quiet_retries` attempts
    /// in a row have failed. A connection that drops after being established
    /// is always rebuilt.
    ///
    /// # Errors
    /// Returns the failure the host declined to retry.
    pub async fn run(&self) -> Result<(), SupervisorError> {
        let mut generation: u64 = 0;
        let mut failures: u32 = 0;
        loop {
            match self.establish().await {
                Ok(connection) => {
                    failures = 0;
                    generation += 1;
                    tracing::info!(generation, "engine connection established");
                    connection.closed().await;
                    tracing::warn!(generation, "engine connection stopped, reconnecting");
                    self.router.detach();
                }
                Err(e) => {
                    self.router.detach();
                    failures += 1;
                    if failures <= self.config.quiet_retries {
                        tracing::debug!(failures, "Failed to connect to engine: {e}");
                    } else {
                        tracing::error!(failures, "Failed to connect to engine: {e}");
                        let message = format!("{e} (after {failures} attempts)");
                        if !self.router.host().retry_connection(&message) {
                            return Err(e);
                        }
                        failures = 0;
                    }
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    /// Spawn [`run`](Self::run) onto the runtime.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<Result<(), SupervisorError>> {
        tokio::spawn(async move { self.run().await })
    }

    async fn establish(&self) -> Result<Arc<Connection>, SupervisorError> {
        let (reader, writer) = tcp::connect(&self.config.transport).await?;
        let connection = Connection::start(reader, writer, self.router.inbound_handler());
        self.router.attach(Arc::clone(&connection));

        if self.config.handshake {
            self.router.initialize(self.config.root_uri.clone()).await?;
        }
        self.router.list_available_agents().await?;
        Ok(connection)
    }
}
