//! TCP transport adapter.
//!
//! The engine is started by someone else; this module only waits for it to
//! listen on a fixed localhost port and then hands out the two stream halves.

use std::{net::SocketAddr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::{
    TcpStream,
    tcp::{OwnedReadHalf, OwnedWriteHalf},
};

/// Default engine port.
pub const DEFAULT_PORT: u16 = 7797;
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(1000);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid engine address {0}")]
    InvalidAddress(String),
    #[error("Nothing listening on {addr} after {waited:?}")]
    ListenerTimeout { addr: SocketAddr, waited: Duration },
    #[error("Connect failed: {0}")]
    Connect(#[from] std::io::Error),
}

/// Where and how patiently to look for the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound on the wait-for-listener loop.
    pub wait_timeout: Duration,
    /// Delay between connection probes.
    pub poll_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl TransportConfig {
    /// Defaults overridden by `RIFT_ENGINE_HOST` / `RIFT_ENGINE_PORT`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(host) = std::env::var("RIFT_ENGINE_HOST") {
            config.host = host;
        }
        if let Some(port) = std::env::var("RIFT_ENGINE_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            config.port = port;
        }
        config
    }

    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub const fn with_wait(mut self, wait_timeout: Duration, poll_interval: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self.poll_interval = poll_interval;
        self
    }

    /// Resolve the configured address.
    ///
    /// # Errors
    /// Returns error if `host:port` is not a socket address.
    pub fn addr(&self) -> Result<SocketAddr, TransportError> {
        let raw = format!("{}:{}", self.host, self.port);
        raw.parse().map_err(|_| TransportError::InvalidAddress(raw))
    }
}

/// Poll until something accepts connections on the configured port.
///
/// # Errors
/// Returns `ListenerTimeout` once `wait_timeout` elapses.
pub async fn wait_for_listener(config: &TransportConfig) -> Result<TcpStream, TransportError> {
    let addr = config.addr()?;
    let started = tokio::time::Instant::now();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                tracing::debug!(%addr, attempts, "engine is listening");
                return Ok(stream);
            }
            Err(e) => {
                let waited = started.elapsed();
                if waited >= config.wait_timeout {
                    return Err(TransportError::ListenerTimeout { addr, waited });
                }
                if attempts == 1 {
                    tracing::info!(%addr, "waiting for engine to listen: {e}");
                }
            }
        }
        tokio::time::sleep(config.poll_interval).await;
    }
}

/// Wait for the engine and split the socket into read and write halves.
///
/// # Errors
/// Returns error if the engine never listens or the socket cannot be set up.
pub async fn connect(
    config: &TransportConfig,
) -> Result<(OwnedReadHalf, OwnedWriteHalf), TransportError> {
    let stream = wait_for_listener(config).await?;
    stream.set_nodelay(true)?;
    tracing::info!(addr = %config.addr()?, "connected to engine");
    Ok(stream.into_split())
}
