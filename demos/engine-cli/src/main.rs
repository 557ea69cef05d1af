//! Headless client for a local agent engine.
//!
//! Connects to the engine (`RIFT_ENGINE_HOST` / `RIFT_ENGINE_PORT`) and
//! serves the webview protocol on `ws://<RIFT_UI_ADDR>/ws`.
//!
//! Run with: cargo run -p engine-cli

use std::{future::IntoFuture, net::SocketAddr, sync::Arc};

use anyhow::Context;
use rift_agents_core::{AgentStatus, Anchor, DecorationSet, EditorHost};
use rift_agents_rpc::TransportConfig;
use rift_agents_session::{RouterConfig, SessionRouter, Supervisor, SupervisorConfig};
use rift_agents_transport::{WebviewBridge, websocket::create_ws_router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_UI_ADDR: &str = "127.0.0.1:3000";

/// Host without an editor: decorations and lenses go to the log.
struct LogHost;

impl EditorHost for LogHost {
    fn render_decorations(&self, agent_id: &str, anchor: &Anchor, decorations: &DecorationSet) {
        tracing::debug!(
            agent_id,
            uri = %anchor.document.uri,
            additive = decorations.additive.len(),
            negative = decorations.negative.len(),
            "decorations"
        );
    }

    fn refresh_code_lenses(&self, agent_id: &str, _anchor: &Anchor, status: AgentStatus) {
        tracing::debug!(agent_id, ?status, "code lens");
    }

    fn retry_connection(&self, error: &str) -> bool {
        tracing::warn!("engine unavailable ({error}), retrying");
        true
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let router = SessionRouter::new(RouterConfig::default(), Arc::new(LogHost));
    let supervisor = Supervisor::new(
        Arc::clone(&router),
        SupervisorConfig {
            transport: TransportConfig::from_env(),
            root_uri: std::env::current_dir()
                .ok()
                .map(|dir| format!("file://{}", dir.display())),
            ..SupervisorConfig::default()
        },
    )
    .spawn();

    let app = create_ws_router(WebviewBridge::new(router))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = std::env::var("RIFT_UI_ADDR")
        .unwrap_or_else(|_| DEFAULT_UI_ADDR.to_string())
        .parse()
        .context("RIFT_UI_ADDR is not a socket address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("Webview socket on ws://{addr}/ws");

    tokio::select! {
        served = axum::serve(listener, app).into_future() => served.context("server failed")?,
        stopped = supervisor => stopped.context("supervisor panicked")??,
    }
    Ok(())
}
