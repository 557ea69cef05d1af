//! Webview transport for rift agents.
//!
//! Provides:
//! - `{type, data}` envelope protocol
//! - `WebviewBridge` - apply UI commands, stream store snapshots back
//! - WebSocket transport (feature: websocket)

pub mod bridge;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use bridge::{BridgeError, WebviewBridge, WebviewPort};
pub use protocol::{OutboundMessage, WebviewMessage};
