//! JSON-RPC connection to the rift engine.
//!
//! Provides:
//! - JSON-RPC 2.0 envelopes
//! - `Content-Length` framed codec
//! - TCP transport adapter that waits for the engine to listen
//! - `Connection` - request/notification peer with inbound dispatch

pub mod codec;
pub mod connection;
pub mod protocol;
pub mod tcp;

pub use codec::{CodecError, FrameReader, FrameWriter};
pub use connection::{Connection, ConnectionState, InboundHandler, ResponseHook, RpcError};
pub use protocol::{JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
pub use tcp::{TransportConfig, TransportError};
