//! Core abstractions for rift agent sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `SessionStore` - Ordered agent projections with selection and broadcast
//! - `PubSub` - Fire-once, single-subscriber topic registry
//! - `AgentStatus`, `Anchor`, `ChatMessage` - Session data model
//! - `EditorHost` - Editor collaborator trait

pub mod pubsub;
pub mod store;
pub mod traits;
pub mod types;

pub use pubsub::{PubSub, PubSubError, Subscription};
pub use store::{AgentState, SessionStore, StoreError, StoreEvent, StoreSnapshot};
pub use traits::{EditorHost, NoopHost};
pub use types::{
    AgentDescriptor, AgentId, AgentStatus, Anchor, ChatMessage, ChatRole, DecorationSet,
    InputRequest, LensAction, Position, Range, RunContext, Task, Tasks, TextDocumentIdentifier,
};
