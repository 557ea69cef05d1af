//! Session routing and lifecycle for rift agents.
//!
//! Provides:
//! - `SessionRouter` - Multiplex agent sessions over one engine connection
//! - `AgentSession` - Per-agent status machine and handlers
//! - `RoutingTable` - Typed per-session channel routes
//! - `Supervisor` - Connect, watch and rebuild the engine connection

pub mod agent;
pub mod router;
pub mod routing;
pub mod supervisor;
pub mod wire;

pub use agent::{AgentSession, ProgressOutcome, SessionContext, SessionError, UserReply};
pub use router::{RouterConfig, RouterError, SessionRouter};
pub use routing::{ChannelKey, ChannelKind, RoutingError, RoutingTable};
pub use supervisor::{Supervisor, SupervisorConfig, SupervisorError};
