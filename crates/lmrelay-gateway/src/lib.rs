//! lmrelay-gateway: WebSocket relay between chat clients and agents
//!
//! Browser chat clients connect to the chat endpoint, agents to the agent
//! endpoint. The [`MessageRouter`] stamps client messages with their origin
//! and routes agent replies back by id; the [`ConnectionRegistry`] is the only
//! mutable state.

pub mod config;
pub mod origin;
pub mod registry;
pub mod router;
pub mod server;

pub use config::{ConfigError, RelayConfig};
pub use origin::{OriginDenied, OriginPolicy};
pub use registry::{
    AgentId, ClientId, Connection, ConnectionRegistry, ConnectionSender, OUTBOUND_QUEUE,
    connection_channel,
};
pub use router::{DropReason, MessageRouter, RouteOutcome};
pub use server::RelayServer;
