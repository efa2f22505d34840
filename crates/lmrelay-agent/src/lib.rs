//! lmrelay-agent: the model-side peer of the relay
//!
//! Holds a self-healing WebSocket link to the relay's agent endpoint and
//! answers each forwarded prompt by streaming a chat completion from a local
//! OpenAI-compatible server (LM Studio by default).

pub mod agent;
pub mod backoff;
pub mod bridge;
pub mod completion;
pub mod link;

#[cfg(test)]
mod testing;

pub use agent::Agent;
pub use backoff::Backoff;
pub use bridge::{CompletionBridge, CompletionConfig, Outbox};
pub use completion::{ChatMessage, ChatRole, CompletionError, CompletionService, LmStudioClient};
pub use link::{
    Connector, LinkConfig, LinkError, LinkEvent, LinkHandle, LinkManager, LinkState, LinkStatus,
    Transport, WsConnector,
};
