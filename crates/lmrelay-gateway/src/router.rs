//! Message router: forwarding policy between chat clients and agents
//!
//! Chat → agent: the frame is stamped with `clientId` and broadcast to every
//! registered agent. Agent → chat: the frame's `targetId` picks the client,
//! and is stripped before delivery. Everything else in a frame is opaque.
//!
//! Malformed frames and routing misses are dropped silently; the relay is
//! best-effort and never reports them back to the sender.

use std::sync::Arc;

use lmrelay_protocol::{CLIENT_ID, Endpoint, Keepalive, TARGET_ID, Welcome, parse_object};
use serde_json::Value;
use tracing::{debug, warn};

use crate::registry::{AgentId, ClientId, Connection, ConnectionRegistry, ConnectionSender};

/// What happened to one inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Forwarded to this many connections
    Delivered(usize),
    /// Keepalive answered directly by the relay
    Answered,
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Not a JSON object
    Malformed,
    /// Chat message arrived while no agent is connected
    NoAgents,
    /// Agent frame without a string `targetId`
    MissingTarget,
    /// Target client has already disconnected
    UnknownTarget,
}

/// Applies the forwarding policy on top of the registry
#[derive(Clone)]
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
}

impl MessageRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Register a newly accepted connection and greet it.
    ///
    /// The welcome goes out before registration so it is always the first
    /// frame the connection sees.
    pub async fn accept(&self, endpoint: Endpoint, tx: ConnectionSender) -> Connection {
        match serde_json::to_string(&Welcome::new(endpoint)) {
            Ok(json) => {
                let _ = tx.try_send(json);
            }
            Err(e) => warn!("Failed to encode welcome: {}", e),
        }

        match endpoint {
            Endpoint::Agent => self.registry.register_agent(tx).await,
            Endpoint::Chat => self.registry.register_client(tx).await,
        }
    }

    /// Route one text frame received on `conn`
    pub async fn route(&self, conn: &Connection, text: &str) -> RouteOutcome {
        match conn {
            Connection::Client { id } => self.from_client(id, text).await,
            Connection::Agent { id } => self.from_agent(*id, text).await,
        }
    }

    /// Remove a closed connection; safe to call more than once
    pub async fn close(&self, conn: &Connection) {
        self.registry.unregister(conn).await;
    }

    async fn from_client(&self, id: &ClientId, text: &str) -> RouteOutcome {
        let Some(mut payload) = parse_object(text) else {
            debug!("Dropping malformed frame from client {}", id);
            return RouteOutcome::Dropped(DropReason::Malformed);
        };

        payload.insert(CLIENT_ID.to_string(), Value::String(id.to_string()));
        let outbound = Value::Object(payload).to_string();

        match self.registry.broadcast_to_agents(&outbound).await {
            0 => {
                debug!("No agent connected, dropping message from client {}", id);
                RouteOutcome::Dropped(DropReason::NoAgents)
            }
            n => RouteOutcome::Delivered(n),
        }
    }

    async fn from_agent(&self, id: AgentId, text: &str) -> RouteOutcome {
        let Some(mut payload) = parse_object(text) else {
            debug!("Dropping malformed frame from {}", id);
            return RouteOutcome::Dropped(DropReason::Malformed);
        };

        let target = match payload.remove(TARGET_ID) {
            Some(Value::String(target)) => target,
            _ => {
                if Keepalive::detect(&Value::Object(payload)) == Some(Keepalive::Ping) {
                    let pong = Keepalive::Pong.to_json();
                    self.registry.send_to_agent(id, pong).await;
                    return RouteOutcome::Answered;
                }
                debug!("Dropping frame without {} from {}", TARGET_ID, id);
                return RouteOutcome::Dropped(DropReason::MissingTarget);
            }
        };

        let outbound = Value::Object(payload).to_string();
        if self.registry.send_to_client(&target, outbound).await {
            RouteOutcome::Delivered(1)
        } else {
            debug!("Client {} is gone, dropping reply from {}", target, id);
            RouteOutcome::Dropped(DropReason::UnknownTarget)
        }
    }
}
