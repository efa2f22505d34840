//! Connection registry: the single source of truth for who is connected
//!
//! Agents and chat clients live in two separate maps behind one lock. A
//! connection's role is decided once at registration and carried in the
//! returned [`Connection`] handle, never stored on the socket itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

/// Frames a socket may have queued before further frames to it are dropped
pub const OUTBOUND_QUEUE: usize = 256;

/// Outbound text frames for one socket
pub type ConnectionSender = mpsc::Sender<String>;

/// Bounded outbound queue for one socket
pub fn connection_channel() -> (ConnectionSender, mpsc::Receiver<String>) {
    mpsc::channel(OUTBOUND_QUEUE)
}

/// Queue a frame without waiting. A full queue drops the frame; the
/// connection stays registered.
fn deliver(tx: &ConnectionSender, text: String, to: impl std::fmt::Display) -> bool {
    match tx.try_send(text) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("Outbound queue for {} is full, dropping frame", to);
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Process-unique agent connection id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId(u64);

/// Process-unique chat client id, exposed to agents as `clientId`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "agent-{}", self.0)
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A registered connection and its role
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Connection {
    Agent { id: AgentId },
    Client { id: ClientId },
}

#[derive(Default)]
struct Connections {
    agents: HashMap<AgentId, ConnectionSender>,
    clients: HashMap<ClientId, ConnectionSender>,
}

/// Tracks live agent and chat-client connections
pub struct ConnectionRegistry {
    inner: RwLock<Connections>,
    next_agent: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Connections::default()),
            next_agent: AtomicU64::new(1),
        }
    }

    /// Register an agent connection.
    ///
    /// Multiple agents are accepted. Every registered agent receives every
    /// client message (fan-out, not load balancing).
    pub async fn register_agent(&self, tx: ConnectionSender) -> Connection {
        let id = AgentId(self.next_agent.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.inner.write().await;
        inner.agents.insert(id, tx);
        if inner.agents.len() > 1 {
            warn!(
                "{} agents registered; client messages will be broadcast to all of them",
                inner.agents.len()
            );
        }
        info!("Registered {} ({} agents)", id, inner.agents.len());
        Connection::Agent { id }
    }

    /// Register a chat client under a freshly generated id
    pub async fn register_client(&self, tx: ConnectionSender) -> Connection {
        let mut inner = self.inner.write().await;
        let id = loop {
            let candidate = ClientId(uuid::Uuid::new_v4().simple().to_string());
            if !inner.clients.contains_key(&candidate) {
                break candidate;
            }
        };
        inner.clients.insert(id.clone(), tx);
        info!("Registered client {} ({} clients)", id, inner.clients.len());
        Connection::Client { id }
    }

    /// Remove a connection. Returns `false` if it was already gone.
    pub async fn unregister(&self, conn: &Connection) -> bool {
        let mut inner = self.inner.write().await;
        let removed = match conn {
            Connection::Agent { id } => inner.agents.remove(id).is_some(),
            Connection::Client { id } => inner.clients.remove(id).is_some(),
        };
        if removed {
            debug!(
                "Unregistered {:?} ({} agents, {} clients left)",
                conn,
                inner.agents.len(),
                inner.clients.len()
            );
        }
        removed
    }

    /// Send a frame to every registered agent; returns how many accepted it
    pub async fn broadcast_to_agents(&self, text: &str) -> usize {
        let inner = self.inner.read().await;
        inner
            .agents
            .iter()
            .filter(|(id, tx)| deliver(tx, text.to_string(), id))
            .count()
    }

    /// Send a frame to one agent
    pub async fn send_to_agent(&self, id: AgentId, text: String) -> bool {
        let inner = self.inner.read().await;
        match inner.agents.get(&id) {
            Some(tx) => deliver(tx, text, id),
            None => false,
        }
    }

    /// Send a frame to one chat client by id
    pub async fn send_to_client(&self, id: &str, text: String) -> bool {
        let inner = self.inner.read().await;
        match inner.clients.get(&ClientId(id.to_string())) {
            Some(tx) => deliver(tx, text, id),
            None => false,
        }
    }

    pub async fn agent_count(&self) -> usize {
        self.inner.read().await.agents.len()
    }

    pub async fn client_count(&self) -> usize {
        self.inner.read().await.clients.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
