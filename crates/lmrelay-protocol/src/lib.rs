//! lmrelay-protocol: JSON frames exchanged over the relay
//!
//! The relay treats every frame as an opaque JSON object. Only two fields are
//! reserved: `clientId`, stamped by the relay on the chat → agent path, and
//! `targetId`, consumed by the relay on the agent → chat path.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field the relay adds to chat messages before handing them to agents
pub const CLIENT_ID: &str = "clientId";

/// Field agents set to address a chat client; stripped before delivery
pub const TARGET_ID: &str = "targetId";

/// WebSocket close code for policy violations (bad origin, unknown path)
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

pub const DEFAULT_AGENT_PATH: &str = "/agent";
pub const DEFAULT_CHAT_PATH: &str = "/chat";

/// Logical endpoint a connection joined, fixed for its lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Agent,
    Chat,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent => write!(f, "agent"),
            Self::Chat => write!(f, "chat"),
        }
    }
}

/// First frame every accepted connection receives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Welcome {
    #[serde(rename = "type")]
    pub kind: String,
    pub endpoint: Endpoint,
    pub message: String,
}

impl Welcome {
    pub const KIND: &'static str = "welcome";

    pub fn new(endpoint: Endpoint) -> Self {
        let message = match endpoint {
            Endpoint::Agent => "Connected to Agent WebSocket server",
            Endpoint::Chat => "Connected to Chat WebSocket server",
        };
        Self {
            kind: Self::KIND.to_string(),
            endpoint,
            message: message.to_string(),
        }
    }
}

/// Application-level keepalive frames (`{"type":"ping"}` / `{"type":"pong"}`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keepalive {
    Ping,
    Pong,
}

impl Keepalive {
    /// Recognise a keepalive frame inside an arbitrary JSON value
    pub fn detect(value: &Value) -> Option<Self> {
        match value.get("type").and_then(Value::as_str) {
            Some("ping") => Some(Self::Ping),
            Some("pong") => Some(Self::Pong),
            _ => None,
        }
    }

    pub fn to_json(self) -> String {
        match self {
            Self::Ping => r#"{"type":"ping"}"#.to_string(),
            Self::Pong => r#"{"type":"pong"}"#.to_string(),
        }
    }
}

/// Parse a text frame as a JSON object.
///
/// Returns `None` for malformed JSON and for any JSON value that is not an
/// object; the relay drops both.
pub fn parse_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Chat client → relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub id: String,
    pub prompt: String,
}

/// Relay → agent: a chat request stamped with its origin
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptRequest {
    pub client_id: String,
    /// Opaque request id, echoed back on every reply
    #[serde(default)]
    pub id: Value,
    pub prompt: String,
}

/// Agent → relay (with `targetId`) and relay → chat client (without it)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentReply {
    #[serde(default)]
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub end: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl AgentReply {
    fn addressed(id: Value, target_id: impl Into<String>) -> Self {
        Self {
            id,
            target_id: Some(target_id.into()),
            content: None,
            end: false,
            error: None,
        }
    }

    /// One streamed content chunk
    pub fn chunk(id: Value, target_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::addressed(id, target_id)
        }
    }

    /// Successful end of stream
    pub fn end(id: Value, target_id: impl Into<String>) -> Self {
        Self {
            end: true,
            ..Self::addressed(id, target_id)
        }
    }

    /// Failed end of stream
    pub fn error(id: Value, target_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::addressed(id, target_id)
        }
    }
}
