//! Relay server configuration

use lmrelay_protocol::{DEFAULT_AGENT_PATH, DEFAULT_CHAT_PATH};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Path serving connection counts; cannot be used as a WebSocket endpoint
pub const STATUS_PATH: &str = "/status";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must start with '/', got '{value}'")]
    RelativePath { field: &'static str, value: String },
    #[error("agent_path and chat_path must differ (both '{0}')")]
    SamePaths(String),
    #[error("{field} '{value}' is reserved")]
    ReservedPath { field: &'static str, value: String },
    /// Route captures, wildcards and empty segments are not literal paths
    #[error("{field} '{value}' is not a literal path")]
    PatternPath { field: &'static str, value: String },
}

/// Characters axum reads as route captures or wildcards
const ROUTE_SYNTAX: &[char] = &[':', '*', '{', '}'];

/// `[server]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_agent_path")]
    pub agent_path: String,
    #[serde(default = "default_chat_path")]
    pub chat_path: String,
    /// Host patterns allowed on the chat endpoint; empty disables the check
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_agent_path() -> String {
    DEFAULT_AGENT_PATH.to_string()
}

fn default_chat_path() -> String {
    DEFAULT_CHAT_PATH.to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            agent_path: default_agent_path(),
            chat_path: default_chat_path(),
            allowed_origins: Vec::new(),
        }
    }
}

impl RelayConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("agent_path", &self.agent_path),
            ("chat_path", &self.chat_path),
        ] {
            if !value.starts_with('/') {
                return Err(ConfigError::RelativePath {
                    field,
                    value: value.clone(),
                });
            }
            let empty_segment = value.len() > 1 && value[1..].split('/').any(str::is_empty);
            if empty_segment || value.contains(ROUTE_SYNTAX) {
                return Err(ConfigError::PatternPath {
                    field,
                    value: value.clone(),
                });
            }
            if value == STATUS_PATH {
                return Err(ConfigError::ReservedPath {
                    field,
                    value: value.clone(),
                });
            }
        }
        if self.agent_path == self.chat_path {
            return Err(ConfigError::SamePaths(self.agent_path.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.agent_path, "/agent");
        assert_eq!(config.chat_path, "/chat");
        assert!(config.allowed_origins.is_empty());
        assert_eq!(config.listen_addr(), "0.0.0.0:3000");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_deserialize_uses_defaults() {
        let config: RelayConfig = serde_json::from_str(r#"{"port": 8080}"#).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.chat_path, "/chat");
    }

    #[test]
    fn test_validate_rejects_relative_path() {
        let config = RelayConfig {
            chat_path: "chat".into(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RelativePath { field: "chat_path", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_same_paths() {
        let config = RelayConfig {
            agent_path: "/ws".into(),
            chat_path: "/ws".into(),
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::SamePaths("/ws".into())));
    }

    #[test]
    fn test_validate_rejects_route_syntax() {
        for path in ["/:room", "/{room}", "/chat/{*rest}", "/*", "/a}"] {
            let config = RelayConfig {
                chat_path: path.into(),
                ..Default::default()
            };
            assert_eq!(
                config.validate(),
                Err(ConfigError::PatternPath {
                    field: "chat_path",
                    value: path.into()
                }),
                "{}",
                path
            );
        }
    }

    #[test]
    fn test_validate_rejects_empty_segments() {
        for path in ["//agent", "/ws//agent", "/agent/"] {
            let config = RelayConfig {
                agent_path: path.into(),
                ..Default::default()
            };
            assert!(
                matches!(config.validate(), Err(ConfigError::PatternPath { .. })),
                "{}",
                path
            );
        }
    }

    #[test]
    fn test_validate_accepts_nested_literal_paths() {
        let config = RelayConfig {
            agent_path: "/ws/agent".into(),
            chat_path: "/ws/chat-v2".into(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_status_path() {
        let config = RelayConfig {
            agent_path: STATUS_PATH.into(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ReservedPath { .. })
        ));
    }
}
