//! `config.toml` loading

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use lmrelay_agent::{CompletionConfig, LinkConfig};
use lmrelay_gateway::RelayConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Environment variable that overrides `server.port`
pub const PORT_ENV: &str = "PORT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: RelayConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

/// `[agent]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
}

fn default_relay_url() -> String {
    "ws://localhost:3000/agent".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            link: LinkConfig::default(),
            completion: CompletionConfig::default(),
        }
    }
}

/// `~/.lmrelay/config.toml`
pub fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".lmrelay").join("config.toml"))
}

impl Config {
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config TOML")?;
        config.server.validate().context("Bad [server] section")?;
        Ok(config)
    }

    /// Load from an explicit path (which must exist) or from the default
    /// location (where a missing file means all defaults).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default = default_config_path()?;
                if !default.exists() {
                    debug!("No config at {}, using defaults", default.display());
                    return Ok(Self::default());
                }
                default
            }
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Failed to load config from {}", path.display()))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Apply port overrides: `PORT` beats the file, `--port` beats both
    pub fn override_port(&mut self, env_port: Option<&str>, cli_port: Option<u16>) -> Result<()> {
        if let Some(raw) = env_port.map(str::trim).filter(|s| !s.is_empty()) {
            self.server.port = raw
                .parse()
                .with_context(|| format!("{} must be a port number, got '{}'", PORT_ENV, raw))?;
        }
        if let Some(port) = cli_port {
            self.server.port = port;
        }
        Ok(())
    }

    /// Chat endpoint of the relay this config describes
    pub fn chat_url(&self) -> String {
        let server = &self.server;
        let host = match server.bind.as_str() {
            "" | "0.0.0.0" | "::" => "localhost".to_string(),
            bind if bind.contains(':') => format!("[{}]", bind),
            bind => bind.to_string(),
        };
        format!("ws://{}:{}{}", host, server.port, server.chat_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_is_all_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.agent.relay_url, "ws://localhost:3000/agent");
        assert_eq!(config.agent.link.max_reconnect_attempts, 5);
        assert_eq!(config.agent.completion.base_url, "http://localhost:1234");
        assert_eq!(config.agent.completion.model, "qwen3-4b-2507");
        assert_eq!(config.agent.completion.timeout_secs, 300);
    }

    #[test]
    fn test_chat_url_follows_server_section() {
        assert_eq!(Config::default().chat_url(), "ws://localhost:3000/chat");

        let mut config = Config::parse(
            r#"
[server]
bind = "127.0.0.1"
port = 8080
chat_path = "/ws/chat"
"#,
        )
        .unwrap();
        assert_eq!(config.chat_url(), "ws://127.0.0.1:8080/ws/chat");

        config.override_port(Some("9000"), None).unwrap();
        assert_eq!(config.chat_url(), "ws://127.0.0.1:9000/ws/chat");

        config.server.bind = "::1".into();
        assert_eq!(config.chat_url(), "ws://[::1]:9000/ws/chat");
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::parse(
            r#"
[server]
port = 8080
allowed_origins = ["*.example.com"]

[agent.link]
max_delay_ms = 10000

[agent.completion]
system_prompt = "Be brief."
"#,
        )
        .unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.chat_path, "/chat");
        assert_eq!(config.server.allowed_origins, vec!["*.example.com"]);
        assert_eq!(config.agent.link.max_delay_ms, 10000);
        assert_eq!(config.agent.link.base_delay_ms, 1000);
        assert_eq!(config.agent.completion.system_prompt, "Be brief.");
        assert_eq!(config.agent.completion.model, "qwen3-4b-2507");
    }

    #[test]
    fn test_invalid_paths_are_rejected() {
        let err = Config::parse(
            r#"
[server]
agent_path = "/ws"
chat_path = "/ws"
"#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("must differ"));
    }

    #[test]
    fn test_malformed_toml_is_an_error() {
        assert!(Config::parse("[server\nport = 1").is_err());
    }

    #[test]
    fn test_load_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 4000").unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.server.port, 4000);
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = Config::load(Some(&missing)).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }

    #[test]
    fn test_port_override_precedence() {
        let mut config = Config::default();
        config.override_port(Some("5000"), None).unwrap();
        assert_eq!(config.server.port, 5000);

        config.override_port(Some("5000"), Some(6000)).unwrap();
        assert_eq!(config.server.port, 6000);

        let mut config = Config::default();
        config.override_port(Some("  "), None).unwrap();
        assert_eq!(config.server.port, 3000);
    }

    #[test]
    fn test_bad_port_env_is_an_error() {
        let mut config = Config::default();
        let err = config.override_port(Some("http"), None).unwrap_err();
        assert!(err.to_string().contains("PORT must be a port number"));
    }
}
