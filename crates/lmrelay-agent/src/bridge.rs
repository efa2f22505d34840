//! Completion bridge: turns one prompt into a stream of replies

use std::sync::Arc;
use std::time::Duration;

use lmrelay_protocol::{AgentReply, PromptRequest};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::completion::{ChatMessage, CompletionError, CompletionService};
use crate::link::{LinkError, LinkHandle};

/// `[agent.completion]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Prepended as a system message when non-empty
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:1234".to_string()
}

fn default_model() -> String {
    "qwen3-4b-2507".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            system_prompt: String::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl CompletionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Where replies go. The link in production, a channel in tests.
pub trait Outbox: Send + Sync {
    fn post(&self, reply: &AgentReply) -> Result<(), LinkError>;
}

impl Outbox for LinkHandle {
    fn post(&self, reply: &AgentReply) -> Result<(), LinkError> {
        self.send(reply)
    }
}

pub struct CompletionBridge {
    service: Arc<dyn CompletionService>,
    config: CompletionConfig,
}

impl CompletionBridge {
    pub fn new(service: Arc<dyn CompletionService>, config: CompletionConfig) -> Self {
        Self { service, config }
    }

    fn build_messages(&self, prompt: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(2);
        if !self.config.system_prompt.trim().is_empty() {
            messages.push(ChatMessage::system(self.config.system_prompt.clone()));
        }
        messages.push(ChatMessage::user(prompt));
        messages
    }

    /// Answer one prompt: a chunk reply per fragment, then exactly one
    /// terminal reply (`end` on success, `error` on failure or timeout).
    ///
    /// Errors only when the outbox itself is gone.
    pub async fn answer(
        &self,
        request: PromptRequest,
        outbox: &dyn Outbox,
    ) -> Result<(), LinkError> {
        let messages = self.build_messages(&request.prompt);
        let PromptRequest { client_id, id, .. } = request;
        debug!("Answering prompt {} for client {}", id, client_id);

        let mut post_failure: Option<LinkError> = None;
        let mut forward = |chunk: &str| {
            if post_failure.is_some() {
                return;
            }
            if let Err(e) = outbox.post(&AgentReply::chunk(id.clone(), client_id.clone(), chunk)) {
                post_failure = Some(e);
            }
        };

        let timeout = self.config.timeout();
        let outcome = tokio::time::timeout(
            timeout,
            self.service.stream_chat(&self.config.model, &messages, &mut forward),
        )
        .await
        .unwrap_or(Err(CompletionError::Timeout(timeout)));

        if let Some(e) = post_failure {
            return Err(e);
        }

        let terminal = match outcome {
            Ok(()) => AgentReply::end(id, client_id),
            Err(e) => {
                warn!("Completion for client {} failed: {}", client_id, e);
                AgentReply::error(id, client_id, e.to_string())
            }
        };
        outbox.post(&terminal)
    }
}
