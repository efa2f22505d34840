//! In-memory test doubles for the link and the completion backend

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::completion::{ChatMessage, CompletionError, CompletionService};
use crate::link::{Connector, LinkError, Transport};

/// The relay's end of a mock transport
pub struct Peer {
    pub from_link: mpsc::UnboundedReceiver<String>,
    pub to_link: mpsc::UnboundedSender<String>,
}

#[derive(Clone)]
pub struct MockConnector {
    accept: bool,
    attempts: Arc<Mutex<Vec<(Instant, String)>>>,
    peers: mpsc::UnboundedSender<Peer>,
}

impl MockConnector {
    pub fn accepting() -> (Self, mpsc::UnboundedReceiver<Peer>) {
        Self::build(true)
    }

    pub fn refusing() -> (Self, mpsc::UnboundedReceiver<Peer>) {
        Self::build(false)
    }

    fn build(accept: bool) -> (Self, mpsc::UnboundedReceiver<Peer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            accept,
            attempts: Arc::new(Mutex::new(Vec::new())),
            peers: tx,
        };
        (connector, rx)
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    pub fn urls(&self) -> Vec<String> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, url)| url.clone())
            .collect()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Transport, LinkError> {
        let attempt = (Instant::now(), url.to_string());
        self.attempts.lock().unwrap().push(attempt);

        if !self.accept {
            return Err(LinkError::Connect {
                url: url.to_string(),
                reason: "connection refused".into(),
            });
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let _ = self.peers.send(Peer {
            from_link: out_rx,
            to_link: in_tx,
        });
        Ok(Transport {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

/// What a scripted completion does when called
#[derive(Clone)]
pub enum Script {
    Chunks(Vec<&'static str>),
    ChunksThenFail(Vec<&'static str>, &'static str),
    Hang,
}

pub struct ScriptedService {
    script: Script,
    pub calls: Mutex<Vec<(String, Vec<ChatMessage>)>>,
}

impl ScriptedService {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl CompletionService for ScriptedService {
    async fn stream_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<(), CompletionError> {
        self.calls
            .lock()
            .unwrap()
            .push((model.to_string(), messages.to_vec()));

        match &self.script {
            Script::Chunks(chunks) => {
                for chunk in chunks {
                    on_chunk(chunk);
                }
                Ok(())
            }
            Script::ChunksThenFail(chunks, reason) => {
                for chunk in chunks {
                    on_chunk(chunk);
                }
                Err(CompletionError::Stream(reason.to_string()))
            }
            Script::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}
