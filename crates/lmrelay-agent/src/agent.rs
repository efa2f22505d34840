//! Agent runtime: dispatches relay prompts to the completion bridge

use std::sync::Arc;

use lmrelay_protocol::{CLIENT_ID, PromptRequest, Welcome};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::CompletionBridge;
use crate::link::{LinkError, LinkEvent, LinkHandle};

pub struct Agent {
    link: LinkHandle,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    bridge: Arc<CompletionBridge>,
}

impl Agent {
    pub fn new(
        link: LinkHandle,
        events: mpsc::UnboundedReceiver<LinkEvent>,
        bridge: CompletionBridge,
    ) -> Self {
        Self {
            link,
            events,
            bridge: Arc::new(bridge),
        }
    }

    /// Connect to `url` and serve prompts until `shutdown` fires or the
    /// link gives up. Each prompt is answered on its own task so replies to
    /// concurrent prompts interleave but stay ordered per prompt.
    pub async fn run(mut self, url: &str, shutdown: CancellationToken) -> Result<(), LinkError> {
        self.link.connect(url)?;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Agent shutting down");
                    let _ = self.link.disconnect();
                    return Ok(());
                }
                event = self.events.recv() => match event {
                    None => return Err(LinkError::Closed),
                    Some(LinkEvent::Opened) => info!("Agent connected to relay"),
                    Some(LinkEvent::Closed) => warn!("Agent lost relay link"),
                    Some(LinkEvent::GaveUp { attempts }) => {
                        error!("Giving up on relay after {} reconnect attempts", attempts);
                        return Err(LinkError::ReconnectBudgetExhausted(attempts));
                    }
                    Some(LinkEvent::Message(frame)) => self.dispatch(frame),
                },
            }
        }
    }

    fn dispatch(&self, frame: Value) {
        if frame.get(CLIENT_ID).is_none() {
            if frame.get("type").and_then(Value::as_str) == Some(Welcome::KIND) {
                debug!("Relay welcome: {}", frame);
            } else {
                debug!("Ignoring relay frame without {}: {}", CLIENT_ID, frame);
            }
            return;
        }

        let request: PromptRequest = match serde_json::from_value(frame) {
            Ok(request) => request,
            Err(e) => {
                debug!("Ignoring malformed prompt: {}", e);
                return;
            }
        };

        let bridge = self.bridge.clone();
        let link = self.link.clone();
        tokio::spawn(async move {
            if let Err(e) = bridge.answer(request, &link).await {
                warn!("Could not deliver reply: {}", e);
            }
        });
    }
}
