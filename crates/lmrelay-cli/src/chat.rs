//! One-shot chat client for the relay's chat endpoint

use anyhow::{Context, Result, anyhow, bail};
use futures_util::{SinkExt, StreamExt};
use lmrelay_protocol::{AgentReply, ChatRequest};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::debug;

/// Send `prompt` and collect the streamed reply.
///
/// `on_chunk` sees each content fragment as it arrives; the full text is
/// returned once the agent signals `end`.
pub async fn ask(
    url: &str,
    origin: Option<&str>,
    prompt: &str,
    mut on_chunk: impl FnMut(&str),
) -> Result<String> {
    let mut request = url
        .into_client_request()
        .with_context(|| format!("Invalid chat URL: {}", url))?;
    if let Some(origin) = origin {
        let value = HeaderValue::from_str(origin).context("Invalid origin header")?;
        request.headers_mut().insert("Origin", value);
    }

    let (mut ws, _) = connect_async(request)
        .await
        .with_context(|| format!("Failed to connect to {}", url))?;

    let id = uuid::Uuid::new_v4().simple().to_string();
    let payload = serde_json::to_string(&ChatRequest {
        id: id.clone(),
        prompt: prompt.to_string(),
    })?;
    ws.send(Message::text(payload)).await?;
    debug!("Sent prompt {}", id);

    let mut full = String::new();
    while let Some(frame) = ws.next().await {
        let text = match frame? {
            Message::Text(text) => text,
            Message::Close(frame) => {
                let reason = frame
                    .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                    .unwrap_or_default();
                bail!(
                    "Relay closed the connection before the reply ended {}",
                    reason.trim_end()
                );
            }
            _ => continue,
        };

        let reply: AgentReply = match serde_json::from_str(text.as_str()) {
            Ok(reply) => reply,
            Err(_) => continue,
        };
        if reply.id.as_str() != Some(id.as_str()) {
            continue;
        }

        if let Some(error) = reply.error {
            let _ = ws.close(None).await;
            return Err(anyhow!("Agent error: {}", error));
        }
        if let Some(content) = reply.content {
            on_chunk(&content);
            full.push_str(&content);
        }
        if reply.end {
            let _ = ws.close(None).await;
            return Ok(full);
        }
    }

    bail!("Relay connection ended before the reply ended")
}
