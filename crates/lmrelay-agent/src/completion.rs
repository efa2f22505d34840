//! Streaming chat completions against an OpenAI-compatible local server

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP error! status: {0}")]
    Status(StatusCode),
    #[error("completion timed out after {0:?}")]
    Timeout(Duration),
    #[error("completion stream failed: {0}")]
    Stream(String),
}

/// A single chat turn sent to the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
}

/// Backend that streams a completion as text fragments
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Stream a completion, calling `on_chunk` once per non-empty fragment
    /// in arrival order. Returns once the stream has finished.
    async fn stream_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<(), CompletionError>;
}

/// Client for LM Studio's OpenAI-compatible endpoints
pub struct LmStudioClient {
    http: Client,
    base_url: String,
}

impl LmStudioClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, CompletionError> {
        let http = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// IDs of the models the server currently offers
    pub async fn list_models(&self) -> Result<Vec<String>, CompletionError> {
        let url = format!("{}/v1/models", self.base_url);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(CompletionError::Status(resp.status()));
        }
        let list: ModelList = resp.json().await?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }
}

#[async_trait]
impl CompletionService for LmStudioClient {
    async fn stream_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<(), CompletionError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = CompletionRequest {
            model,
            messages,
            stream: true,
        };

        debug!("Streaming completion from {} with model {}", url, model);
        let resp = self.http.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(CompletionError::Status(resp.status()));
        }

        let mut stream = resp.bytes_stream();
        let mut lines = LineBuffer::default();
        while let Some(bytes) = stream.next().await {
            for line in lines.push(&bytes?) {
                match parse_sse_line(&line) {
                    SseLine::Content(text) => on_chunk(&text),
                    SseLine::Done => return Ok(()),
                    SseLine::Ignored => {}
                }
            }
        }
        if let Some(SseLine::Content(text)) = lines.finish().map(|line| parse_sse_line(&line)) {
            on_chunk(&text);
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum SseLine {
    Content(String),
    Done,
    Ignored,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return SseLine::Ignored;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|c| !c.is_empty())
            .map(SseLine::Content)
            .unwrap_or(SseLine::Ignored),
        Err(e) => {
            debug!("Skipping unparseable stream line: {}", e);
            SseLine::Ignored
        }
    }
}

/// Reassembles newline-terminated lines from arbitrarily split byte chunks
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).trim_end().to_string());
        }
        lines
    }

    /// Whatever is left after the stream ends without a final newline
    fn finish(self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.pending).trim_end().to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};

    use axum::body::Body;
    use axum::extract::State;
    use axum::http::header;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    fn delta(content: &str) -> String {
        format!(
            "data: {}\n\n",
            json!({"choices": [{"delta": {"content": content}}]})
        )
    }

    #[test]
    fn test_parse_sse_line() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"hi"}}]}"#),
            SseLine::Content("hi".into())
        );
        assert_eq!(parse_sse_line("data: [DONE]"), SseLine::Done);
        assert_eq!(parse_sse_line(": keepalive"), SseLine::Ignored);
        assert_eq!(parse_sse_line(""), SseLine::Ignored);
        assert_eq!(parse_sse_line("data: {broken"), SseLine::Ignored);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            SseLine::Ignored
        );
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":""}}]}"#),
            SseLine::Ignored
        );
    }

    #[test]
    fn test_line_buffer_joins_split_lines() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"data: {\"a\"").is_empty());
        assert_eq!(buf.push(b":1}\r\ndata: [DO"), vec!["data: {\"a\":1}"]);
        assert_eq!(buf.push(b"NE]\n"), vec!["data: [DONE]"]);
        assert!(buf.finish().is_none());
    }

    #[test]
    fn test_line_buffer_handles_split_utf8() {
        let text = "data: héllo\n".as_bytes();
        // Split inside the two-byte 'é'
        let split = text.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut buf = LineBuffer::default();
        assert!(buf.push(&text[..split]).is_empty());
        assert_eq!(buf.push(&text[split..]), vec!["data: héllo"]);
    }

    #[test]
    fn test_line_buffer_finish_returns_tail() {
        let mut buf = LineBuffer::default();
        buf.push(b"data: tail");
        assert_eq!(buf.finish().as_deref(), Some("data: tail"));
    }

    type Seen = Arc<Mutex<Option<Value>>>;

    /// Records the request body and answers with fragments split mid-event
    async fn split_stream(State(seen): State<Seen>, Json(body): Json<Value>) -> impl IntoResponse {
        *seen.lock().unwrap() = Some(body);
        let parts: Vec<Result<String, Infallible>> = vec![
            Ok(delta("he")),
            Ok(": ping\n\n".into()),
            Ok(delta("llo")[..10].to_string()),
            Ok(delta("llo")[10..].to_string()),
            Ok("data: [DONE]\n\n".into()),
            Ok(delta("after done")),
        ];
        let headers = [(header::CONTENT_TYPE, "text/event-stream")];
        let stream = futures_util::stream::iter(parts);
        (headers, Body::from_stream(stream))
    }

    #[tokio::test]
    async fn test_stream_chat_delivers_chunks_in_order() {
        let seen = Arc::new(Mutex::new(None::<Value>));
        let app = Router::new()
            .route("/v1/chat/completions", post(split_stream))
            .with_state(seen.clone());
        let base = serve(app).await;

        let client = LmStudioClient::new(format!("{}/", base)).unwrap();
        let mut chunks = Vec::new();
        client
            .stream_chat(
                "qwen3-4b-2507",
                &[ChatMessage::user("hi")],
                &mut |c: &str| chunks.push(c.to_string()),
            )
            .await
            .unwrap();

        assert_eq!(chunks, vec!["he", "llo"]);
        let body = seen.lock().unwrap().clone().unwrap();
        assert_eq!(body["model"], "qwen3-4b-2507");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"], json!([{"role": "user", "content": "hi"}]));
    }

    #[tokio::test]
    async fn test_stream_chat_through_trait_object() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                let body = format!("{}{}data: [DONE]\n\n", delta("a"), delta("b"));
                ([(header::CONTENT_TYPE, "text/event-stream")], body)
            }),
        );
        let base = serve(app).await;

        // The bridge only ever sees the backend as a trait object
        let service: Arc<dyn CompletionService> = Arc::new(LmStudioClient::new(base).unwrap());
        let mut chunks: Vec<String> = Vec::new();
        let mut on_chunk = |c: &str| chunks.push(c.to_owned());
        service
            .stream_chat("m", &[ChatMessage::user("hi")], &mut on_chunk)
            .await
            .unwrap();
        assert_eq!(chunks, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_stream_chat_reports_http_status() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async { axum::http::StatusCode::INTERNAL_SERVER_ERROR }),
        );
        let base = serve(app).await;

        let client = LmStudioClient::new(base).unwrap();
        let err = client
            .stream_chat("m", &[ChatMessage::user("hi")], &mut |_: &str| {})
            .await
            .unwrap_err();
        assert!(matches!(err, CompletionError::Status(s) if s.as_u16() == 500));
        assert_eq!(
            err.to_string(),
            "HTTP error! status: 500 Internal Server Error"
        );
    }

    #[tokio::test]
    async fn test_stream_without_done_marker_ends_cleanly() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                let body = format!("{}{}", delta("a"), delta("b").trim_end());
                ([(header::CONTENT_TYPE, "text/event-stream")], body)
            }),
        );
        let base = serve(app).await;

        let client = LmStudioClient::new(base).unwrap();
        let mut chunks = Vec::new();
        client
            .stream_chat("m", &[], &mut |c: &str| chunks.push(c.to_string()))
            .await
            .unwrap();
        assert_eq!(chunks, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_list_models() {
        let app = Router::new().route(
            "/v1/models",
            get(|| async {
                Json(json!({
                    "object": "list",
                    "data": [{"id": "qwen3-4b-2507"}, {"id": "llama-3.2-1b"}]
                }))
            }),
        );
        let base = serve(app).await;

        let client = LmStudioClient::new(base).unwrap();
        assert_eq!(
            client.list_models().await.unwrap(),
            vec!["qwen3-4b-2507", "llama-3.2-1b"]
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_is_http_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = LmStudioClient::new(format!("http://{}", addr)).unwrap();
        let err = client.list_models().await.unwrap_err();
        assert!(matches!(err, CompletionError::Http(_)));
    }
}
