//! Relay server: axum WebSocket endpoints feeding the message router

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use lmrelay_protocol::{CLOSE_POLICY_VIOLATION, Endpoint};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, RelayConfig, STATUS_PATH};
use crate::origin::OriginPolicy;
use crate::registry::{ConnectionRegistry, connection_channel};
use crate::router::MessageRouter;

/// How long to wait for the peer to acknowledge a policy close
const CLOSE_GRACE: Duration = Duration::from_secs(1);

struct RelayState {
    router: MessageRouter,
    origins: OriginPolicy,
}

/// Hosts the registry and router behind two WebSocket endpoints
pub struct RelayServer {
    config: RelayConfig,
    state: Arc<RelayState>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let state = Arc::new(RelayState {
            router: MessageRouter::new(Arc::new(ConnectionRegistry::new())),
            origins: OriginPolicy::new(&config.allowed_origins),
        });
        Ok(Self { config, state })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn message_router(&self) -> &MessageRouter {
        &self.state.router
    }

    /// Build the HTTP application
    pub fn app(&self) -> Router {
        Router::new()
            .route(&self.config.agent_path, get(agent_ws))
            .route(&self.config.chat_path, get(chat_ws))
            .route(STATUS_PATH, get(status))
            .fallback(unsupported_path)
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Serve on an already-bound listener until `shutdown` fires
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(
                "Relay listening on {} (agent: {}, chat: {})",
                addr, self.config.agent_path, self.config.chat_path
            );
        }
        if self.state.origins.is_enabled() {
            info!("Origin allow-list: {:?}", self.config.allowed_origins);
        } else {
            warn!("Origin validation disabled; any page may open a chat connection");
        }

        axum::serve(listener, self.app())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Relay stopped");
        Ok(())
    }

    /// Bind the configured address and serve
    pub async fn bind_and_serve(self, shutdown: CancellationToken) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr()).await?;
        self.serve(listener, shutdown).await
    }
}

async fn agent_ws(ws: WebSocketUpgrade, State(state): State<Arc<RelayState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, Endpoint::Agent))
}

async fn chat_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
) -> Response {
    let origin = headers.get(header::ORIGIN).map(|v| v.as_bytes());
    if let Err(denied) = state.origins.check_raw(origin) {
        warn!("Rejecting chat connection: {}", denied);
        let reason = denied.to_string();
        return ws.on_upgrade(move |socket| close_with_policy_violation(socket, reason));
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, Endpoint::Chat))
}

async fn status(State(state): State<Arc<RelayState>>) -> Json<serde_json::Value> {
    let registry = state.router.registry();
    Json(serde_json::json!({
        "agents": registry.agent_count().await,
        "clients": registry.client_count().await,
    }))
}

async fn unsupported_path(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    uri: Uri,
) -> Response {
    match ws {
        Ok(ws) => {
            warn!("Rejecting WebSocket on unsupported path {}", uri.path());
            ws.on_upgrade(|socket| close_with_policy_violation(socket, "Unsupported path".into()))
        }
        Err(_) => (StatusCode::NOT_FOUND, "Not Found").into_response(),
    }
}

async fn close_with_policy_violation(mut socket: WebSocket, reason: String) {
    // Close reasons must fit in a control frame
    let reason: String = reason.chars().take(123).collect();
    let frame = CloseFrame {
        code: CLOSE_POLICY_VIOLATION,
        reason: reason.into(),
    };
    if socket.send(Message::Close(Some(frame))).await.is_err() {
        return;
    }
    let _ = tokio::time::timeout(CLOSE_GRACE, async {
        while let Some(Ok(_)) = socket.recv().await {}
    })
    .await;
}

async fn handle_socket(socket: WebSocket, state: Arc<RelayState>, endpoint: Endpoint) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = connection_channel();

    // Single writer per socket; preserves per-connection send order
    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let conn = state.router.accept(endpoint, tx).await;
    info!("{} connection opened: {:?}", endpoint, conn);

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                state.router.route(&conn, text.as_str()).await;
            }
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => {
                    state.router.route(&conn, text).await;
                }
                Err(_) => debug!("Dropping non-UTF-8 binary frame from {:?}", conn),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Socket error on {:?}: {}", conn, e);
                break;
            }
        }
    }

    // Dropping the registry's sender ends the writer task
    state.router.close(&conn).await;
    let _ = send_task.await;
    info!("{} connection closed: {:?}", endpoint, conn);
}
