//! Resilient link manager: keeps the agent's single uplink to the relay alive
//!
//! The link runs as one actor task that owns the transport, the reconnect
//! timer, the ping interval and the pong deadline. Every timer lives inside
//! the state it belongs to, so leaving a state (including an explicit
//! `disconnect()`) drops its timers with it.
//!
//! ```text
//! disconnected --connect()--> connecting --opened--> open
//!      ^                          |                    |
//!      |                       failure        close / error / missed pong
//!      |                          v                    v
//!      +--- budget spent --- reconnecting <------------+
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use lmrelay_protocol::Keepalive;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("link manager has shut down")]
    Closed,
    #[error("reconnect budget exhausted after {0} attempts")]
    ReconnectBudgetExhausted(u32),
    #[error("failed to encode frame: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// `[agent.link]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
}

fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    5000
}
fn default_ping_interval_secs() -> u64 {
    30
}
fn default_pong_timeout_secs() -> u64 {
    5
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            ping_interval_secs: default_ping_interval_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
        }
    }
}

impl LinkConfig {
    fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.max_reconnect_attempts,
        )
    }

    pub fn ping_interval(&self) -> Duration {
        // A zero period would make the interval panic
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Open,
    Reconnecting,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: LinkState,
    pub reconnect_attempts: u32,
}

/// Notifications for the owner of the link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Opened,
    /// A JSON frame from the relay (keepalive frames are consumed by the link)
    Message(Value),
    Closed,
    /// Reconnect budget exhausted; the link stays down until `connect()`
    GaveUp { attempts: u32 },
}

/// An open connection, reduced to text frames in each direction.
///
/// Dropping `outgoing` closes the connection; `incoming` ending means the
/// peer closed it.
pub struct Transport {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<String>,
}

/// Opens transports to the relay
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Transport, LinkError>;
}

/// WebSocket connector backed by tokio-tungstenite
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Transport, LinkError> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| LinkError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(ws, out_rx, in_tx));

        Ok(Transport {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

/// Shuttle frames between a WebSocket and a [`Transport`]'s channels
async fn pump(
    mut ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    incoming: mpsc::UnboundedSender<String>,
) {
    loop {
        tokio::select! {
            out = outgoing.recv() => match out {
                Some(text) => {
                    if let Err(e) = ws.send(Message::text(text)).await {
                        debug!("Relay write failed: {}", e);
                        break;
                    }
                }
                None => {
                    let _ = ws.close(None).await;
                    break;
                }
            },
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if incoming.send(text.as_str().to_owned()).is_err() {
                        let _ = ws.close(None).await;
                        break;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => {
                        if incoming.send(text).is_err() {
                            let _ = ws.close(None).await;
                            break;
                        }
                    }
                    Err(_) => debug!("Dropping non-UTF-8 binary frame from relay"),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!("Relay closed the link: {:?}", frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Relay read failed: {}", e);
                    break;
                }
                None => break,
            },
        }
    }
}

enum Command {
    Connect(String),
    Send(String),
    Disconnect,
}

/// Cloneable control surface for a running link
#[derive(Clone)]
pub struct LinkHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<LinkStatus>,
}

impl LinkHandle {
    /// Connect to `url`. Ignored while already connecting to or connected to
    /// the same URL; a different URL replaces the current link.
    pub fn connect(&self, url: impl Into<String>) -> Result<(), LinkError> {
        self.command(Command::Connect(url.into()))
    }

    /// Queue a JSON frame. Frames queued while the link is not open are
    /// dropped.
    pub fn send<T: Serialize + ?Sized>(&self, msg: &T) -> Result<(), LinkError> {
        let text = serde_json::to_string(msg)?;
        self.command(Command::Send(text))
    }

    /// Close the link and cancel any pending reconnect
    pub fn disconnect(&self) -> Result<(), LinkError> {
        self.command(Command::Disconnect)
    }

    pub fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<LinkStatus> {
        self.status.clone()
    }

    fn command(&self, cmd: Command) -> Result<(), LinkError> {
        self.commands.send(cmd).map_err(|_| LinkError::Closed)
    }
}

/// Spawns link actors
pub struct LinkManager;

impl LinkManager {
    /// Start a link actor in the `disconnected` state.
    ///
    /// The actor stops once every [`LinkHandle`] has been dropped.
    pub fn spawn<C: Connector>(
        config: LinkConfig,
        connector: C,
    ) -> (LinkHandle, mpsc::UnboundedReceiver<LinkEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(LinkStatus {
            state: LinkState::Disconnected,
            reconnect_attempts: 0,
        });

        let actor = LinkActor {
            backoff: config.backoff(),
            config,
            connector: Arc::new(connector),
            commands: cmd_rx,
            events: event_tx,
            status: status_tx,
            url: None,
        };
        tokio::spawn(actor.run());

        (
            LinkHandle {
                commands: cmd_tx,
                status: status_rx,
            },
            event_rx,
        )
    }
}

enum Phase {
    Idle,
    Connect,
    Open(Transport),
    Wait(Duration),
    Stop,
}

struct LinkActor<C> {
    config: LinkConfig,
    connector: Arc<C>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<LinkEvent>,
    status: watch::Sender<LinkStatus>,
    backoff: Backoff,
    url: Option<String>,
}

impl<C: Connector> LinkActor<C> {
    async fn run(mut self) {
        let mut phase = Phase::Idle;
        loop {
            phase = match phase {
                Phase::Idle => self.idle().await,
                Phase::Connect => self.connect().await,
                Phase::Open(transport) => self.open(transport).await,
                Phase::Wait(delay) => self.wait(delay).await,
                Phase::Stop => {
                    debug!("Link manager stopped");
                    return;
                }
            };
        }
    }

    fn set_state(&self, state: LinkState) {
        self.status.send_replace(LinkStatus {
            state,
            reconnect_attempts: self.backoff.attempt(),
        });
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    /// Start over against `url` with a fresh reconnect budget
    fn retarget(&mut self, url: String) -> Phase {
        info!("Connecting link to {}", url);
        self.url = Some(url);
        self.backoff.reset();
        Phase::Connect
    }

    fn disconnected(&mut self) -> Phase {
        info!("Link disconnected");
        self.backoff.reset();
        Phase::Idle
    }

    /// Close/error path: schedule a reconnect or give up
    fn after_loss(&mut self) -> Phase {
        match self.backoff.next_delay() {
            Some(delay) => {
                info!(
                    "Reconnecting in {:?} (attempt {}/{})",
                    delay,
                    self.backoff.attempt(),
                    self.config.max_reconnect_attempts
                );
                Phase::Wait(delay)
            }
            None => {
                let attempts = self.backoff.attempt();
                error!(
                    "Reconnect budget exhausted after {} attempts; giving up on {}",
                    attempts,
                    self.url.as_deref().unwrap_or("<none>")
                );
                self.emit(LinkEvent::GaveUp { attempts });
                Phase::Idle
            }
        }
    }

    async fn idle(&mut self) -> Phase {
        self.set_state(LinkState::Disconnected);
        loop {
            match self.commands.recv().await {
                None => return Phase::Stop,
                Some(Command::Connect(url)) => return self.retarget(url),
                Some(Command::Send(_)) => debug!("Link is down, dropping outbound frame"),
                Some(Command::Disconnect) => {}
            }
        }
    }

    async fn connect(&mut self) -> Phase {
        self.set_state(LinkState::Connecting);
        let Some(url) = self.url.clone() else {
            return Phase::Idle;
        };

        let connector = self.connector.clone();
        let target = url.clone();
        let attempt = async move { connector.connect(&target).await };
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => {
                    return match result {
                        Ok(transport) => Phase::Open(transport),
                        Err(e) => {
                            warn!("Link connect failed: {}", e);
                            self.after_loss()
                        }
                    };
                }
                cmd = self.commands.recv() => match cmd {
                    None => return Phase::Stop,
                    Some(Command::Disconnect) => return self.disconnected(),
                    Some(Command::Connect(next)) if next == url => {
                        debug!("Already connecting to {}", url);
                    }
                    Some(Command::Connect(next)) => return self.retarget(next),
                    Some(Command::Send(_)) => debug!("Link not open yet, dropping outbound frame"),
                },
            }
        }
    }

    async fn wait(&mut self, delay: Duration) -> Phase {
        self.set_state(LinkState::Reconnecting);
        let timer = tokio::time::sleep(delay);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = &mut timer => return Phase::Connect,
                cmd = self.commands.recv() => match cmd {
                    None => return Phase::Stop,
                    Some(Command::Disconnect) => return self.disconnected(),
                    Some(Command::Connect(url)) => return self.retarget(url),
                    Some(Command::Send(_)) => {
                        debug!("Link is reconnecting, dropping outbound frame")
                    }
                },
            }
        }
    }

    async fn open(&mut self, transport: Transport) -> Phase {
        let Transport {
            outgoing,
            mut incoming,
        } = transport;

        self.backoff.reset();
        self.set_state(LinkState::Open);
        info!(
            "Link open to {}",
            self.url.as_deref().unwrap_or("<unknown>")
        );
        self.emit(LinkEvent::Opened);

        let ping_interval = self.config.ping_interval();
        let pong_timeout = self.config.pong_timeout();
        let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pong_deadline: Option<Instant> = None;

        loop {
            let deadline = pong_deadline;
            let pong_timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                frame = incoming.recv() => match frame {
                    Some(text) => self.on_frame(&text, &mut pong_deadline),
                    None => {
                        info!("Relay closed the link");
                        self.emit(LinkEvent::Closed);
                        return self.after_loss();
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    None => return Phase::Stop,
                    Some(Command::Send(text)) => {
                        if outgoing.send(text).is_err() {
                            warn!("Link transport gone while sending");
                            self.emit(LinkEvent::Closed);
                            return self.after_loss();
                        }
                    }
                    Some(Command::Disconnect) => {
                        drop(outgoing);
                        self.emit(LinkEvent::Closed);
                        return self.disconnected();
                    }
                    Some(Command::Connect(url)) if self.url.as_deref() == Some(url.as_str()) => {
                        debug!("Already connected to {}", url);
                    }
                    Some(Command::Connect(url)) => {
                        drop(outgoing);
                        self.emit(LinkEvent::Closed);
                        return self.retarget(url);
                    }
                },
                _ = ping.tick() => {
                    if outgoing.send(Keepalive::Ping.to_json()).is_err() {
                        warn!("Link transport gone while pinging");
                        self.emit(LinkEvent::Closed);
                        return self.after_loss();
                    }
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + pong_timeout);
                    }
                },
                _ = pong_timer => {
                    warn!("No pong within {:?}, closing link", pong_timeout);
                    drop(outgoing);
                    self.emit(LinkEvent::Closed);
                    return self.after_loss();
                },
            }
        }
    }

    fn on_frame(&self, text: &str, pong_deadline: &mut Option<Instant>) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                debug!("Dropping malformed frame from relay: {}", e);
                return;
            }
        };

        match Keepalive::detect(&value) {
            Some(Keepalive::Pong) => *pong_deadline = None,
            _ => self.emit(LinkEvent::Message(value)),
        }
    }
}
