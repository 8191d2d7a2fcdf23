//! Socket.IO signaling client
//!
//! [`SocketIoChannel`] speaks Engine.IO v4 over a single WebSocket, joins one
//! namespace and exposes call events through [`SignalingChannel`]. When the
//! connection drops it reconnects with exponential backoff and jitter; emits
//! made while it is down fail with [`SignalingError::NotConnected`].

use crate::config::SignalingConfig;
use crate::identity::PeerId;
use crate::signaling::{InboundSignal, OutboundSignal, SignalingChannel, SignalingError};
use crate::socketio::{EnginePacket, OpenHandshake, SocketPacket, SocketPacketKind};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// Connection lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Namespace joined
    Connected {
        /// Socket id assigned by the server
        sid: String,
    },
    /// Connection lost
    Disconnected {
        /// Why
        reason: String,
    },
    /// Waiting before the next reconnect attempt
    Reconnecting {
        /// Attempt number, starting at 1
        attempt: u32,
        /// Delay before the attempt
        delay: Duration,
    },
    /// Reconnect attempt failed
    ReconnectError {
        /// Error description
        error: String,
    },
    /// Attempts exhausted; the channel stays down
    ReconnectFailed,
}

/// Why a connection ended
#[derive(Debug)]
enum Ended {
    Shutdown,
    ServerDisconnect,
    Lost(String),
}

/// What to do with one incoming frame
#[derive(Debug, PartialEq, Eq)]
enum FrameAction {
    Reply(String),
    Signal(InboundSignal),
    ServerDisconnect,
    Close,
    Ignore,
}

#[derive(Default)]
struct LinkState {
    connected: bool,
    sid: Option<PeerId>,
}

struct Shared {
    config: SignalingConfig,
    link: RwLock<LinkState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    events: broadcast::Sender<ChannelEvent>,
}

/// Build the Engine.IO WebSocket URL for a server base URL
///
/// # Errors
///
/// Returns [`SignalingError::InvalidUrl`] for unparsable URLs or unsupported schemes
pub fn websocket_url(server_url: &str) -> Result<Url, SignalingError> {
    let mut url =
        Url::parse(server_url).map_err(|e| SignalingError::InvalidUrl(format!("{server_url}: {e}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SignalingError::InvalidUrl(format!(
                "unsupported scheme {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| SignalingError::InvalidUrl(server_url.to_string()))?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/socket.io/");
    }
    url.query_pairs_mut()
        .clear()
        .append_pair("EIO", "4")
        .append_pair("transport", "websocket");
    Ok(url)
}

/// Delay before reconnect attempt `attempt` (0-based)
///
/// Exponential from `reconnection_delay`, doubled per attempt, jittered by
/// `randomization_factor` and capped at `reconnection_delay_max`.
#[must_use]
pub fn reconnect_delay(config: &SignalingConfig, attempt: u32, rng: &mut impl Rng) -> Duration {
    let base = config.reconnection_delay.as_millis() as f64;
    let max = config.reconnection_delay_max.as_millis() as f64;
    let mut ms = base * 2f64.powi(attempt.min(31) as i32);
    let jitter = config.randomization_factor.clamp(0.0, 1.0);
    if jitter > 0.0 {
        let roll: f64 = rng.gen();
        let deviation = (roll * jitter * ms).floor();
        ms = if (roll * 10.0).floor() as u64 & 1 == 0 {
            ms - deviation
        } else {
            ms + deviation
        };
    }
    Duration::from_millis(ms.min(max).max(0.0) as u64)
}

fn text_frame(packet: &SocketPacket) -> Result<String, SignalingError> {
    Ok(EnginePacket::Message(packet.encode()?).encode()?)
}

fn classify(frame: &str, namespace: &str) -> Result<FrameAction, SignalingError> {
    match EnginePacket::decode(frame)? {
        EnginePacket::Ping(data) => Ok(FrameAction::Reply(EnginePacket::Pong(data).encode()?)),
        EnginePacket::Close => Ok(FrameAction::Close),
        EnginePacket::Message(payload) => {
            let packet = SocketPacket::decode(&payload)?;
            if packet.namespace != namespace {
                return Ok(FrameAction::Ignore);
            }
            match packet.kind {
                SocketPacketKind::Disconnect => Ok(FrameAction::ServerDisconnect),
                SocketPacketKind::Event => {
                    let Some((event, payload)) = packet.event_parts() else {
                        return Ok(FrameAction::Ignore);
                    };
                    Ok(InboundSignal::from_event(&event, payload)?
                        .map_or(FrameAction::Ignore, FrameAction::Signal))
                }
                _ => Ok(FrameAction::Ignore),
            }
        }
        _ => Ok(FrameAction::Ignore),
    }
}

struct Connection {
    write: WsWrite,
    read: WsRead,
    handshake: OpenHandshake,
    sid: String,
}

async fn next_text(read: &mut WsRead) -> Result<String, SignalingError> {
    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Close(_))) | None => {
                return Err(SignalingError::Handshake("connection closed".to_string()))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(SignalingError::WebSocket(e.to_string())),
        }
    }
}

async fn handshake(config: &SignalingConfig) -> Result<Connection, SignalingError> {
    let url = websocket_url(&config.server_url)?;
    tracing::debug!(url = %url, "Connecting to signaling server");
    let (stream, _) = connect_async(url.as_str())
        .await
        .map_err(|e| SignalingError::WebSocket(e.to_string()))?;
    let (mut write, mut read) = stream.split();

    let handshake = loop {
        match EnginePacket::decode(&next_text(&mut read).await?)? {
            EnginePacket::Open(handshake) => break handshake,
            EnginePacket::Noop => continue,
            other => {
                return Err(SignalingError::Handshake(format!(
                    "expected open packet, got {other:?}"
                )))
            }
        }
    };

    write
        .send(Message::Text(text_frame(&SocketPacket::connect(
            &config.namespace,
        ))?))
        .await
        .map_err(|e| SignalingError::WebSocket(e.to_string()))?;

    let sid = loop {
        let frame = next_text(&mut read).await?;
        match EnginePacket::decode(&frame)? {
            EnginePacket::Ping(data) => {
                write
                    .send(Message::Text(EnginePacket::Pong(data).encode()?))
                    .await
                    .map_err(|e| SignalingError::WebSocket(e.to_string()))?;
            }
            EnginePacket::Message(payload) => {
                let packet = SocketPacket::decode(&payload)?;
                if packet.namespace != config.namespace {
                    continue;
                }
                match packet.kind {
                    SocketPacketKind::Connect => {
                        break packet.connect_sid().unwrap_or_else(|| handshake.sid.clone())
                    }
                    SocketPacketKind::ConnectError => {
                        let message = packet
                            .data
                            .as_ref()
                            .and_then(|d| d.get("message"))
                            .and_then(|m| m.as_str())
                            .unwrap_or("connection refused")
                            .to_string();
                        return Err(SignalingError::Handshake(message));
                    }
                    _ => continue,
                }
            }
            EnginePacket::Close => {
                return Err(SignalingError::Handshake("server closed".to_string()))
            }
            _ => continue,
        }
    };

    Ok(Connection {
        write,
        read,
        handshake,
        sid,
    })
}

async fn open(config: &SignalingConfig) -> Result<Connection, SignalingError> {
    tokio::time::timeout(config.timeout, handshake(config))
        .await
        .map_err(|_| SignalingError::Handshake("timed out".to_string()))?
}

impl Shared {
    fn set_link(&self, connected: bool, sid: Option<&str>) {
        let mut link = self.link.write();
        link.connected = connected;
        if let Some(sid) = sid {
            link.sid = PeerId::new(sid).ok();
        }
    }

    fn notify(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    async fn run(
        &self,
        connection: Connection,
        inbound: &mpsc::UnboundedSender<InboundSignal>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Ended {
        let Connection {
            mut write,
            mut read,
            handshake,
            sid,
        } = connection;
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        *self.outbound.lock() = Some(out_tx);
        self.set_link(true, Some(&sid));
        tracing::info!(sid = %sid, "Signaling connected");
        self.notify(ChannelEvent::Connected { sid });

        // The server pings every interval and expects a pong within the timeout
        let silence = Duration::from_millis(handshake.ping_interval + handshake.ping_timeout);
        let mut deadline = Instant::now() + silence;

        let ended = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        break Ended::Shutdown;
                    }
                }
                Some(frame) = out_rx.recv() => {
                    if let Err(e) = write.send(Message::Text(frame)).await {
                        break Ended::Lost(e.to_string());
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    break Ended::Lost("ping timeout".to_string());
                }
                message = read.next() => {
                    // Only traffic from the server proves it is still there
                    deadline = Instant::now() + silence;
                    let text = match message {
                        None => break Ended::Lost("transport close".to_string()),
                        Some(Err(e)) => break Ended::Lost(e.to_string()),
                        Some(Ok(Message::Close(_))) => break Ended::Lost("transport close".to_string()),
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(_)) => continue,
                    };
                    match classify(&text, &self.config.namespace) {
                        Ok(FrameAction::Reply(frame)) => {
                            if let Err(e) = write.send(Message::Text(frame)).await {
                                break Ended::Lost(e.to_string());
                            }
                        }
                        Ok(FrameAction::Signal(signal)) => {
                            if inbound.send(signal).is_err() {
                                break Ended::Shutdown;
                            }
                        }
                        Ok(FrameAction::ServerDisconnect) => break Ended::ServerDisconnect,
                        Ok(FrameAction::Close) => break Ended::Lost("server close".to_string()),
                        Ok(FrameAction::Ignore) => {}
                        Err(e) => tracing::warn!(error = %e, "Dropping malformed frame"),
                    }
                }
            }
        };

        *self.outbound.lock() = None;
        self.set_link(false, None);
        ended
    }

    async fn supervise(
        self: Arc<Self>,
        first: Connection,
        inbound: mpsc::UnboundedSender<InboundSignal>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut connection = first;
        loop {
            let (reason, pause) = match self.run(connection, &inbound, &mut shutdown).await {
                Ended::Shutdown => break,
                Ended::ServerDisconnect => {
                    tracing::info!("Server closed the session");
                    (
                        "io server disconnect".to_string(),
                        Some(self.config.server_disconnect_delay),
                    )
                }
                Ended::Lost(reason) => {
                    tracing::warn!(reason = %reason, "Signaling connection lost");
                    (reason, None)
                }
            };
            self.notify(ChannelEvent::Disconnected { reason });
            if !self.config.reconnection {
                break;
            }

            let next = match pause {
                Some(delay) => self.rejoin_after(delay, &mut shutdown).await,
                None => self.reconnect(&mut shutdown).await,
            };
            match next {
                Some(next) => connection = next,
                None => break,
            }
        }
        tracing::debug!("Signaling supervisor stopped");
    }

    /// One fresh connection after the server dropped us on purpose, then the
    /// regular backoff if that fails
    async fn rejoin_after(
        &self,
        delay: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Connection> {
        tracing::info!(delay_ms = delay.as_millis() as u64, "Rejoining after server disconnect");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return None;
                }
            }
        }

        match open(&self.config).await {
            Ok(connection) => {
                tracing::info!("Rejoined");
                Some(connection)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Rejoin failed");
                self.notify(ChannelEvent::ReconnectError {
                    error: e.to_string(),
                });
                self.reconnect(shutdown).await
            }
        }
    }

    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Connection> {
        let mut attempt: u32 = 0;
        loop {
            if let Some(max) = self.config.reconnection_attempts {
                if attempt >= max {
                    tracing::error!(attempts = attempt, "Reconnection failed");
                    self.notify(ChannelEvent::ReconnectFailed);
                    return None;
                }
            }
            let delay = reconnect_delay(&self.config, attempt, &mut rand::thread_rng());
            attempt += 1;
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");
            self.notify(ChannelEvent::Reconnecting { attempt, delay });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return None;
                    }
                }
            }

            match open(&self.config).await {
                Ok(connection) => {
                    tracing::info!(attempt, "Reconnected");
                    return Some(connection);
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Reconnect error");
                    self.notify(ChannelEvent::ReconnectError {
                        error: e.to_string(),
                    });
                }
            }
        }
    }
}

/// Socket.IO client implementing [`SignalingChannel`]
pub struct SocketIoChannel {
    shared: Arc<Shared>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundSignal>>,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SocketIoChannel {
    /// Connect and join the configured namespace
    ///
    /// Reconnection only applies once the first connection has succeeded.
    ///
    /// # Errors
    ///
    /// Returns error if the URL is invalid or the first handshake fails
    #[tracing::instrument(skip(config), fields(server = %config.server_url))]
    pub async fn connect(config: SignalingConfig) -> Result<Self, SignalingError> {
        let first = open(&config).await?;
        let (events, _) = broadcast::channel(100);
        let shared = Arc::new(Shared {
            config,
            link: RwLock::new(LinkState::default()),
            outbound: Mutex::new(None),
            events,
        });
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut lifecycle = shared.events.subscribe();
        let supervisor = tokio::spawn(Arc::clone(&shared).supervise(first, inbound_tx, shutdown_rx));
        // Emits only work once the supervisor has published the writer
        while let Ok(event) = lifecycle.recv().await {
            if matches!(event, ChannelEvent::Connected { .. }) {
                break;
            }
        }

        Ok(Self {
            shared,
            inbound: tokio::sync::Mutex::new(inbound_rx),
            shutdown: shutdown_tx,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    /// Subscribe to connection lifecycle events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.shared.events.subscribe()
    }

    /// Close the connection and stop reconnecting
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for SocketIoChannel {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[async_trait]
impl SignalingChannel for SocketIoChannel {
    async fn emit(&self, signal: OutboundSignal) -> Result<(), SignalingError> {
        let (event, payload) = signal.to_event();
        let frame = text_frame(&SocketPacket::event(
            &self.shared.config.namespace,
            event,
            payload,
        ))?;
        let outbound = self.shared.outbound.lock();
        match outbound.as_ref() {
            Some(tx) if self.is_connected() => tx.send(frame).map_err(|_| SignalingError::NotConnected),
            _ => Err(SignalingError::NotConnected),
        }
    }

    async fn next_signal(&self) -> Result<Option<InboundSignal>, SignalingError> {
        Ok(self.inbound.lock().await.recv().await)
    }

    fn is_connected(&self) -> bool {
        self.shared.link.read().connected
    }

    fn local_id(&self) -> Option<PeerId> {
        self.shared.link.read().sid.clone()
    }
}
