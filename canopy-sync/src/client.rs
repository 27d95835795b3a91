//! WebSocket connection manager.
//!
//! Provides:
//! - Connection lifecycle (connect, reconnect with exponential backoff, close)
//! - One ordered event stream carrying status changes and raw text frames
//! - A cloneable fire-and-forget send handle
//!
//! ```text
//!            ┌──────────── supervisor task ────────────┐
//!  connect() │ Connecting ──ok──▸ Connected ──close──┐ │
//!            │     ▲   └──err──┐                     │ │
//!            │     │           ▼                     ▼ │
//!            │     └─ sleep(backoff) ◂── Disconnected ◂┘ │
//!            └─────────────────────────────────────────┘
//! ```
//!
//! Only one supervisor runs at a time, so at most one reconnect timer is
//! ever pending. `close()` is the only terminal transition.

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::protocol::OutboundMessage;

/// Connection state as reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Events emitted by the connection, in transport order.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The connection changed state. `Connected` starts a new epoch.
    Status(ConnectionState),
    /// A text frame from the server, not yet decoded.
    Frame(String),
}

/// Connection errors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Connection closed")]
    Closed,
}

/// Connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// WebSocket URL to (re)connect to
    pub endpoint: String,
    /// First reconnect delay in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound for the reconnect delay in milliseconds
    pub max_delay_ms: u64,
    /// Capacity of the inbound event channel
    pub event_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:8501/ws".to_string(),
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
            event_capacity: 256,
        }
    }
}

impl ConnectionConfig {
    /// Configuration whose endpoint is `/ws` on the given page origin.
    pub fn from_origin(origin: &str) -> Result<Self, ConnectionError> {
        Ok(Self {
            endpoint: endpoint_for_origin(origin, "/ws")?,
            ..Self::default()
        })
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Derive the socket URL from a page origin: same host and port, scheme
/// upgraded (`http` → `ws`, `https` → `wss`), path replaced by `path`.
pub fn endpoint_for_origin(origin: &str, path: &str) -> Result<String, ConnectionError> {
    let mut url =
        Url::parse(origin).map_err(|e| ConnectionError::InvalidEndpoint(format!("{origin}: {e}")))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ConnectionError::InvalidEndpoint(format!(
                "unsupported scheme '{other}'"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ConnectionError::InvalidEndpoint(format!("cannot use scheme '{scheme}'")))?;
    url.set_path(path);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.to_string())
}

/// Exponential reconnect backoff: `min(base · 2^attempts, max)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempts: 0,
        }
    }

    /// Delay for the next reconnect; counts it as an attempt.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.checked_pow(self.attempts).unwrap_or(u32::MAX);
        let delay = self.base.checked_mul(factor).unwrap_or(self.max).min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Called on a successful open.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Outbound side of the connection, as seen by the dispatch layer.
pub trait EventSink: Send + Sync {
    /// Fire-and-forget send; may drop the message.
    fn send(&self, message: OutboundMessage);
}

type Outgoing = Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>;

/// Cloneable send handle. Messages are dropped while not connected.
#[derive(Clone)]
pub struct ConnectionHandle {
    state: watch::Receiver<ConnectionState>,
    outgoing: Outgoing,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

impl EventSink for ConnectionHandle {
    fn send(&self, message: OutboundMessage) {
        if self.state() != ConnectionState::Connected {
            log::debug!("Not connected, dropping event for '{}'", message.widget_id());
            return;
        }

        let encoded = match message.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                log::warn!("Failed to encode event for '{}': {e}", message.widget_id());
                return;
            }
        };

        let outgoing = self.outgoing.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = outgoing.as_ref() {
            // A closed channel means the socket just went away.
            let _ = tx.send(encoded);
        }
    }
}

/// State shared between the manager and its supervisor task.
struct Shared {
    state: watch::Sender<ConnectionState>,
    outgoing: Outgoing,
    event_tx: mpsc::Sender<ConnectionEvent>,
}

impl Shared {
    async fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
        let _ = self.event_tx.send(ConnectionEvent::Status(state)).await;
    }

    fn set_outgoing(&self, tx: Option<mpsc::UnboundedSender<String>>) {
        *self.outgoing.lock().unwrap_or_else(PoisonError::into_inner) = tx;
    }
}

/// Why a live connection ended.
enum Ended {
    /// Socket closed or failed; reconnect.
    Dropped,
    /// Caller tore the connection down; stop.
    Teardown,
}

/// The connection manager.
///
/// Owns the socket through a supervisor task and reports everything on one
/// ordered channel, so status changes and frames can never be observed out
/// of order relative to each other.
pub struct ConnectionManager {
    config: ConnectionConfig,
    shared: Arc<Shared>,
    event_rx: Option<mpsc::Receiver<ConnectionEvent>>,
    supervisor: Option<(watch::Sender<bool>, JoinHandle<()>)>,
}

impl ConnectionManager {
    /// Create a manager. Nothing happens until [`connect`](Self::connect).
    pub fn new(config: ConnectionConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            shared: Arc::new(Shared {
                state,
                outgoing: Arc::new(Mutex::new(None)),
                event_tx,
            }),
            event_rx: Some(event_rx),
            supervisor: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ConnectionEvent>> {
        self.event_rx.take()
    }

    /// Start (or restart) the connection loop. Must be called inside a
    /// tokio runtime. A running loop, including a pending reconnect timer,
    /// is superseded.
    pub fn connect(&mut self) {
        self.stop_supervisor();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(supervise(
            self.config.clone(),
            self.shared.clone(),
            shutdown_rx,
        ));
        self.supervisor = Some((shutdown_tx, task));
    }

    /// Tear the connection down for good and report `Disconnected`.
    pub async fn close(&mut self) {
        if let Some((shutdown, task)) = self.supervisor.take() {
            let _ = shutdown.send(true);
            let _ = task.await;
        }
        self.shared.set_outgoing(None);
        if self.state() != ConnectionState::Disconnected {
            self.shared.set_state(ConnectionState::Disconnected).await;
        }
    }

    /// Send handle for the dispatch layer.
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            state: self.shared.state.subscribe(),
            outgoing: self.shared.outgoing.clone(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Observe state changes without consuming the event stream.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn stop_supervisor(&mut self) {
        if let Some((shutdown, task)) = self.supervisor.take() {
            let _ = shutdown.send(true);
            task.abort();
        }
        self.shared.set_outgoing(None);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop_supervisor();
    }
}

/// Connect, run, back off, repeat, until shutdown.
async fn supervise(config: ConnectionConfig, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut backoff = Backoff::new(config.base_delay(), config.max_delay());

    loop {
        shared.set_state(ConnectionState::Connecting).await;

        let attempt = tokio::select! {
            result = tokio_tungstenite::connect_async(config.endpoint.as_str()) => result,
            _ = shutdown.changed() => break,
        };

        match attempt {
            Ok((ws, _)) => {
                backoff.reset();
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                shared.set_outgoing(Some(out_tx));
                shared.set_state(ConnectionState::Connected).await;
                log::info!("Connected to {}", config.endpoint);

                let ended = run_connection(ws, out_rx, &shared.event_tx, &mut shutdown).await;
                shared.set_outgoing(None);
                if let Ended::Teardown = ended {
                    break;
                }
                log::info!("Connection to {} lost", config.endpoint);
            }
            Err(e) => {
                log::warn!("Connection to {} failed: {e}", config.endpoint);
            }
        }

        shared.set_state(ConnectionState::Disconnected).await;

        let delay = backoff.next_delay();
        log::info!(
            "Reconnecting to {} in {delay:?} (attempt {})",
            config.endpoint,
            backoff.attempts()
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
}

/// Pump frames both ways until the socket ends or shutdown is requested.
async fn run_connection<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    event_tx: &mpsc::Sender<ConnectionEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> Ended
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut ws_writer, mut ws_reader) = ws.split();

    loop {
        tokio::select! {
            incoming = ws_reader.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if event_tx.send(ConnectionEvent::Frame(text.as_str().to_owned())).await.is_err() {
                        // Nobody is consuming events anymore.
                        let _ = ws_writer.close().await;
                        return Ended::Teardown;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    log::warn!("Ignoring {}-byte binary frame", data.len());
                }
                Some(Ok(Message::Close(frame))) => {
                    log::debug!("Server closed connection: {frame:?}");
                    return Ended::Dropped;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("Socket error: {e}");
                    return Ended::Dropped;
                }
                None => return Ended::Dropped,
            },
            outgoing = out_rx.recv() => match outgoing {
                Some(text) => {
                    if let Err(e) = ws_writer.send(Message::Text(text.into())).await {
                        log::warn!("Send failed: {e}");
                        return Ended::Dropped;
                    }
                }
                // Sender is only cleared by this task's owner.
                None => return Ended::Dropped,
            },
            _ = shutdown.changed() => {
                let _ = ws_writer.close().await;
                return Ended::Teardown;
            }
        }
    }
}
