//! WebSocket sync client.
//!
//! Wraps a [`SyncAgent`] with a live connection:
//! - connection lifecycle (connect, disconnect, reconnect with backoff)
//! - writer task draining the outgoing queue into the socket
//! - reader loop feeding server frames to the agent
//! - heartbeat task
//! - event channel to the application
//!
//! Edits never wait on the network: they apply to the local replica and
//! queue their frame. While disconnected the agent buffers edits and
//! replays them after the next join and snapshot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::form_urlencoded;

use crate::agent::{AgentError, Reaction, SyncAgent};
use crate::cursors::{EditorSurface, NullSurface, CURSOR_THROTTLE};
use crate::operation::{Operation, ParticipantId};
use crate::protocol::{ClientMessage, PresenceEntry, ProtocolError, ServerMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Joined to the document.
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Joined (or re-joined) the document
    Connected {
        participant_id: ParticipantId,
        color: String,
    },
    /// Connection lost
    Disconnected,
    /// Waiting before reconnect attempt `attempt`
    Reconnecting { attempt: u32, delay: Duration },
    /// A section snapshot was adopted (pending local edits re-applied)
    SectionLoaded {
        section: String,
        text: String,
        revision: u64,
    },
    /// Remote operations applied to the local text
    RemoteEdit {
        section: String,
        revision: u64,
        ops: Vec<Operation>,
    },
    /// One of our operations was committed
    Acknowledged { section: String, revision: u64 },
    /// Section baseline lost; a snapshot has been requested
    Resyncing { section: String },
    LockGranted {
        section: String,
        holder: ParticipantId,
    },
    LockDenied {
        section: String,
        holder: ParticipantId,
        holder_name: Option<String>,
    },
    LockReleased {
        section: String,
        holder: ParticipantId,
    },
    PresenceChanged(Vec<PresenceEntry>),
    ServerError(String),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("client is already connected")]
    AlreadyConnected,
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(e.to_string())
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// e.g. `ws://127.0.0.1:9090/collab`
    pub server_url: String,
    pub document_id: String,
    /// Query parameters appended to the URL (credentials).
    pub query: Vec<(String, String)>,
    pub heartbeat_interval: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    /// Give up after this many consecutive failed attempts.
    pub max_reconnect_attempts: Option<u32>,
    pub cursor_throttle: Duration,
    pub event_capacity: usize,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            document_id: document_id.into(),
            query: Vec::new(),
            heartbeat_interval: Duration::from_secs(10),
            reconnect_initial: Duration::from_millis(250),
            reconnect_max: Duration::from_secs(10),
            max_reconnect_attempts: None,
            cursor_throttle: CURSOR_THROTTLE,
            event_capacity: 256,
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Fast timers for tests.
    pub fn for_testing(server_url: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(100),
            reconnect_initial: Duration::from_millis(20),
            reconnect_max: Duration::from_millis(200),
            max_reconnect_attempts: Some(20),
            cursor_throttle: Duration::ZERO,
            ..Self::new(server_url, document_id)
        }
    }

    /// Server URL with the query parameters appended.
    pub fn url(&self) -> String {
        if self.query.is_empty() {
            return self.server_url.clone();
        }
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&self.query)
            .finish();
        let sep = if self.server_url.contains('?') { '&' } else { '?' };
        format!("{}{sep}{query}", self.server_url)
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        (current * 2).min(self.reconnect_max)
    }
}

struct AgentCore {
    agent: SyncAgent,
    surface: Box<dyn EditorSurface>,
}

struct ClientShared {
    config: ClientConfig,
    core: Mutex<AgentCore>,
    out_tx: mpsc::UnboundedSender<ClientMessage>,
    out_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ClientMessage>>,
    event_tx: mpsc::Sender<SyncEvent>,
    state: RwLock<ConnectionState>,
}

impl ClientShared {
    fn dispatch(&self, reaction: Reaction) {
        for msg in reaction.outbound {
            let _ = self.out_tx.send(msg);
        }
        for event in reaction.events {
            self.emit(event);
        }
    }

    fn emit(&self, event: SyncEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            log::warn!("Dropping sync event: {e}");
        }
    }

    fn send(&self, msg: Option<ClientMessage>) {
        if let Some(msg) = msg {
            let _ = self.out_tx.send(msg);
        }
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    /// Discard frames queued for a session that no longer exists.
    async fn drain_outgoing(&self) -> usize {
        let mut rx = self.out_rx.lock().await;
        let mut dropped = 0;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

/// The sync client.
pub struct SyncClient {
    shared: Arc<ClientShared>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    supervisor: Option<tokio::task::JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_surface(config, Box::new(NullSurface))
    }

    /// Client that drives `surface` with remote cursor overlays.
    pub fn with_surface(config: ClientConfig, surface: Box<dyn EditorSurface>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let agent = SyncAgent::new(config.cursor_throttle);
        Self {
            shared: Arc::new(ClientShared {
                config,
                core: Mutex::new(AgentCore { agent, surface }),
                out_tx,
                out_rx: tokio::sync::Mutex::new(out_rx),
                event_tx,
                state: RwLock::new(ConnectionState::Disconnected),
            }),
            event_rx: Some(event_rx),
            shutdown_tx: None,
            supervisor: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Open the socket and start the background session.
    ///
    /// Only the first attempt is reported here; later drops reconnect in
    /// the background.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if self.supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(ClientError::AlreadyConnected);
        }
        self.shared.set_state(ConnectionState::Connecting).await;
        let url = self.shared.config.url();
        let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                self.shared.set_state(ConnectionState::Disconnected).await;
                return Err(e.into());
            }
        };
        log::info!("Connected to {}", self.shared.config.server_url);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = self.shared.clone();
        self.supervisor = Some(tokio::spawn(supervise(shared, ws, shutdown_rx)));
        self.shutdown_tx = Some(shutdown_tx);
        Ok(())
    }

    /// Leave the document and stop reconnecting.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.supervisor.take() {
            if let Err(e) = handle.await {
                log::error!("Sync supervisor failed: {e}");
            }
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    pub fn participant_id(&self) -> Option<ParticipantId> {
        self.shared.core.lock().agent.participant_id()
    }

    /// Start syncing a section.
    pub fn open_section(&self, section: &str) {
        let msg = self.shared.core.lock().agent.open_section(section);
        self.shared.send(msg);
    }

    pub fn insert(&self, section: &str, position: usize, text: &str) -> Result<(), ClientError> {
        let mut core = self.shared.core.lock();
        let msg = core.agent.insert(section, position, text)?;
        self.shared.send(msg);
        Ok(())
    }

    pub fn delete(&self, section: &str, position: usize, len: usize) -> Result<(), ClientError> {
        let mut core = self.shared.core.lock();
        let msg = core.agent.delete(section, position, len)?;
        self.shared.send(msg);
        Ok(())
    }

    /// Throttled cursor update.
    pub fn move_cursor(&self, section: &str, line: u32, column: u32) {
        let mut core = self.shared.core.lock();
        let msg = core.agent.move_cursor(section, line, column, Instant::now());
        self.shared.send(msg);
    }

    /// Send the latest cursor position now.
    pub fn flush_cursor(&self) {
        let mut core = self.shared.core.lock();
        let msg = core.agent.flush_cursor(Instant::now());
        self.shared.send(msg);
    }

    pub fn request_lock(&self, section: &str) -> Result<(), ClientError> {
        let msg = self.shared.core.lock().agent.request_lock(section)?;
        self.shared.send(Some(msg));
        Ok(())
    }

    pub fn unlock(&self, section: &str) -> Result<(), ClientError> {
        let msg = self.shared.core.lock().agent.unlock(section)?;
        self.shared.send(Some(msg));
        Ok(())
    }

    pub fn text(&self, section: &str) -> Option<String> {
        let core = self.shared.core.lock();
        core.agent.section(section).map(|r| r.text().to_string())
    }

    pub fn revision(&self, section: &str) -> Option<u64> {
        let core = self.shared.core.lock();
        core.agent.section(section).map(|r| r.revision())
    }

    /// True when every local edit of `section` has been acknowledged.
    pub fn is_settled(&self, section: &str) -> bool {
        let core = self.shared.core.lock();
        core.agent
            .section(section)
            .is_some_and(|r| !r.has_pending())
    }

    pub fn lock_holder(&self, section: &str) -> Option<ParticipantId> {
        self.shared.core.lock().agent.lock_holder(section)
    }

    pub fn presence(&self) -> Vec<PresenceEntry> {
        self.shared.core.lock().agent.presence().to_vec()
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
    }
}

// ─── Background tasks ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Lost,
    Shutdown,
}

/// Run sessions until shutdown, reconnecting with exponential backoff.
async fn supervise(shared: Arc<ClientShared>, first: WsStream, mut shutdown: watch::Receiver<bool>) {
    let config = shared.config.clone();
    let mut next = Some(first);
    let mut backoff = config.reconnect_initial;
    let mut failures: u32 = 0;

    loop {
        let ws = match next.take() {
            Some(ws) => ws,
            None => {
                if config
                    .max_reconnect_attempts
                    .is_some_and(|max| failures >= max)
                {
                    log::warn!("Giving up after {failures} reconnect attempts");
                    break;
                }
                shared.set_state(ConnectionState::Reconnecting).await;
                shared.emit(SyncEvent::Reconnecting {
                    attempt: failures + 1,
                    delay: backoff,
                });
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => break,
                }
                match tokio_tungstenite::connect_async(config.url().as_str()).await {
                    Ok((ws, _)) => ws,
                    Err(e) => {
                        log::debug!("Reconnect to {} failed: {e}", config.server_url);
                        failures += 1;
                        backoff = config.next_backoff(backoff);
                        continue;
                    }
                }
            }
        };

        let dropped = shared.drain_outgoing().await;
        if dropped > 0 {
            log::debug!("Discarded {dropped} frames from the previous session");
        }
        shared.set_state(ConnectionState::Connecting).await;

        let (end, joined) = run_session(&shared, ws, &mut shutdown).await;

        {
            let mut core = shared.core.lock();
            let AgentCore { agent, surface } = &mut *core;
            agent.disconnected(&mut **surface);
        }
        shared.emit(SyncEvent::Disconnected);

        if end == SessionEnd::Shutdown {
            break;
        }
        if joined {
            failures = 0;
            backoff = config.reconnect_initial;
        } else {
            failures += 1;
            backoff = config.next_backoff(backoff);
        }
        log::info!("Connection to {} lost", config.server_url);
    }

    shared.set_state(ConnectionState::Disconnected).await;
}

async fn write_frame(sink: &mut WsSink, msg: &ClientMessage) -> Result<(), ClientError> {
    let text = msg.encode()?;
    sink.send(Message::text(text)).await?;
    Ok(())
}

/// One connection: join, then pump frames until it drops.
///
/// Returns how it ended and whether the join succeeded.
async fn run_session(
    shared: &Arc<ClientShared>,
    ws: WsStream,
    shutdown: &mut watch::Receiver<bool>,
) -> (SessionEnd, bool) {
    let (mut sink, mut frames) = ws.split();
    let join = ClientMessage::Join {
        document_id: shared.config.document_id.clone(),
    };
    if let Err(e) = write_frame(&mut sink, &join).await {
        log::warn!("Failed to send join: {e}");
        return (SessionEnd::Lost, false);
    }

    // Writer task: forward the outgoing queue to the socket.
    let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel::<()>();
    let writer_shared = shared.clone();
    let writer = tokio::spawn(async move {
        let mut out_rx = writer_shared.out_rx.lock().await;
        loop {
            tokio::select! {
                msg = out_rx.recv() => {
                    let Some(msg) = msg else { break };
                    if let Err(e) = write_frame(&mut sink, &msg).await {
                        log::warn!("Write failed: {e}");
                        break;
                    }
                }
                _ = &mut stop_rx => {
                    while let Ok(msg) = out_rx.try_recv() {
                        if write_frame(&mut sink, &msg).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
        let _ = sink.close().await;
    });

    let heartbeat_shared = shared.clone();
    let heartbeat = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_shared.config.heartbeat_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if heartbeat_shared.core.lock().agent.is_joined() {
                let _ = heartbeat_shared.out_tx.send(ClientMessage::Heartbeat);
            }
        }
    });

    let mut joined = false;
    let end = loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let msg = match ServerMessage::decode(text.as_str()) {
                        Ok(msg) => msg,
                        Err(e) => {
                            log::warn!("Malformed server frame: {e}");
                            continue;
                        }
                    };
                    let is_join = matches!(msg, ServerMessage::Joined { .. });
                    let reaction = {
                        let mut core = shared.core.lock();
                        let AgentCore { agent, surface } = &mut *core;
                        agent.handle(msg, &mut **surface)
                    };
                    shared.dispatch(reaction);
                    if is_join {
                        joined = true;
                        shared.set_state(ConnectionState::Connected).await;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break SessionEnd::Lost,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("Read failed: {e}");
                    break SessionEnd::Lost;
                }
            },
            _ = shutdown.changed() => {
                let _ = shared.out_tx.send(ClientMessage::Leave);
                break SessionEnd::Shutdown;
            }
        }
    };

    heartbeat.abort();
    let _ = stop_tx.send(());
    if let Err(e) = writer.await {
        log::error!("Writer task failed: {e}");
    }
    (end, joined)
}
