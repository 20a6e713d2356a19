//! WebSocket collaboration gateway.
//!
//! Architecture:
//! ```text
//! Tab A ──┐                 ┌── DocumentRoom "paper-1" ── section actors
//!          ├── CollabServer ─┤          │
//! Tab B ──┘   (accept loop)  │    BroadcastGroup ──► Tab A, Tab B
//!                            └── sweeper (heartbeat timeouts)
//! ```
//!
//! Connection lifecycle:
//! ```text
//! Connecting ──join ok──► Joined ──leave / close / evicted / error──► Closing ──► Closed
//!     │  ▲                                                               ▲
//!     │  └── other frames: error, stay                                   │
//!     └── auth failure / room full: error ───────────────────────────────┘
//! ```
//!
//! Every connection runs in its own task. Section-scoped requests are
//! handed to the section actor and the connection awaits the reply before
//! reading its next frame, so a client sees replies in request order.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::auth::{Authenticator, ConnectionRequest};
use crate::broadcast::{Envelope, Frame};
use crate::error::CollabError;
use crate::locks::{LockOutcome, ReleaseOutcome};
use crate::operation::{Operation, ParticipantId};
use crate::protocol::{edit_from_wire, ClientMessage, ProtocolError, ServerMessage};
use crate::room::{DocumentRoom, Membership, RoomRegistry, RoomSettings};
use crate::section::SectionConfig;
use crate::storage::{RetryPolicy, SnapshotStore};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum participants per room
    pub max_participants_per_room: usize,
    /// Open sections per room
    pub max_sections_per_room: usize,
    /// Longest accepted section name, in characters
    pub max_section_name_len: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Participants silent for this long are evicted
    pub heartbeat_timeout: Duration,
    /// How often the eviction sweep runs
    pub sweep_interval: Duration,
    /// Section serializer tuning
    pub section: SectionConfig,
    /// Persistence retry schedule
    pub retry: RetryPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_participants_per_room: 100,
            max_sections_per_room: 256,
            max_section_name_len: 128,
            broadcast_capacity: 256,
            heartbeat_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            section: SectionConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ServerConfig {
    /// Fast timers for tests.
    pub fn for_testing(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            max_participants_per_room: 10,
            max_sections_per_room: 8,
            max_section_name_len: 64,
            broadcast_capacity: 64,
            heartbeat_timeout: Duration::from_millis(500),
            sweep_interval: Duration::from_millis(100),
            section: SectionConfig::for_testing(),
            retry: RetryPolicy::for_testing(),
        }
    }

    fn room_settings(&self) -> RoomSettings {
        RoomSettings {
            max_participants: self.max_participants_per_room,
            max_sections: self.max_sections_per_room,
            max_section_name_len: self.max_section_name_len,
            broadcast_capacity: self.broadcast_capacity,
            section: self.section.clone(),
            retry: self.retry,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub active_rooms: usize,
    pub ops_accepted: u64,
    pub ops_rejected: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    ops_accepted: AtomicU64,
    ops_rejected: AtomicU64,
}

struct Shared {
    config: ServerConfig,
    registry: RoomRegistry,
    auth: Arc<dyn Authenticator>,
    stats: AtomicServerStats,
}

/// The collaboration server.
pub struct CollabServer {
    shared: Arc<Shared>,
}

impl CollabServer {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn SnapshotStore>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        let registry = RoomRegistry::new(config.room_settings(), store);
        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                auth,
                stats: AtomicServerStats::default(),
            }),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.shared.registry
    }

    /// Accept connections until the process ends.
    pub async fn run(&self) -> Result<(), CollabError> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves, then close every room.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<(), CollabError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Collaboration server listening on {}", self.shared.config.bind_addr);
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), CollabError> {
        let sweeper = self.spawn_sweeper();
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => break Err(CollabError::from(e)),
                    };
                    log::debug!("New TCP connection from {addr}");
                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, shared).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = &mut shutdown => {
                    log::info!("Shutting down collaboration server");
                    break Ok(());
                }
            }
        };

        sweeper.abort();
        self.shared.registry.shutdown().await;
        result
    }

    fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = shared
                    .registry
                    .sweep(Instant::now(), shared.config.heartbeat_timeout)
                    .await;
                if evicted > 0 {
                    log::info!("Sweep evicted {evicted} idle participants");
                }
            }
        })
    }

    pub async fn stats(&self) -> ServerStats {
        let s = &self.shared.stats;
        ServerStats {
            total_connections: s.total_connections.load(Ordering::Relaxed),
            active_connections: s.active_connections.load(Ordering::Relaxed),
            total_messages: s.total_messages.load(Ordering::Relaxed),
            active_rooms: self.shared.registry.room_count().await,
            ops_accepted: s.ops_accepted.load(Ordering::Relaxed),
            ops_rejected: s.ops_rejected.load(Ordering::Relaxed),
        }
    }
}

// ─── Connection ───────────────────────────────────────────────────

struct Session {
    room: Arc<DocumentRoom>,
    participant_id: ParticipantId,
    receiver: tokio::sync::broadcast::Receiver<Envelope>,
}

enum Phase {
    Connecting,
    Joined(Session),
    Closing,
    Closed,
}

enum Event {
    Socket(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
    Broadcast(Result<Envelope, RecvError>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsFrames = SplitStream<WebSocketStream<TcpStream>>;

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
) -> Result<(), CollabError> {
    let mut request = ConnectionRequest::default();
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        let uri = req.uri().path_and_query().map_or("/", |pq| pq.as_str());
        let mut captured = ConnectionRequest::from_uri(uri);
        for (name, value) in req.headers() {
            if let Ok(value) = value.to_str() {
                captured = captured.with_header(name.as_str(), value);
            }
        }
        request = captured;
        Ok::<Response, ErrorResponse>(resp)
    })
    .await?;
    let (sink, mut frames) = ws_stream.split();

    log::info!("WebSocket connection established from {addr}");
    shared.stats.total_connections.fetch_add(1, Ordering::Relaxed);
    shared.stats.active_connections.fetch_add(1, Ordering::Relaxed);

    let mut conn = Connection {
        addr,
        shared: shared.clone(),
        request,
        sink,
        phase: Phase::Connecting,
    };
    let result = conn.serve(&mut frames).await;
    conn.close().await;

    shared.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    log::info!("Connection closed from {addr}");
    result
}

struct Connection {
    addr: SocketAddr,
    shared: Arc<Shared>,
    request: ConnectionRequest,
    sink: WsSink,
    phase: Phase,
}

impl Connection {
    async fn serve(&mut self, frames: &mut WsFrames) -> Result<(), CollabError> {
        loop {
            let event = match &mut self.phase {
                Phase::Connecting => Event::Socket(frames.next().await),
                Phase::Joined(session) => tokio::select! {
                    frame = frames.next() => Event::Socket(frame),
                    envelope = session.receiver.recv() => Event::Broadcast(envelope),
                },
                Phase::Closing | Phase::Closed => return Ok(()),
            };

            let flow = match event {
                Event::Socket(frame) => self.on_socket(frame).await?,
                Event::Broadcast(envelope) => self.on_broadcast(envelope).await?,
            };
            if flow == Flow::Close {
                return Ok(());
            }
        }
    }

    /// Leave the room (if joined) and close the socket.
    async fn close(&mut self) {
        if let Phase::Joined(session) = std::mem::replace(&mut self.phase, Phase::Closing) {
            self.shared
                .registry
                .leave(&session.room, session.participant_id)
                .await;
        }
        let _ = self.sink.close().await;
        self.phase = Phase::Closed;
    }

    async fn send(&mut self, msg: &ServerMessage) -> Result<(), CollabError> {
        let text = msg.encode()?;
        self.sink.send(Message::text(text)).await?;
        Ok(())
    }

    async fn send_error(&mut self, message: impl Into<String>) -> Result<(), CollabError> {
        self.send(&ServerMessage::error(message)).await
    }

    fn session(&self) -> Option<(Arc<DocumentRoom>, ParticipantId)> {
        match &self.phase {
            Phase::Joined(session) => Some((session.room.clone(), session.participant_id)),
            _ => None,
        }
    }

    async fn on_socket(
        &mut self,
        frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) -> Result<Flow, CollabError> {
        match frame {
            Some(Ok(Message::Text(text))) => {
                self.shared.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                match ClientMessage::decode(text.as_str()) {
                    Ok(msg) => self.on_message(msg).await,
                    Err(e) => {
                        log::warn!("Malformed frame from {}: {e}", self.addr);
                        self.send_error(e.to_string()).await?;
                        Ok(Flow::Continue)
                    }
                }
            }
            Some(Ok(Message::Binary(_))) => {
                self.send_error(ProtocolError::BinaryFrame.to_string()).await?;
                Ok(Flow::Continue)
            }
            Some(Ok(Message::Ping(data))) => {
                self.sink.send(Message::Pong(data)).await?;
                Ok(Flow::Continue)
            }
            Some(Ok(Message::Close(_))) | None => Ok(Flow::Close),
            Some(Ok(_)) => Ok(Flow::Continue),
            Some(Err(e)) => {
                log::warn!("WebSocket error from {}: {e}", self.addr);
                Ok(Flow::Close)
            }
        }
    }

    async fn on_message(&mut self, msg: ClientMessage) -> Result<Flow, CollabError> {
        let Some((room, pid)) = self.session() else {
            return match msg {
                ClientMessage::Join { document_id } => self.join(&document_id).await,
                _ => {
                    self.send_error("join a document first").await?;
                    Ok(Flow::Continue)
                }
            };
        };

        match msg {
            ClientMessage::Join { .. } => {
                self.send_error("already joined").await?;
            }
            ClientMessage::Heartbeat => {
                if room.heartbeat(pid, Instant::now()).is_err() {
                    return self.evicted().await;
                }
            }
            ClientMessage::CursorUpdate {
                section,
                line,
                column,
                seq,
            } => {
                log::trace!("Cursor {pid} -> {section}:{line}:{column} #{seq:?}");
                if room
                    .update_cursor(pid, &section, line, column, seq, Instant::now())
                    .is_err()
                {
                    return self.evicted().await;
                }
            }
            ClientMessage::LockRequest { section } => {
                let handle = match room.section(&section) {
                    Ok(handle) => handle,
                    Err(e) => return self.room_error(e).await,
                };
                match handle.request_lock(pid).await {
                    Ok(LockOutcome::Granted) => {}
                    Ok(LockOutcome::Denied { holder }) => {
                        self.send(&ServerMessage::LockDenied { section, holder }).await?;
                    }
                    Err(e) => return self.room_error(e).await,
                }
            }
            ClientMessage::Unlock { section } => {
                let handle = match room.section(&section) {
                    Ok(handle) => handle,
                    Err(e) => return self.room_error(e).await,
                };
                match handle.release_lock(pid).await {
                    Ok(ReleaseOutcome::Released) => {}
                    Ok(ReleaseOutcome::NotHolder) => {
                        log::debug!("Unlock of {section} by non-holder {pid}");
                        self.send_error("not the lock holder").await?;
                    }
                    Err(e) => return self.room_error(e).await,
                }
            }
            ClientMessage::OpSubmit {
                section,
                base_revision,
                kind,
                position,
                payload,
            } => {
                let edit = match edit_from_wire(kind, payload) {
                    Ok(edit) => edit,
                    Err(e) => {
                        self.send_error(e.to_string()).await?;
                        return Ok(Flow::Continue);
                    }
                };
                let handle = match room.section(&section) {
                    Ok(handle) => handle,
                    Err(e) => return self.room_error(e).await,
                };
                let op = Operation::new(section.clone(), base_revision, position, edit, pid);
                match handle.submit(op).await {
                    Ok(Ok(accepted)) => {
                        log::debug!(
                            "{pid} op on {section} accepted at {:?}",
                            accepted.iter().map(|a| a.revision).collect::<Vec<_>>()
                        );
                        self.shared
                            .stats
                            .ops_accepted
                            .fetch_add(accepted.len() as u64, Ordering::Relaxed);
                    }
                    Ok(Err(reason)) => {
                        log::debug!("{pid} op on {section}@{base_revision} rejected: {reason}");
                        self.shared.stats.ops_rejected.fetch_add(1, Ordering::Relaxed);
                        self.send(&ServerMessage::OpRejected { section, reason }).await?;
                    }
                    Err(e) => return self.room_error(e).await,
                }
            }
            ClientMessage::SnapshotRequest { section } => {
                let handle = match room.section(&section) {
                    Ok(handle) => handle,
                    Err(e) => return self.room_error(e).await,
                };
                match handle.snapshot().await {
                    Ok(snapshot) => {
                        self.send(&ServerMessage::SectionSnapshot {
                            section,
                            text: snapshot.text,
                            revision: snapshot.revision,
                        })
                        .await?;
                    }
                    Err(e) => return self.room_error(e).await,
                }
            }
            ClientMessage::Leave => return Ok(Flow::Close),
        }
        Ok(Flow::Continue)
    }

    async fn join(&mut self, document_id: &str) -> Result<Flow, CollabError> {
        let auth = &self.shared.auth;
        let user = match auth.authenticate(&self.request) {
            Ok(user) => user,
            Err(e) => {
                log::warn!("Authentication failed from {}: {e}", self.addr);
                self.send_error(CollabError::AuthorizationFailure(e.to_string()).to_string())
                    .await?;
                return Ok(Flow::Close);
            }
        };
        if let Err(e) = auth.authorize(&user, document_id) {
            log::warn!("{} denied access to {document_id}: {e}", user.user_id);
            self.send_error(CollabError::AuthorizationFailure(e.to_string()).to_string())
                .await?;
            return Ok(Flow::Close);
        }

        let membership = match self
            .shared
            .registry
            .join(document_id, &user, Instant::now())
            .await
        {
            Ok(membership) => membership,
            Err(e) => {
                self.send_error(e.to_string()).await?;
                return Ok(Flow::Close);
            }
        };

        let Membership {
            room,
            participant,
            presence_snapshot,
            receiver,
        } = membership;
        self.phase = Phase::Joined(Session {
            room,
            participant_id: participant.participant_id,
            receiver,
        });
        self.send(&ServerMessage::Joined {
            participant_id: participant.participant_id,
            color: participant.color,
            presence_snapshot,
        })
        .await?;
        Ok(Flow::Continue)
    }

    async fn on_broadcast(&mut self, envelope: Result<Envelope, RecvError>) -> Result<Flow, CollabError> {
        let Some((room, pid)) = self.session() else {
            return Ok(Flow::Continue);
        };
        match envelope {
            Ok(envelope) if !envelope.audience.includes(pid) => Ok(Flow::Continue),
            Ok(Envelope {
                frame: Frame::Message(text),
                ..
            }) => {
                self.sink.send(Message::text(text.to_string())).await?;
                Ok(Flow::Continue)
            }
            Ok(Envelope {
                frame: Frame::Evicted,
                ..
            }) => self.evicted().await,
            Ok(Envelope {
                frame: Frame::Shutdown,
                ..
            }) => {
                self.send_error("server shutting down").await?;
                Ok(Flow::Close)
            }
            Err(RecvError::Lagged(n)) => {
                log::warn!("Participant {pid} lagged by {n} messages");
                room.broadcast().record_dropped(n);
                self.send_error("resync required").await?;
                Ok(Flow::Continue)
            }
            Err(RecvError::Closed) => Ok(Flow::Close),
        }
    }

    async fn evicted(&mut self) -> Result<Flow, CollabError> {
        log::info!("Closing evicted connection from {}", self.addr);
        self.send_error("evicted: heartbeat timeout").await?;
        Ok(Flow::Close)
    }

    async fn room_error(&mut self, e: CollabError) -> Result<Flow, CollabError> {
        self.send_error(e.to_string()).await?;
        match e {
            CollabError::RoomClosed => Ok(Flow::Close),
            _ => Ok(Flow::Continue),
        }
    }
}
