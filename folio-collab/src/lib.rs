//! # folio-collab — Real-time collaborative section editing
//!
//! Several users edit named sections of one manuscript at once: live
//! cursors, advisory per-section locks, and operational transform so that
//! concurrent edits converge.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌──────────────┐
//! │ SyncClient  │ ◄─────────────────► │ CollabServer │
//! │ + SyncAgent │     JSON frames     │  (gateway)   │
//! └──────┬──────┘                     └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌──────────────┐
//! │ replicas    │                     │ DocumentRoom │──► BroadcastGroup
//! │ (optimistic)│                     │  presence    │
//! └─────────────┘                     │  sections ───┼──► actor per section
//!                                     └──────┬───────┘     (log + lock)
//!                                            │
//!                                     ┌──────┴───────┐
//!                                     │ SnapshotStore│ (RocksDB / memory)
//!                                     └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`operation`] — operations and the transform rules
//! - [`section`] — authoritative section state and operation log
//! - [`locks`] — advisory section locks
//! - [`presence`] — participants, colors, heartbeats
//! - [`protocol`] — JSON wire messages
//! - [`broadcast`] — room fan-out with backpressure
//! - [`room`] — document rooms, section actors, room registry
//! - [`server`] — WebSocket gateway
//! - [`auth`] — handshake authentication
//! - [`storage`] — snapshot persistence
//! - [`cursors`] — remote cursor overlays
//! - [`agent`] — client-side sync state machine
//! - [`client`] — reconnecting WebSocket client

pub mod agent;
pub mod auth;
pub mod broadcast;
pub mod client;
pub mod cursors;
pub mod error;
pub mod locks;
pub mod operation;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod section;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use agent::{AgentError, ReplicaState, SectionReplica, SyncAgent};
pub use auth::{
    AuthError, Authenticator, ConnectionRequest, QueryAuthenticator, TokenAuthenticator,
    UserIdentity,
};
pub use broadcast::{Audience, BroadcastGroup, BroadcastStats};
pub use client::{ClientConfig, ClientError, ConnectionState, SyncClient, SyncEvent};
pub use cursors::{CursorOverlay, CursorOverlays, EditorSurface, NullSurface};
pub use error::{CollabError, RejectReason};
pub use locks::{LockOutcome, ReleaseOutcome, SectionLock};
pub use operation::{apply, transform, transform_sequences, Edit, OpKind, Operation, ParticipantId};
pub use presence::{CursorColor, Participant, PresenceRegistry};
pub use protocol::{ClientMessage, PresenceEntry, ProtocolError, ServerMessage};
pub use room::{DocumentRoom, RoomRegistry, RoomSettings, SectionHandle};
pub use section::{AcceptedOp, SectionConfig, SectionState};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use storage::{
    MemoryStore, RetryPolicy, RocksStore, SectionSnapshot, SnapshotStore, StoreConfig, StoreError,
};
