//! Room fan-out with backpressure.
//!
//! Every participant of a room holds a receiver on one tokio broadcast
//! channel. Frames are JSON-encoded once and shared as `Arc<str>`; each
//! envelope names its audience and every connection filters for itself.
//!
//! ```text
//! section actor ─┐
//! gateway conn  ─┼─► BroadcastGroup ──► rx(conn A) ── audience? ──► socket
//! sweeper       ─┘        (Arc<str>) ──► rx(conn B) ── audience? ──► socket
//! ```
//!
//! A receiver that falls more than `capacity` frames behind gets `Lagged`;
//! the connection then tells its client to resync.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::operation::ParticipantId;
use crate::protocol::{ProtocolError, ServerMessage};

/// Who a frame is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    All,
    AllExcept(ParticipantId),
    Only(ParticipantId),
}

impl Audience {
    pub fn includes(&self, participant: ParticipantId) -> bool {
        match self {
            Audience::All => true,
            Audience::AllExcept(excluded) => *excluded != participant,
            Audience::Only(target) => *target == participant,
        }
    }
}

/// Payload of an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Pre-encoded JSON text frame.
    Message(Arc<str>),
    /// The participant was evicted; its connection must close.
    Evicted,
    /// The server is stopping; every connection must close.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub audience: Audience,
    pub frame: Frame,
}

/// Snapshot of broadcast counters.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub subscribers: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Broadcast channel for one document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    /// Encode and fan out a message. Returns the number of receivers.
    pub fn send(&self, audience: Audience, msg: &ServerMessage) -> Result<usize, ProtocolError> {
        let encoded: Arc<str> = Arc::from(msg.encode()?);
        Ok(self.send_envelope(Envelope {
            audience,
            frame: Frame::Message(encoded),
        }))
    }

    /// Fan out a pre-built envelope.
    pub fn send_envelope(&self, envelope: Envelope) -> usize {
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        // No receivers is not an error: the room may be empty mid-teardown.
        self.sender.send(envelope).unwrap_or(0)
    }

    /// Tell one participant's connection to close.
    pub fn evict(&self, participant: ParticipantId) -> usize {
        self.send_envelope(Envelope {
            audience: Audience::Only(participant),
            frame: Frame::Evicted,
        })
    }

    /// Tell every connection of the room to close.
    pub fn close_all(&self) -> usize {
        self.send_envelope(Envelope {
            audience: Audience::All,
            frame: Frame::Shutdown,
        })
    }

    /// Record frames a lagging receiver lost.
    pub fn record_dropped(&self, n: u64) {
        self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}
