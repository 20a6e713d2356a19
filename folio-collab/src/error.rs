//! Error types shared across the collaboration layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::operation::ParticipantId;
use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Why a submitted operation was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The client claims a revision the section has not reached.
    #[error("base revision is ahead of the section")]
    FutureRevision,
    /// The operations needed to transform the submit were folded away.
    #[error("base revision predates the retained history")]
    HistoryTrimmed,
    /// Position or length falls outside the text after transformation.
    #[error("operation range is outside the section text")]
    OutOfBounds,
}

/// Top-level error for gateway and room operations.
#[derive(Debug, Error)]
pub enum CollabError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("authorization failed: {0}")]
    AuthorizationFailure(String),

    #[error("section {section} is locked by {holder}")]
    LockConflict {
        section: String,
        holder: ParticipantId,
    },

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("room is closed")]
    RoomClosed,

    #[error("room is full ({0} participants)")]
    RoomFull(usize),

    #[error("too many open sections (limit {0})")]
    SectionLimit(usize),
}

impl From<ProtocolError> for CollabError {
    fn from(e: ProtocolError) -> Self {
        CollabError::ProtocolViolation(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CollabError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        CollabError::TransportFailure(e.to_string())
    }
}

impl From<std::io::Error> for CollabError {
    fn from(e: std::io::Error) -> Self {
        CollabError::TransportFailure(e.to_string())
    }
}
