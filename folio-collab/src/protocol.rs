//! JSON wire protocol.
//!
//! One WebSocket per document; every frame is a JSON text message tagged by
//! `"type"`:
//! ```text
//! {"type":"op_submit","section":"methods","base_revision":11,
//!  "kind":"insert","position":3,"payload":"ins"}
//! ```
//!
//! `payload` is a string for inserts and a non-negative integer (deleted
//! length) for deletes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::RejectReason;
use crate::operation::{Edit, OpKind, Operation, ParticipantId};
use crate::section::AcceptedOp;

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("malformed message: {0}")]
    Deserialization(String),
    #[error("{kind:?} operation carries the wrong payload type")]
    PayloadMismatch { kind: OpKind },
    #[error("operation payload is missing")]
    MissingPayload,
    #[error("binary frames are not supported")]
    BinaryFrame,
}

/// Insert text or deleted length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    Length(usize),
}

impl From<&Edit> for Payload {
    fn from(edit: &Edit) -> Self {
        match edit {
            Edit::Insert(text) => Payload::Text(text.clone()),
            Edit::Delete(len) => Payload::Length(*len),
        }
    }
}

/// Build the edit described by a wire `kind` + `payload` pair.
pub fn edit_from_wire(kind: OpKind, payload: Option<Payload>) -> Result<Edit, ProtocolError> {
    match (kind, payload) {
        (_, None) => Err(ProtocolError::MissingPayload),
        (OpKind::Insert, Some(Payload::Text(text))) => Ok(Edit::Insert(text)),
        (OpKind::Delete, Some(Payload::Length(len))) => Ok(Edit::Delete(len)),
        (kind, Some(_)) => Err(ProtocolError::PayloadMismatch { kind }),
    }
}

/// One row of a presence snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub participant_id: ParticipantId,
    pub user_id: String,
    pub display_name: String,
    pub color: String,
    pub section: Option<String>,
    pub line: u32,
    pub column: u32,
}

/// Client → server frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        document_id: String,
    },
    Heartbeat,
    CursorUpdate {
        section: String,
        line: u32,
        column: u32,
        /// Client-side ordering; absent means "newest"
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
    LockRequest {
        section: String,
    },
    Unlock {
        section: String,
    },
    OpSubmit {
        section: String,
        base_revision: u64,
        kind: OpKind,
        position: usize,
        #[serde(default)]
        payload: Option<Payload>,
    },
    SnapshotRequest {
        section: String,
    },
    Leave,
}

/// Server → client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Joined {
        participant_id: ParticipantId,
        color: String,
        presence_snapshot: Vec<PresenceEntry>,
    },
    CursorUpdate {
        participant_id: ParticipantId,
        section: String,
        line: u32,
        column: u32,
        seq: u64,
    },
    LockGranted {
        section: String,
        holder: ParticipantId,
    },
    LockDenied {
        section: String,
        holder: ParticipantId,
    },
    LockReleased {
        section: String,
        holder: ParticipantId,
    },
    OpAccepted {
        section: String,
        final_revision: u64,
        kind: OpKind,
        position: usize,
        payload: Payload,
        author_id: ParticipantId,
    },
    OpRejected {
        section: String,
        reason: RejectReason,
    },
    SectionSnapshot {
        section: String,
        text: String,
        revision: u64,
    },
    PresenceChanged {
        presence_snapshot: Vec<PresenceEntry>,
    },
    Error {
        message: String,
    },
}

impl ClientMessage {
    /// Build an `op_submit` frame for a local operation.
    pub fn submit(op: &Operation) -> Self {
        ClientMessage::OpSubmit {
            section: op.section().to_string(),
            base_revision: op.base_revision(),
            kind: op.kind(),
            position: op.position(),
            payload: Some(Payload::from(op.edit())),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

impl ServerMessage {
    /// Build an `op_accepted` frame for a committed operation.
    pub fn accepted(accepted: &AcceptedOp) -> Self {
        let op = &accepted.op;
        ServerMessage::OpAccepted {
            section: op.section().to_string(),
            final_revision: accepted.revision,
            kind: op.kind(),
            position: op.position(),
            payload: Payload::from(op.edit()),
            author_id: op.author_id(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Rebuild the accepted operation carried by an `op_accepted` frame.
    ///
    /// The operation's base revision is the revision just before it.
    pub fn accepted_operation(&self) -> Option<Result<(u64, Operation), ProtocolError>> {
        match self {
            ServerMessage::OpAccepted {
                section,
                final_revision,
                kind,
                position,
                payload,
                author_id,
            } => Some(edit_from_wire(*kind, Some(payload.clone())).map(|edit| {
                let op = Operation::new(
                    section.clone(),
                    final_revision.saturating_sub(1),
                    *position,
                    edit,
                    *author_id,
                );
                (*final_revision, op)
            })),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_decode_op_submit_insert() {
        let raw = r#"{"type":"op_submit","section":"methods","base_revision":11,
                      "kind":"insert","position":3,"payload":"ins"}"#;
        let msg = ClientMessage::decode(raw).unwrap();
        match msg {
            ClientMessage::OpSubmit {
                section,
                base_revision,
                kind,
                position,
                payload,
            } => {
                assert_eq!(section, "methods");
                assert_eq!(base_revision, 11);
                assert_eq!(position, 3);
                assert_eq!(edit_from_wire(kind, payload).unwrap(), Edit::Insert("ins".into()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_op_submit_delete() {
        let raw = r#"{"type":"op_submit","section":"abstract","base_revision":0,
                      "kind":"delete","position":0,"payload":5}"#;
        let ClientMessage::OpSubmit { kind, payload, .. } = ClientMessage::decode(raw).unwrap() else {
            panic!("expected op_submit");
        };
        assert_eq!(edit_from_wire(kind, payload).unwrap(), Edit::Delete(5));
    }

    #[test]
    fn test_payload_mismatch_rejected() {
        let err = edit_from_wire(OpKind::Delete, Some(Payload::Text("x".into()))).unwrap_err();
        assert_eq!(err, ProtocolError::PayloadMismatch { kind: OpKind::Delete });
        assert_eq!(edit_from_wire(OpKind::Insert, None), Err(ProtocolError::MissingPayload));
    }

    #[test]
    fn test_negative_delete_length_is_malformed() {
        let raw = r#"{"type":"op_submit","section":"s","base_revision":0,
                      "kind":"delete","position":0,"payload":-3}"#;
        assert!(matches!(
            ClientMessage::decode(raw),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[test]
    fn test_unknown_type_is_error() {
        assert!(ClientMessage::decode(r#"{"type":"teleport"}"#).is_err());
        assert!(ClientMessage::decode("not json").is_err());
    }

    #[test]
    fn test_unit_variants() {
        assert_eq!(ClientMessage::decode(r#"{"type":"heartbeat"}"#).unwrap(), ClientMessage::Heartbeat);
        assert_eq!(ClientMessage::Leave.encode().unwrap(), r#"{"type":"leave"}"#);
    }

    #[test]
    fn test_cursor_update_without_seq() {
        let msg = ClientMessage::decode(
            r#"{"type":"cursor_update","section":"intro","line":2,"column":7}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::CursorUpdate {
                section: "intro".into(),
                line: 2,
                column: 7,
                seq: None
            }
        );
        let encoded = msg.encode().unwrap();
        assert!(!encoded.contains("seq"));
    }

    #[test]
    fn test_op_accepted_shape() {
        let author = Uuid::from_u128(7);
        let op = Operation::delete("methods", 11, 0, 5, author);
        let frame = ServerMessage::accepted(&AcceptedOp { revision: 12, op });
        let value: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "op_accepted");
        assert_eq!(value["final_revision"], 12);
        assert_eq!(value["kind"], "delete");
        assert_eq!(value["payload"], 5);

        let (revision, rebuilt) = frame.accepted_operation().unwrap().unwrap();
        assert_eq!(revision, 12);
        assert_eq!(rebuilt.base_revision(), 11);
        assert_eq!(rebuilt.author_id(), author);
    }

    #[test]
    fn test_op_rejected_shape() {
        let frame = ServerMessage::OpRejected {
            section: "s".into(),
            reason: RejectReason::FutureRevision,
        };
        assert_eq!(
            frame.encode().unwrap(),
            r#"{"type":"op_rejected","section":"s","reason":"future_revision"}"#
        );
    }
}
