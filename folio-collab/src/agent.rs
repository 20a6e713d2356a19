//! Client sync agent: the client half of the operation protocol.
//!
//! Per open section the agent keeps a [`SectionReplica`]:
//!
//! ```text
//!   text ── revision ── in_flight (sent, awaiting op_accepted)
//!                   └── buffered  (applied locally, not yet sent)
//! ```
//!
//! Local edits apply immediately. At most one submit is in flight per
//! section; the next buffered edit goes out once every piece of the
//! in-flight one is acknowledged. Remote operations are transformed
//! against everything still pending with the same rules the server uses,
//! so both sides converge.
//!
//! The agent does no I/O: it consumes [`ServerMessage`]s and returns the
//! [`ClientMessage`]s to send plus [`SyncEvent`]s for the application.
//! [`crate::client::SyncClient`] wires it to a socket.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use thiserror::Error;
use uuid::Uuid;

use crate::client::SyncEvent;
use crate::cursors::{CursorOverlays, EditorSurface};
use crate::operation::{apply, transform_sequences, Edit, OutOfBounds, Operation, ParticipantId};
use crate::protocol::{ClientMessage, PresenceEntry, ServerMessage};

/// Server error text telling a lagging client to resync.
pub const RESYNC_REQUIRED: &str = "resync required";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("section {0} is not open")]
    UnknownSection(String),
    #[error("section {0} has not loaded yet")]
    SectionLoading(String),
    #[error("not joined to a document")]
    NotJoined,
    #[error("edit out of bounds: {0}")]
    OutOfBounds(#[from] OutOfBounds),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    /// Waiting for the first snapshot.
    Loading,
    Synced,
    /// Baseline lost; waiting for a fresh snapshot. Local edits buffer.
    Resyncing,
}

/// What an `op_accepted` frame did to a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// Stale, duplicate or arrived while not synced.
    Ignored,
    /// Our own operation came back; carries the next submit, if any.
    Acknowledged(Option<Operation>),
    /// A remote operation, as applied to the local text.
    Applied(Vec<Operation>),
    /// A revision was skipped; the replica is now resyncing.
    Gap,
}

/// Local copy of one section.
#[derive(Debug, Clone)]
pub struct SectionReplica {
    name: String,
    text: String,
    revision: u64,
    in_flight: Vec<Operation>,
    buffered: Vec<Operation>,
    state: ReplicaState,
}

impl SectionReplica {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: String::new(),
            revision: 0,
            in_flight: Vec::new(),
            buffered: Vec::new(),
            state: ReplicaState::Loading,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn state(&self) -> ReplicaState {
        self.state
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.in_flight.is_empty() || !self.buffered.is_empty()
    }

    /// Apply a local edit. Returns the operation to send now, if any.
    pub fn local_edit(
        &mut self,
        position: usize,
        edit: Edit,
        author: ParticipantId,
    ) -> Result<Option<Operation>, AgentError> {
        if self.state == ReplicaState::Loading {
            return Err(AgentError::SectionLoading(self.name.clone()));
        }
        let op = Operation::new(self.name.clone(), self.revision, position, edit, author);
        apply(&mut self.text, &op)?;

        if self.state == ReplicaState::Synced && self.in_flight.is_empty() {
            self.in_flight.push(op.clone());
            Ok(Some(op))
        } else {
            self.buffered.push(op);
            Ok(None)
        }
    }

    /// Integrate an accepted operation committed at `final_revision`.
    pub fn on_accepted(&mut self, final_revision: u64, op: Operation, me: Option<ParticipantId>) -> RemoteOutcome {
        if self.state != ReplicaState::Synced || final_revision <= self.revision {
            return RemoteOutcome::Ignored;
        }
        if final_revision > self.revision + 1 {
            self.state = ReplicaState::Resyncing;
            return RemoteOutcome::Gap;
        }

        if Some(op.author_id()) == me {
            if self.in_flight.is_empty() {
                // Our own op that we never sent on this baseline.
                self.state = ReplicaState::Resyncing;
                return RemoteOutcome::Gap;
            }
            self.in_flight.remove(0);
            self.revision = final_revision;
            return RemoteOutcome::Acknowledged(self.next_submit());
        }

        let (remote, in_flight) = transform_sequences(std::slice::from_ref(&op), &self.in_flight);
        let (remote, buffered) = transform_sequences(&remote, &self.buffered);
        let mut text = self.text.clone();
        for piece in &remote {
            if apply(&mut text, piece).is_err() {
                log::warn!(
                    "Remote op @{final_revision} does not fit local {}; resyncing",
                    self.name
                );
                self.state = ReplicaState::Resyncing;
                return RemoteOutcome::Gap;
            }
        }
        self.text = text;
        self.in_flight = in_flight;
        self.buffered = buffered;
        self.revision = final_revision;
        RemoteOutcome::Applied(remote)
    }

    fn next_submit(&mut self) -> Option<Operation> {
        if !self.in_flight.is_empty() || self.buffered.is_empty() {
            return None;
        }
        let next = self.buffered.remove(0).rebased(self.revision);
        self.in_flight.push(next.clone());
        Some(next)
    }

    /// Drop the baseline. Returns `true` if a snapshot must be requested.
    pub fn begin_resync(&mut self) -> bool {
        match self.state {
            ReplicaState::Synced => {
                self.state = ReplicaState::Resyncing;
                true
            }
            ReplicaState::Loading | ReplicaState::Resyncing => false,
        }
    }

    /// Adopt a server snapshot and replay pending local edits on top of it.
    ///
    /// Returns the first operation to send.
    pub fn on_snapshot(&mut self, text: String, revision: u64, author: ParticipantId) -> Option<Operation> {
        let mut pending = std::mem::take(&mut self.in_flight);
        pending.append(&mut self.buffered);

        self.text = text;
        self.revision = revision;
        self.state = ReplicaState::Synced;

        for op in pending {
            let len = self.text.chars().count();
            let position = op.position().min(len);
            let edit = match op.edit() {
                Edit::Insert(text) => Edit::Insert(text.clone()),
                Edit::Delete(n) => Edit::Delete((*n).min(len - position)),
            };
            let replayed = Operation::new(self.name.clone(), revision, position, edit, author);
            if replayed.is_noop() {
                continue;
            }
            if apply(&mut self.text, &replayed).is_ok() {
                self.buffered.push(replayed);
            }
        }
        self.next_submit()
    }
}

/// Result of feeding the agent one server frame.
#[derive(Debug, Default)]
pub struct Reaction {
    pub outbound: Vec<ClientMessage>,
    pub events: Vec<SyncEvent>,
}

impl Reaction {
    fn send(&mut self, msg: ClientMessage) {
        self.outbound.push(msg);
    }

    fn emit(&mut self, event: SyncEvent) {
        self.events.push(event);
    }
}

/// All client-side sync state for one document.
#[derive(Debug)]
pub struct SyncAgent {
    participant_id: Option<ParticipantId>,
    color: Option<String>,
    sections: HashMap<String, SectionReplica>,
    locks: HashMap<String, ParticipantId>,
    presence: Vec<PresenceEntry>,
    cursors: CursorOverlays,
}

impl SyncAgent {
    pub fn new(cursor_throttle: Duration) -> Self {
        Self {
            participant_id: None,
            color: None,
            sections: HashMap::new(),
            locks: HashMap::new(),
            presence: Vec::new(),
            cursors: CursorOverlays::new(cursor_throttle),
        }
    }

    pub fn participant_id(&self) -> Option<ParticipantId> {
        self.participant_id
    }

    pub fn color(&self) -> Option<&str> {
        self.color.as_deref()
    }

    pub fn is_joined(&self) -> bool {
        self.participant_id.is_some()
    }

    pub fn section(&self, name: &str) -> Option<&SectionReplica> {
        self.sections.get(name)
    }

    pub fn lock_holder(&self, section: &str) -> Option<ParticipantId> {
        self.locks.get(section).copied()
    }

    pub fn presence(&self) -> &[PresenceEntry] {
        &self.presence
    }

    pub fn cursors(&self) -> &CursorOverlays {
        &self.cursors
    }

    fn display_name(&self, participant: ParticipantId) -> Option<String> {
        self.presence
            .iter()
            .find(|e| e.participant_id == participant)
            .map(|e| e.display_name.clone())
    }

    /// Start tracking a section. Returns the snapshot request to send.
    pub fn open_section(&mut self, name: &str) -> Option<ClientMessage> {
        if self.sections.contains_key(name) {
            return None;
        }
        self.sections
            .insert(name.to_string(), SectionReplica::new(name));
        self.is_joined().then(|| ClientMessage::SnapshotRequest {
            section: name.to_string(),
        })
    }

    pub fn insert(
        &mut self,
        section: &str,
        position: usize,
        text: &str,
    ) -> Result<Option<ClientMessage>, AgentError> {
        self.local_edit(section, position, Edit::Insert(text.to_string()))
    }

    pub fn delete(
        &mut self,
        section: &str,
        position: usize,
        len: usize,
    ) -> Result<Option<ClientMessage>, AgentError> {
        self.local_edit(section, position, Edit::Delete(len))
    }

    fn local_edit(
        &mut self,
        section: &str,
        position: usize,
        edit: Edit,
    ) -> Result<Option<ClientMessage>, AgentError> {
        let author = self.participant_id.unwrap_or(Uuid::nil());
        let replica = self
            .sections
            .get_mut(section)
            .ok_or_else(|| AgentError::UnknownSection(section.to_string()))?;
        let op = replica.local_edit(position, edit, author)?;
        Ok(op.as_ref().map(ClientMessage::submit))
    }

    /// Throttled local cursor update.
    pub fn move_cursor(&mut self, section: &str, line: u32, column: u32, now: Instant) -> Option<ClientMessage> {
        let msg = self.cursors.move_local(section, line, column, now);
        msg.filter(|_| self.is_joined())
    }

    /// Send the latest local cursor now.
    pub fn flush_cursor(&mut self, now: Instant) -> Option<ClientMessage> {
        let msg = self.cursors.force_local(now);
        msg.filter(|_| self.is_joined())
    }

    pub fn request_lock(&self, section: &str) -> Result<ClientMessage, AgentError> {
        if !self.is_joined() {
            return Err(AgentError::NotJoined);
        }
        Ok(ClientMessage::LockRequest {
            section: section.to_string(),
        })
    }

    pub fn unlock(&self, section: &str) -> Result<ClientMessage, AgentError> {
        if !self.is_joined() {
            return Err(AgentError::NotJoined);
        }
        Ok(ClientMessage::Unlock {
            section: section.to_string(),
        })
    }

    /// The transport dropped: forget the session, keep local text and
    /// pending edits for replay after the next join.
    pub fn disconnected(&mut self, surface: &mut dyn EditorSurface) {
        self.participant_id = None;
        self.color = None;
        self.locks.clear();
        self.presence.clear();
        self.cursors.set_local_participant(None);
        self.cursors.clear(surface);
        for replica in self.sections.values_mut() {
            replica.begin_resync();
        }
    }

    /// Feed one server frame.
    pub fn handle(&mut self, msg: ServerMessage, surface: &mut dyn EditorSurface) -> Reaction {
        let mut reaction = Reaction::default();
        match msg {
            ServerMessage::Joined {
                participant_id,
                color,
                presence_snapshot,
            } => {
                self.participant_id = Some(participant_id);
                self.color = Some(color.clone());
                self.cursors.set_local_participant(Some(participant_id));
                self.cursors.apply_presence(&presence_snapshot, surface);
                self.presence = presence_snapshot;
                reaction.emit(SyncEvent::Connected {
                    participant_id,
                    color,
                });
                let mut names: Vec<&String> = self.sections.keys().collect();
                names.sort();
                for name in names {
                    reaction.send(ClientMessage::SnapshotRequest {
                        section: name.clone(),
                    });
                }
            }
            ServerMessage::CursorUpdate {
                participant_id,
                section,
                line,
                column,
                seq,
            } => {
                self.cursors
                    .apply_cursor(participant_id, &section, line, column, seq, surface);
            }
            ServerMessage::LockGranted { section, holder } => {
                self.locks.insert(section.clone(), holder);
                reaction.emit(SyncEvent::LockGranted { section, holder });
            }
            ServerMessage::LockDenied { section, holder } => {
                let holder_name = self.display_name(holder);
                reaction.emit(SyncEvent::LockDenied {
                    section,
                    holder,
                    holder_name,
                });
            }
            ServerMessage::LockReleased { section, holder } => {
                if self.locks.get(&section) == Some(&holder) {
                    self.locks.remove(&section);
                }
                reaction.emit(SyncEvent::LockReleased { section, holder });
            }
            msg @ ServerMessage::OpAccepted { .. } => self.on_accepted(&msg, &mut reaction),
            ServerMessage::OpRejected { section, reason } => {
                log::warn!("Operation on {section} rejected: {reason}");
                self.resync(&section, &mut reaction);
            }
            ServerMessage::SectionSnapshot {
                section,
                text,
                revision,
            } => self.on_snapshot(section, text, revision, &mut reaction),
            ServerMessage::PresenceChanged { presence_snapshot } => {
                self.cursors.apply_presence(&presence_snapshot, surface);
                self.presence = presence_snapshot.clone();
                reaction.emit(SyncEvent::PresenceChanged(presence_snapshot));
            }
            ServerMessage::Error { message } => {
                if message == RESYNC_REQUIRED {
                    let mut names: Vec<String> = self.sections.keys().cloned().collect();
                    names.sort();
                    for name in names {
                        self.resync(&name, &mut reaction);
                    }
                }
                reaction.emit(SyncEvent::ServerError(message));
            }
        }
        reaction
    }

    fn resync(&mut self, section: &str, reaction: &mut Reaction) {
        let Some(replica) = self.sections.get_mut(section) else {
            return;
        };
        if replica.begin_resync() {
            reaction.emit(SyncEvent::Resyncing {
                section: section.to_string(),
            });
            reaction.send(ClientMessage::SnapshotRequest {
                section: section.to_string(),
            });
        }
    }

    fn on_accepted(&mut self, msg: &ServerMessage, reaction: &mut Reaction) {
        let (final_revision, op) = match msg.accepted_operation() {
            Some(Ok(accepted)) => accepted,
            Some(Err(e)) => {
                log::warn!("Undecodable op_accepted: {e}");
                return;
            }
            None => return,
        };
        let section = op.section().to_string();
        let me = self.participant_id;
        let Some(replica) = self.sections.get_mut(&section) else {
            return;
        };

        match replica.on_accepted(final_revision, op, me) {
            RemoteOutcome::Ignored => {}
            RemoteOutcome::Acknowledged(next) => {
                reaction.emit(SyncEvent::Acknowledged {
                    section,
                    revision: final_revision,
                });
                if let Some(next) = next {
                    reaction.send(ClientMessage::submit(&next));
                }
            }
            RemoteOutcome::Applied(ops) => {
                reaction.emit(SyncEvent::RemoteEdit {
                    section,
                    revision: final_revision,
                    ops,
                });
            }
            RemoteOutcome::Gap => {
                log::info!("Revision gap on {section} at {final_revision}; resyncing");
                reaction.emit(SyncEvent::Resyncing {
                    section: section.clone(),
                });
                reaction.send(ClientMessage::SnapshotRequest { section });
            }
        }
    }

    fn on_snapshot(&mut self, section: String, text: String, revision: u64, reaction: &mut Reaction) {
        let Some(author) = self.participant_id else {
            return;
        };
        let Some(replica) = self.sections.get_mut(&section) else {
            return;
        };
        if replica.state() == ReplicaState::Synced {
            return;
        }
        let next = replica.on_snapshot(text, revision, author);
        reaction.emit(SyncEvent::SectionLoaded {
            section,
            text: replica.text().to_string(),
            revision,
        });
        if let Some(next) = next {
            reaction.send(ClientMessage::submit(&next));
        }
    }
}

impl Default for SyncAgent {
    fn default() -> Self {
        Self::new(crate::cursors::CURSOR_THROTTLE)
    }
}
