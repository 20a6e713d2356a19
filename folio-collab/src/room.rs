//! Document rooms and their section serializers.
//!
//! ```text
//!                        RoomRegistry (RwLock<HashMap<doc, Arc<DocumentRoom>>>)
//!                                   │
//!                    ┌──────────────┴──────────────┐
//!                    ▼                             ▼
//!              DocumentRoom "paper-1"        DocumentRoom "paper-2"
//!              ├── presence (Mutex)
//!              ├── BroadcastGroup ◄───────────────┐
//!              └── sections                       │ op_accepted / lock_*
//!                   ├── "abstract" ─► actor task ─┤
//!                   └── "methods"  ─► actor task ─┘
//! ```
//!
//! Each section is owned by one actor task. Connections talk to it over an
//! mpsc command channel and get replies on oneshot channels; the actor is
//! the only writer of the section's text, log and lock, so commands for a
//! section are totally ordered. Acceptances and lock changes are broadcast
//! from inside the actor, which keeps every subscriber's view in revision
//! order.
//!
//! A room is torn down when its last participant leaves or is evicted:
//! it is marked closed, every section persists its final text and stops,
//! and only then is the room removed from the registry. A join racing with
//! teardown waits for it and then opens a fresh room.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;

use crate::auth::UserIdentity;
use crate::broadcast::{Audience, BroadcastGroup, Envelope};
use crate::error::{CollabError, RejectReason};
use crate::locks::{LockOutcome, ReleaseOutcome, SectionLock};
use crate::operation::{Operation, ParticipantId};
use crate::presence::{Participant, PresenceRegistry, UnknownParticipant};
use crate::protocol::{PresenceEntry, ServerMessage};
use crate::section::{AcceptedOp, SectionConfig, SectionState};
use crate::storage::{
    load_blocking, persist_with_retry, RetryPolicy, SectionSnapshot, SnapshotStore, StoreError,
};

pub type DocumentId = String;

// ───────────────────────────────────────────────────────────────────
// Section actor
// ───────────────────────────────────────────────────────────────────

enum SectionCommand {
    Submit {
        op: Operation,
        reply: oneshot::Sender<Result<Vec<AcceptedOp>, RejectReason>>,
    },
    RequestLock {
        participant: ParticipantId,
        reply: oneshot::Sender<LockOutcome>,
    },
    ReleaseLock {
        participant: ParticipantId,
        reply: oneshot::Sender<ReleaseOutcome>,
    },
    ReleaseHeldBy {
        participant: ParticipantId,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<SectionSnapshot>,
    },
    PersistFinished {
        revision: u64,
        result: Result<(), StoreError>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable address of a section actor.
#[derive(Clone)]
pub struct SectionHandle {
    name: Arc<str>,
    tx: mpsc::Sender<SectionCommand>,
}

impl SectionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn call<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> SectionCommand,
    ) -> Result<R, CollabError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| CollabError::RoomClosed)?;
        rx.await.map_err(|_| CollabError::RoomClosed)
    }

    /// Transform and commit an operation.
    pub async fn submit(
        &self,
        op: Operation,
    ) -> Result<Result<Vec<AcceptedOp>, RejectReason>, CollabError> {
        self.call(|reply| SectionCommand::Submit { op, reply }).await
    }

    pub async fn request_lock(&self, participant: ParticipantId) -> Result<LockOutcome, CollabError> {
        self.call(|reply| SectionCommand::RequestLock { participant, reply })
            .await
    }

    pub async fn release_lock(
        &self,
        participant: ParticipantId,
    ) -> Result<ReleaseOutcome, CollabError> {
        self.call(|reply| SectionCommand::ReleaseLock { participant, reply })
            .await
    }

    pub async fn release_held_by(&self, participant: ParticipantId) -> Result<bool, CollabError> {
        self.call(|reply| SectionCommand::ReleaseHeldBy { participant, reply })
            .await
    }

    /// Current text and revision.
    pub async fn snapshot(&self) -> Result<SectionSnapshot, CollabError> {
        self.call(|reply| SectionCommand::Snapshot { reply }).await
    }

    async fn shutdown(&self) -> Result<(), CollabError> {
        self.call(|reply| SectionCommand::Shutdown { reply }).await
    }
}

struct SectionActor {
    document_id: DocumentId,
    state: SectionState,
    lock: SectionLock,
    config: SectionConfig,
    retry: RetryPolicy,
    broadcast: Arc<BroadcastGroup>,
    /// `None` when the initial load failed; the section then never persists
    /// so it cannot overwrite good data with an empty text.
    store: Option<Arc<dyn SnapshotStore>>,
    self_tx: mpsc::WeakSender<SectionCommand>,
    persisted_revision: u64,
    persist_in_flight: bool,
}

impl SectionActor {
    fn spawn(
        document_id: DocumentId,
        name: String,
        config: SectionConfig,
        retry: RetryPolicy,
        broadcast: Arc<BroadcastGroup>,
        store: Arc<dyn SnapshotStore>,
    ) -> (SectionHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.command_capacity.max(1));
        let self_tx = tx.downgrade();
        let handle = SectionHandle {
            name: Arc::from(name.as_str()),
            tx,
        };

        let task = tokio::spawn(async move {
            let (state, store) =
                match load_blocking(store.clone(), document_id.clone(), name.clone()).await {
                    Ok(Some(snapshot)) => {
                        log::info!(
                            "Section {document_id}/{name} loaded at revision {}",
                            snapshot.revision
                        );
                        (SectionState::from_snapshot(name, snapshot), Some(store))
                    }
                    Ok(None) => (SectionState::new(name), Some(store)),
                    Err(e) => {
                        log::error!(
                            "Failed to load section {document_id}/{name}: {e}; persistence disabled"
                        );
                        (SectionState::new(name), None)
                    }
                };

            let persisted_revision = state.revision();
            let actor = SectionActor {
                document_id,
                state,
                lock: SectionLock::new(),
                config,
                retry,
                broadcast,
                store,
                self_tx,
                persisted_revision,
                persist_in_flight: false,
            };
            actor.run(rx).await;
        });

        (handle, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SectionCommand>) {
        let mut ticker = tokio::time::interval(self.config.lock_check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(SectionCommand::Shutdown { reply }) => {
                            self.persist_final(&mut rx).await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(cmd) => self.handle(cmd),
                        None => {
                            self.persist_final(&mut rx).await;
                            break;
                        }
                    }
                }
                _ = ticker.tick() => self.expire_idle_lock(),
            }
        }

        log::debug!(
            "Section {}/{} stopped at revision {}",
            self.document_id,
            self.state.name(),
            self.state.revision()
        );
    }

    fn handle(&mut self, cmd: SectionCommand) {
        match cmd {
            SectionCommand::Submit { op, reply } => {
                let result = self.submit(op);
                let _ = reply.send(result);
            }
            SectionCommand::RequestLock { participant, reply } => {
                let outcome = self.lock.request(participant, Instant::now());
                if outcome == LockOutcome::Granted {
                    self.announce(ServerMessage::LockGranted {
                        section: self.state.name().to_string(),
                        holder: participant,
                    });
                }
                let _ = reply.send(outcome);
            }
            SectionCommand::ReleaseLock { participant, reply } => {
                let outcome = self.lock.release(participant);
                if outcome == ReleaseOutcome::Released {
                    self.announce_released(participant);
                }
                let _ = reply.send(outcome);
            }
            SectionCommand::ReleaseHeldBy { participant, reply } => {
                let released = self.lock.release_if_held_by(participant);
                if released {
                    self.announce_released(participant);
                }
                let _ = reply.send(released);
            }
            SectionCommand::Snapshot { reply } => {
                let _ = reply.send(self.state.snapshot());
            }
            SectionCommand::PersistFinished { revision, result } => {
                self.persist_in_flight = false;
                match result {
                    Ok(()) => {
                        self.persisted_revision = self.persisted_revision.max(revision);
                        let folded = self
                            .state
                            .trim_after_persist(self.persisted_revision, self.config.retain_ops);
                        log::debug!(
                            "Section {}/{} persisted @{revision}, folded {folded} ops",
                            self.document_id,
                            self.state.name()
                        );
                    }
                    Err(e) => log::error!(
                        "Giving up persisting {}/{}@{revision}: {e}",
                        self.document_id,
                        self.state.name()
                    ),
                }
                self.maybe_persist();
            }
            // Handled in run().
            SectionCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn submit(&mut self, op: Operation) -> Result<Vec<AcceptedOp>, RejectReason> {
        let author = op.author_id();
        let accepted = self.state.submit(op)?;

        self.lock.touch(author, Instant::now());
        for entry in &accepted {
            self.announce(ServerMessage::accepted(entry));
        }

        let capped = self.state.enforce_log_cap(self.config.max_log_len);
        if capped > 0 {
            log::debug!("Section {} log cap folded {capped} ops", self.state.name());
        }
        self.maybe_persist();
        Ok(accepted)
    }

    fn announce(&self, msg: ServerMessage) {
        if let Err(e) = self.broadcast.send(Audience::All, &msg) {
            log::error!("Failed to encode broadcast for {}: {e}", self.state.name());
        }
    }

    fn announce_released(&self, holder: ParticipantId) {
        self.announce(ServerMessage::LockReleased {
            section: self.state.name().to_string(),
            holder,
        });
    }

    fn expire_idle_lock(&mut self) {
        if let Some(holder) = self
            .lock
            .expire_idle(Instant::now(), self.config.lock_idle_timeout)
        {
            log::info!(
                "Lock on {}/{} expired after idling ({holder})",
                self.document_id,
                self.state.name()
            );
            self.announce_released(holder);
        }
    }

    fn maybe_persist(&mut self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let pending = self.state.revision().saturating_sub(self.persisted_revision);
        if self.persist_in_flight || pending < self.config.persist_every.max(1) {
            return;
        }
        let Some(tx) = self.self_tx.upgrade() else {
            return;
        };

        self.persist_in_flight = true;
        let snapshot = self.state.snapshot();
        let revision = snapshot.revision;
        let document_id = self.document_id.clone();
        let section = self.state.name().to_string();
        let retry = self.retry;
        tokio::spawn(async move {
            let result = persist_with_retry(store, document_id, section, snapshot, retry).await;
            let _ = tx.send(SectionCommand::PersistFinished { revision, result }).await;
        });
    }

    /// Persist the final text once any background write has landed, so an
    /// older snapshot can never overwrite it.
    async fn persist_final(&mut self, rx: &mut mpsc::Receiver<SectionCommand>) {
        let Some(store) = self.store.clone() else {
            return;
        };
        while self.persist_in_flight {
            match rx.recv().await {
                Some(SectionCommand::PersistFinished { revision, result }) => {
                    self.persist_in_flight = false;
                    if result.is_ok() {
                        self.persisted_revision = self.persisted_revision.max(revision);
                    }
                }
                // Stopping: dropped replies surface as RoomClosed.
                Some(_) => {}
                None => break,
            }
        }
        if self.state.revision() == self.persisted_revision {
            return;
        }
        let snapshot = self.state.snapshot();
        let revision = snapshot.revision;
        match persist_with_retry(
            store,
            self.document_id.clone(),
            self.state.name().to_string(),
            snapshot,
            self.retry,
        )
        .await
        {
            Ok(()) => {
                self.persisted_revision = revision;
                log::info!(
                    "Persisted final text of {}/{} @{revision}",
                    self.document_id,
                    self.state.name()
                );
            }
            Err(e) => log::error!(
                "Failed to persist final text of {}/{}: {e}",
                self.document_id,
                self.state.name()
            ),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Document room
// ───────────────────────────────────────────────────────────────────

struct SectionEntry {
    handle: SectionHandle,
    task: JoinHandle<()>,
}

/// Everything live for one open manuscript.
pub struct DocumentRoom {
    document_id: DocumentId,
    presence: Mutex<PresenceRegistry>,
    sections: Mutex<HashMap<String, SectionEntry>>,
    broadcast: Arc<BroadcastGroup>,
    store: Arc<dyn SnapshotStore>,
    section_config: SectionConfig,
    retry: RetryPolicy,
    max_participants: usize,
    max_sections: usize,
    max_section_name_len: usize,
    closed: AtomicBool,
    torn_down: watch::Sender<bool>,
}

impl DocumentRoom {
    fn new(document_id: DocumentId, settings: &RoomSettings, store: Arc<dyn SnapshotStore>) -> Self {
        let (torn_down, _) = watch::channel(false);
        Self {
            document_id,
            presence: Mutex::new(PresenceRegistry::new()),
            sections: Mutex::new(HashMap::new()),
            broadcast: Arc::new(BroadcastGroup::new(settings.broadcast_capacity)),
            store,
            section_config: settings.section.clone(),
            retry: settings.retry,
            max_participants: settings.max_participants,
            max_sections: settings.max_sections,
            max_section_name_len: settings.max_section_name_len,
            closed: AtomicBool::new(false),
            torn_down,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn broadcast(&self) -> &Arc<BroadcastGroup> {
        &self.broadcast
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn participant_count(&self) -> usize {
        self.presence.lock().len()
    }

    pub fn presence_snapshot(&self) -> Vec<PresenceEntry> {
        self.presence.lock().snapshot()
    }

    pub fn section_count(&self) -> usize {
        self.sections.lock().len()
    }

    /// Handle to a section's actor, starting it on first use.
    ///
    /// New sections are refused once the room holds `max_sections` actors.
    pub fn section(&self, name: &str) -> Result<SectionHandle, CollabError> {
        if name.is_empty() {
            return Err(CollabError::ProtocolViolation("empty section name".into()));
        }
        if name.chars().count() > self.max_section_name_len {
            return Err(CollabError::ProtocolViolation(format!(
                "section name longer than {} characters",
                self.max_section_name_len
            )));
        }
        if self.is_closed() {
            return Err(CollabError::RoomClosed);
        }
        let mut sections = self.sections.lock();
        if let Some(entry) = sections.get(name) {
            return Ok(entry.handle.clone());
        }
        if sections.len() >= self.max_sections {
            log::warn!(
                "Room {} refused section {name}: {} already open",
                self.document_id,
                sections.len()
            );
            return Err(CollabError::SectionLimit(self.max_sections));
        }
        let (handle, task) = SectionActor::spawn(
            self.document_id.clone(),
            name.to_string(),
            self.section_config.clone(),
            self.retry,
            self.broadcast.clone(),
            self.store.clone(),
        );
        log::debug!("Started section {}/{name}", self.document_id);
        sections.insert(
            name.to_string(),
            SectionEntry {
                handle: handle.clone(),
                task,
            },
        );
        Ok(handle)
    }

    fn section_handles(&self) -> Vec<SectionHandle> {
        self.sections
            .lock()
            .values()
            .map(|entry| entry.handle.clone())
            .collect()
    }

    fn join(&self, user: &UserIdentity, now: Instant) -> Result<Participant, CollabError> {
        if self.is_closed() {
            return Err(CollabError::RoomClosed);
        }
        let mut presence = self.presence.lock();
        if presence.len() >= self.max_participants {
            return Err(CollabError::RoomFull(self.max_participants));
        }
        Ok(presence.join(&user.user_id, &user.display_name, now))
    }

    pub fn heartbeat(&self, participant: ParticipantId, now: Instant) -> Result<(), UnknownParticipant> {
        self.presence.lock().heartbeat(participant, now)
    }

    /// Record a cursor move and relay it to everyone else. Stale sequence
    /// numbers are dropped silently.
    pub fn update_cursor(
        &self,
        participant: ParticipantId,
        section: &str,
        line: u32,
        column: u32,
        seq: Option<u64>,
        now: Instant,
    ) -> Result<bool, UnknownParticipant> {
        let relayed = self
            .presence
            .lock()
            .update_cursor(participant, section, line, column, seq, now)?;
        if let Some(seq) = relayed {
            let msg = ServerMessage::CursorUpdate {
                participant_id: participant,
                section: section.to_string(),
                line,
                column,
                seq,
            };
            if let Err(e) = self.broadcast.send(Audience::AllExcept(participant), &msg) {
                log::error!("Failed to encode cursor for {}: {e}", self.document_id);
            }
        }
        Ok(relayed.is_some())
    }

    fn announce_presence(&self) {
        let msg = ServerMessage::PresenceChanged {
            presence_snapshot: self.presence_snapshot(),
        };
        if let Err(e) = self.broadcast.send(Audience::All, &msg) {
            log::error!("Failed to encode presence for {}: {e}", self.document_id);
        }
    }

    async fn release_locks_of(&self, participant: ParticipantId) {
        for handle in self.section_handles() {
            match handle.release_held_by(participant).await {
                Ok(true) => log::debug!(
                    "Released {}/{} held by departed {participant}",
                    self.document_id,
                    handle.name()
                ),
                Ok(false) => {}
                Err(e) => log::debug!("Lock release on {} skipped: {e}", handle.name()),
            }
        }
    }

    /// Stop every section actor after it persists its final text.
    async fn shutdown_sections(&self) {
        let entries: Vec<SectionEntry> = self.sections.lock().drain().map(|(_, e)| e).collect();
        for entry in entries {
            if let Err(e) = entry.handle.shutdown().await {
                log::warn!("Section {} already stopped: {e}", entry.handle.name());
            }
            if let Err(e) = entry.task.await {
                log::error!("Section {} task failed: {e}", entry.handle.name());
            }
        }
    }

    async fn wait_torn_down(&self) {
        let mut rx = self.torn_down.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

/// Settings shared by every room.
#[derive(Debug, Clone)]
pub struct RoomSettings {
    pub max_participants: usize,
    /// Open section actors per room
    pub max_sections: usize,
    /// Longest accepted section name, in characters
    pub max_section_name_len: usize,
    pub broadcast_capacity: usize,
    pub section: SectionConfig,
    pub retry: RetryPolicy,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            max_participants: 100,
            max_sections: 256,
            max_section_name_len: 128,
            broadcast_capacity: 256,
            section: SectionConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// A successful join.
pub struct Membership {
    pub room: Arc<DocumentRoom>,
    pub participant: Participant,
    pub presence_snapshot: Vec<PresenceEntry>,
    pub receiver: tokio::sync::broadcast::Receiver<Envelope>,
}

/// All open rooms, keyed by document id.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<DocumentId, Arc<DocumentRoom>>>,
    settings: RoomSettings,
    store: Arc<dyn SnapshotStore>,
}

impl RoomRegistry {
    pub fn new(settings: RoomSettings, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            settings,
            store,
        }
    }

    /// Add a participant to a document's room, creating the room if needed.
    pub async fn join(
        &self,
        document_id: &str,
        user: &UserIdentity,
        now: Instant,
    ) -> Result<Membership, CollabError> {
        loop {
            let mut rooms = self.rooms.write().await;
            let room = match rooms.get(document_id) {
                Some(room) if room.is_closed() => {
                    let room = room.clone();
                    drop(rooms);
                    room.wait_torn_down().await;
                    continue;
                }
                Some(room) => room.clone(),
                None => {
                    let room = Arc::new(DocumentRoom::new(
                        document_id.to_string(),
                        &self.settings,
                        self.store.clone(),
                    ));
                    rooms.insert(document_id.to_string(), room.clone());
                    log::info!("Room {document_id} opened");
                    room
                }
            };

            let participant = room.join(user, now)?;
            let receiver = room.broadcast.subscribe();
            let presence_snapshot = room.presence_snapshot();
            room.announce_presence();
            log::info!(
                "{} ({}) joined {document_id} as {}",
                participant.display_name,
                participant.user_id,
                participant.participant_id
            );

            return Ok(Membership {
                room,
                participant,
                presence_snapshot,
                receiver,
            });
        }
    }

    /// Remove a participant; tears the room down when it empties.
    pub async fn leave(&self, room: &Arc<DocumentRoom>, participant: ParticipantId) {
        let (departed, emptied) = {
            let _rooms = self.rooms.write().await;
            let mut presence = room.presence.lock();
            let departed = presence.leave(participant);
            let emptied = departed.is_some() && presence.is_empty();
            if emptied {
                room.closed.store(true, Ordering::Release);
            }
            (departed, emptied)
        };

        let Some(departed) = departed else {
            return;
        };
        log::info!(
            "{} left {} ({})",
            departed.display_name,
            room.document_id,
            departed.participant_id
        );
        self.finish_departures(room, &[departed], emptied).await;
    }

    /// Evict participants whose heartbeat is older than `timeout`.
    ///
    /// Returns the number of evicted participants.
    pub async fn sweep(&self, now: Instant, timeout: Duration) -> usize {
        let mut departures = Vec::new();
        {
            let rooms = self.rooms.write().await;
            for room in rooms.values() {
                if room.is_closed() {
                    continue;
                }
                let mut presence = room.presence.lock();
                let evicted = presence.evict_expired(now, timeout);
                if evicted.is_empty() {
                    continue;
                }
                let emptied = presence.is_empty();
                if emptied {
                    room.closed.store(true, Ordering::Release);
                }
                departures.push((room.clone(), evicted, emptied));
            }
        }

        let mut count = 0;
        for (room, evicted, emptied) in departures {
            for participant in &evicted {
                log::info!(
                    "Evicted {} from {} (heartbeat timeout)",
                    participant.participant_id,
                    room.document_id
                );
                room.broadcast.evict(participant.participant_id);
            }
            count += evicted.len();
            self.finish_departures(&room, &evicted, emptied).await;
        }
        count
    }

    async fn finish_departures(&self, room: &Arc<DocumentRoom>, departed: &[Participant], emptied: bool) {
        if emptied {
            self.teardown(room).await;
            return;
        }
        for participant in departed {
            room.release_locks_of(participant.participant_id).await;
        }
        room.announce_presence();
    }

    async fn teardown(&self, room: &Arc<DocumentRoom>) {
        room.shutdown_sections().await;
        {
            let mut rooms = self.rooms.write().await;
            if rooms
                .get(&room.document_id)
                .is_some_and(|current| Arc::ptr_eq(current, room))
            {
                rooms.remove(&room.document_id);
            }
        }
        room.torn_down.send_replace(true);
        log::info!("Room {} closed", room.document_id);
    }

    pub async fn room(&self, document_id: &str) -> Option<Arc<DocumentRoom>> {
        self.rooms.read().await.get(document_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<DocumentId> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Close every room, persisting all sections.
    pub async fn shutdown(&self) {
        let rooms: Vec<Arc<DocumentRoom>> = {
            let rooms = self.rooms.read().await;
            rooms.values().cloned().collect()
        };
        for room in rooms {
            room.closed.store(true, Ordering::Release);
            self.teardown(&room).await;
            room.broadcast().close_all();
        }
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.flush()).await {
            Ok(Ok(())) => log::info!("Section store flushed"),
            Ok(Err(e)) => log::error!("Failed to flush section store: {e}"),
            Err(e) => log::error!("Store flush task failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Frame;
    use crate::storage::MemoryStore;
    use tokio::sync::broadcast::Receiver;

    fn settings() -> RoomSettings {
        RoomSettings {
            max_participants: 3,
            max_sections: 4,
            max_section_name_len: 16,
            broadcast_capacity: 64,
            section: SectionConfig::for_testing(),
            retry: RetryPolicy::for_testing(),
        }
    }

    fn registry() -> (RoomRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (RoomRegistry::new(settings(), store.clone()), store)
    }

    fn drain(rx: &mut Receiver<Envelope>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            if let Frame::Message(text) = envelope.frame {
                out.push(ServerMessage::decode(&text).unwrap());
            }
        }
        out
    }

    #[tokio::test]
    async fn test_join_creates_room_and_announces() {
        let (registry, _) = registry();
        let now = Instant::now();
        let mut a = registry.join("doc", &UserIdentity::new("a", "Ada"), now).await.unwrap();
        assert_eq!(a.presence_snapshot.len(), 1);
        assert_eq!(registry.room_count().await, 1);

        let b = registry.join("doc", &UserIdentity::new("b", "Bo"), now).await.unwrap();
        assert!(Arc::ptr_eq(&a.room, &b.room));
        assert_eq!(b.presence_snapshot.len(), 2);

        let frames = drain(&mut a.receiver);
        assert!(frames.iter().any(|m| matches!(
            m,
            ServerMessage::PresenceChanged { presence_snapshot } if presence_snapshot.len() == 2
        )));
    }

    #[tokio::test]
    async fn test_room_full() {
        let (registry, _) = registry();
        let now = Instant::now();
        for i in 0..3 {
            registry
                .join("doc", &UserIdentity::new(format!("u{i}"), "x"), now)
                .await
                .unwrap();
        }
        let err = registry
            .join("doc", &UserIdentity::new("late", "x"), now)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CollabError::RoomFull(3)));
    }

    #[tokio::test]
    async fn test_submit_broadcasts_in_revision_order() {
        let (registry, _) = registry();
        let mut m = registry
            .join("doc", &UserIdentity::new("a", "Ada"), Instant::now())
            .await
            .unwrap();
        let pid = m.participant.participant_id;
        let section = m.room.section("abstract").unwrap();

        section.submit(Operation::insert("abstract", 0, 0, "Hello", pid)).await.unwrap().unwrap();
        section.submit(Operation::insert("abstract", 1, 5, "!", pid)).await.unwrap().unwrap();

        let revisions: Vec<u64> = drain(&mut m.receiver)
            .into_iter()
            .filter_map(|msg| match msg {
                ServerMessage::OpAccepted { final_revision, .. } => Some(final_revision),
                _ => None,
            })
            .collect();
        assert_eq!(revisions, vec![1, 2]);
        assert_eq!(section.snapshot().await.unwrap().text, "Hello!");
    }

    #[tokio::test]
    async fn test_concurrent_lock_requests_single_grant() {
        let (registry, _) = registry();
        let now = Instant::now();
        let a = registry.join("doc", &UserIdentity::new("a", "A"), now).await.unwrap();
        let b = registry.join("doc", &UserIdentity::new("b", "B"), now).await.unwrap();
        let section = a.room.section("intro").unwrap();

        let (ra, rb) = tokio::join!(
            section.request_lock(a.participant.participant_id),
            section.request_lock(b.participant.participant_id)
        );
        let outcomes = [ra.unwrap(), rb.unwrap()];
        let grants = outcomes.iter().filter(|o| **o == LockOutcome::Granted).count();
        assert_eq!(grants, 1);
    }

    #[tokio::test]
    async fn test_leave_releases_locks() {
        let (registry, _) = registry();
        let now = Instant::now();
        let a = registry.join("doc", &UserIdentity::new("a", "A"), now).await.unwrap();
        let mut b = registry.join("doc", &UserIdentity::new("b", "B"), now).await.unwrap();
        let section = a.room.section("intro").unwrap();
        let a_id = a.participant.participant_id;
        section.request_lock(a_id).await.unwrap();
        drain(&mut b.receiver);

        registry.leave(&a.room, a_id).await;

        let frames = drain(&mut b.receiver);
        assert!(frames.iter().any(|m| matches!(
            m,
            ServerMessage::LockReleased { holder, .. } if *holder == a_id
        )));
        assert_eq!(
            section.request_lock(b.participant.participant_id).await.unwrap(),
            LockOutcome::Granted
        );
    }

    #[tokio::test]
    async fn test_last_leave_persists_and_removes_room() {
        let (registry, store) = registry();
        let m = registry
            .join("doc", &UserIdentity::new("a", "A"), Instant::now())
            .await
            .unwrap();
        let pid = m.participant.participant_id;
        let section = m.room.section("methods").unwrap();
        section.submit(Operation::insert("methods", 0, 0, "text", pid)).await.unwrap().unwrap();

        registry.leave(&m.room, pid).await;

        assert_eq!(registry.room_count().await, 0);
        assert!(m.room.is_closed());
        let saved = store.load_section_snapshot("doc", "methods").unwrap().unwrap();
        assert_eq!(saved, SectionSnapshot { text: "text".into(), revision: 1 });
        assert!(matches!(m.room.section("methods"), Err(CollabError::RoomClosed)));
    }

    #[derive(Default)]
    struct FlushCountingStore {
        inner: MemoryStore,
        flushes: std::sync::atomic::AtomicUsize,
    }

    impl SnapshotStore for FlushCountingStore {
        fn load_section_snapshot(&self, document_id: &str, section: &str) -> Result<Option<SectionSnapshot>, StoreError> {
            self.inner.load_section_snapshot(document_id, section)
        }

        fn persist_section_snapshot(
            &self,
            document_id: &str,
            section: &str,
            snapshot: &SectionSnapshot,
        ) -> Result<(), StoreError> {
            self.inner.persist_section_snapshot(document_id, section, snapshot)
        }

        fn flush(&self) -> Result<(), StoreError> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shutdown_persists_then_flushes_store() {
        let store = Arc::new(FlushCountingStore::default());
        let registry = RoomRegistry::new(settings(), store.clone());
        let m = registry
            .join("doc", &UserIdentity::new("a", "A"), Instant::now())
            .await
            .unwrap();
        let pid = m.participant.participant_id;
        let section = m.room.section("intro").unwrap();
        section.submit(Operation::insert("intro", 0, 0, "draft", pid)).await.unwrap().unwrap();

        registry.shutdown().await;

        assert_eq!(store.flushes.load(Ordering::SeqCst), 1);
        let saved = store.load_section_snapshot("doc", "intro").unwrap().unwrap();
        assert_eq!(saved, SectionSnapshot { text: "draft".into(), revision: 1 });
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_reopened_room_resumes_persisted_revision() {
        let (registry, store) = registry();
        store
            .persist_section_snapshot("doc", "abstract", &SectionSnapshot { text: "abc".into(), revision: 9 })
            .unwrap();
        let m = registry
            .join("doc", &UserIdentity::new("a", "A"), Instant::now())
            .await
            .unwrap();
        let snapshot = m.room.section("abstract").unwrap().snapshot().await.unwrap();
        assert_eq!(snapshot.revision, 9);
        assert_eq!(snapshot.text, "abc");
    }

    #[tokio::test]
    async fn test_sweep_evicts_and_releases() {
        let (registry, _) = registry();
        let start = Instant::now();
        let a = registry.join("doc", &UserIdentity::new("a", "A"), start).await.unwrap();
        let mut b = registry.join("doc", &UserIdentity::new("b", "B"), start).await.unwrap();
        let a_id = a.participant.participant_id;
        let b_id = b.participant.participant_id;
        let section = a.room.section("intro").unwrap();
        section.request_lock(a_id).await.unwrap();
        drain(&mut b.receiver);

        a.room.heartbeat(b_id, start + Duration::from_secs(20)).unwrap();
        let evicted = registry.sweep(start + Duration::from_secs(31), Duration::from_secs(30)).await;
        assert_eq!(evicted, 1);

        let mut saw_evict = false;
        let mut frames = Vec::new();
        while let Ok(envelope) = b.receiver.try_recv() {
            match envelope.frame {
                Frame::Evicted => {
                    assert_eq!(envelope.audience, Audience::Only(a_id));
                    saw_evict = true;
                }
                Frame::Message(text) => frames.push(ServerMessage::decode(&text).unwrap()),
                Frame::Shutdown => panic!("unexpected shutdown"),
            }
        }
        assert!(saw_evict);
        assert!(frames.iter().any(|m| matches!(m, ServerMessage::LockReleased { .. })));
        let last_presence = frames
            .iter()
            .rev()
            .find_map(|m| match m {
                ServerMessage::PresenceChanged { presence_snapshot } => Some(presence_snapshot),
                _ => None,
            })
            .unwrap();
        assert!(last_presence.iter().all(|e| e.participant_id != a_id));
        assert!(a.room.heartbeat(a_id, start).is_err());
    }

    #[tokio::test]
    async fn test_rejoin_after_teardown_gets_fresh_room() {
        let (registry, _) = registry();
        let now = Instant::now();
        let first = registry.join("doc", &UserIdentity::new("a", "A"), now).await.unwrap();
        registry.leave(&first.room, first.participant.participant_id).await;

        let second = registry.join("doc", &UserIdentity::new("a", "A"), now).await.unwrap();
        assert!(!Arc::ptr_eq(&first.room, &second.room));
        assert!(!second.room.is_closed());
    }

    #[tokio::test]
    async fn test_section_count_and_name_limited() {
        let (registry, _) = registry();
        let a = registry
            .join("doc", &UserIdentity::new("a", "A"), Instant::now())
            .await
            .unwrap();

        for i in 0..4 {
            a.room.section(&format!("s{i}")).unwrap();
        }
        assert!(matches!(a.room.section("s4"), Err(CollabError::SectionLimit(4))));
        assert_eq!(a.room.section_count(), 4);

        // Existing sections stay reachable at the cap.
        let handle = a.room.section("s0").unwrap();
        assert_eq!(handle.snapshot().await.unwrap().revision, 0);

        let long = "x".repeat(17);
        assert!(matches!(a.room.section(&long), Err(CollabError::ProtocolViolation(_))));
        assert!(matches!(a.room.section(""), Err(CollabError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_cursor_relay_skips_author() {
        let (registry, _) = registry();
        let now = Instant::now();
        let a = registry.join("doc", &UserIdentity::new("a", "A"), now).await.unwrap();
        let a_id = a.participant.participant_id;
        let mut rx = a.room.broadcast().subscribe();

        assert!(a.room.update_cursor(a_id, "intro", 1, 2, Some(1), now).unwrap());
        assert!(!a.room.update_cursor(a_id, "intro", 1, 3, Some(1), now).unwrap());

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.audience, Audience::AllExcept(a_id));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_idle_lock_expires() {
        let (registry, _) = registry();
        let mut m = registry
            .join("doc", &UserIdentity::new("a", "A"), Instant::now())
            .await
            .unwrap();
        let pid = m.participant.participant_id;
        let section = m.room.section("intro").unwrap();
        section.request_lock(pid).await.unwrap();
        drain(&mut m.receiver);

        tokio::time::sleep(Duration::from_millis(600)).await;

        let frames = drain(&mut m.receiver);
        assert!(frames.iter().any(|msg| matches!(
            msg,
            ServerMessage::LockReleased { holder, .. } if *holder == pid
        )));
    }
}
