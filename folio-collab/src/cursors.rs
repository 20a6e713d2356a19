//! Remote cursor overlays on the client.
//!
//! Tracks where every other participant's cursor is, discards stale
//! sequence numbers, and drives an [`EditorSurface`] so the editor widget
//! can draw (and erase) labelled, colored cursors. Local cursor moves are
//! throttled to ~30 updates per second.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::operation::ParticipantId;
use crate::presence::{home_slot, CursorColor};
use crate::protocol::{ClientMessage, PresenceEntry};

/// Default minimum spacing between local cursor broadcasts.
pub const CURSOR_THROTTLE: Duration = Duration::from_millis(33);

/// One remote cursor as the editor should draw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorOverlay {
    pub participant_id: ParticipantId,
    pub label: String,
    pub color: String,
    pub section: String,
    pub line: u32,
    pub column: u32,
    seq: Option<u64>,
}

/// The editor widget the client drives.
pub trait EditorSurface: Send {
    fn render_cursor_overlay(&mut self, overlay: &CursorOverlay);

    fn remove_cursor_overlay(&mut self, participant_id: ParticipantId);
}

/// Surface that draws nothing (headless clients).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSurface;

impl EditorSurface for NullSurface {
    fn render_cursor_overlay(&mut self, _overlay: &CursorOverlay) {}

    fn remove_cursor_overlay(&mut self, _participant_id: ParticipantId) {}
}

#[derive(Debug, Clone)]
struct LocalCursor {
    section: String,
    line: u32,
    column: u32,
}

/// Remote overlays plus the throttled local cursor.
#[derive(Debug)]
pub struct CursorOverlays {
    local_participant: Option<ParticipantId>,
    overlays: HashMap<ParticipantId, CursorOverlay>,
    /// Label and color of everyone in the last presence snapshot.
    peers: HashMap<ParticipantId, (String, String)>,
    local: Option<LocalCursor>,
    local_seq: u64,
    last_sent: Option<Instant>,
    throttle: Duration,
}

impl CursorOverlays {
    pub fn new(throttle: Duration) -> Self {
        Self {
            local_participant: None,
            overlays: HashMap::new(),
            peers: HashMap::new(),
            local: None,
            local_seq: 0,
            last_sent: None,
            throttle,
        }
    }

    pub fn set_local_participant(&mut self, participant: Option<ParticipantId>) {
        self.local_participant = participant;
    }

    pub fn get(&self, participant: ParticipantId) -> Option<&CursorOverlay> {
        self.overlays.get(&participant)
    }

    pub fn len(&self) -> usize {
        self.overlays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overlays.is_empty()
    }

    pub fn overlays(&self) -> impl Iterator<Item = &CursorOverlay> {
        self.overlays.values()
    }

    /// Reconcile with a presence snapshot: refresh everyone present, drop
    /// everyone absent.
    pub fn apply_presence(&mut self, entries: &[PresenceEntry], surface: &mut dyn EditorSurface) {
        let absent: Vec<ParticipantId> = self
            .overlays
            .keys()
            .filter(|id| entries.iter().all(|e| e.participant_id != **id))
            .copied()
            .collect();
        for id in absent {
            self.overlays.remove(&id);
            surface.remove_cursor_overlay(id);
        }

        self.peers = entries
            .iter()
            .filter(|e| Some(e.participant_id) != self.local_participant)
            .map(|e| (e.participant_id, (e.display_name.clone(), e.color.clone())))
            .collect();

        for entry in entries {
            if Some(entry.participant_id) == self.local_participant {
                continue;
            }
            let Some(section) = &entry.section else {
                continue;
            };
            let seq = self.overlays.get(&entry.participant_id).and_then(|o| o.seq);
            let overlay = CursorOverlay {
                participant_id: entry.participant_id,
                label: entry.display_name.clone(),
                color: entry.color.clone(),
                section: section.clone(),
                line: entry.line,
                column: entry.column,
                seq,
            };
            if self.overlays.get(&entry.participant_id) != Some(&overlay) {
                surface.render_cursor_overlay(&overlay);
                self.overlays.insert(entry.participant_id, overlay);
            }
        }
    }

    /// Apply a relayed cursor move. Returns `false` when the sequence
    /// number is not newer than the last one seen.
    pub fn apply_cursor(
        &mut self,
        participant: ParticipantId,
        section: &str,
        line: u32,
        column: u32,
        seq: u64,
        surface: &mut dyn EditorSurface,
    ) -> bool {
        if Some(participant) == self.local_participant {
            return false;
        }
        let peers = &self.peers;
        let overlay = self.overlays.entry(participant).or_insert_with(|| {
            let (label, color) = peers.get(&participant).cloned().unwrap_or_else(|| {
                // Cursor from someone not yet in our presence snapshot.
                let id = participant.to_string();
                (
                    format!("Peer-{}", &id[..8]),
                    CursorColor::palette(home_slot(&id)).to_hex(),
                )
            });
            CursorOverlay {
                participant_id: participant,
                label,
                color,
                section: section.to_string(),
                line,
                column,
                seq: None,
            }
        });
        if overlay.seq.is_some_and(|last| seq <= last) {
            return false;
        }
        overlay.seq = Some(seq);
        overlay.section = section.to_string();
        overlay.line = line;
        overlay.column = column;
        surface.render_cursor_overlay(overlay);
        true
    }

    /// Remove every overlay (disconnect).
    pub fn clear(&mut self, surface: &mut dyn EditorSurface) {
        self.peers.clear();
        for (id, _) in self.overlays.drain() {
            surface.remove_cursor_overlay(id);
        }
    }

    /// Record a local cursor move; returns a frame unless throttled.
    pub fn move_local(
        &mut self,
        section: &str,
        line: u32,
        column: u32,
        now: Instant,
    ) -> Option<ClientMessage> {
        self.local = Some(LocalCursor {
            section: section.to_string(),
            line,
            column,
        });
        let throttled = self
            .last_sent
            .is_some_and(|last| now.saturating_duration_since(last) < self.throttle);
        if throttled {
            return None;
        }
        self.force_local(now)
    }

    /// Send the latest local cursor regardless of the throttle.
    pub fn force_local(&mut self, now: Instant) -> Option<ClientMessage> {
        let local = self.local.clone()?;
        self.local_seq += 1;
        self.last_sent = Some(now);
        Some(ClientMessage::CursorUpdate {
            section: local.section,
            line: local.line,
            column: local.column,
            seq: Some(self.local_seq),
        })
    }
}

impl Default for CursorOverlays {
    fn default() -> Self {
        Self::new(CURSOR_THROTTLE)
    }
}
