//! Presence registry: who is in a document room and where their cursor is.
//!
//! ```text
//! join ──► Participant{color, last_seen} ──► heartbeat / cursor_update
//!                │                                  │
//!                └──── leave / evict_expired ◄──────┘ (timeout)
//! ```
//!
//! Colors come from a fixed palette. A participant's slot starts at a stable
//! hash of its `user_id` and probes forward to the first slot no one in the
//! room is using, so the same user usually gets the same color.

use std::time::{Duration, Instant};

use thiserror::Error;
use uuid::Uuid;

use crate::operation::ParticipantId;
use crate::protocol::PresenceEntry;

/// Number of distinct cursor colors.
pub const PALETTE_SIZE: usize = 12;

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// RGB cursor color.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl CursorColor {
    /// The palette color at `slot` (wraps around the palette).
    pub fn palette(slot: usize) -> Self {
        let hue = (slot % PALETTE_SIZE) as f32 / PALETTE_SIZE as f32;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.5);
        Self { r, g, b }
    }

    /// `#rrggbb`
    pub fn to_hex(&self) -> String {
        let byte = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", byte(self.r), byte(self.g), byte(self.b))
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// 32-bit FNV-1a.
fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in bytes {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Preferred palette slot for a user.
pub fn home_slot(user_id: &str) -> usize {
    fnv1a(user_id.as_bytes()) as usize % PALETTE_SIZE
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("participant {0} is not present (evicted or never joined)")]
pub struct UnknownParticipant(pub ParticipantId);

/// One connected tab.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub participant_id: ParticipantId,
    pub user_id: String,
    pub display_name: String,
    pub color: String,
    slot: usize,
    pub section: Option<String>,
    pub line: u32,
    pub column: u32,
    cursor_seq: Option<u64>,
    pub joined_at: Instant,
    pub last_seen: Instant,
}

impl Participant {
    pub fn entry(&self) -> PresenceEntry {
        PresenceEntry {
            participant_id: self.participant_id,
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            color: self.color.clone(),
            section: self.section.clone(),
            line: self.line,
            column: self.column,
        }
    }
}

/// Participants of one room, in join order.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    participants: Vec<Participant>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn contains(&self, participant_id: ParticipantId) -> bool {
        self.get(participant_id).is_some()
    }

    pub fn get(&self, participant_id: ParticipantId) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| p.participant_id == participant_id)
    }

    fn get_mut(&mut self, participant_id: ParticipantId) -> Option<&mut Participant> {
        self.participants
            .iter_mut()
            .find(|p| p.participant_id == participant_id)
    }

    /// Add a participant with a fresh id and a palette color.
    pub fn join(&mut self, user_id: &str, display_name: &str, now: Instant) -> Participant {
        let slot = self.pick_slot(user_id);
        let participant = Participant {
            participant_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            color: CursorColor::palette(slot).to_hex(),
            slot,
            section: None,
            line: 0,
            column: 0,
            cursor_seq: None,
            joined_at: now,
            last_seen: now,
        };
        self.participants.push(participant.clone());
        participant
    }

    fn pick_slot(&self, user_id: &str) -> usize {
        let home = home_slot(user_id);
        (0..PALETTE_SIZE)
            .map(|offset| (home + offset) % PALETTE_SIZE)
            .find(|slot| self.participants.iter().all(|p| p.slot != *slot))
            .unwrap_or(home)
    }

    pub fn heartbeat(
        &mut self,
        participant_id: ParticipantId,
        now: Instant,
    ) -> Result<(), UnknownParticipant> {
        let participant = self
            .get_mut(participant_id)
            .ok_or(UnknownParticipant(participant_id))?;
        participant.last_seen = now;
        Ok(())
    }

    pub fn leave(&mut self, participant_id: ParticipantId) -> Option<Participant> {
        let idx = self
            .participants
            .iter()
            .position(|p| p.participant_id == participant_id)?;
        Some(self.participants.remove(idx))
    }

    /// Record a cursor move.
    ///
    /// Returns the sequence number the move is relayed with, or `None` for
    /// a stale update, which leaves the stored cursor untouched. An update
    /// without a client sequence number is always the newest and takes the
    /// next number after the last accepted one.
    pub fn update_cursor(
        &mut self,
        participant_id: ParticipantId,
        section: &str,
        line: u32,
        column: u32,
        seq: Option<u64>,
        now: Instant,
    ) -> Result<Option<u64>, UnknownParticipant> {
        let participant = self
            .get_mut(participant_id)
            .ok_or(UnknownParticipant(participant_id))?;
        participant.last_seen = now;
        let seq = match (seq, participant.cursor_seq) {
            (Some(seq), Some(last)) if seq <= last => return Ok(None),
            (Some(seq), _) => seq,
            (None, Some(last)) => last.saturating_add(1),
            (None, None) => 1,
        };
        participant.cursor_seq = Some(seq);
        participant.section = Some(section.to_string());
        participant.line = line;
        participant.column = column;
        Ok(Some(seq))
    }

    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        self.participants.iter().map(Participant::entry).collect()
    }

    /// Remove participants not seen for `timeout`.
    pub fn evict_expired(&mut self, now: Instant, timeout: Duration) -> Vec<Participant> {
        let (expired, alive): (Vec<_>, Vec<_>) = std::mem::take(&mut self.participants)
            .into_iter()
            .partition(|p| now.saturating_duration_since(p.last_seen) >= timeout);
        self.participants = alive;
        expired
    }

    pub fn participant_ids(&self) -> Vec<ParticipantId> {
        self.participants.iter().map(|p| p.participant_id).collect()
    }
}
