//! Advisory per-section edit lock.
//!
//! At most one participant holds a section at a time. The lock is advisory:
//! operations from non-holders are still accepted by the serializer. All
//! calls for one section run on that section's actor, so two concurrent
//! requests can never both be granted.

use std::time::{Duration, Instant};

use crate::operation::ParticipantId;

/// Current holder of a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockGrant {
    pub holder: ParticipantId,
    pub acquired_at: Instant,
    pub last_activity: Instant,
}

/// Reply to a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,
    Denied { holder: ParticipantId },
}

/// Reply to an unlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NotHolder,
}

#[derive(Debug, Default)]
pub struct SectionLock {
    grant: Option<LockGrant>,
}

impl SectionLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder(&self) -> Option<ParticipantId> {
        self.grant.map(|g| g.holder)
    }

    pub fn grant(&self) -> Option<&LockGrant> {
        self.grant.as_ref()
    }

    /// Grant the lock if it is free; a re-request by the holder refreshes it.
    pub fn request(&mut self, participant: ParticipantId, now: Instant) -> LockOutcome {
        match &mut self.grant {
            Some(grant) if grant.holder == participant => {
                grant.last_activity = now;
                LockOutcome::Granted
            }
            Some(grant) => LockOutcome::Denied {
                holder: grant.holder,
            },
            None => {
                self.grant = Some(LockGrant {
                    holder: participant,
                    acquired_at: now,
                    last_activity: now,
                });
                LockOutcome::Granted
            }
        }
    }

    pub fn release(&mut self, participant: ParticipantId) -> ReleaseOutcome {
        match self.grant {
            Some(grant) if grant.holder == participant => {
                self.grant = None;
                ReleaseOutcome::Released
            }
            _ => ReleaseOutcome::NotHolder,
        }
    }

    /// Keystroke activity; refreshes the idle timer only for the holder.
    pub fn touch(&mut self, participant: ParticipantId, now: Instant) {
        if let Some(grant) = &mut self.grant {
            if grant.holder == participant {
                grant.last_activity = now;
            }
        }
    }

    /// Release the lock if it has been idle for `idle_timeout`; returns the
    /// former holder.
    pub fn expire_idle(&mut self, now: Instant, idle_timeout: Duration) -> Option<ParticipantId> {
        let grant = self.grant?;
        if now.saturating_duration_since(grant.last_activity) >= idle_timeout {
            self.grant = None;
            Some(grant.holder)
        } else {
            None
        }
    }

    /// Disconnect / eviction cleanup.
    pub fn release_if_held_by(&mut self, participant: ParticipantId) -> bool {
        self.release(participant) == ReleaseOutcome::Released
    }
}
