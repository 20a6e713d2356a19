//! Per-section operation log and serializer state.
//!
//! ```text
//!   base_text@base_revision ── log[base+1] ── log[base+2] ── … ── text@revision
//! ```
//!
//! Invariants:
//! - log revisions are exactly `base_revision+1 ..= revision`
//! - replaying the log over `base_text` reproduces `text`
//!
//! The state is owned by one section actor; nothing here is shared.

use std::collections::VecDeque;
use std::time::Duration;

use crate::error::RejectReason;
use crate::operation::{apply, check_bounds, transform_sequences, Operation};
use crate::storage::SectionSnapshot;

/// Tuning for section serializers.
#[derive(Debug, Clone)]
pub struct SectionConfig {
    /// Persist after this many accepted operations
    pub persist_every: u64,
    /// Newest log entries kept after a persist
    pub retain_ops: usize,
    /// Hard cap on log length, folded even without persistence
    pub max_log_len: usize,
    /// Command channel capacity per section actor
    pub command_capacity: usize,
    /// Locks idle longer than this are released
    pub lock_idle_timeout: Duration,
    /// How often idle locks are checked
    pub lock_check_interval: Duration,
}

impl Default for SectionConfig {
    fn default() -> Self {
        Self {
            persist_every: 50,
            retain_ops: 256,
            max_log_len: 4096,
            command_capacity: 256,
            lock_idle_timeout: Duration::from_secs(120),
            lock_check_interval: Duration::from_secs(5),
        }
    }
}

impl SectionConfig {
    /// Short timers and tiny logs for tests.
    pub fn for_testing() -> Self {
        Self {
            persist_every: 4,
            retain_ops: 4,
            max_log_len: 64,
            command_capacity: 32,
            lock_idle_timeout: Duration::from_millis(300),
            lock_check_interval: Duration::from_millis(50),
        }
    }
}

/// An operation committed at `revision`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedOp {
    pub revision: u64,
    pub op: Operation,
}

/// Authoritative state of one section.
#[derive(Debug, Clone)]
pub struct SectionState {
    name: String,
    base_text: String,
    base_revision: u64,
    text: String,
    revision: u64,
    log: VecDeque<AcceptedOp>,
}

impl SectionState {
    /// Empty section at revision 0.
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_snapshot(name, SectionSnapshot {
            text: String::new(),
            revision: 0,
        })
    }

    /// Section resumed from a persisted snapshot; the log starts empty.
    pub fn from_snapshot(name: impl Into<String>, snapshot: SectionSnapshot) -> Self {
        Self {
            name: name.into(),
            base_text: snapshot.text.clone(),
            base_revision: snapshot.revision,
            text: snapshot.text,
            revision: snapshot.revision,
            log: VecDeque::new(),
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

    pub fn base_revision(&self) -> u64 {
        self.base_revision
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    pub fn log(&self) -> impl Iterator<Item = &AcceptedOp> {
        self.log.iter()
    }

    /// Current text and revision.
    pub fn snapshot(&self) -> SectionSnapshot {
        SectionSnapshot {
            text: self.text.clone(),
            revision: self.revision,
        }
    }

    /// Transform `op` against everything committed since its base revision
    /// and commit the result.
    ///
    /// Returns one accepted entry per piece (one or two), each with its own
    /// revision. Nothing is committed when the submit is rejected.
    pub fn submit(&mut self, op: Operation) -> Result<Vec<AcceptedOp>, RejectReason> {
        let base = op.base_revision();
        if base > self.revision {
            return Err(RejectReason::FutureRevision);
        }
        if base < self.base_revision {
            return Err(RejectReason::HistoryTrimmed);
        }
        if op.position().checked_add(op.edit().char_len()).is_none() {
            return Err(RejectReason::OutOfBounds);
        }

        let skip = (base - self.base_revision) as usize;
        let concurrent: Vec<Operation> = self.log.make_contiguous()[skip..]
            .iter()
            .map(|entry| entry.op.clone())
            .collect();
        let (pieces, _) = transform_sequences(std::slice::from_ref(&op), &concurrent);

        let mut len = self.text.chars().count();
        for piece in &pieces {
            len = check_bounds(piece, len).map_err(|_| RejectReason::OutOfBounds)?;
        }

        let mut accepted = Vec::with_capacity(pieces.len());
        for piece in pieces {
            let rebased = piece.rebased(self.revision);
            apply(&mut self.text, &rebased).map_err(|_| RejectReason::OutOfBounds)?;
            self.revision += 1;
            let entry = AcceptedOp {
                revision: self.revision,
                op: rebased,
            };
            self.log.push_back(entry.clone());
            accepted.push(entry);
        }

        Ok(accepted)
    }

    /// Fold log entries with revision `<= upto` into the base snapshot.
    ///
    /// Returns the number of entries folded.
    pub fn fold_into_base(&mut self, upto: u64) -> usize {
        let mut folded = 0;
        while let Some(front) = self.log.front() {
            if front.revision > upto {
                break;
            }
            if let Some(entry) = self.log.pop_front() {
                if apply(&mut self.base_text, &entry.op).is_err() {
                    log::error!(
                        "Section {} log entry {} does not replay over its base",
                        self.name,
                        entry.revision
                    );
                }
                self.base_revision = entry.revision;
                folded += 1;
            }
        }
        folded
    }

    /// Trim after revision `persisted` reached storage, keeping the newest
    /// `retain` entries.
    pub fn trim_after_persist(&mut self, persisted: u64, retain: usize) -> usize {
        let keep_from = self.revision.saturating_sub(retain as u64);
        self.fold_into_base(persisted.min(keep_from))
    }

    /// Fold the oldest entries so that at most `max_len` remain.
    pub fn enforce_log_cap(&mut self, max_len: usize) -> usize {
        if self.log.len() <= max_len {
            return 0;
        }
        let excess = (self.log.len() - max_len) as u64;
        self.fold_into_base(self.base_revision + excess)
    }

    /// Replay the log over the base text.
    pub fn replay(&self) -> String {
        let mut text = self.base_text.clone();
        for entry in &self.log {
            if apply(&mut text, &entry.op).is_err() {
                break;
            }
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Edit;
    use uuid::Uuid;

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn at_revision(text: &str, revision: u64) -> SectionState {
        SectionState::from_snapshot("methods", SectionSnapshot {
            text: text.into(),
            revision,
        })
    }

    fn assert_log_contiguous(state: &SectionState) {
        let revisions: Vec<u64> = state.log().map(|e| e.revision).collect();
        let expected: Vec<u64> = (state.base_revision() + 1..=state.revision()).collect();
        assert_eq!(revisions, expected);
        assert_eq!(state.replay(), state.text());
    }

    #[test]
    fn test_submit_at_head() {
        let mut state = SectionState::new("abstract");
        let accepted = state.submit(Operation::insert("abstract", 0, 0, "Hi", id(1))).unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].revision, 1);
        assert_eq!(state.text(), "Hi");
        assert_log_contiguous(&state);
    }

    #[test]
    fn test_hello_world_concurrent_inserts() {
        let mut state = at_revision("", 5);
        let a = state.submit(Operation::insert("s", 5, 0, "Hello ", id(1))).unwrap();
        let b = state.submit(Operation::insert("s", 5, 0, "World", id(2))).unwrap();

        assert_eq!(a[0].revision, 6);
        assert_eq!(b[0].revision, 7);
        assert_eq!(b[0].op.position(), 6);
        assert_eq!(state.text(), "Hello World");
        assert_log_contiguous(&state);
    }

    #[test]
    fn test_insert_clamped_to_delete_start() {
        let mut state = at_revision("0123456789", 10);
        let del = state.submit(Operation::delete("methods", 10, 0, 5, id(1))).unwrap();
        assert_eq!(del[0].revision, 11);

        let ins = state.submit(Operation::insert("methods", 10, 3, "ins", id(2))).unwrap();
        assert_eq!(ins.len(), 1);
        assert_eq!(ins[0].revision, 12);
        assert_eq!(ins[0].op.position(), 0);
        assert_eq!(state.text(), "ins56789");
    }

    #[test]
    fn test_future_revision_rejected() {
        let mut state = at_revision("abc", 3);
        let err = state.submit(Operation::insert("s", 4, 0, "x", id(1))).unwrap_err();
        assert_eq!(err, RejectReason::FutureRevision);
        assert_eq!(state.revision(), 3);
    }

    #[test]
    fn test_out_of_bounds_rejected_without_commit() {
        let mut state = at_revision("abc", 0);
        let err = state.submit(Operation::delete("s", 0, 2, 5, id(1))).unwrap_err();
        assert_eq!(err, RejectReason::OutOfBounds);
        assert_eq!(state.revision(), 0);
        assert_eq!(state.log_len(), 0);
    }

    #[test]
    fn test_overflowing_range_rejected() {
        let mut state = at_revision("abc", 0);
        let err = state.submit(Operation::delete("s", 0, 1, usize::MAX, id(1))).unwrap_err();
        assert_eq!(err, RejectReason::OutOfBounds);
        let err = state.submit(Operation::insert("s", 0, usize::MAX, "x", id(1))).unwrap_err();
        assert_eq!(err, RejectReason::OutOfBounds);
        assert_eq!(state.revision(), 0);
        assert_eq!(state.text(), "abc");
    }

    #[test]
    fn test_stale_huge_delete_rejected_after_transform() {
        let mut state = at_revision("abcdef", 0);
        state.submit(Operation::insert("s", 0, 3, "XY", id(1))).unwrap();
        state.submit(Operation::delete("s", 1, 0, 1, id(1))).unwrap();

        let huge = Operation::delete("s", 0, 1, usize::MAX - 1, id(2));
        let err = state.submit(huge).unwrap_err();
        assert_eq!(err, RejectReason::OutOfBounds);
        assert_eq!(state.revision(), 2);
        assert_log_contiguous(&state);

        // The section keeps serving afterwards.
        let ok = state.submit(Operation::insert("s", 2, 0, "!", id(2))).unwrap();
        assert_eq!(ok[0].revision, 3);
        assert_eq!(state.text(), "!bcXYdef");
    }

    #[test]
    fn test_duplicate_stale_delete_becomes_noop() {
        let mut state = at_revision("abcdef", 0);
        state.submit(Operation::delete("s", 0, 1, 3, id(1))).unwrap();
        let dup = state.submit(Operation::delete("s", 0, 1, 3, id(2))).unwrap();
        assert_eq!(dup.len(), 1);
        assert_eq!(dup[0].revision, 2);
        assert_eq!(dup[0].op.edit(), &Edit::Delete(0));
        assert_eq!(state.text(), "aef");
        assert_log_contiguous(&state);
    }

    #[test]
    fn test_stale_delete_split_consumes_two_revisions() {
        let mut state = at_revision("abcdefg", 0);
        state.submit(Operation::insert("s", 0, 3, "XY", id(1))).unwrap();
        let pieces = state.submit(Operation::delete("s", 0, 1, 4, id(2))).unwrap();
        assert_eq!(pieces.iter().map(|p| p.revision).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(pieces[1].op.base_revision(), 2);
        assert_eq!(state.text(), "aXYfg");
        assert_log_contiguous(&state);
    }

    #[test]
    fn test_trim_after_persist_keeps_retained() {
        let mut state = SectionState::new("s");
        for i in 0..10 {
            state.submit(Operation::insert("s", i, 0, "x", id(1))).unwrap();
        }
        let folded = state.trim_after_persist(10, 3);
        assert_eq!(folded, 7);
        assert_eq!(state.base_revision(), 7);
        assert_log_contiguous(&state);

        let err = state.submit(Operation::insert("s", 6, 0, "y", id(2))).unwrap_err();
        assert_eq!(err, RejectReason::HistoryTrimmed);
        assert!(state.submit(Operation::insert("s", 7, 0, "y", id(2))).is_ok());
    }

    #[test]
    fn test_trim_never_passes_persisted_revision() {
        let mut state = SectionState::new("s");
        for i in 0..10 {
            state.submit(Operation::insert("s", i, 0, "x", id(1))).unwrap();
        }
        assert_eq!(state.trim_after_persist(2, 0), 2);
        assert_eq!(state.base_revision(), 2);
    }

    #[test]
    fn test_log_cap() {
        let mut state = SectionState::new("s");
        for i in 0..20 {
            state.submit(Operation::insert("s", i, i as usize, "a", id(1))).unwrap();
        }
        assert_eq!(state.enforce_log_cap(8), 12);
        assert_eq!(state.log_len(), 8);
        assert_log_contiguous(&state);
        assert_eq!(state.enforce_log_cap(8), 0);
    }
}
