//! Text operations and the operational-transform rules.
//!
//! An [`Operation`] is a single insert or delete against one section,
//! addressed in characters (Unicode scalar values), tagged with the
//! revision it was computed against and the participant that authored it.
//!
//! ```text
//!   state@r ──── a ────► state@r+1
//!      │                    │
//!      b            transform(b, a)
//!      ▼                    ▼
//!   state@r' ─ transform(a, b) ─► converged
//! ```
//!
//! `transform(op, applied)` rewrites `op` so that it can be applied after
//! `applied`, where both were produced from the same state. The server uses
//! it to rebase stale submissions against the log, and every client uses the
//! same function to rebase its pending queue against remote operations, so
//! both sides always compute identical results.
//!
//! Rules:
//! - insert/insert: the insert at the lower position goes first; equal
//!   positions go to the lower author id.
//! - insert/delete: an insert inside a deleted range lands at the start of
//!   that range.
//! - delete/insert: a delete that straddles an insert splits in two, so the
//!   inserted text survives.
//! - delete/delete: the overlapping portion is dropped from the later delete.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one connected participant (one browser tab).
pub type ParticipantId = Uuid;

/// Operation kind as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Insert,
    Delete,
}

/// The edit carried by an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    /// Insert this text at the position.
    Insert(String),
    /// Delete this many characters starting at the position.
    Delete(usize),
}

impl Edit {
    pub fn kind(&self) -> OpKind {
        match self {
            Edit::Insert(_) => OpKind::Insert,
            Edit::Delete(_) => OpKind::Delete,
        }
    }

    /// Length of the edit in characters.
    pub fn char_len(&self) -> usize {
        match self {
            Edit::Insert(text) => text.chars().count(),
            Edit::Delete(len) => *len,
        }
    }
}

/// An atomic, immutable edit of one section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    section: String,
    base_revision: u64,
    position: usize,
    edit: Edit,
    author_id: ParticipantId,
}

impl Operation {
    pub fn new(
        section: impl Into<String>,
        base_revision: u64,
        position: usize,
        edit: Edit,
        author_id: ParticipantId,
    ) -> Self {
        Self {
            section: section.into(),
            base_revision,
            position,
            edit,
            author_id,
        }
    }

    pub fn insert(
        section: impl Into<String>,
        base_revision: u64,
        position: usize,
        text: impl Into<String>,
        author_id: ParticipantId,
    ) -> Self {
        Self::new(section, base_revision, position, Edit::Insert(text.into()), author_id)
    }

    pub fn delete(
        section: impl Into<String>,
        base_revision: u64,
        position: usize,
        len: usize,
        author_id: ParticipantId,
    ) -> Self {
        Self::new(section, base_revision, position, Edit::Delete(len), author_id)
    }

    pub fn section(&self) -> &str {
        &self.section
    }

    pub fn base_revision(&self) -> u64 {
        self.base_revision
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn edit(&self) -> &Edit {
        &self.edit
    }

    pub fn kind(&self) -> OpKind {
        self.edit.kind()
    }

    pub fn author_id(&self) -> ParticipantId {
        self.author_id
    }

    /// True when applying the operation leaves the text unchanged.
    pub fn is_noop(&self) -> bool {
        match &self.edit {
            Edit::Insert(text) => text.is_empty(),
            Edit::Delete(len) => *len == 0,
        }
    }

    /// Same edit, re-expressed against another base revision.
    pub fn rebased(&self, base_revision: u64) -> Self {
        Self {
            base_revision,
            ..self.clone()
        }
    }

    /// Same edit, attributed to another author.
    pub fn reauthored(&self, author_id: ParticipantId) -> Self {
        Self {
            author_id,
            ..self.clone()
        }
    }

    fn moved(&self, position: usize) -> Self {
        Self {
            position,
            ..self.clone()
        }
    }

    fn resized(&self, position: usize, len: usize) -> Self {
        Self {
            position,
            edit: Edit::Delete(len),
            ..self.clone()
        }
    }

    fn noop(&self) -> Self {
        let edit = match self.edit {
            Edit::Insert(_) => Edit::Insert(String::new()),
            Edit::Delete(_) => Edit::Delete(0),
        };
        Self { edit, ..self.clone() }
    }
}

/// Position or length outside the text it is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfBounds {
    pub position: usize,
    pub len: usize,
    pub text_len: usize,
}

impl fmt::Display for OutOfBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "range {}..{} outside text of {} characters",
            self.position,
            self.position.saturating_add(self.len),
            self.text_len
        )
    }
}

impl std::error::Error for OutOfBounds {}

/// Byte offset of the `char_pos`-th character, or `None` past the end.
fn byte_offset(text: &str, char_pos: usize) -> Option<usize> {
    if char_pos == 0 {
        return Some(0);
    }
    match text.char_indices().nth(char_pos) {
        Some((idx, _)) => Some(idx),
        None if text.chars().count() == char_pos => Some(text.len()),
        None => None,
    }
}

/// Check that `op` fits a text of `text_len` characters and return the
/// length after applying it.
pub fn check_bounds(op: &Operation, text_len: usize) -> Result<usize, OutOfBounds> {
    match &op.edit {
        Edit::Insert(text) => {
            if op.position > text_len {
                return Err(OutOfBounds {
                    position: op.position,
                    len: 0,
                    text_len,
                });
            }
            Ok(text_len + text.chars().count())
        }
        Edit::Delete(len) => match op.position.checked_add(*len) {
            Some(end) if end <= text_len => Ok(text_len - len),
            _ => Err(OutOfBounds {
                position: op.position,
                len: *len,
                text_len,
            }),
        },
    }
}

/// Apply an operation to a text buffer in place.
///
/// The buffer is untouched when the operation does not fit.
pub fn apply(text: &mut String, op: &Operation) -> Result<(), OutOfBounds> {
    let text_len = text.chars().count();
    check_bounds(op, text_len)?;
    let oob = OutOfBounds {
        position: op.position,
        len: op.edit.char_len(),
        text_len,
    };
    match &op.edit {
        Edit::Insert(inserted) => {
            let at = byte_offset(text, op.position).ok_or(oob)?;
            text.insert_str(at, inserted);
        }
        Edit::Delete(len) => {
            let start = byte_offset(text, op.position).ok_or(oob)?;
            let end = byte_offset(text, op.position + len).ok_or(oob)?;
            text.replace_range(start..end, "");
        }
    }
    Ok(())
}

/// Rewrite `op` so it applies after `applied`, both produced from the same
/// state.
///
/// Returns one operation, or two when a delete is split around a
/// concurrent insert (right piece first, then left piece, so the pieces
/// apply in order without shifting each other). Never returns an empty
/// list: an operation that has nothing left to do becomes a no-op.
///
/// Positions saturate instead of overflowing; an operation that ends past
/// `usize::MAX` is still rejected by [`check_bounds`] afterwards.
pub fn transform(op: &Operation, applied: &Operation) -> Vec<Operation> {
    match (&op.edit, &applied.edit) {
        (Edit::Insert(text), Edit::Insert(other)) => {
            // A resubmitted duplicate of an already applied insert.
            if op.author_id == applied.author_id
                && op.position == applied.position
                && text == other
                && !text.is_empty()
            {
                return vec![op.noop()];
            }
            let applied_first = applied.position < op.position
                || (applied.position == op.position && applied.author_id <= op.author_id);
            if applied_first {
                vec![op.moved(op.position.saturating_add(other.chars().count()))]
            } else {
                vec![op.clone()]
            }
        }
        (Edit::Insert(_), Edit::Delete(del_len)) => {
            let del_start = applied.position;
            let del_end = del_start.saturating_add(*del_len);
            let position = if del_end <= op.position {
                op.position - del_len
            } else if del_start < op.position {
                del_start
            } else {
                op.position
            };
            vec![op.moved(position)]
        }
        (Edit::Delete(len), Edit::Insert(inserted)) => {
            let ins_len = inserted.chars().count();
            let start = op.position;
            let end = start.saturating_add(*len);
            if applied.position <= start {
                vec![op.moved(start.saturating_add(ins_len))]
            } else if applied.position >= end {
                vec![op.clone()]
            } else {
                let left = applied.position - start;
                let right = end - applied.position;
                vec![
                    op.resized(applied.position.saturating_add(ins_len), right),
                    op.resized(start, left),
                ]
            }
        }
        (Edit::Delete(len), Edit::Delete(other_len)) => {
            let start = op.position;
            let end = start.saturating_add(*len);
            let other_start = applied.position;
            let other_end = other_start.saturating_add(*other_len);
            if other_end <= start {
                vec![op.moved(start - other_len)]
            } else if other_start >= end {
                vec![op.clone()]
            } else {
                let overlap = end.min(other_end) - start.max(other_start);
                vec![op.resized(start.min(other_start), len - overlap)]
            }
        }
    }
}

/// Transform two concurrent operation sequences against each other.
///
/// `xs` and `ys` were both produced from the same state. Returns
/// `(xs', ys')` where `xs'` applies after `ys` and `ys'` applies after `xs`;
/// applying `ys` then `xs'` yields the same text as `xs` then `ys'`.
pub fn transform_sequences(xs: &[Operation], ys: &[Operation]) -> (Vec<Operation>, Vec<Operation>) {
    match (xs, ys) {
        ([], _) | (_, []) => (xs.to_vec(), ys.to_vec()),
        ([x], [y]) => (transform(x, y), transform(y, x)),
        ([x], [y, rest @ ..]) => {
            let (x1, y1) = transform_sequences(std::slice::from_ref(x), std::slice::from_ref(y));
            let (x2, rest1) = transform_sequences(&x1, rest);
            let mut ys_out = y1;
            ys_out.extend(rest1);
            (x2, ys_out)
        }
        ([x, rest @ ..], _) => {
            let (x1, ys1) = transform_sequences(std::slice::from_ref(x), ys);
            let (rest1, ys2) = transform_sequences(rest, &ys1);
            let mut xs_out = x1;
            xs_out.extend(rest1);
            (xs_out, ys2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(n: u128) -> ParticipantId {
        Uuid::from_u128(n)
    }

    fn run(text: &str, ops: &[Operation]) -> String {
        let mut out = text.to_string();
        for op in ops {
            apply(&mut out, op).unwrap();
        }
        out
    }

    fn converge(text: &str, a: &Operation, b: &Operation) -> (String, String) {
        let left = {
            let mut t = run(text, std::slice::from_ref(a));
            for op in transform(b, a) {
                apply(&mut t, &op).unwrap();
            }
            t
        };
        let right = {
            let mut t = run(text, std::slice::from_ref(b));
            for op in transform(a, b) {
                apply(&mut t, &op).unwrap();
            }
            t
        };
        (left, right)
    }

    #[test]
    fn test_apply_insert_and_delete() {
        let mut text = String::from("hello");
        apply(&mut text, &Operation::insert("s", 0, 5, " world", id(1))).unwrap();
        assert_eq!(text, "hello world");
        apply(&mut text, &Operation::delete("s", 1, 0, 6, id(1))).unwrap();
        assert_eq!(text, "world");
    }

    #[test]
    fn test_apply_counts_characters_not_bytes() {
        let mut text = String::from("héllo");
        apply(&mut text, &Operation::insert("s", 0, 2, "✓", id(1))).unwrap();
        assert_eq!(text, "hé✓llo");
        apply(&mut text, &Operation::delete("s", 1, 1, 2, id(1))).unwrap();
        assert_eq!(text, "hllo");
    }

    #[test]
    fn test_apply_out_of_bounds_leaves_text() {
        let mut text = String::from("abc");
        assert!(apply(&mut text, &Operation::insert("s", 0, 4, "x", id(1))).is_err());
        assert!(apply(&mut text, &Operation::delete("s", 0, 2, 2, id(1))).is_err());
        assert_eq!(text, "abc");
    }

    #[test]
    fn test_huge_delete_out_of_bounds() {
        let mut text = String::from("abc");
        let op = Operation::delete("s", 0, 1, usize::MAX, id(1));
        let err = check_bounds(&op, 3).unwrap_err();
        assert_eq!(err.len, usize::MAX);
        assert!(apply(&mut text, &op).is_err());
        assert!(apply(&mut text, &Operation::delete("s", 0, usize::MAX, 1, id(1))).is_err());
        assert_eq!(text, "abc");
        assert!(err.to_string().contains("outside text of 3"));
    }

    #[test]
    fn test_transform_saturates_extreme_ranges() {
        let huge = Operation::delete("s", 0, 1, usize::MAX, id(2));
        let far = Operation::insert("s", 0, usize::MAX, "x", id(2));
        let insert = Operation::insert("s", 0, 0, "yz", id(1));
        let delete = Operation::delete("s", 0, 0, 2, id(1));

        for applied in [&insert, &delete] {
            for op in [&huge, &far] {
                for piece in transform(op, applied) {
                    assert!(check_bounds(&piece, 16).is_err() || piece.is_noop());
                }
            }
        }
        let inside = Operation::insert("s", 0, 2, "q", id(1));
        let pieces = transform(&huge, &inside);
        assert_eq!(pieces.len(), 2);
        assert!(check_bounds(&pieces[0], 16).is_err());
    }

    #[test]
    fn test_insert_insert_same_position_lower_author_first() {
        let a = Operation::insert("s", 5, 0, "Hello ", id(1));
        let b = Operation::insert("s", 5, 0, "World", id(2));

        let b1 = transform(&b, &a);
        assert_eq!(b1.len(), 1);
        assert_eq!(b1[0].position(), 6);

        let a1 = transform(&a, &b);
        assert_eq!(a1[0].position(), 0);

        let (left, right) = converge("", &a, &b);
        assert_eq!(left, "Hello World");
        assert_eq!(right, "Hello World");
    }

    #[test]
    fn test_insert_shifted_by_earlier_insert() {
        let applied = Operation::insert("s", 0, 2, "xyz", id(9));
        let op = Operation::insert("s", 0, 4, "!", id(1));
        assert_eq!(transform(&op, &applied)[0].position(), 7);
    }

    #[test]
    fn test_insert_clamped_into_deleted_range() {
        let delete = Operation::delete("s", 10, 0, 5, id(1));
        let insert = Operation::insert("s", 10, 3, "ins", id(2));
        let out = transform(&insert, &delete);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].position(), 0);
    }

    #[test]
    fn test_insert_after_delete_shifts_back() {
        let delete = Operation::delete("s", 0, 1, 3, id(1));
        let insert = Operation::insert("s", 0, 6, "x", id(2));
        assert_eq!(transform(&insert, &delete)[0].position(), 3);
    }

    #[test]
    fn test_delete_split_around_insert() {
        let delete = Operation::delete("s", 0, 1, 4, id(1));
        let insert = Operation::insert("s", 0, 3, "XY", id(2));
        let pieces = transform(&delete, &insert);
        assert_eq!(pieces.len(), 2);

        let (left, right) = converge("abcdefg", &delete, &insert);
        assert_eq!(left, "aXYfg");
        assert_eq!(right, "aXYfg");
    }

    #[test]
    fn test_delete_delete_overlap_keeps_remainder() {
        let a = Operation::delete("s", 0, 0, 4, id(1));
        let b = Operation::delete("s", 0, 2, 4, id(2));
        let b1 = transform(&b, &a);
        assert_eq!(b1[0].position(), 0);
        assert_eq!(b1[0].edit(), &Edit::Delete(2));

        let (left, right) = converge("abcdefgh", &a, &b);
        assert_eq!(left, "gh");
        assert_eq!(right, "gh");
    }

    #[test]
    fn test_identical_delete_becomes_noop() {
        let a = Operation::delete("s", 0, 2, 3, id(1));
        let out = transform(&a, &a);
        assert!(out[0].is_noop());
    }

    #[test]
    fn test_identical_insert_becomes_noop() {
        let a = Operation::insert("s", 0, 2, "dup", id(1));
        let out = transform(&a, &a);
        assert!(out[0].is_noop());
        assert_eq!(out[0].kind(), OpKind::Insert);
    }

    #[test]
    fn test_transform_sequences_matches_pairwise() {
        let a = Operation::insert("s", 0, 0, "A", id(1));
        let b = Operation::delete("s", 0, 1, 2, id(2));
        let (xs, ys) = transform_sequences(&[a.clone()], &[b.clone()]);
        assert_eq!(xs, transform(&a, &b));
        assert_eq!(ys, transform(&b, &a));
    }

    #[test]
    fn test_transform_sequences_converge() {
        let base = "the quick brown fox";
        let xs = vec![
            Operation::insert("s", 0, 4, "very ", id(1)),
            Operation::delete("s", 0, 10, 6, id(1)),
        ];
        let ys = vec![
            Operation::delete("s", 0, 0, 4, id(2)),
            Operation::insert("s", 0, 6, "ee", id(2)),
        ];
        let (xs1, ys1) = transform_sequences(&xs, &ys);
        let mut left = run(base, &ys);
        left = run(&left, &xs1);
        let mut right = run(base, &xs);
        right = run(&right, &ys1);
        assert_eq!(left, right);
    }

    #[derive(Debug, Clone)]
    enum Gen {
        Insert(usize, String),
        Delete(usize, usize),
    }

    fn gen_op() -> impl Strategy<Value = Gen> {
        prop_oneof![
            (0usize..32, "[a-z]{0,4}").prop_map(|(p, t)| Gen::Insert(p, t)),
            (0usize..32, 0usize..8).prop_map(|(p, l)| Gen::Delete(p, l)),
        ]
    }

    fn materialize(g: &Gen, text_len: usize, author: ParticipantId) -> Operation {
        match g {
            Gen::Insert(p, t) => Operation::insert("s", 0, p % (text_len + 1), t.clone(), author),
            Gen::Delete(p, l) => {
                let pos = p % (text_len + 1);
                let len = (*l).min(text_len - pos);
                Operation::delete("s", 0, pos, len, author)
            }
        }
    }

    proptest! {
        #[test]
        fn prop_pairwise_convergence(
            text in "[a-z]{0,24}",
            ga in gen_op(),
            gb in gen_op(),
            flip in any::<bool>(),
        ) {
            let len = text.chars().count();
            let (ida, idb) = if flip { (id(1), id(2)) } else { (id(2), id(1)) };
            let a = materialize(&ga, len, ida);
            let b = materialize(&gb, len, idb);
            let (left, right) = converge(&text, &a, &b);
            prop_assert_eq!(left, right);
        }

        #[test]
        fn prop_sequence_convergence(
            text in "[a-z]{0,24}",
            gxs in proptest::collection::vec(gen_op(), 1..4),
            gys in proptest::collection::vec(gen_op(), 1..4),
        ) {
            let mut xs = Vec::new();
            let mut len = text.chars().count();
            for g in &gxs {
                let op = materialize(g, len, id(1));
                len = check_bounds(&op, len).unwrap();
                xs.push(op);
            }
            let mut ys = Vec::new();
            let mut len = text.chars().count();
            for g in &gys {
                let op = materialize(g, len, id(2));
                len = check_bounds(&op, len).unwrap();
                ys.push(op);
            }
            let (xs1, ys1) = transform_sequences(&xs, &ys);
            let left = run(&run(&text, &ys), &xs1);
            let right = run(&run(&text, &xs), &ys1);
            prop_assert_eq!(left, right);
        }
    }
}
