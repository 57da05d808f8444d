//! Ordered view of one group's log.
//!
//! ```text
//!   first_index-1   first_index            offset              last_index
//!        │               │                    │                     │
//!        ▼               ▼                    ▼                     ▼
//!   ─────┬───────────────────────────────────┬──────────────────────┐
//!  dummy │         durable (Storage)          │   unstable (memory)  │
//!   ─────┴───────────────────────────────────┴──────────────────────┘
//!                         ▲            ▲
//!                      applied     committed
//! ```
//!
//! `applied <= committed <= last_index` holds after every operation and
//! `committed` never moves backwards.

use std::cmp;
use std::sync::Arc;

use tracing::debug;

use super::error::{RaftError, Result};
use crate::proto::{Entry, HardState};
use crate::storage::{limit_size, Storage, StorageError, NO_LIMIT};

/// Entries appended locally but not yet handed to [`Storage`].
#[derive(Debug, Default)]
pub(crate) struct Unstable {
    /// Index of `entries[0]`.
    offset: u64,
    entries: Vec<Entry>,
}

impl Unstable {
    fn maybe_last_index(&self) -> Option<u64> {
        self.entries.last().map(|e| e.index)
    }

    fn maybe_term(&self, index: u64) -> Option<u64> {
        if index < self.offset {
            return None;
        }
        self.entries
            .get((index - self.offset) as usize)
            .map(|e| e.term)
    }

    fn stable_to(&mut self, index: u64, term: u64) {
        if self.maybe_term(index) != Some(term) {
            return;
        }
        let n = (index + 1 - self.offset) as usize;
        self.entries.drain(..n);
        self.offset = index + 1;
    }

    fn truncate_and_append(&mut self, ents: &[Entry]) {
        let after = ents[0].index;
        if after == self.offset + self.entries.len() as u64 {
            self.entries.extend_from_slice(ents);
        } else if after <= self.offset {
            self.offset = after;
            self.entries = ents.to_vec();
        } else {
            self.entries.truncate((after - self.offset) as usize);
            self.entries.extend_from_slice(ents);
        }
    }

    fn slice(&self, lo: u64, hi: u64) -> &[Entry] {
        &self.entries[(lo - self.offset) as usize..(hi - self.offset) as usize]
    }
}

pub struct RaftLog {
    storage: Arc<dyn Storage>,
    unstable: Unstable,
    /// Cached `storage.first_index()`.
    first_index: u64,
    /// Index of the last entry handed to storage.
    stable_last: u64,
    committed: u64,
    applied: u64,
}

impl RaftLog {
    /// Build the log over `storage`, restoring the commit index from its
    /// hard state. `applied` is the state machine's own applied index.
    pub fn new(storage: Arc<dyn Storage>, applied: u64) -> Result<Self> {
        let first_index = storage.first_index()?;
        let last_index = storage.last_index()?;
        let hs = storage.initial_state()?;

        let mut log = Self {
            storage,
            unstable: Unstable {
                offset: last_index + 1,
                entries: Vec::new(),
            },
            first_index,
            stable_last: last_index,
            committed: first_index - 1,
            applied: first_index - 1,
        };

        if hs.commit > log.committed {
            log.committed = cmp::min(hs.commit, last_index);
        }
        if applied > log.applied {
            log.applied = cmp::min(applied, log.committed);
        }
        Ok(log)
    }

    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    pub fn last_index(&self) -> u64 {
        self.unstable
            .maybe_last_index()
            .unwrap_or(self.stable_last)
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Term of the entry at `index`; zero past the end of the log.
    pub fn term(&self, index: u64) -> Result<u64> {
        if index + 1 < self.first_index {
            return Err(StorageError::Compacted.into());
        }
        if index > self.last_index() {
            return Ok(0);
        }
        if let Some(term) = self.unstable.maybe_term(index) {
            return Ok(term);
        }
        match self.storage.term(index) {
            Ok(term) => Ok(term),
            Err(StorageError::Unavailable(_)) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    pub fn last_term(&self) -> u64 {
        self.term(self.last_index()).unwrap_or(0)
    }

    pub fn match_term(&self, index: u64, term: u64) -> bool {
        matches!(self.term(index), Ok(t) if t == term)
    }

    /// Whether a log ending at (`last_index`, `term`) is at least as
    /// up to date as this one.
    pub fn is_up_to_date(&self, last_index: u64, term: u64) -> bool {
        let last_term = self.last_term();
        term > last_term || (term == last_term && last_index >= self.last_index())
    }

    /// Append to the unstable tail, replacing any conflicting suffix.
    /// Returns the new last index.
    pub fn append(&mut self, ents: &[Entry]) -> Result<u64> {
        if ents.is_empty() {
            return Ok(self.last_index());
        }
        let after = ents[0].index - 1;
        if after < self.committed {
            return Err(RaftError::InvalidState(format!(
                "append after {} is out of range [committed({})]",
                after, self.committed
            )));
        }
        if after > self.last_index() {
            return Err(RaftError::InvalidState(format!(
                "append after {} leaves a gap [last_index({})]",
                after,
                self.last_index()
            )));
        }
        self.unstable.truncate_and_append(ents);
        Ok(self.last_index())
    }

    /// Index of the first entry whose term disagrees with the log, or zero.
    pub fn find_conflict(&self, ents: &[Entry]) -> u64 {
        for e in ents {
            if !self.match_term(e.index, e.term) {
                if e.index <= self.last_index() {
                    debug!(
                        index = e.index,
                        existing = self.term(e.index).unwrap_or(0),
                        conflicting = e.term,
                        "found conflict"
                    );
                }
                return e.index;
            }
        }
        0
    }

    /// Follower-side append. `None` when the entry at (`index`, `log_term`)
    /// does not match, otherwise the index of the last new entry.
    pub fn maybe_append(
        &mut self,
        index: u64,
        log_term: u64,
        committed: u64,
        ents: &[Entry],
    ) -> Result<Option<u64>> {
        if !self.match_term(index, log_term) {
            return Ok(None);
        }

        let last_new = index + ents.len() as u64;
        let ci = self.find_conflict(ents);
        if ci != 0 {
            if ci <= self.committed {
                return Err(RaftError::InvalidState(format!(
                    "entry {} conflicts with committed entry [committed({})]",
                    ci, self.committed
                )));
            }
            let start = (ci - index - 1) as usize;
            self.append(&ents[start..])?;
        }
        self.commit_to(cmp::min(committed, last_new))?;
        Ok(Some(last_new))
    }

    pub fn commit_to(&mut self, commit: u64) -> Result<()> {
        if self.committed >= commit {
            return Ok(());
        }
        if self.last_index() < commit {
            return Err(RaftError::InvalidState(format!(
                "commit {} is out of range [last_index({})]",
                commit,
                self.last_index()
            )));
        }
        self.committed = commit;
        Ok(())
    }

    /// Advance the commit index to `max_index` if that entry belongs to
    /// `term`.
    pub fn maybe_commit(&mut self, max_index: u64, term: u64) -> bool {
        if max_index > self.committed && self.match_term(max_index, term) {
            self.committed = max_index;
            return true;
        }
        false
    }

    pub fn applied_to(&mut self, index: u64) -> Result<()> {
        if index == 0 {
            return Ok(());
        }
        if self.committed < index || index < self.applied {
            return Err(RaftError::InvalidState(format!(
                "applied {} is out of range [prev_applied({}), committed({})]",
                index, self.applied, self.committed
            )));
        }
        self.applied = index;
        Ok(())
    }

    /// Entries from `lo` to the end of the log, bounded by `max_size`.
    pub fn entries(&self, lo: u64, max_size: u64) -> Result<Vec<Entry>> {
        let last = self.last_index();
        if lo > last {
            return Ok(Vec::new());
        }
        self.slice(lo, last + 1, max_size)
    }

    /// Committed entries not yet applied.
    pub fn next_ents(&self) -> Result<Vec<Entry>> {
        let off = cmp::max(self.applied + 1, self.first_index);
        if self.committed + 1 > off {
            return self.slice(off, self.committed + 1, NO_LIMIT);
        }
        Ok(Vec::new())
    }

    pub fn has_next_ents(&self) -> bool {
        self.committed + 1 > cmp::max(self.applied + 1, self.first_index)
    }

    pub fn unstable_entries(&self) -> &[Entry] {
        &self.unstable.entries
    }

    /// Entries up to (`index`, `term`) reached storage.
    pub fn stable_to(&mut self, index: u64, term: u64) {
        self.unstable.stable_to(index, term);
    }

    /// Hand the unstable tail to storage. Returns whether anything was written.
    pub fn persist(&mut self) -> Result<bool> {
        let (index, term) = match self.unstable.entries.last() {
            Some(e) => (e.index, e.term),
            None => return Ok(false),
        };
        self.storage.store_entries(&self.unstable.entries)?;
        self.stable_last = index;
        self.stable_to(index, term);
        Ok(true)
    }

    pub fn store_hard_state(&self, hs: HardState) -> Result<()> {
        self.storage.store_hard_state(hs)?;
        Ok(())
    }

    fn slice(&self, lo: u64, hi: u64, max_size: u64) -> Result<Vec<Entry>> {
        if lo > hi {
            return Err(RaftError::InvalidState(format!("invalid slice {} > {}", lo, hi)));
        }
        if lo < self.first_index {
            return Err(StorageError::Compacted.into());
        }
        if hi > self.last_index() + 1 {
            return Err(RaftError::InvalidState(format!(
                "slice [{}, {}) out of bound [{}, {}]",
                lo,
                hi,
                self.first_index,
                self.last_index()
            )));
        }
        if lo == hi {
            return Ok(Vec::new());
        }

        let mut ents = Vec::new();
        if lo < self.unstable.offset {
            let stored = self
                .storage
                .entries(lo, cmp::min(hi, self.unstable.offset), max_size)?;
            let complete = stored.len() as u64 == cmp::min(hi, self.unstable.offset) - lo;
            ents = stored;
            if !complete {
                return Ok(ents);
            }
        }
        if hi > self.unstable.offset {
            let from = cmp::max(lo, self.unstable.offset);
            ents.extend_from_slice(self.unstable.slice(from, hi));
        }
        Ok(limit_size(ents, max_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::EntryType;
    use crate::storage::MemoryStorage;
    use proptest::prelude::*;

    fn ent(index: u64, term: u64) -> Entry {
        Entry::new(index, term, EntryType::Normal, Vec::new())
    }

    fn log_with_stable(entries: &[Entry]) -> RaftLog {
        let storage = MemoryStorage::new();
        storage.store_entries(entries).unwrap();
        RaftLog::new(Arc::new(storage), 0).unwrap()
    }

    #[test]
    fn test_new_sets_offset_after_durable_tail() {
        let log = log_with_stable(&[ent(1, 1), ent(2, 1), ent(3, 2)]);
        assert_eq!(log.unstable.offset, 4);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.committed(), 0);
        assert_eq!(log.applied(), 0);
        assert_eq!(log.last_term(), 2);
    }

    #[test]
    fn test_new_restores_commit_from_hard_state() {
        let storage = MemoryStorage::new();
        storage.store_entries(&[ent(1, 1), ent(2, 1)]).unwrap();
        storage
            .store_hard_state(HardState {
                term: 1,
                vote: 1,
                commit: 5,
            })
            .unwrap();
        let log = RaftLog::new(Arc::new(storage), 9).unwrap();
        assert_eq!(log.committed(), 2);
        assert_eq!(log.applied(), 2);
    }

    #[test]
    fn test_last_index_prefers_unstable_tail() {
        let mut log = log_with_stable(&[ent(1, 1)]);
        log.append(&[ent(2, 1), ent(3, 1)]).unwrap();
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.unstable_entries().len(), 2);
        assert_eq!(log.entries(1, NO_LIMIT).unwrap().len(), 3);
    }

    #[test]
    fn test_append_before_commit_is_rejected() {
        let mut log = log_with_stable(&[ent(1, 1), ent(2, 1)]);
        log.commit_to(2).unwrap();
        assert!(matches!(log.append(&[ent(2, 2)]), Err(RaftError::InvalidState(_))));
        assert_eq!(log.last_term(), 1);
    }

    #[test]
    fn test_maybe_append_truncates_conflict() {
        let mut log = log_with_stable(&[ent(1, 1), ent(2, 1), ent(3, 1)]);
        let last = log.maybe_append(1, 1, 2, &[ent(2, 2)]).unwrap();
        assert_eq!(last, Some(2));
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.term(2).unwrap(), 2);
        assert_eq!(log.committed(), 2);

        // Mismatched previous entry.
        assert_eq!(log.maybe_append(2, 1, 2, &[ent(3, 2)]).unwrap(), None);
    }

    #[test]
    fn test_persist_moves_tail_to_storage() {
        let mut log = log_with_stable(&[]);
        log.append(&[ent(1, 1), ent(2, 1)]).unwrap();
        assert!(log.persist().unwrap());
        assert!(log.unstable_entries().is_empty());
        assert_eq!(log.last_index(), 2);
        assert!(!log.persist().unwrap());

        log.commit_to(2).unwrap();
        let next = log.next_ents().unwrap();
        assert_eq!(next.len(), 2);
        log.applied_to(2).unwrap();
        assert!(!log.has_next_ents());
    }

    #[test]
    fn test_commit_past_last_index_is_rejected() {
        let mut log = log_with_stable(&[ent(1, 1)]);
        assert!(log.commit_to(2).is_err());
        assert_eq!(log.committed(), 0);
    }

    #[test]
    fn test_maybe_commit_requires_matching_term() {
        let mut log = log_with_stable(&[ent(1, 1), ent(2, 2)]);
        assert!(!log.maybe_commit(1, 2));
        assert!(log.maybe_commit(2, 2));
        assert_eq!(log.committed(), 2);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Append(u64),
        Commit(u64),
        Apply(u64),
        Conflict(u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u64..5).prop_map(Op::Append),
            (0u64..40).prop_map(Op::Commit),
            (0u64..40).prop_map(Op::Apply),
            (1u64..40).prop_map(Op::Conflict),
        ]
    }

    proptest! {
        #[test]
        fn prop_applied_committed_last_ordering(ops in prop::collection::vec(op(), 1..60)) {
            let mut log = log_with_stable(&[]);
            let mut term = 1;
            let mut prev_committed = 0;

            for op in ops {
                match op {
                    Op::Append(n) => {
                        let last = log.last_index();
                        let ents: Vec<Entry> = (1..=n).map(|i| ent(last + i, term)).collect();
                        let _ = log.append(&ents);
                    }
                    Op::Commit(c) => { let _ = log.commit_to(c); }
                    Op::Apply(a) => { let _ = log.applied_to(a); }
                    Op::Conflict(at) => {
                        term += 1;
                        let _ = log.append(&[ent(at, term)]);
                    }
                }
                prop_assert!(log.applied() <= log.committed());
                prop_assert!(log.committed() <= log.last_index());
                prop_assert!(log.committed() >= prev_committed);
                prev_committed = log.committed();
            }
        }
    }
}
