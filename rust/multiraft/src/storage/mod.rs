//! Durable log storage capability.
//!
//! A raft group layers its in-memory unstable tail on top of a [`Storage`]
//! implementation. The engine only needs ordered entry access plus the
//! persisted [`HardState`]; how the bytes reach disk is up to the backend.
//!
//! # Storage Backends
//!
//! - [`MemoryStorage`]: vector-backed store for tests and ephemeral groups
//! - [`RedbStorage`]: redb-backed durable store (`durable` feature)
//!
//! # Example
//!
//! ```rust
//! use multiraft::proto::{Entry, EntryType};
//! use multiraft::storage::{MemoryStorage, Storage};
//!
//! let storage = MemoryStorage::new();
//! storage
//!     .store_entries(&[Entry::new(1, 1, EntryType::Normal, b"a=1".to_vec())])
//!     .unwrap();
//! assert_eq!(storage.first_index().unwrap(), 1);
//! assert_eq!(storage.last_index().unwrap(), 1);
//! ```

mod memory;
#[cfg(feature = "durable")]
mod redb_store;

pub use memory::MemoryStorage;
#[cfg(feature = "durable")]
pub use redb_store::RedbStorage;

use thiserror::Error;

use crate::proto::{Entry, HardState};

/// Pass as `max_size` to fetch entries without a size bound.
pub const NO_LIMIT: u64 = u64::MAX;

/// Errors that can occur during log storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("requested index is unavailable due to compaction")]
    Compacted,

    #[error("requested index {0} is beyond the last stored entry")]
    Unavailable(u64),

    #[error("log is not contiguous: {0}")]
    Corrupted(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[cfg(feature = "durable")]
    #[error("redb database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[cfg(feature = "durable")]
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),

    #[cfg(feature = "durable")]
    #[error("redb transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[cfg(feature = "durable")]
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[cfg(feature = "durable")]
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Append-only log store backing one raft group.
///
/// Index `first_index() - 1` is the compaction point: its term stays
/// queryable through [`Storage::term`] so the log-matching check works at the
/// boundary. A fresh store has `first_index() == 1` and `last_index() == 0`.
pub trait Storage: Send + Sync {
    /// Persisted vote state, empty for a fresh store.
    fn initial_state(&self) -> Result<HardState>;

    fn first_index(&self) -> Result<u64>;

    fn last_index(&self) -> Result<u64>;

    /// Term of the entry at `index`, valid in `[first_index - 1, last_index]`.
    fn term(&self, index: u64) -> Result<u64>;

    /// Entries in `[lo, hi)`, truncated once their total size exceeds
    /// `max_size` (at least one entry is always returned).
    fn entries(&self, lo: u64, hi: u64, max_size: u64) -> Result<Vec<Entry>>;

    /// Append entries, replacing any stored entries at or after the index of
    /// the first one.
    fn store_entries(&self, entries: &[Entry]) -> Result<()>;

    fn store_hard_state(&self, state: HardState) -> Result<()>;

    /// Discard every entry up to and including `index`.
    fn truncate(&self, index: u64) -> Result<()>;
}

/// Keep the longest prefix of `entries` whose total size stays within
/// `max_size`, always keeping the first entry.
pub(crate) fn limit_size(mut entries: Vec<Entry>, max_size: u64) -> Vec<Entry> {
    if entries.is_empty() || max_size == NO_LIMIT {
        return entries;
    }

    let mut size = entries[0].size();
    let mut limit = 1;
    while limit < entries.len() {
        size += entries[limit].size();
        if size > max_size {
            break;
        }
        limit += 1;
    }
    entries.truncate(limit);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::EntryType;

    fn entry(index: u64, len: usize) -> Entry {
        Entry::new(index, 1, EntryType::Normal, vec![0u8; len])
    }

    #[test]
    fn test_limit_size_keeps_first_entry() {
        let entries = vec![entry(1, 100), entry(2, 100)];
        let limited = limit_size(entries, 1);
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].index, 1);
    }

    #[test]
    fn test_limit_size_cuts_at_boundary() {
        let entries = vec![entry(1, 10), entry(2, 10), entry(3, 10)];
        let one = entries[0].size();
        assert_eq!(limit_size(entries.clone(), one * 2).len(), 2);
        assert_eq!(limit_size(entries.clone(), one * 2 - 1).len(), 1);
        assert_eq!(limit_size(entries, NO_LIMIT).len(), 3);
    }
}
