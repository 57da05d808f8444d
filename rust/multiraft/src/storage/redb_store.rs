#![allow(clippy::result_large_err)]
//! Durable log storage using redb.
//!
//! Each group owns one database file with two typed tables: the entry log
//! keyed by index, and a small metadata table holding the hard state plus
//! the compaction point.
//!
//! # Example
//!
//! ```rust,ignore
//! use multiraft::storage::{RedbStorage, Storage};
//!
//! let storage = RedbStorage::open("/var/lib/multiraft/group-7.redb").unwrap();
//! let hs = storage.initial_state().unwrap();
//! ```

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};

use super::{limit_size, Result, Storage, StorageError};
use crate::proto::{Entry, HardState};

/// Log entries keyed by index, values are bincode-encoded [`Entry`].
const ENTRIES_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("raft_entries");

/// Hard state fields and compaction point.
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("raft_meta");

const KEY_TERM: &str = "term";
const KEY_VOTE: &str = "vote";
const KEY_COMMIT: &str = "commit";
const KEY_FIRST_INDEX: &str = "first_index";
const KEY_COMPACTED_TERM: &str = "compacted_term";

/// redb-backed [`Storage`]. Every write is one committed transaction.
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create the log database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = Database::create(path)?;

        // Create both tables up front so readers never see TableDoesNotExist.
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(ENTRIES_TABLE)?;
            let _ = write_txn.open_table(META_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    fn meta(&self, key: &str) -> Result<Option<u64>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(META_TABLE)?;
        Ok(table.get(key)?.map(|v| v.value()))
    }

    fn load_entry(&self, index: u64) -> Result<Option<Entry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ENTRIES_TABLE)?;
        match table.get(index)? {
            Some(v) => Ok(Some(bincode::deserialize(v.value())?)),
            None => Ok(None),
        }
    }
}

impl Storage for RedbStorage {
    fn initial_state(&self) -> Result<HardState> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(META_TABLE)?;
        let read = |key: &str| -> Result<u64> { Ok(table.get(key)?.map(|v| v.value()).unwrap_or(0)) };
        Ok(HardState {
            term: read(KEY_TERM)?,
            vote: read(KEY_VOTE)?,
            commit: read(KEY_COMMIT)?,
        })
    }

    fn first_index(&self) -> Result<u64> {
        Ok(self.meta(KEY_FIRST_INDEX)?.unwrap_or(1))
    }

    fn last_index(&self) -> Result<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ENTRIES_TABLE)?;
        let result = match table.last()? {
            Some((k, _)) => Ok(k.value()),
            None => Ok(self.first_index()? - 1),
        };
        result
    }

    fn term(&self, index: u64) -> Result<u64> {
        let first = self.first_index()?;
        if index + 1 < first {
            return Err(StorageError::Compacted);
        }
        if index + 1 == first {
            return Ok(self.meta(KEY_COMPACTED_TERM)?.unwrap_or(0));
        }
        self.load_entry(index)?
            .map(|e| e.term)
            .ok_or(StorageError::Unavailable(index))
    }

    fn entries(&self, lo: u64, hi: u64, max_size: u64) -> Result<Vec<Entry>> {
        let first = self.first_index()?;
        if lo < first {
            return Err(StorageError::Compacted);
        }
        let last = self.last_index()?;
        if hi > last + 1 {
            return Err(StorageError::Unavailable(hi - 1));
        }

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ENTRIES_TABLE)?;
        let mut ents = Vec::with_capacity((hi.saturating_sub(lo)) as usize);
        for item in table.range(lo..hi)? {
            let (_, v) = item?;
            ents.push(bincode::deserialize::<Entry>(v.value())?);
        }
        Ok(limit_size(ents, max_size))
    }

    fn store_entries(&self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let first = self.first_index()?;
        let last = self.last_index()?;
        let entries = match entries.iter().position(|e| e.index >= first) {
            Some(pos) => &entries[pos..],
            None => return Ok(()),
        };
        let start = entries[0].index;
        if start > last + 1 {
            return Err(StorageError::Corrupted(format!(
                "missing log entries before index {} (last stored {})",
                start, last
            )));
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(ENTRIES_TABLE)?;
            let stale: Vec<u64> = table
                .range(start..)?
                .map(|item| item.map(|(k, _)| k.value()))
                .collect::<std::result::Result<_, _>>()?;
            for index in stale {
                table.remove(index)?;
            }
            for entry in entries {
                let bytes = bincode::serialize(entry)?;
                table.insert(entry.index, bytes.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn store_hard_state(&self, state: HardState) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(META_TABLE)?;
            table.insert(KEY_TERM, state.term)?;
            table.insert(KEY_VOTE, state.vote)?;
            table.insert(KEY_COMMIT, state.commit)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn truncate(&self, index: u64) -> Result<()> {
        let first = self.first_index()?;
        if index < first {
            return Ok(());
        }
        if index > self.last_index()? {
            return Err(StorageError::Unavailable(index));
        }
        let term = self.term(index)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut entries = write_txn.open_table(ENTRIES_TABLE)?;
            for i in first..=index {
                entries.remove(i)?;
            }
            let mut meta = write_txn.open_table(META_TABLE)?;
            meta.insert(KEY_FIRST_INDEX, index + 1)?;
            meta.insert(KEY_COMPACTED_TERM, term)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}
