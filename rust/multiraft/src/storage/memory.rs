//! Vector-backed log storage.

use parking_lot::RwLock;

use super::{limit_size, Result, Storage, StorageError};
use crate::proto::{Entry, HardState};

struct MemoryLog {
    hard_state: HardState,
    /// `entries[0]` is a dummy marking the compaction point.
    entries: Vec<Entry>,
}

impl MemoryLog {
    fn offset(&self) -> u64 {
        self.entries[0].index
    }

    fn last_index(&self) -> u64 {
        self.offset() + self.entries.len() as u64 - 1
    }
}

/// In-memory [`Storage`]. Nothing survives the process.
pub struct MemoryStorage {
    inner: RwLock<MemoryLog>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryLog {
                hard_state: HardState::default(),
                entries: vec![Entry::default()],
            }),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn initial_state(&self) -> Result<HardState> {
        Ok(self.inner.read().hard_state)
    }

    fn first_index(&self) -> Result<u64> {
        Ok(self.inner.read().offset() + 1)
    }

    fn last_index(&self) -> Result<u64> {
        Ok(self.inner.read().last_index())
    }

    fn term(&self, index: u64) -> Result<u64> {
        let log = self.inner.read();
        let offset = log.offset();
        if index < offset {
            return Err(StorageError::Compacted);
        }
        log.entries
            .get((index - offset) as usize)
            .map(|e| e.term)
            .ok_or(StorageError::Unavailable(index))
    }

    fn entries(&self, lo: u64, hi: u64, max_size: u64) -> Result<Vec<Entry>> {
        let log = self.inner.read();
        let offset = log.offset();
        if lo <= offset {
            return Err(StorageError::Compacted);
        }
        if hi > log.last_index() + 1 {
            return Err(StorageError::Unavailable(hi - 1));
        }
        if lo >= hi {
            return Ok(Vec::new());
        }
        let ents = log.entries[(lo - offset) as usize..(hi - offset) as usize].to_vec();
        Ok(limit_size(ents, max_size))
    }

    fn store_entries(&self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut log = self.inner.write();
        let first = log.offset() + 1;
        let last = entries[0].index + entries.len() as u64 - 1;
        if last < first {
            return Ok(());
        }

        let entries = if first > entries[0].index {
            &entries[(first - entries[0].index) as usize..]
        } else {
            entries
        };

        let offset = (entries[0].index - log.offset()) as usize;
        if offset > log.entries.len() {
            return Err(StorageError::Corrupted(format!(
                "missing log entries before index {} (last stored {})",
                entries[0].index,
                log.last_index()
            )));
        }
        log.entries.truncate(offset);
        log.entries.extend_from_slice(entries);
        Ok(())
    }

    fn store_hard_state(&self, state: HardState) -> Result<()> {
        self.inner.write().hard_state = state;
        Ok(())
    }

    fn truncate(&self, index: u64) -> Result<()> {
        let mut log = self.inner.write();
        let offset = log.offset();
        if index <= offset {
            return Ok(());
        }
        if index > log.last_index() {
            return Err(StorageError::Unavailable(index));
        }

        let keep = (index - offset) as usize;
        log.entries.drain(..keep);
        log.entries[0].data.clear();
        Ok(())
    }
}
