//! Application state machine capability.
//!
//! The engine hands committed entries to a [`StateMachine`] in index order
//! from the group's apply task. Implementations must be deterministic: given
//! the same sequence of commands, every replica must reach the same state.

use super::error::Result;
use crate::proto::{ConfChange, NodeId, Peer};

/// Streams the chunks of a state machine snapshot.
pub trait SnapshotIterator: Send {
    /// Index of the last entry covered by the snapshot.
    fn applied_index(&self) -> u64;

    /// Next chunk, or `None` once exhausted.
    fn next_chunk(&mut self) -> Option<Result<Vec<u8>>>;
}

/// Application state machine driven by one raft group.
pub trait StateMachine: Send + 'static {
    /// Apply a committed normal entry.
    ///
    /// An error halts the group's apply loop.
    fn apply(&mut self, command: &[u8], index: u64) -> Result<()>;

    /// Apply a committed membership change. The group's peer table has
    /// already been updated when this is called.
    fn apply_member_change(&mut self, change: &ConfChange, index: u64) -> Result<()>;

    /// Capture the current state for transfer to a lagging replica.
    fn snapshot(&self) -> Result<Box<dyn SnapshotIterator>>;

    /// Replace the current state with a received snapshot.
    fn apply_snapshot(&mut self, peers: &[Peer], iter: &mut dyn SnapshotIterator) -> Result<()>;

    /// Called whenever the group observes a new leader (`NO_LEADER` when
    /// leadership is lost), ordered with respect to applied entries.
    fn handle_leader_change(&mut self, leader: NodeId);
}

/// Snapshot held entirely in memory.
pub struct VecSnapshot {
    applied_index: u64,
    chunks: std::vec::IntoIter<Vec<u8>>,
}

impl VecSnapshot {
    pub fn new(applied_index: u64, chunks: Vec<Vec<u8>>) -> Self {
        Self {
            applied_index,
            chunks: chunks.into_iter(),
        }
    }
}

impl SnapshotIterator for VecSnapshot {
    fn applied_index(&self) -> u64 {
        self.applied_index
    }

    fn next_chunk(&mut self) -> Option<Result<Vec<u8>>> {
        self.chunks.next().map(Ok)
    }
}
