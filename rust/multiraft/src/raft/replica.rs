//! Leader-side replication progress of one follower.

use std::fmt;
use std::time::Instant;

use crate::proto::Peer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    /// Position unknown: send one append, then wait for an answer.
    Probe,
    /// Position confirmed: pipeline appends up to the in-flight window.
    Replicate,
    /// Follower is behind the log's first index and needs a snapshot.
    Snapshot,
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplicaState::Probe => "Probe",
            ReplicaState::Replicate => "Replicate",
            ReplicaState::Snapshot => "Snapshot",
        };
        f.write_str(name)
    }
}

/// Ring buffer of the last indexes of unacknowledged append messages.
#[derive(Debug, Clone)]
pub struct Inflight {
    start: usize,
    count: usize,
    buffer: Vec<u64>,
}

impl Inflight {
    pub fn new(size: usize) -> Self {
        Self {
            start: 0,
            count: 0,
            buffer: vec![0; size.max(1)],
        }
    }

    pub fn add(&mut self, index: u64) {
        if self.full() {
            return;
        }
        let next = (self.start + self.count) % self.buffer.len();
        self.buffer[next] = index;
        self.count += 1;
    }

    /// Release every message whose last index is `<= to`.
    pub fn free_to(&mut self, to: u64) {
        if self.count == 0 || to < self.buffer[self.start] {
            return;
        }
        let mut i = 0;
        let mut idx = self.start;
        while i < self.count {
            if to < self.buffer[idx] {
                break;
            }
            idx = (idx + 1) % self.buffer.len();
            i += 1;
        }
        self.count -= i;
        self.start = idx;
    }

    pub fn free_first_one(&mut self) {
        if self.count > 0 {
            let first = self.buffer[self.start];
            self.free_to(first);
        }
    }

    pub fn full(&self) -> bool {
        self.count == self.buffer.len()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        self.start = 0;
        self.count = 0;
    }
}

#[derive(Debug, Clone)]
pub struct Replica {
    pub peer: Peer,
    pub state: ReplicaState,
    pub matched: u64,
    pub next: u64,
    /// Highest commit index the follower has reported.
    pub committed: u64,
    pub active: bool,
    pub last_active: Instant,
    pub paused: bool,
    pub pending_snap: u64,
    pub inflight: Inflight,
}

impl Replica {
    pub fn new(peer: Peer, max_inflight: usize) -> Self {
        Self {
            peer,
            state: ReplicaState::Probe,
            matched: 0,
            next: 1,
            committed: 0,
            active: false,
            last_active: Instant::now(),
            paused: false,
            pending_snap: 0,
            inflight: Inflight::new(max_inflight),
        }
    }

    fn reset_state(&mut self, state: ReplicaState) {
        self.paused = false;
        self.pending_snap = 0;
        self.state = state;
        self.inflight.reset();
    }

    pub fn become_probe(&mut self) {
        if self.state == ReplicaState::Snapshot {
            let pending = self.pending_snap;
            self.reset_state(ReplicaState::Probe);
            self.next = (self.matched + 1).max(pending + 1);
        } else {
            self.reset_state(ReplicaState::Probe);
            self.next = self.matched + 1;
        }
    }

    /// Switch to pipelining. Entries already sent past `matched` stay sent.
    pub fn become_replicate(&mut self) {
        self.reset_state(ReplicaState::Replicate);
        self.next = self.next.max(self.matched + 1);
    }

    pub fn become_snapshot(&mut self, index: u64) {
        self.reset_state(ReplicaState::Snapshot);
        self.pending_snap = index;
    }

    /// Record an acknowledgement up to `index`. Returns whether `matched`
    /// advanced. Never moves `matched` or `next` backwards.
    pub fn maybe_update(&mut self, index: u64, commit: u64) -> bool {
        if commit > self.committed {
            self.committed = commit;
        }
        let mut updated = false;
        if self.matched < index {
            self.matched = index;
            updated = true;
            self.resume();
        }
        if self.next < index + 1 {
            self.next = index + 1;
        }
        updated
    }

    /// Pipelined send of entries up to `last`.
    pub fn optimistic_update(&mut self, last: u64) {
        if self.next < last + 1 {
            self.next = last + 1;
        }
    }

    /// Handle a rejected append for `rejected` with the follower reporting
    /// `last` as its last index. Returns false for stale rejections.
    pub fn maybe_decr_to(&mut self, rejected: u64, last: u64) -> bool {
        if self.state == ReplicaState::Replicate {
            if rejected <= self.matched {
                return false;
            }
            self.next = self.matched + 1;
            return true;
        }

        if self.next == 0 || self.next - 1 != rejected {
            return false;
        }
        self.next = rejected.min(last + 1).max(1);
        self.resume();
        true
    }

    pub fn snapshot_failure(&mut self) {
        self.pending_snap = 0;
    }

    pub fn need_snapshot_abort(&self) -> bool {
        self.state == ReplicaState::Snapshot && self.matched >= self.pending_snap
    }

    pub fn is_paused(&self) -> bool {
        match self.state {
            ReplicaState::Probe => self.paused,
            ReplicaState::Replicate => self.inflight.full(),
            ReplicaState::Snapshot => true,
        }
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn mark_active(&mut self) {
        self.active = true;
        self.last_active = Instant::now();
    }
}

impl fmt::Display for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "next={}, match={}, commit={}, state={}, paused={}, pending_snap={}, inflight={}",
            self.next,
            self.matched,
            self.committed,
            self.state,
            self.is_paused(),
            self.pending_snap,
            self.inflight.count()
        )
    }
}
