//! Raft consensus for many independent groups on one node.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │  Node (one per process)                                            │
//! │                                                                    │
//! │  tick loop ──► Raft::tick ──────┐                                  │
//! │  heartbeat coalescing           │                                  │
//! │                                 ▼                                  │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐            │
//! │  │ Raft group 1 │   │ Raft group 2 │   │ Raft group N │            │
//! │  │  worker task │   │  worker task │   │  worker task │            │
//! │  │  ├─ RaftFsm  │   │  ├─ RaftFsm  │   │  ├─ RaftFsm  │            │
//! │  │  │  ├─ log   │   │  │  ├─ log   │   │  │  ├─ log   │            │
//! │  │  │  └─ reps  │   │  │  └─ reps  │   │  │  └─ reps  │            │
//! │  │  └─ apply    │   │  └─ apply    │   │  └─ apply    │            │
//! │  └──────────────┘   └──────────────┘   └──────────────┘            │
//! │                                                                    │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Components
//!
//! - [`Node`]: Hosts groups, drives ticks, coalesces heartbeats
//! - [`Raft`]: Handle to one group's worker
//! - [`RaftLog`]: Unstable tail over a [`Storage`](crate::storage::Storage)
//! - [`Replica`]: Leader-side replication progress for one peer
//! - [`StateMachine`]: Application callback for committed entries

mod config;
mod error;
mod fsm;
mod group;
mod log;
mod node;
mod replica;
mod state_machine;

pub use config::{
    NodeConfig, RaftConfig, DEFAULT_APP_BUFFER_SIZE, DEFAULT_ELECTION_TICK,
    DEFAULT_HEARTBEAT_TICK, DEFAULT_INFLIGHT_MSGS, DEFAULT_REQ_BUFFER_SIZE, DEFAULT_RETAIN_LOGS,
    DEFAULT_SIZE_PER_MSG, DEFAULT_TICK_INTERVAL, MAX_INFLIGHT_MSGS, MAX_SIZE_PER_MSG,
    MIN_TICK_INTERVAL,
};
pub use error::{RaftError, Result};
pub use fsm::{ReplicaStatus, StateRole, Status};
pub use group::{Raft, SoftState, MAX_PROPOSAL_BATCH};
pub use log::RaftLog;
pub use node::Node;
pub use replica::{Inflight, Replica, ReplicaState};
pub use state_machine::{SnapshotIterator, StateMachine, VecSnapshot};
